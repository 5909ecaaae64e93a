/// Backup configuration
///
/// Handles reading, prompting for and validating the run configuration. The
/// JSON field names follow the deployment's existing config files
/// (`serverIp`, `sshUser`, `minioEndpoint`, ...).

use anyhow::{anyhow, Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Duration;

use crate::core::context::DeploymentMode;
use crate::utils::{
    split_host_port, DEFAULT_BACKUP_ROOT, DEFAULT_BACKUP_TIMEOUT, DEFAULT_COMMAND_TIMEOUT,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_SQL_SERVER_PORT, DEFAULT_SSH_PORT, DEFAULT_TRANSFER_TIMEOUT,
    DEFAULT_UPLOAD_TIMEOUT, ENV_MINIO_ACCESS_KEY, ENV_MINIO_SECRET_KEY, ENV_SQL_PASS,
    ENV_SSH_PASS,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    pub server_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_pass: String,

    pub sql_server_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_server_port: Option<u16>,
    pub sql_user: String,
    #[serde(default)]
    pub sql_pass: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DeploymentMode>,

    pub minio_endpoint: String,
    #[serde(default)]
    pub minio_access_key: String,
    #[serde(default)]
    pub minio_secret_key: String,
    pub bucket_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minio_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minio_use_ssl: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_staging_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_sudo: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlcmd_path: Option<String>,

    #[serde(default, skip_serializing_if = "TimeoutSettings::is_empty")]
    pub timeouts: TimeoutSettings,
}

/// Per-operation timeouts as humantime strings ("30s", "10m")
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<String>,
}

/// Resolved timeouts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timeouts {
    #[serde(with = "humantime_secs")]
    pub connect: Duration,
    #[serde(with = "humantime_secs")]
    pub command: Duration,
    #[serde(with = "humantime_secs")]
    pub backup: Duration,
    #[serde(with = "humantime_secs")]
    pub transfer: Duration,
    #[serde(with = "humantime_secs")]
    pub upload: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            command: DEFAULT_COMMAND_TIMEOUT,
            backup: DEFAULT_BACKUP_TIMEOUT,
            transfer: DEFAULT_TRANSFER_TIMEOUT,
            upload: DEFAULT_UPLOAD_TIMEOUT,
        }
    }
}

impl TimeoutSettings {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Resolve against the defaults
    pub fn resolve(&self) -> Result<Timeouts> {
        let defaults = Timeouts::default();
        Ok(Timeouts {
            connect: parse_timeout("connect", self.connect.as_deref(), defaults.connect)?,
            command: parse_timeout("command", self.command.as_deref(), defaults.command)?,
            backup: parse_timeout("backup", self.backup.as_deref(), defaults.backup)?,
            transfer: parse_timeout("transfer", self.transfer.as_deref(), defaults.transfer)?,
            upload: parse_timeout("upload", self.upload.as_deref(), defaults.upload)?,
        })
    }
}

fn parse_timeout(name: &str, value: Option<&str>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(raw) => {
            let duration = humantime::parse_duration(raw.trim())
                .with_context(|| format!("Invalid {} timeout '{}'", name, raw))?;
            if duration.is_zero() {
                return Err(anyhow!("{} timeout must be greater than zero", name));
            }
            Ok(duration)
        }
    }
}

/// Timeouts persist in checkpoints as humantime strings
mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl BackupConfig {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow!("Configuration file not found: {}", path.display()));
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file {}", path.display()))?;

        config.fill_secrets_from_env();
        Ok(config)
    }

    /// Fill secrets the file left empty from `SQLBACKUP_*` environment variables
    pub fn fill_secrets_from_env(&mut self) {
        self.fill_secrets_with(|key| std::env::var(key).ok());
    }

    fn fill_secrets_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let slots: [(&mut String, &str); 4] = [
            (&mut self.ssh_pass, ENV_SSH_PASS),
            (&mut self.sql_pass, ENV_SQL_PASS),
            (&mut self.minio_access_key, ENV_MINIO_ACCESS_KEY),
            (&mut self.minio_secret_key, ENV_MINIO_SECRET_KEY),
        ];
        for (slot, key) in slots {
            if slot.is_empty() {
                if let Some(value) = lookup(key) {
                    *slot = value;
                }
            }
        }
    }

    /// Deployment mode, explicit or inferred from the container setting
    pub fn deployment_mode(&self) -> DeploymentMode {
        self.mode.unwrap_or_else(|| {
            if self.container().is_some() {
                DeploymentMode::Container
            } else {
                DeploymentMode::Direct
            }
        })
    }

    /// Container identifier, ignoring blank values
    pub fn container(&self) -> Option<&str> {
        self.docker_container
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port.unwrap_or(DEFAULT_SSH_PORT)
    }

    pub fn backup_root(&self) -> &str {
        self.backup_root.as_deref().unwrap_or(DEFAULT_BACKUP_ROOT)
    }

    /// Validate configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let required = [
            ("serverIp", &self.server_ip),
            ("sshUser", &self.ssh_user),
            ("sshPass", &self.ssh_pass),
            ("sqlServerAddress", &self.sql_server_address),
            ("sqlUser", &self.sql_user),
            ("sqlPass", &self.sql_pass),
            ("minioEndpoint", &self.minio_endpoint),
            ("minioAccessKey", &self.minio_access_key),
            ("minioSecretKey", &self.minio_secret_key),
            ("bucketName", &self.bucket_name),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                errors.push(format!("{} is not set", name));
            }
        }

        if !self.sql_server_address.trim().is_empty() {
            if let Err(e) = split_host_port(&self.sql_server_address, DEFAULT_SQL_SERVER_PORT) {
                errors.push(format!("Invalid sqlServerAddress: {}", e));
            }
        }

        let mode = self.deployment_mode();
        if mode.uses_container() && self.container().is_none() {
            errors.push(format!("dockerContainer is required in {} mode", mode));
        }

        if !self.bucket_name.is_empty() && !is_valid_bucket_name(&self.bucket_name) {
            errors.push(format!("Invalid bucket name: {}", self.bucket_name));
        }

        for (name, root) in [
            ("backupRoot", self.backup_root.as_deref()),
            ("remoteStagingRoot", self.remote_staging_root.as_deref()),
        ] {
            if let Some(root) = root {
                if !root.starts_with('/') || root.trim_end_matches('/').is_empty() {
                    errors.push(format!("{} must be an absolute path below /: {}", name, root));
                }
            }
        }

        if let Err(e) = self.timeouts.resolve() {
            errors.push(e.to_string());
        }

        errors
    }

    /// Sample configuration printed by `config template`
    pub fn template() -> Self {
        Self {
            server_ip: "203.0.113.10".to_string(),
            ssh_user: "backup".to_string(),
            ssh_pass: "<ssh password>".to_string(),
            sql_server_address: "203.0.113.10,1433".to_string(),
            sql_user: "sa".to_string(),
            sql_pass: "<sql password>".to_string(),
            docker_container: Some("mssql".to_string()),
            minio_endpoint: "minio.example.com:9000".to_string(),
            minio_access_key: "<access key>".to_string(),
            minio_secret_key: "<secret key>".to_string(),
            bucket_name: "database-backups".to_string(),
            ..Self::default()
        }
    }
}

/// S3 bucket naming rules (lowercase, digits, dots, hyphens; 3-63 chars)
fn is_valid_bucket_name(name: &str) -> bool {
    (3..=63).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
        && !name.starts_with(['.', '-'])
        && !name.ends_with(['.', '-'])
}

/// Collect a configuration interactively, field by field
pub fn prompt_config() -> Result<BackupConfig> {
    let stdin = io::stdin();
    let mut input = stdin.lock();

    println!("Enter backup configuration (password fields are masked)\n");

    let server_ip = prompt_required(&mut input, "Remote server address: ")?;
    let ssh_user = prompt_required(&mut input, "SSH username: ")?;
    let ssh_pass = prompt_password("SSH password: ")?;
    let sql_server_address = prompt_required(&mut input, "SQL Server address: ")?;
    let sql_user = prompt_required(&mut input, "SQL Server username: ")?;
    let sql_pass = prompt_password("SQL Server password: ")?;
    let docker_container = prompt_optional(&mut input, "Docker container (blank for native SQL Server): ")?;
    let minio_endpoint = prompt_required(&mut input, "MinIO endpoint: ")?;
    let minio_access_key = prompt_required(&mut input, "MinIO access key: ")?;
    let minio_secret_key = prompt_password("MinIO secret key: ")?;
    let bucket_name = prompt_required(&mut input, "Bucket name: ")?;

    Ok(BackupConfig {
        server_ip,
        ssh_user,
        ssh_pass,
        sql_server_address,
        sql_user,
        sql_pass,
        docker_container,
        minio_endpoint,
        minio_access_key,
        minio_secret_key,
        bucket_name,
        ..BackupConfig::default()
    })
}

/// Prompt until a non-empty answer is given
pub fn prompt_required<R: BufRead>(input: &mut R, prompt: &str) -> Result<String> {
    loop {
        match read_answer(input, prompt)? {
            Some(answer) if !answer.is_empty() => return Ok(answer),
            Some(_) => println!("✗ Input cannot be empty! Please enter a valid value."),
            None => return Err(anyhow!("Input closed before '{}' was answered", prompt.trim())),
        }
    }
}

fn prompt_optional<R: BufRead>(input: &mut R, prompt: &str) -> Result<Option<String>> {
    Ok(read_answer(input, prompt)?.filter(|answer| !answer.is_empty()))
}

fn read_answer<R: BufRead>(input: &mut R, prompt: &str) -> Result<Option<String>> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Read a password, echoing `*` per character
pub fn prompt_password(prompt: &str) -> Result<String> {
    loop {
        print!("{}", prompt);
        io::stdout().flush()?;

        terminal::enable_raw_mode().context("Failed to switch terminal to raw mode")?;
        let result = read_masked(&mut io::stdout());
        terminal::disable_raw_mode().context("Failed to restore terminal mode")?;
        print!("\r\n");
        io::stdout().flush()?;

        let password = result?;
        if !password.is_empty() {
            return Ok(password);
        }
        println!("✗ Input cannot be empty! Please enter a valid value.");
    }
}

fn read_masked<W: Write>(out: &mut W) -> Result<String> {
    let mut editor = MaskedInput::default();
    loop {
        if let Event::Key(key) = event::read()? {
            if key.kind == KeyEventKind::Release {
                continue;
            }
            match editor.apply(key) {
                MaskedAction::Echo(text) => {
                    out.write_all(text.as_bytes())?;
                    out.flush()?;
                }
                MaskedAction::Done => return Ok(editor.into_value()),
                MaskedAction::Cancel => return Err(anyhow!("Password entry cancelled")),
                MaskedAction::None => {}
            }
        }
    }
}

/// Line editor state for masked input
#[derive(Debug, Default)]
struct MaskedInput {
    value: String,
}

#[derive(Debug, PartialEq)]
enum MaskedAction {
    Echo(&'static str),
    Done,
    Cancel,
    None,
}

impl MaskedInput {
    fn apply(&mut self, key: KeyEvent) -> MaskedAction {
        match key.code {
            KeyCode::Enter => MaskedAction::Done,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                MaskedAction::Cancel
            }
            KeyCode::Backspace => {
                if self.value.pop().is_some() {
                    MaskedAction::Echo("\u{8} \u{8}")
                } else {
                    MaskedAction::None
                }
            }
            KeyCode::Char(c) => {
                self.value.push(c);
                MaskedAction::Echo("*")
            }
            _ => MaskedAction::None,
        }
    }

    fn into_value(self) -> String {
        self.value
    }
}
