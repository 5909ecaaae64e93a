/// Per-run context
///
/// A `RunContext` is built once from a validated [`BackupConfig`] and a single
/// timestamp. Every path and name used by the pipeline stages is derived here
/// so that artifacts from one run can be correlated.

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::config::{BackupConfig, Timeouts};
use crate::core::error::PipelineError;
use crate::utils::{
    split_host_port, ARCHIVE_EXTENSION, DEFAULT_REGION, DEFAULT_SQLCMD_PATH,
    DEFAULT_SQL_SERVER_PORT, RUN_NAME_PREFIX, RUN_TIMESTAMP_FORMAT,
};

/// Where SQL Server runs relative to the remote host
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMode {
    /// Native SQL Server; backups land directly on the host filesystem
    Direct,
    /// SQL Server in a container, backed up over TDS
    Container,
    /// SQL Server in a container, backed up by `sqlcmd` run inside it
    ContainerDelegated,
}

impl DeploymentMode {
    pub fn uses_container(self) -> bool {
        !matches!(self, DeploymentMode::Direct)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentMode::Direct => "direct",
            DeploymentMode::Container => "container",
            DeploymentMode::ContainerDelegated => "container-delegated",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(DeploymentMode::Direct),
            "container" => Ok(DeploymentMode::Container),
            "container-delegated" => Ok(DeploymentMode::ContainerDelegated),
            other => Err(format!(
                "unknown mode '{}' (expected direct, container or container-delegated)",
                other
            )),
        }
    }
}

/// A credential that never shows up in logs or checkpoints
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteHost {
    pub address: String,
    pub port: u16,
    pub username: String,
    #[serde(skip)]
    pub password: Secret,
}

impl RemoteHost {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseServer {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip)]
    pub password: Secret,
}

impl DatabaseServer {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageDestination {
    /// Base URL including scheme, without trailing slash
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub key: String,
    #[serde(skip)]
    pub access_key: Secret,
    #[serde(skip)]
    pub secret_key: Secret,
}

/// Options shaping the remote commands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandOptions {
    pub use_sudo: bool,
    pub sqlcmd_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunContext {
    pub timestamp: NaiveDateTime,
    pub run_name: String,
    pub mode: DeploymentMode,
    pub remote: RemoteHost,
    pub database: DatabaseServer,
    pub container: Option<String>,
    /// Directory receiving `<db>.bak` files, on the host or inside the container
    pub backup_dir: String,
    /// Directory on the remote host the transfer gateway downloads from
    pub remote_staging_dir: String,
    pub local_staging_dir: PathBuf,
    pub archive_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub storage: StorageDestination,
    pub timeouts: Timeouts,
    pub commands: CommandOptions,
}

/// `DatabaseBackups_<YYYY-MM-DD_HH-mm-ss>` for the given timestamp
pub fn run_name(timestamp: NaiveDateTime) -> String {
    format!("{}_{}", RUN_NAME_PREFIX, timestamp.format(RUN_TIMESTAMP_FORMAT))
}

impl RunContext {
    /// Build the context for a run starting at `timestamp`
    ///
    /// `local_root` receives the staging directory, the archive and the
    /// checkpoint file.
    pub fn from_config(
        config: &BackupConfig,
        timestamp: NaiveDateTime,
        local_root: &Path,
    ) -> Result<Self, PipelineError> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(PipelineError::ConfigurationInvalid(errors.join("; ")));
        }

        let timestamp = timestamp.with_nanosecond(0).unwrap_or(timestamp);
        let run_name = run_name(timestamp);
        let mode = config.deployment_mode();

        let (db_host, db_port) =
            split_host_port(&config.sql_server_address, DEFAULT_SQL_SERVER_PORT)
                .map_err(PipelineError::ConfigurationInvalid)?;
        let db_port = config.sql_server_port.unwrap_or(db_port);

        let timeouts = config
            .timeouts
            .resolve()
            .map_err(|e| PipelineError::ConfigurationInvalid(e.to_string()))?;

        let backup_dir = join_remote(config.backup_root(), &run_name);
        let remote_staging_dir = match mode {
            // Native SQL Server writes straight to the host filesystem
            DeploymentMode::Direct => backup_dir.clone(),
            _ => {
                let root = config
                    .remote_staging_root
                    .clone()
                    .unwrap_or_else(|| format!("/home/{}", config.ssh_user));
                join_remote(&root, &run_name)
            }
        };

        let local_staging_dir = local_root.join(&run_name);
        let archive_name = format!("{}.{}", run_name, ARCHIVE_EXTENSION);
        let archive_path = local_root.join(&archive_name);
        let checkpoint_path = local_root.join(format!("{}.state.json", run_name));

        Ok(Self {
            timestamp,
            mode,
            remote: RemoteHost {
                address: config.server_ip.trim().to_string(),
                port: config.ssh_port(),
                username: config.ssh_user.clone(),
                password: Secret::new(&config.ssh_pass),
            },
            database: DatabaseServer {
                host: db_host,
                port: db_port,
                username: config.sql_user.clone(),
                password: Secret::new(&config.sql_pass),
            },
            container: config.container().map(str::to_string),
            backup_dir,
            remote_staging_dir,
            local_staging_dir,
            archive_path,
            checkpoint_path,
            storage: StorageDestination {
                endpoint: normalize_endpoint(&config.minio_endpoint, config.minio_use_ssl),
                region: config
                    .minio_region
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REGION.to_string()),
                bucket: config.bucket_name.clone(),
                key: archive_name,
                access_key: Secret::new(&config.minio_access_key),
                secret_key: Secret::new(&config.minio_secret_key),
            },
            timeouts,
            commands: CommandOptions {
                use_sudo: config.use_sudo.unwrap_or(true),
                sqlcmd_path: config
                    .sqlcmd_path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SQLCMD_PATH.to_string()),
            },
            run_name,
        })
    }

    /// Re-attach credentials to a context restored from a checkpoint
    pub fn with_credentials(mut self, config: &BackupConfig) -> Self {
        self.remote.password = Secret::new(&config.ssh_pass);
        self.database.password = Secret::new(&config.sql_pass);
        self.storage.access_key = Secret::new(&config.minio_access_key);
        self.storage.secret_key = Secret::new(&config.minio_secret_key);
        self
    }

    /// Container identifier; only present in container modes
    pub fn container_id(&self) -> Result<&str, PipelineError> {
        self.container.as_deref().ok_or_else(|| {
            PipelineError::ConfigurationInvalid(format!(
                "{} mode requires a docker container",
                self.mode
            ))
        })
    }

    /// Backup file path for a database inside `backup_dir`
    pub fn backup_file_path(&self, database: &str) -> String {
        join_remote(&self.backup_dir, &backup_file_name(database))
    }

    /// Every secret of this run, for log redaction
    pub fn secrets(&self) -> Vec<&str> {
        vec![
            self.remote.password.expose(),
            self.database.password.expose(),
            self.storage.access_key.expose(),
            self.storage.secret_key.expose(),
        ]
    }
}

/// `<database>.bak`
pub fn backup_file_name(database: &str) -> String {
    format!("{}.{}", database, crate::utils::BACKUP_FILE_EXTENSION)
}

fn join_remote(root: &str, name: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), name)
}

fn normalize_endpoint(endpoint: &str, use_ssl: Option<bool>) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else if use_ssl.unwrap_or(false) {
        format!("https://{}", endpoint)
    } else {
        format!("http://{}", endpoint)
    }
}
