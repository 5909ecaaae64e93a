//! In-memory remote host for driving the orchestrator end to end
//!
//! One simulated filesystem backs the host, the container, the SQL Server
//! fake and the SFTP fake. Failpoints make a chosen operation fail.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sqlbackup_cli::core::config::BackupConfig;
use sqlbackup_cli::core::context::StorageDestination;
use sqlbackup_cli::core::database::{DatabaseConnector, DatabaseSession};
use sqlbackup_cli::core::remote::{CommandOutput, RemoteConnector, RemoteExecutor};
use sqlbackup_cli::core::storage::{ObjectStore, UploadReceipt};
use sqlbackup_cli::core::transfer::{FileTransfer, TransferSummary};
use sqlbackup_cli::core::{Gateways, PipelineError, ProgressReporter, Stage};
use sqlbackup_cli::utils::{is_system_database, SYSTEM_DATABASES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Space {
    Host,
    Container,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fail {
    OpenShell,
    OpenTransfer,
    ConnectDatabase,
    /// Commands containing the text exit with status 1
    Command(String),
    /// Backing up the named database fails
    Backup(String),
    Download,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub bytes: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub shells_opened: usize,
    pub shell_disconnects: usize,
    pub transfers_opened: usize,
    pub transfer_disconnects: usize,
    pub sessions_opened: usize,
    pub sessions_closed: usize,
}

#[derive(Debug)]
struct HostState {
    files: BTreeMap<(Space, String), Vec<u8>>,
    dirs: BTreeSet<(Space, String)>,
    databases: Vec<String>,
    database_space: Space,
    delegated_backup_dir: Option<String>,
    fails: Vec<Fail>,
    delays: Vec<(String, Duration)>,
    commands: Vec<String>,
    backups: Vec<String>,
    objects: Vec<StoredObject>,
    counters: Counters,
}

/// Shared handle to the simulated deployment
#[derive(Clone)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new(databases: &[&str], database_space: Space) -> Self {
        let mut dirs = BTreeSet::new();
        for space in [Space::Host, Space::Container] {
            dirs.insert((space, "/".to_string()));
        }
        Self {
            state: Arc::new(Mutex::new(HostState {
                files: BTreeMap::new(),
                dirs,
                databases: databases.iter().map(|s| s.to_string()).collect(),
                database_space,
                delegated_backup_dir: None,
                fails: Vec::new(),
                delays: Vec::new(),
                commands: Vec::new(),
                backups: Vec::new(),
                objects: Vec::new(),
                counters: Counters::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    /// Directory sqlcmd writes `<db>.bak` files to in the container
    pub fn with_delegated_backup_dir(self, dir: &str) -> Self {
        self.lock().delegated_backup_dir = Some(dir.to_string());
        self
    }

    pub fn fail(&self, fail: Fail) {
        self.lock().fails.push(fail);
    }

    /// Commands containing `text` take `duration` to finish
    pub fn delay(&self, text: &str, duration: Duration) {
        self.lock().delays.push((text.to_string(), duration));
    }

    pub fn clear_failures(&self) {
        self.lock().fails.clear();
    }

    pub fn gateways(&self) -> Gateways {
        Gateways {
            remote: Arc::new(self.clone()),
            database: Arc::new(self.clone()),
            storage: Arc::new(self.clone()),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn backups(&self) -> Vec<String> {
        self.lock().backups.clone()
    }

    pub fn objects(&self) -> Vec<StoredObject> {
        self.lock().objects.clone()
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    pub fn exists(&self, space: Space, path: &str) -> bool {
        let state = self.lock();
        state.dirs.contains(&(space, path.to_string()))
            || state.files.contains_key(&(space, path.to_string()))
    }

    fn should_fail(&self, fail: &Fail) -> bool {
        self.lock().fails.contains(fail)
    }
}

impl HostState {
    fn make_dir(&mut self, space: Space, path: &str) {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert((space, current.clone()));
        }
    }

    fn is_dir(&self, space: Space, path: &str) -> bool {
        self.dirs.contains(&(space, path.to_string()))
    }

    fn write_file(&mut self, space: Space, path: &str, data: Vec<u8>) -> Result<()> {
        let parent = parent_of(path);
        if !self.is_dir(space, parent) {
            return Err(anyhow!("Cannot open backup device '{}': directory does not exist", path));
        }
        self.files.insert((space, path.to_string()), data);
        Ok(())
    }

    fn list(&self, space: Space, path: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .files
            .keys()
            .map(|(s, p)| (*s, p.as_str()))
            .chain(self.dirs.iter().map(|(s, p)| (*s, p.as_str())))
            .filter(|(s, p)| *s == space && parent_of(p) == path && *p != "/")
            .map(|(_, p)| name_of(p).to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn remove_tree(&mut self, space: Space, path: &str) {
        let prefix = format!("{}/", path);
        self.files
            .retain(|(s, p), _| !(*s == space && (p == path || p.starts_with(&prefix))));
        self.dirs
            .retain(|(s, p)| !(*s == space && (p == path || p.starts_with(&prefix))));
    }

    fn files_under(&self, space: Space, dir: &str) -> Vec<(String, Vec<u8>)> {
        let prefix = format!("{}/", dir);
        self.files
            .iter()
            .filter(|((s, p), _)| *s == space && p.starts_with(&prefix))
            .map(|((_, p), data)| (p[prefix.len()..].to_string(), data.clone()))
            .collect()
    }

    fn run(&mut self, command: &str) -> CommandOutput {
        let ok = |stdout: String| CommandOutput { status: 0, stdout, stderr: String::new() };
        let err = |status: i32, stderr: &str| CommandOutput {
            status,
            stdout: String::new(),
            stderr: stderr.to_string(),
        };

        let command = command.strip_prefix("sudo ").unwrap_or(command);
        let words: Vec<&str> = command.split_whitespace().collect();

        let (space, args): (Space, &[&str]) = match words.as_slice() {
            ["docker", "exec", _container, rest @ ..] => (Space::Container, rest),
            _ => (Space::Host, &words[..]),
        };

        if space == Space::Container && args.first().map_or(false, |a| a.ends_with("sqlcmd")) {
            return self.delegated_backup();
        }

        match args {
            ["mkdir", "-p", path] => {
                self.make_dir(space, path);
                ok(String::new())
            }
            ["ls", "-1A", path] => {
                if !self.is_dir(space, path) {
                    return err(2, &format!("ls: cannot access '{}': No such file or directory", path));
                }
                ok(self.list(space, path).join("\n"))
            }
            ["chmod", "-R", "777", path] => {
                if self.is_dir(space, path) {
                    ok(String::new())
                } else {
                    err(1, &format!("chmod: cannot access '{}'", path))
                }
            }
            ["rm", "-rf", path] => {
                self.remove_tree(space, path);
                ok(String::new())
            }
            ["docker", "cp", source, destination] => {
                let Some((_, source)) = source.split_once(':') else {
                    return err(1, "invalid docker cp source");
                };
                let source = source.trim_end_matches("/.");
                if !self.is_dir(Space::Container, source) {
                    return err(1, &format!("Error: No such container:path: {}", source));
                }
                self.make_dir(Space::Host, destination);
                for (relative, data) in self.files_under(Space::Container, source) {
                    let target = format!("{}/{}", destination, relative);
                    self.make_dir(Space::Host, parent_of(&target));
                    self.files.insert((Space::Host, target), data);
                }
                ok(String::new())
            }
            _ => err(127, &format!("unknown command: {}", command)),
        }
    }

    fn delegated_backup(&mut self) -> CommandOutput {
        let Some(dir) = self.delegated_backup_dir.clone() else {
            return CommandOutput {
                status: 1,
                stdout: String::new(),
                stderr: "no backup directory configured".to_string(),
            };
        };
        let databases: Vec<String> = self
            .databases
            .iter()
            .filter(|db| !is_system_database(db))
            .cloned()
            .collect();

        let mut stdout = String::new();
        for db in databases {
            let path = format!("{}/{}.bak", dir, db);
            if let Err(e) = self.write_file(Space::Container, &path, format!("backup of {}", db).into_bytes()) {
                return CommandOutput {
                    status: 1,
                    stdout,
                    stderr: format!("Msg 3201: {}", e),
                };
            }
            self.backups.push(db.clone());
            stdout.push_str(&format!("Backup completed for {}\n", db));
        }
        CommandOutput { status: 0, stdout, stderr: String::new() }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => "",
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub struct FakeShell {
    host: FakeHost,
}

#[async_trait]
impl RemoteExecutor for FakeShell {
    async fn execute(&self, command: &str) -> Result<CommandOutput> {
        let delay = self
            .host
            .lock()
            .delays
            .iter()
            .find(|(text, _)| command.contains(text.as_str()))
            .map(|(_, duration)| *duration);
        if let Some(duration) = delay {
            tokio::time::sleep(duration).await;
        }

        let mut state = self.host.lock();
        state.commands.push(command.to_string());
        let injected = state.fails.iter().any(|f| matches!(f, Fail::Command(text) if command.contains(text.as_str())));
        if injected {
            return Ok(CommandOutput {
                status: 1,
                stdout: String::new(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(state.run(command))
    }

    async fn disconnect(&self) -> Result<()> {
        self.host.lock().counters.shell_disconnects += 1;
        Ok(())
    }
}

pub struct FakeTransfer {
    host: FakeHost,
}

#[async_trait]
impl FileTransfer for FakeTransfer {
    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<TransferSummary> {
        if self.host.should_fail(&Fail::Download) {
            return Err(anyhow!("connection reset by peer"));
        }
        let files = {
            let state = self.host.lock();
            if !state.is_dir(Space::Host, remote_path) {
                return Err(anyhow!("no such file: {}", remote_path));
            }
            state.files_under(Space::Host, remote_path)
        };

        fs::create_dir_all(local_path)?;
        let mut summary = TransferSummary::default();
        for (relative, data) in files {
            let target = local_path.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &data)?;
            summary.files += 1;
            summary.bytes += data.len() as u64;
        }
        Ok(summary)
    }

    async fn disconnect(&self) -> Result<()> {
        self.host.lock().counters.transfer_disconnects += 1;
        Ok(())
    }
}

#[async_trait]
impl RemoteConnector for FakeHost {
    async fn open_shell(&self) -> Result<Box<dyn RemoteExecutor>> {
        if self.should_fail(&Fail::OpenShell) {
            return Err(anyhow!("Authentication failed"));
        }
        self.lock().counters.shells_opened += 1;
        Ok(Box::new(FakeShell { host: self.clone() }))
    }

    async fn open_transfer(&self) -> Result<Box<dyn FileTransfer>> {
        if self.should_fail(&Fail::OpenTransfer) {
            return Err(anyhow!("Authentication failed"));
        }
        self.lock().counters.transfers_opened += 1;
        Ok(Box::new(FakeTransfer { host: self.clone() }))
    }
}

pub struct FakeSession {
    host: FakeHost,
}

#[async_trait]
impl DatabaseSession for FakeSession {
    async fn list_databases(&mut self) -> Result<Vec<String>> {
        Ok(self.host.lock().databases.clone())
    }

    async fn backup_database(&mut self, database: &str, path: &str) -> Result<()> {
        if self.host.should_fail(&Fail::Backup(database.to_string())) {
            return Err(anyhow!("BACKUP DATABASE is terminating abnormally"));
        }
        let mut state = self.host.lock();
        let space = state.database_space;
        state.write_file(space, path, format!("backup of {}", database).into_bytes())?;
        state.backups.push(database.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.host.lock().counters.sessions_closed += 1;
        Ok(())
    }
}

#[async_trait]
impl DatabaseConnector for FakeHost {
    async fn connect(&self) -> Result<Box<dyn DatabaseSession>> {
        if self.should_fail(&Fail::ConnectDatabase) {
            return Err(anyhow!("Login failed for user 'sa'"));
        }
        self.lock().counters.sessions_opened += 1;
        Ok(Box::new(FakeSession { host: self.clone() }))
    }
}

#[async_trait]
impl ObjectStore for FakeHost {
    async fn upload(&self, dest: &StorageDestination, file: &Path) -> Result<UploadReceipt> {
        if self.should_fail(&Fail::Upload) {
            return Err(anyhow!("storage returned status 503 Service Unavailable"));
        }
        let bytes = fs::metadata(file)?.len();
        self.lock().objects.push(StoredObject {
            bucket: dest.bucket.clone(),
            key: dest.key.clone(),
            bytes,
        });
        Ok(UploadReceipt {
            bucket: dest.bucket.clone(),
            key: dest.key.clone(),
            bytes,
            etag: Some("d41d8cd98f00b204e9800998ecf8427e".to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started(Stage),
    Completed(Stage),
    Failed(Stage),
    Database(String),
}

/// Records every progress event
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<Event>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressReporter for RecordingReporter {
    fn stage_started(&self, stage: Stage) {
        self.events.lock().unwrap().push(Event::Started(stage));
    }

    fn stage_completed(&self, stage: Stage, _detail: &str) {
        self.events.lock().unwrap().push(Event::Completed(stage));
    }

    fn stage_failed(&self, stage: Stage, _error: &PipelineError) {
        self.events.lock().unwrap().push(Event::Failed(stage));
    }

    fn database_backed_up(&self, database: &str) {
        self.events.lock().unwrap().push(Event::Database(database.to_string()));
    }
}

pub fn config(container: Option<&str>) -> BackupConfig {
    BackupConfig {
        server_ip: "10.0.0.5".to_string(),
        ssh_user: "deploy".to_string(),
        ssh_pass: "ssh-secret".to_string(),
        sql_server_address: "10.0.0.5".to_string(),
        sql_user: "sa".to_string(),
        sql_pass: "sql-secret".to_string(),
        docker_container: container.map(str::to_string),
        minio_endpoint: "minio.local:9000".to_string(),
        minio_access_key: "access".to_string(),
        minio_secret_key: "minio-secret".to_string(),
        bucket_name: "db-backups".to_string(),
        ..BackupConfig::default()
    }
}

pub fn timestamp() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 3, 9)
        .unwrap()
        .and_hms_opt(14, 5, 7)
        .unwrap()
}

/// Entry names of a `.tar.gz` archive, sorted
pub fn archive_entries(path: &Path) -> Vec<String> {
    let file = fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let mut names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// The four engine databases, for assertions
pub fn system_databases() -> Vec<&'static str> {
    SYSTEM_DATABASES.to_vec()
}
