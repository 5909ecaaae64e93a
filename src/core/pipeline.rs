/// Backup pipeline orchestration
///
/// Runs the stages of one backup run strictly in order, checkpointing every
/// transition. The first failing stage aborts the run: nothing is retried and
/// nothing already done is rolled back.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::archive;
use crate::core::artifacts::{BackupArtifactSet, StagingLocation};
use crate::core::checkpoint::{CheckpointStore, RunState};
use crate::core::context::{DeploymentMode, RunContext};
use crate::core::database::{
    backup_in_container, backup_over_protocol, DatabaseConnector, DatabaseRef, TdsConnector,
};
use crate::core::error::{bounded, ErrorKind, PipelineError};
use crate::core::progress::ProgressReporter;
use crate::core::remote::{CommandBuilder, CommandOutput, RemoteConnector, RemoteExecutor, SshConnector};
use crate::core::storage::{ObjectStore, S3Publisher, UploadReceipt};
use crate::utils::{format_bytes, redact};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    PrepareBackupDir,
    BackupDatabases,
    EnsureContainerStagingDir,
    CopyContainerToHost,
    DownloadToLocal,
    CleanupRemote,
    CleanupContainer,
    Compress,
    Upload,
    Done,
    Aborted,
}

impl Stage {
    /// Stages a run executes in `mode`, in order
    pub fn plan(mode: DeploymentMode) -> Vec<Stage> {
        let mut plan = vec![Stage::Init, Stage::PrepareBackupDir, Stage::BackupDatabases];
        if mode.uses_container() {
            plan.push(Stage::EnsureContainerStagingDir);
            plan.push(Stage::CopyContainerToHost);
        }
        plan.push(Stage::DownloadToLocal);
        plan.push(Stage::CleanupRemote);
        if mode.uses_container() {
            plan.push(Stage::CleanupContainer);
        }
        plan.push(Stage::Compress);
        plan.push(Stage::Upload);
        plan
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::PrepareBackupDir => "prepare_backup_dir",
            Stage::BackupDatabases => "backup_databases",
            Stage::EnsureContainerStagingDir => "ensure_container_staging_dir",
            Stage::CopyContainerToHost => "copy_container_to_host",
            Stage::DownloadToLocal => "download_to_local",
            Stage::CleanupRemote => "cleanup_remote",
            Stage::CleanupContainer => "cleanup_container",
            Stage::Compress => "compress",
            Stage::Upload => "upload",
            Stage::Done => "done",
            Stage::Aborted => "aborted",
        }
    }

    /// Progress label shown while the stage runs
    pub fn label(self) -> &'static str {
        match self {
            Stage::Init => "Preparing run",
            Stage::PrepareBackupDir => "Creating backup directory",
            Stage::BackupDatabases => "Backing up databases",
            Stage::EnsureContainerStagingDir => "Checking backup files in container",
            Stage::CopyContainerToHost => "Copying backups from container to server",
            Stage::DownloadToLocal => "Downloading backups to local machine",
            Stage::CleanupRemote => "Deleting backup directory on server",
            Stage::CleanupContainer => "Deleting backup files in container",
            Stage::Compress => "Compressing backups",
            Stage::Upload => "Uploading archive",
            Stage::Done => "Done",
            Stage::Aborted => "Aborted",
        }
    }

    /// Error kind of a failure inside this stage
    pub fn error_kind(self) -> ErrorKind {
        match self {
            Stage::PrepareBackupDir | Stage::BackupDatabases => ErrorKind::BackupFailed,
            Stage::EnsureContainerStagingDir
            | Stage::CopyContainerToHost
            | Stage::DownloadToLocal
            | Stage::CleanupRemote
            | Stage::CleanupContainer => ErrorKind::TransferFailed,
            Stage::Compress => ErrorKind::ArchiveFailed,
            Stage::Upload => ErrorKind::UploadFailed,
            Stage::Init | Stage::Done | Stage::Aborted => ErrorKind::ConfigurationInvalid,
        }
    }

    /// What the stage will do for `ctx`, for dry runs
    pub fn describe(self, ctx: &RunContext) -> String {
        let container = ctx.container.as_deref().unwrap_or("-");
        match self {
            Stage::Init => format!("prepare local directory {}", ctx.local_staging_dir.display()),
            Stage::PrepareBackupDir => match ctx.mode {
                DeploymentMode::Direct => format!("mkdir host:{}", ctx.backup_dir),
                _ => format!("mkdir {}:{}", container, ctx.backup_dir),
            },
            Stage::BackupDatabases => match ctx.mode {
                DeploymentMode::ContainerDelegated => {
                    format!("sqlcmd in {} → {}/<db>.bak", container, ctx.backup_dir)
                }
                _ => format!("BACKUP DATABASE via {} → {}/<db>.bak", ctx.database.endpoint(), ctx.backup_dir),
            },
            Stage::EnsureContainerStagingDir => format!("verify {}:{}", container, ctx.backup_dir),
            Stage::CopyContainerToHost => format!(
                "docker cp {}:{} → host:{}",
                container, ctx.backup_dir, ctx.remote_staging_dir
            ),
            Stage::DownloadToLocal => format!(
                "sftp host:{} → {}",
                ctx.remote_staging_dir,
                ctx.local_staging_dir.display()
            ),
            Stage::CleanupRemote => format!("rm -rf host:{}", ctx.remote_staging_dir),
            Stage::CleanupContainer => format!("rm -rf {}:{}", container, ctx.backup_dir),
            Stage::Compress => format!("tar.gz → {}", ctx.archive_path.display()),
            Stage::Upload => format!(
                "PUT {}/{}/{}",
                ctx.storage.endpoint, ctx.storage.bucket, ctx.storage.key
            ),
            Stage::Done | Stage::Aborted => String::new(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External collaborators of a run
#[derive(Clone)]
pub struct Gateways {
    pub remote: Arc<dyn RemoteConnector>,
    pub database: Arc<dyn DatabaseConnector>,
    pub storage: Arc<dyn ObjectStore>,
}

impl Gateways {
    /// SSH/SFTP, TDS and S3 gateways for a real deployment
    pub fn for_context(ctx: &RunContext) -> Self {
        Self {
            remote: Arc::new(SshConnector::new(ctx.remote.clone(), ctx.timeouts)),
            database: Arc::new(TdsConnector::new(ctx.database.clone(), ctx.timeouts.connect)),
            storage: Arc::new(S3Publisher::new(ctx.timeouts.upload)),
        }
    }
}

/// Summary of a completed run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_name: String,
    pub archive_path: PathBuf,
    pub files: Vec<String>,
    pub receipt: Option<UploadReceipt>,
    /// Stages executed by this invocation
    pub stages: Vec<Stage>,
    pub elapsed: Duration,
}

/// An aborted run
#[derive(Debug, Error)]
#[error("{stage} stage failed")]
pub struct RunFailure {
    pub stage: Stage,
    /// Stages completed by this invocation before the failure
    pub completed: Vec<Stage>,
    #[source]
    pub error: PipelineError,
    pub checkpoint: PathBuf,
}

impl RunFailure {
    /// Command that continues this run, if its state was saved
    pub fn resume_command(&self) -> Option<String> {
        self.checkpoint
            .is_file()
            .then(|| format!("sqlbackup-cli run --resume {}", self.checkpoint.display()))
    }
}

struct StageOutcome {
    artifacts: Option<BackupArtifactSet>,
    detail: String,
    receipt: Option<UploadReceipt>,
}

impl StageOutcome {
    fn new(artifacts: Option<BackupArtifactSet>, detail: String) -> Self {
        Self {
            artifacts,
            detail,
            receipt: None,
        }
    }
}

/// The run's command channel, opened on first use and released once
struct Channels<'a> {
    connector: &'a dyn RemoteConnector,
    target: String,
    connect_timeout: Duration,
    shell: Option<Box<dyn RemoteExecutor>>,
}

impl<'a> Channels<'a> {
    fn new(connector: &'a dyn RemoteConnector, ctx: &RunContext) -> Self {
        Self {
            connector,
            target: format!("ssh {}", ctx.remote.endpoint()),
            connect_timeout: ctx.timeouts.connect,
            shell: None,
        }
    }

    async fn shell(&mut self) -> Result<&dyn RemoteExecutor, PipelineError> {
        if self.shell.is_none() {
            let shell =
                open_channel(self.connect_timeout, &self.target, self.connector.open_shell()).await?;
            debug!(target = %self.target, "command channel opened");
            self.shell = Some(shell);
        }
        match self.shell.as_deref() {
            Some(shell) => Ok(shell),
            None => Err(PipelineError::connection(&self.target, "command channel unavailable")),
        }
    }

    async fn release(&mut self) {
        if let Some(shell) = self.shell.take() {
            if let Err(e) = shell.disconnect().await {
                warn!(target = %self.target, error = %e, "failed to close command channel");
            }
        }
    }
}

async fn open_channel<T, F>(limit: Duration, target: &str, fut: F) -> Result<T, PipelineError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(e)) => Err(PipelineError::connection(target, format!("{:#}", e))),
        Err(_) => Err(PipelineError::connection(
            target,
            format!("timed out after {}", humantime::format_duration(limit)),
        )),
    }
}

pub struct Orchestrator {
    ctx: RunContext,
    gateways: Gateways,
    reporter: Arc<dyn ProgressReporter>,
    commands: CommandBuilder,
}

impl Orchestrator {
    pub fn new(ctx: RunContext, gateways: Gateways, reporter: Arc<dyn ProgressReporter>) -> Self {
        let commands = CommandBuilder::new(&ctx.commands);
        Self {
            ctx,
            gateways,
            reporter,
            commands,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Run every stage from the start
    pub async fn run(&self) -> Result<RunReport, RunFailure> {
        self.execute(RunState::new(self.ctx.clone())).await
    }

    /// Continue a checkpointed run after its last completed stage
    pub async fn resume(&self, state: RunState) -> Result<RunReport, RunFailure> {
        if state.context.run_name != self.ctx.run_name {
            return Err(self.failure(
                Stage::Init,
                Vec::new(),
                PipelineError::ConfigurationInvalid(format!(
                    "run state belongs to {}, not {}",
                    state.context.run_name, self.ctx.run_name
                )),
            ));
        }
        self.execute(state).await
    }

    fn failure(&self, stage: Stage, completed: Vec<Stage>, error: PipelineError) -> RunFailure {
        RunFailure {
            stage,
            completed,
            error,
            checkpoint: self.ctx.checkpoint_path.clone(),
        }
    }

    fn pending_stages(&self, state: &RunState) -> Result<Vec<Stage>, PipelineError> {
        let plan = Stage::plan(self.ctx.mode);
        let start = match state.last_completed {
            None => 0,
            Some(done) => plan.iter().position(|s| *s == done).map(|i| i + 1).ok_or_else(|| {
                PipelineError::ConfigurationInvalid(format!(
                    "stage {} is not part of a {} run",
                    done, self.ctx.mode
                ))
            })?,
        };
        Ok(plan[start..].to_vec())
    }

    async fn execute(&self, mut state: RunState) -> Result<RunReport, RunFailure> {
        let started = Instant::now();
        let store = CheckpointStore::new(&self.ctx.checkpoint_path);
        let pending = self
            .pending_stages(&state)
            .map_err(|e| self.failure(Stage::Init, Vec::new(), e))?;

        info!(run = %self.ctx.run_name, mode = %self.ctx.mode, stages = pending.len(), "backup run started");

        let mut channels = Channels::new(self.gateways.remote.as_ref(), &self.ctx);
        let mut completed = Vec::with_capacity(pending.len());
        let mut receipt = None;
        let mut failed = None;

        for stage in pending {
            self.reporter.stage_started(stage);
            info!(stage = %stage, "stage started");
            let stage_started = Instant::now();

            match self.run_stage(stage, &mut channels, state.artifacts.clone()).await {
                Ok(outcome) => {
                    if outcome.receipt.is_some() {
                        receipt = outcome.receipt;
                    }
                    state.complete(stage, outcome.artifacts);
                    save_checkpoint(&store, &state);
                    let elapsed_ms = stage_started.elapsed().as_millis() as u64;
                    info!(stage = %stage, elapsed_ms, "stage completed");
                    self.reporter.stage_completed(stage, &outcome.detail);
                    completed.push(stage);
                }
                Err(error) => {
                    state.abort(stage, &error);
                    save_checkpoint(&store, &state);
                    warn!(stage = %stage, error = %error, "stage failed, run aborted");
                    self.reporter.stage_failed(stage, &error);
                    failed = Some((stage, error));
                    break;
                }
            }
        }

        channels.release().await;

        if let Some((stage, error)) = failed {
            return Err(self.failure(stage, completed, error));
        }

        state.finish();
        if let Err(e) = store.remove() {
            warn!(path = %store.path().display(), error = %e, "failed to remove run state");
        }

        let files = state
            .artifacts
            .as_ref()
            .map(|set| set.files().to_vec())
            .unwrap_or_default();
        info!(run = %self.ctx.run_name, files = files.len(), "backup run completed");

        Ok(RunReport {
            run_name: self.ctx.run_name.clone(),
            archive_path: self.ctx.archive_path.clone(),
            files,
            receipt,
            stages: completed,
            elapsed: started.elapsed(),
        })
    }

    async fn run_stage(
        &self,
        stage: Stage,
        channels: &mut Channels<'_>,
        artifacts: Option<BackupArtifactSet>,
    ) -> Result<StageOutcome, PipelineError> {
        match stage {
            Stage::Init => self.init(),
            Stage::PrepareBackupDir => self.prepare_backup_dir(channels).await,
            Stage::BackupDatabases => self.backup_databases(channels).await,
            Stage::EnsureContainerStagingDir => {
                self.ensure_container_staging_dir(channels, self.require(stage, artifacts)?)
                    .await
            }
            Stage::CopyContainerToHost => {
                self.copy_container_to_host(channels, self.require(stage, artifacts)?)
                    .await
            }
            Stage::DownloadToLocal => {
                self.download_to_local(channels, self.require(stage, artifacts)?)
                    .await
            }
            Stage::CleanupRemote => self.cleanup_remote(channels, artifacts).await,
            Stage::CleanupContainer => self.cleanup_container(channels, artifacts).await,
            Stage::Compress => self.compress(self.require(stage, artifacts)?).await,
            Stage::Upload => self.upload(artifacts).await,
            Stage::Done | Stage::Aborted => Err(PipelineError::ConfigurationInvalid(format!(
                "{} is a terminal state, not a stage",
                stage
            ))),
        }
    }

    fn require(
        &self,
        stage: Stage,
        artifacts: Option<BackupArtifactSet>,
    ) -> Result<BackupArtifactSet, PipelineError> {
        artifacts.ok_or_else(|| {
            stage
                .error_kind()
                .with_message(format!("no backup artifacts recorded before {}", stage))
        })
    }

    /// Run one remote command, turning a non-zero exit into a stage failure
    async fn remote(
        &self,
        shell: &dyn RemoteExecutor,
        stage: Stage,
        action: &str,
        command: String,
    ) -> Result<CommandOutput, PipelineError> {
        self.remote_within(self.ctx.timeouts.command, shell, stage, action, command)
            .await
    }

    /// Like `remote`, for commands that move bulk data and need a longer limit
    async fn remote_within(
        &self,
        limit: Duration,
        shell: &dyn RemoteExecutor,
        stage: Stage,
        action: &str,
        command: String,
    ) -> Result<CommandOutput, PipelineError> {
        debug!(
            stage = %stage,
            command = %redact(&command, &self.ctx.secrets()),
            "remote command"
        );
        let output = bounded(
            limit,
            stage.error_kind(),
            action,
            shell.execute(&command),
        )
        .await?;
        if !output.stdout.trim().is_empty() {
            debug!(stage = %stage, output = %output.stdout.trim(), "remote command output");
        }
        output.ensure_success(stage.error_kind(), action)
    }

    /// Refuse recursive deletes of anything but this run's own directories
    fn guard_removal(&self, stage: Stage, path: &str) -> Result<(), PipelineError> {
        let last = path.trim_end_matches('/').rsplit('/').next();
        if path.starts_with('/') && last == Some(self.ctx.run_name.as_str()) {
            Ok(())
        } else {
            Err(stage.error_kind().with_message(format!(
                "refusing to delete {}: not a directory of run {}",
                path, self.ctx.run_name
            )))
        }
    }

    fn verify_listing(
        &self,
        stage: Stage,
        artifacts: &BackupArtifactSet,
        listing: &[String],
    ) -> Result<(), PipelineError> {
        let missing = artifacts.missing_from(listing);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(stage.error_kind().with_message(format!(
                "backup files missing from {}: {}",
                artifacts.location(),
                missing.join(", ")
            )))
        }
    }

    fn init(&self) -> Result<StageOutcome, PipelineError> {
        let root = self
            .ctx
            .local_staging_dir
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&root).map_err(|e| {
            PipelineError::ConfigurationInvalid(format!(
                "cannot create output directory {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(StageOutcome::new(
            None,
            format!("Run {} ({} mode)", self.ctx.run_name, self.ctx.mode),
        ))
    }

    async fn prepare_backup_dir(&self, channels: &mut Channels<'_>) -> Result<StageOutcome, PipelineError> {
        let stage = Stage::PrepareBackupDir;
        let shell = channels.shell().await?;

        let location = match self.ctx.mode {
            DeploymentMode::Direct => {
                self.remote(shell, stage, "mkdir", self.commands.make_dir(&self.ctx.backup_dir))
                    .await?;
                // The database service account writes here
                self.remote(shell, stage, "chmod", self.commands.chmod_recursive(&self.ctx.backup_dir))
                    .await?;
                StagingLocation::RemoteHost {
                    path: self.ctx.backup_dir.clone(),
                }
            }
            _ => {
                let container = self.ctx.container_id()?;
                self.remote(
                    shell,
                    stage,
                    "docker exec mkdir",
                    self.commands.container_make_dir(container, &self.ctx.backup_dir),
                )
                .await?;
                StagingLocation::Container {
                    container: container.to_string(),
                    path: self.ctx.backup_dir.clone(),
                }
            }
        };

        Ok(StageOutcome::new(None, format!("Backup directory ready: {}", location)))
    }

    async fn backup_databases(&self, channels: &mut Channels<'_>) -> Result<StageOutcome, PipelineError> {
        if self.ctx.mode == DeploymentMode::ContainerDelegated {
            let shell = channels.shell().await?;
            let artifacts = backup_in_container(shell, &self.commands, &self.ctx).await?;
            let detail = format!(
                "Delegated backup completed in container {}",
                self.ctx.container_id()?
            );
            return Ok(StageOutcome::new(Some(artifacts), detail));
        }

        let mut session = open_channel(
            self.ctx.timeouts.connect,
            &format!("sql server {}", self.ctx.database.endpoint()),
            self.gateways.database.connect(),
        )
        .await?;

        let reporter = Arc::clone(&self.reporter);
        let mut on_backup = move |database: &DatabaseRef| reporter.database_backed_up(database.name());
        let result = backup_over_protocol(session.as_mut(), &self.ctx, &mut on_backup).await;

        match tokio::time::timeout(self.ctx.timeouts.command, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to close SQL Server connection"),
            Err(_) => warn!("timed out closing SQL Server connection"),
        }

        let artifacts = result?;
        let detail = format!("Backed up {} databases", artifacts.files().len());
        Ok(StageOutcome::new(Some(artifacts), detail))
    }

    async fn ensure_container_staging_dir(
        &self,
        channels: &mut Channels<'_>,
        artifacts: BackupArtifactSet,
    ) -> Result<StageOutcome, PipelineError> {
        let stage = Stage::EnsureContainerStagingDir;
        let container = self.ctx.container_id()?;
        let shell = channels.shell().await?;

        self.remote(
            shell,
            stage,
            "docker exec mkdir",
            self.commands.container_make_dir(container, &self.ctx.backup_dir),
        )
        .await?;
        let listing = self
            .remote(
                shell,
                stage,
                "docker exec ls",
                self.commands.container_list_dir(container, &self.ctx.backup_dir),
            )
            .await?
            .lines();

        let artifacts = if artifacts.is_empty() {
            if listing.is_empty() {
                return Err(stage.error_kind().with_message(format!(
                    "no backup files found in {}",
                    artifacts.location()
                )));
            }
            artifacts.with_files(listing)
        } else {
            self.verify_listing(stage, &artifacts, &listing)?;
            artifacts
        };

        let detail = format!(
            "{} backup files present in {}",
            artifacts.files().len(),
            artifacts.location()
        );
        Ok(StageOutcome::new(Some(artifacts), detail))
    }

    async fn copy_container_to_host(
        &self,
        channels: &mut Channels<'_>,
        artifacts: BackupArtifactSet,
    ) -> Result<StageOutcome, PipelineError> {
        let stage = Stage::CopyContainerToHost;
        let container = self.ctx.container_id()?;
        let shell = channels.shell().await?;
        let staging = &self.ctx.remote_staging_dir;

        self.remote(shell, stage, "mkdir", self.commands.make_dir(staging))
            .await?;
        // `<dir>/.` copies the directory contents whether or not the target exists
        let source = format!("{}/.", self.ctx.backup_dir);
        self.remote_within(
            self.ctx.timeouts.transfer,
            shell,
            stage,
            "docker cp",
            self.commands.container_copy(container, &source, staging),
        )
        .await?;

        let artifacts = artifacts.relocate(StagingLocation::RemoteHost {
            path: staging.clone(),
        });
        let detail = format!(
            "Copied {} backup files to {}",
            artifacts.files().len(),
            artifacts.location()
        );
        Ok(StageOutcome::new(Some(artifacts), detail))
    }

    async fn download_to_local(
        &self,
        channels: &mut Channels<'_>,
        artifacts: BackupArtifactSet,
    ) -> Result<StageOutcome, PipelineError> {
        let stage = Stage::DownloadToLocal;
        let staging = &self.ctx.remote_staging_dir;
        let local = &self.ctx.local_staging_dir;
        let shell = channels.shell().await?;

        let listing = self
            .remote(shell, stage, "ls", self.commands.list_dir(staging))
            .await?
            .lines();
        if artifacts.is_empty() {
            return Err(stage
                .error_kind()
                .with_message(format!("no backup files recorded for {}", artifacts.location())));
        }
        self.verify_listing(stage, &artifacts, &listing)?;

        self.remote(shell, stage, "chmod", self.commands.chmod_recursive(staging))
            .await?;

        let transfer = open_channel(
            self.ctx.timeouts.connect,
            &format!("sftp {}", self.ctx.remote.endpoint()),
            self.gateways.remote.open_transfer(),
        )
        .await?;
        let result = bounded(
            self.ctx.timeouts.transfer,
            ErrorKind::TransferFailed,
            "download",
            transfer.download(staging, local),
        )
        .await;
        if let Err(e) = transfer.disconnect().await {
            warn!(error = %e, "failed to close transfer channel");
        }
        let summary = result?;

        let missing: Vec<&str> = artifacts
            .files()
            .iter()
            .filter(|file| !local.join(file.as_str()).is_file())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(stage.error_kind().with_message(format!(
                "backup files missing from {} after download: {}",
                local.display(),
                missing.join(", ")
            )));
        }

        let artifacts = artifacts.relocate(StagingLocation::Local {
            path: local.clone(),
        });
        let detail = format!(
            "Downloaded {} files ({}) to {}",
            summary.files,
            format_bytes(summary.bytes),
            local.display()
        );
        Ok(StageOutcome::new(Some(artifacts), detail))
    }

    async fn cleanup_remote(
        &self,
        channels: &mut Channels<'_>,
        artifacts: Option<BackupArtifactSet>,
    ) -> Result<StageOutcome, PipelineError> {
        let stage = Stage::CleanupRemote;
        let staging = &self.ctx.remote_staging_dir;
        self.guard_removal(stage, staging)?;

        let shell = channels.shell().await?;
        self.remote(shell, stage, "rm", self.commands.remove_dir(staging))
            .await?;

        Ok(StageOutcome::new(
            artifacts,
            format!("Deleted backup directory on server: {}", staging),
        ))
    }

    async fn cleanup_container(
        &self,
        channels: &mut Channels<'_>,
        artifacts: Option<BackupArtifactSet>,
    ) -> Result<StageOutcome, PipelineError> {
        let stage = Stage::CleanupContainer;
        let container = self.ctx.container_id()?;
        self.guard_removal(stage, &self.ctx.backup_dir)?;

        let shell = channels.shell().await?;
        self.remote(
            shell,
            stage,
            "docker exec rm",
            self.commands.container_remove_dir(container, &self.ctx.backup_dir),
        )
        .await?;

        Ok(StageOutcome::new(
            artifacts,
            format!(
                "Deleted backup files from container {}: {}",
                container, self.ctx.backup_dir
            ),
        ))
    }

    async fn compress(&self, artifacts: BackupArtifactSet) -> Result<StageOutcome, PipelineError> {
        let stage = Stage::Compress;
        let source = self.ctx.local_staging_dir.clone();

        let info = tokio::task::spawn_blocking(move || archive::compress(&source))
            .await
            .map_err(|e| stage.error_kind().with_message(format!("archive task failed: {}", e)))??;

        if info.path != self.ctx.archive_path {
            return Err(stage.error_kind().with_message(format!(
                "archive written to {} instead of {}",
                info.path.display(),
                self.ctx.archive_path.display()
            )));
        }
        let missing = artifacts.missing_from(&info.entries);
        if !missing.is_empty() {
            let _ = std::fs::remove_file(&info.path);
            return Err(stage.error_kind().with_message(format!(
                "archive is missing backup files: {}",
                missing.join(", ")
            )));
        }

        let detail = format!(
            "Compressed {} files into {} ({})",
            info.entries.len(),
            info.path.display(),
            format_bytes(info.bytes)
        );
        Ok(StageOutcome::new(Some(artifacts), detail))
    }

    async fn upload(&self, artifacts: Option<BackupArtifactSet>) -> Result<StageOutcome, PipelineError> {
        let receipt = bounded(
            self.ctx.timeouts.upload,
            ErrorKind::UploadFailed,
            "upload",
            self.gateways
                .storage
                .upload(&self.ctx.storage, &self.ctx.archive_path),
        )
        .await?;

        let detail = format!(
            "Uploaded {}/{} ({})",
            receipt.bucket,
            receipt.key,
            format_bytes(receipt.bytes)
        );
        Ok(StageOutcome {
            artifacts,
            detail,
            receipt: Some(receipt),
        })
    }
}

fn save_checkpoint(store: &CheckpointStore, state: &RunState) {
    if let Err(e) = store.save(state) {
        warn!(path = %store.path().display(), error = %e, "failed to write run state");
    }
}
