mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use common::{
    archive_entries, config, system_databases, timestamp, Event, Fail, FakeHost,
    RecordingReporter, Space,
};
use sqlbackup_cli::core::{
    CheckpointStore, DeploymentMode, Orchestrator, PipelineError, RunContext, RunStatus, Stage,
};

fn context(container: Option<&str>, mode: Option<DeploymentMode>, root: &Path) -> RunContext {
    let mut config = config(container);
    config.mode = mode;
    RunContext::from_config(&config, timestamp(), root).unwrap()
}

fn orchestrator(ctx: &RunContext, host: &FakeHost, reporter: &Arc<RecordingReporter>) -> Orchestrator {
    Orchestrator::new(ctx.clone(), host.gateways(), reporter.clone())
}

#[tokio::test]
async fn test_direct_mode_backs_up_user_databases_only() {
    let dir = TempDir::new().unwrap();
    let ctx = context(None, None, dir.path());
    let host = FakeHost::new(&["Sales", "HR", "master", "tempdb"], Space::Host);
    let reporter = Arc::new(RecordingReporter::default());

    let report = orchestrator(&ctx, &host, &reporter).run().await.unwrap();

    assert_eq!(ctx.mode, DeploymentMode::Direct);
    assert_eq!(host.backups(), vec!["Sales", "HR"]);
    assert_eq!(report.files, vec!["Sales.bak", "HR.bak"]);
    assert_eq!(report.stages, Stage::plan(DeploymentMode::Direct));

    assert_eq!(archive_entries(&ctx.archive_path), vec!["HR.bak", "Sales.bak"]);
    let objects = host.objects();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].bucket, "db-backups");
    assert_eq!(objects[0].key, "DatabaseBackups_2025-03-09_14-05-07.tar.gz");
    assert_eq!(
        Some(objects[0].key.as_str()),
        ctx.archive_path.file_name().and_then(|n| n.to_str())
    );

    // Remote backup directory removed, local copies kept
    assert!(!host.exists(Space::Host, &ctx.backup_dir));
    assert!(ctx.local_staging_dir.join("Sales.bak").is_file());
    assert!(!ctx.checkpoint_path.exists());

    let events = reporter.events();
    assert!(events.contains(&Event::Database("Sales".to_string())));
    assert!(!events.iter().any(|e| matches!(e, Event::Failed(_))));
}

#[tokio::test]
async fn test_direct_mode_never_touches_a_container() {
    let dir = TempDir::new().unwrap();
    let ctx = context(None, None, dir.path());
    let host = FakeHost::new(&["Sales"], Space::Host);
    let reporter = Arc::new(RecordingReporter::default());

    orchestrator(&ctx, &host, &reporter).run().await.unwrap();

    assert!(host.commands().iter().all(|c| !c.contains("docker")));
}

#[tokio::test]
async fn test_container_mode_stages_three_files() {
    let dir = TempDir::new().unwrap();
    let ctx = context(Some("mssql"), None, dir.path());
    let host = FakeHost::new(&["master", "Sales", "HR", "model", "Ops", "msdb"], Space::Container);
    let reporter = Arc::new(RecordingReporter::default());

    let report = orchestrator(&ctx, &host, &reporter).run().await.unwrap();

    assert_eq!(ctx.mode, DeploymentMode::Container);
    assert_eq!(report.stages, Stage::plan(DeploymentMode::Container));
    assert_eq!(archive_entries(&ctx.archive_path), vec!["HR.bak", "Ops.bak", "Sales.bak"]);
    assert_eq!(host.objects().len(), 1);

    assert!(!host.exists(Space::Host, &ctx.remote_staging_dir));
    assert!(!host.exists(Space::Container, &ctx.backup_dir));

    let commands = host.commands();
    assert!(commands
        .iter()
        .any(|c| c.starts_with("sudo docker cp mssql:") && c.ends_with(&ctx.remote_staging_dir)));
    assert!(commands
        .iter()
        .any(|c| c == &format!("sudo chmod -R 777 {}", ctx.remote_staging_dir)));
}

#[tokio::test]
async fn test_delegated_mode_discovers_files_by_listing() {
    let dir = TempDir::new().unwrap();
    let ctx = context(Some("mssql"), Some(DeploymentMode::ContainerDelegated), dir.path());
    let host = FakeHost::new(&["master", "tempdb", "model", "msdb", "Sales", "HR"], Space::Container)
        .with_delegated_backup_dir(&ctx.backup_dir);
    let reporter = Arc::new(RecordingReporter::default());

    let report = orchestrator(&ctx, &host, &reporter).run().await.unwrap();

    assert_eq!(report.files, vec!["HR.bak", "Sales.bak"]);
    assert_eq!(archive_entries(&ctx.archive_path), vec!["HR.bak", "Sales.bak"]);
    assert_eq!(host.counters().sessions_opened, 0);

    let sqlcmd: Vec<String> = host
        .commands()
        .into_iter()
        .filter(|c| c.contains("sqlcmd"))
        .collect();
    assert_eq!(sqlcmd.len(), 1);
    for db in system_databases() {
        assert!(sqlcmd[0].contains(&format!("'\\''{}'\\''", db)));
    }
}

#[tokio::test]
async fn test_download_failure_aborts_before_compress() {
    let dir = TempDir::new().unwrap();
    let ctx = context(Some("mssql"), None, dir.path());
    let host = FakeHost::new(&["Sales", "HR", "Ops"], Space::Container);
    host.fail(Fail::Download);
    let reporter = Arc::new(RecordingReporter::default());

    let failure = orchestrator(&ctx, &host, &reporter).run().await.unwrap_err();

    assert_eq!(failure.stage, Stage::DownloadToLocal);
    assert!(matches!(failure.error, PipelineError::TransferFailed(_)));
    assert_eq!(failure.error.exit_code(), 5);
    assert!(!failure.completed.contains(&Stage::Compress));
    assert!(!ctx.archive_path.exists());
    assert!(host.objects().is_empty());

    let events = reporter.events();
    assert_eq!(events.last(), Some(&Event::Failed(Stage::DownloadToLocal)));
    assert!(!events.contains(&Event::Started(Stage::CleanupRemote)));

    let state = CheckpointStore::load(&ctx.checkpoint_path).unwrap();
    assert_eq!(state.status, RunStatus::Aborted);
    assert_eq!(state.failed_stage, Some(Stage::DownloadToLocal));
    assert_eq!(state.last_completed, Some(Stage::CopyContainerToHost));
    // Files are still staged on the host for a later resume
    assert!(host.exists(Space::Host, &ctx.remote_staging_dir));
}

#[tokio::test]
async fn test_resume_continues_after_last_completed_stage() {
    let dir = TempDir::new().unwrap();
    let ctx = context(Some("mssql"), None, dir.path());
    let host = FakeHost::new(&["Sales", "HR", "Ops"], Space::Container);
    host.fail(Fail::Upload);
    let reporter = Arc::new(RecordingReporter::default());

    let failure = orchestrator(&ctx, &host, &reporter).run().await.unwrap_err();
    assert_eq!(failure.stage, Stage::Upload);
    assert_eq!(failure.error.exit_code(), 7);
    let backups_before = host.backups().len();

    host.clear_failures();
    let state = CheckpointStore::load(&ctx.checkpoint_path)
        .unwrap()
        .reopen()
        .unwrap();
    let resumed_ctx = state.context.clone().with_credentials(&config(Some("mssql")));
    assert_eq!(resumed_ctx, ctx);

    let reporter = Arc::new(RecordingReporter::default());
    let report = orchestrator(&resumed_ctx, &host, &reporter)
        .resume(state)
        .await
        .unwrap();

    assert_eq!(report.stages, vec![Stage::Upload]);
    assert_eq!(host.backups().len(), backups_before);
    assert_eq!(host.objects().len(), 1);
    assert_eq!(host.counters().shells_opened, 1);
    assert!(!ctx.checkpoint_path.exists());
}

#[tokio::test]
async fn test_zero_user_databases_is_a_backup_failure() {
    let dir = TempDir::new().unwrap();
    let ctx = context(None, None, dir.path());
    let host = FakeHost::new(&["master", "tempdb", "model", "msdb"], Space::Host);
    let reporter = Arc::new(RecordingReporter::default());

    let failure = orchestrator(&ctx, &host, &reporter).run().await.unwrap_err();

    assert_eq!(failure.stage, Stage::BackupDatabases);
    assert!(matches!(failure.error, PipelineError::BackupFailed(_)));
    assert_eq!(host.counters().sessions_closed, 1);
}

#[tokio::test]
async fn test_connection_failures() {
    let dir = TempDir::new().unwrap();
    let ctx = context(Some("mssql"), None, dir.path());

    let host = FakeHost::new(&["Sales"], Space::Container);
    host.fail(Fail::OpenShell);
    let reporter = Arc::new(RecordingReporter::default());
    let failure = orchestrator(&ctx, &host, &reporter).run().await.unwrap_err();
    assert_eq!(failure.stage, Stage::PrepareBackupDir);
    assert_eq!(failure.error.exit_code(), 3);
    assert_eq!(host.counters().shell_disconnects, 0);

    let host = FakeHost::new(&["Sales"], Space::Container);
    host.fail(Fail::ConnectDatabase);
    let failure = orchestrator(&ctx, &host, &reporter).run().await.unwrap_err();
    assert_eq!(failure.stage, Stage::BackupDatabases);
    assert!(matches!(failure.error, PipelineError::ConnectionFailed { .. }));
    assert_eq!(host.counters().shell_disconnects, 1);
}

/// Make `stage` fail for a run rooted at `root`
fn inject(stage: Stage, ctx: &RunContext, host: &FakeHost) {
    match stage {
        Stage::Init => {}
        Stage::PrepareBackupDir => host.fail(Fail::Command("mkdir -p".to_string())),
        Stage::BackupDatabases if ctx.mode == DeploymentMode::ContainerDelegated => {
            host.fail(Fail::Command("sqlcmd".to_string()))
        }
        Stage::BackupDatabases => host.fail(Fail::Backup("HR".to_string())),
        Stage::EnsureContainerStagingDir => host.fail(Fail::Command("docker exec mssql ls".to_string())),
        Stage::CopyContainerToHost => host.fail(Fail::Command("docker cp".to_string())),
        Stage::DownloadToLocal => host.fail(Fail::Download),
        Stage::CleanupRemote => host.fail(Fail::Command(format!("rm -rf {}", ctx.remote_staging_dir))),
        Stage::CleanupContainer => host.fail(Fail::Command("docker exec mssql rm".to_string())),
        Stage::Compress => fs::create_dir_all(&ctx.archive_path).unwrap(),
        Stage::Upload => host.fail(Fail::Upload),
        Stage::Done | Stage::Aborted => unreachable!(),
    }
}

async fn assert_channels_released_on_failure(container: Option<&str>, mode: Option<DeploymentMode>) {
    let scratch = TempDir::new().unwrap();
    let mode = context(container, mode, scratch.path()).mode;
    let space = if mode.uses_container() { Space::Container } else { Space::Host };

    for stage in Stage::plan(mode) {
        let dir = TempDir::new().unwrap();
        let root = if stage == Stage::Init {
            // A file where the output directory should be
            let blocker = dir.path().join("blocker");
            fs::write(&blocker, b"x").unwrap();
            blocker.join("out")
        } else {
            dir.path().to_path_buf()
        };
        let ctx = context(container, Some(mode), &root);
        let mut host = FakeHost::new(&["Sales", "HR", "master"], space);
        if mode == DeploymentMode::ContainerDelegated {
            host = host.with_delegated_backup_dir(&ctx.backup_dir);
        }
        inject(stage, &ctx, &host);
        let reporter = Arc::new(RecordingReporter::default());

        let failure = orchestrator(&ctx, &host, &reporter).run().await.unwrap_err();

        assert_eq!(failure.stage, stage, "failure injected at {}", stage);
        assert_eq!(failure.error.kind(), stage.error_kind(), "{}: error kind", stage);
        let counters = host.counters();
        assert!(counters.shells_opened <= 1, "{}: shell opened twice", stage);
        assert_eq!(counters.shells_opened, counters.shell_disconnects, "{}: shell", stage);
        assert_eq!(counters.transfers_opened, counters.transfer_disconnects, "{}: transfer", stage);
        assert_eq!(counters.sessions_opened, counters.sessions_closed, "{}: session", stage);

        let events = reporter.events();
        assert_eq!(events.last(), Some(&Event::Failed(stage)), "{}: events", stage);
        if stage != Stage::Upload {
            assert!(host.objects().is_empty());
        }
    }
}

#[tokio::test]
async fn test_every_channel_released_once_whichever_stage_fails_direct() {
    assert_channels_released_on_failure(None, None).await;
}

#[tokio::test]
async fn test_every_channel_released_once_whichever_stage_fails_container() {
    assert_channels_released_on_failure(Some("mssql"), None).await;
}

#[tokio::test]
async fn test_every_channel_released_once_whichever_stage_fails_delegated() {
    assert_channels_released_on_failure(Some("mssql"), Some(DeploymentMode::ContainerDelegated)).await;
}

#[tokio::test]
async fn test_delegated_sqlcmd_error_is_a_backup_failure() {
    let dir = TempDir::new().unwrap();
    let ctx = context(Some("mssql"), Some(DeploymentMode::ContainerDelegated), dir.path());
    let host = FakeHost::new(&["Sales", "HR"], Space::Container)
        .with_delegated_backup_dir(&ctx.backup_dir);
    host.fail(Fail::Command("sqlcmd".to_string()));
    let reporter = Arc::new(RecordingReporter::default());

    let failure = orchestrator(&ctx, &host, &reporter).run().await.unwrap_err();

    assert_eq!(failure.stage, Stage::BackupDatabases);
    assert!(matches!(&failure.error, PipelineError::BackupFailed(msg) if msg.contains("status 1")));
    assert_eq!(failure.error.exit_code(), 4);
    assert!(host.backups().is_empty());

    let counters = host.counters();
    assert_eq!(counters.shells_opened, 1);
    assert_eq!(counters.shell_disconnects, 1);
    assert_eq!(counters.sessions_opened, 0);
    assert_eq!(counters.transfers_opened, 0);
}

#[tokio::test]
async fn test_container_copy_is_bounded_by_transfer_timeout() {
    let dir = TempDir::new().unwrap();
    let mut ctx = context(Some("mssql"), None, dir.path());
    ctx.timeouts.command = Duration::from_millis(200);
    ctx.timeouts.transfer = Duration::from_secs(10);
    let host = FakeHost::new(&["Sales", "HR"], Space::Container);
    host.delay("docker cp", Duration::from_millis(500));
    let reporter = Arc::new(RecordingReporter::default());

    let report = orchestrator(&ctx, &host, &reporter).run().await.unwrap();
    assert!(report.stages.contains(&Stage::CopyContainerToHost));

    // The same copy fails once it outlasts the transfer limit
    let dir = TempDir::new().unwrap();
    let mut ctx = context(Some("mssql"), None, dir.path());
    ctx.timeouts.transfer = Duration::from_millis(100);
    let host = FakeHost::new(&["Sales", "HR"], Space::Container);
    host.delay("docker cp", Duration::from_millis(500));

    let failure = orchestrator(&ctx, &host, &reporter).run().await.unwrap_err();
    assert_eq!(failure.stage, Stage::CopyContainerToHost);
    assert!(matches!(&failure.error, PipelineError::TransferFailed(msg) if msg.contains("timed out")));
    assert_eq!(host.counters().shell_disconnects, 1);
}

#[tokio::test]
async fn test_resume_hint_only_when_state_was_saved() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, b"x").unwrap();
    let ctx = context(None, None, &blocker.join("out"));
    let host = FakeHost::new(&["Sales"], Space::Host);
    let reporter = Arc::new(RecordingReporter::default());

    let failure = orchestrator(&ctx, &host, &reporter).run().await.unwrap_err();
    assert_eq!(failure.stage, Stage::Init);
    assert_eq!(failure.resume_command(), None);

    let dir = TempDir::new().unwrap();
    let ctx = context(None, None, dir.path());
    let host = FakeHost::new(&["Sales"], Space::Host);
    host.fail(Fail::Upload);

    let failure = orchestrator(&ctx, &host, &reporter).run().await.unwrap_err();
    assert_eq!(
        failure.resume_command(),
        Some(format!("sqlbackup-cli run --resume {}", ctx.checkpoint_path.display()))
    );
}

#[tokio::test]
async fn test_successful_run_releases_channels_once() {
    let dir = TempDir::new().unwrap();
    let ctx = context(Some("mssql"), None, dir.path());
    let host = FakeHost::new(&["Sales", "HR"], Space::Container);
    let reporter = Arc::new(RecordingReporter::default());

    orchestrator(&ctx, &host, &reporter).run().await.unwrap();

    let counters = host.counters();
    assert_eq!(counters.shells_opened, 1);
    assert_eq!(counters.shell_disconnects, 1);
    assert_eq!(counters.transfers_opened, 1);
    assert_eq!(counters.transfer_disconnects, 1);
    assert_eq!(counters.sessions_opened, 1);
    assert_eq!(counters.sessions_closed, 1);
}

#[tokio::test]
async fn test_run_names_are_consistent() {
    let dir = TempDir::new().unwrap();
    let ctx = context(Some("mssql"), None, dir.path());
    let host = FakeHost::new(&["Sales"], Space::Container);
    let reporter = Arc::new(RecordingReporter::default());

    orchestrator(&ctx, &host, &reporter).run().await.unwrap();

    let run = "DatabaseBackups_2025-03-09_14-05-07";
    assert!(ctx.remote_staging_dir.ends_with(&format!("/{}", run)));
    assert!(ctx.backup_dir.ends_with(&format!("/{}", run)));
    assert_eq!(ctx.local_staging_dir.file_name().unwrap(), run);
    assert_eq!(host.objects()[0].key, format!("{}.tar.gz", run));
    assert!(dir.path().join(format!("{}.tar.gz", run)).is_file());
}
