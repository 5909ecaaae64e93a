/// Remote-to-local file transfer over SFTP

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ssh2::{Session, Sftp};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// What a download moved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub files: usize,
    pub bytes: u64,
}

/// An authenticated download channel
///
/// Partial and total failures are indistinguishable to callers: any error
/// means the transfer failed.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Copy `remote_path` (file or directory tree) into `local_path`,
    /// creating `local_path` if needed
    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<TransferSummary>;

    /// Close the channel; later calls are no-ops
    async fn disconnect(&self) -> Result<()>;
}

pub struct SftpTransfer {
    session: Session,
    endpoint: String,
    released: AtomicBool,
}

impl SftpTransfer {
    pub fn new(session: Session, endpoint: String) -> Self {
        Self {
            session,
            endpoint,
            released: AtomicBool::new(false),
        }
    }
}

fn download_tree(session: &Session, remote: &Path, local: &Path) -> Result<TransferSummary> {
    let sftp = session.sftp().context("Failed to open SFTP subsystem")?;
    let stat = sftp
        .stat(remote)
        .with_context(|| format!("Remote path {} not found", remote.display()))?;

    let mut summary = TransferSummary::default();
    fs::create_dir_all(local)
        .with_context(|| format!("Failed to create {}", local.display()))?;

    if stat.is_dir() {
        copy_dir(&sftp, remote, local, &mut summary)?;
    } else {
        let name = remote
            .file_name()
            .ok_or_else(|| anyhow!("Remote path {} has no file name", remote.display()))?;
        copy_file(&sftp, remote, &local.join(name), &mut summary)?;
    }

    Ok(summary)
}

fn copy_dir(sftp: &Sftp, remote: &Path, local: &Path, summary: &mut TransferSummary) -> Result<()> {
    let entries = sftp
        .readdir(remote)
        .with_context(|| format!("Failed to list {}", remote.display()))?;

    for (path, stat) in entries {
        let name = match path.file_name() {
            Some(name) => name.to_owned(),
            None => continue,
        };
        let target: PathBuf = local.join(&name);
        if stat.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
            copy_dir(sftp, &path, &target, summary)?;
        } else {
            copy_file(sftp, &path, &target, summary)?;
        }
    }

    Ok(())
}

fn copy_file(sftp: &Sftp, remote: &Path, local: &Path, summary: &mut TransferSummary) -> Result<()> {
    let mut source = sftp
        .open(remote)
        .with_context(|| format!("Failed to open {}", remote.display()))?;
    let mut target = fs::File::create(local)
        .with_context(|| format!("Failed to create {}", local.display()))?;

    let bytes = std::io::copy(&mut source, &mut target)
        .with_context(|| format!("Failed to download {}", remote.display()))?;

    debug!(file = %remote.display(), bytes, "downloaded");
    summary.files += 1;
    summary.bytes += bytes;
    Ok(())
}

#[async_trait]
impl FileTransfer for SftpTransfer {
    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<TransferSummary> {
        if self.released.load(Ordering::SeqCst) {
            return Err(anyhow!("SFTP channel to {} is already closed", self.endpoint));
        }
        let session = self.session.clone();
        let remote = PathBuf::from(remote_path);
        let local = local_path.to_path_buf();
        tokio::task::spawn_blocking(move || download_tree(&session, &remote, &local))
            .await
            .context("SFTP download task failed")?
            .with_context(|| format!("Download from {}:{} failed", self.endpoint, remote_path))
    }

    async fn disconnect(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || session.disconnect(None, "transfer finished", None))
            .await
            .context("SFTP disconnect task failed")?
            .with_context(|| format!("Failed to disconnect from {}", self.endpoint))
    }
}

impl Drop for SftpTransfer {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.session.disconnect(None, "transfer dropped", None) {
                warn!(host = %self.endpoint, error = %e, "SFTP disconnect on drop failed");
            }
        }
    }
}
