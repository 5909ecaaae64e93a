/// Local archive stage: directory tree → `<dir>.tar.gz`

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::debug;
use walkdir::WalkDir;

use crate::core::error::PipelineError;
use crate::utils::ARCHIVE_EXTENSION;

/// What [`compress`] produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    /// Entry names, relative to the source directory
    pub entries: Vec<String>,
    pub bytes: u64,
}

/// `<source_dir>.tar.gz`
pub fn archive_path_for(source_dir: &Path) -> PathBuf {
    let mut name = source_dir.as_os_str().to_owned();
    name.push(".");
    name.push(ARCHIVE_EXTENSION);
    PathBuf::from(name)
}

/// Compress every regular file below `source_dir` into `<source_dir>.tar.gz`
///
/// A missing, non-directory or file-less source is an error: an empty
/// archive is never produced.
pub fn compress(source_dir: &Path) -> Result<ArchiveInfo, PipelineError> {
    if source_dir.as_os_str().is_empty() {
        return Err(PipelineError::ArchiveFailed(
            "source directory path is empty".to_string(),
        ));
    }
    if !source_dir.is_dir() {
        return Err(PipelineError::ArchiveFailed(format!(
            "source directory {} does not exist",
            source_dir.display()
        )));
    }

    let files = collect_files(source_dir)?;
    if files.is_empty() {
        return Err(PipelineError::ArchiveFailed(format!(
            "source directory {} contains no backup files",
            source_dir.display()
        )));
    }

    let archive_path = archive_path_for(source_dir);
    match write_archive(&archive_path, &files) {
        Ok(bytes) => Ok(ArchiveInfo {
            path: archive_path,
            entries: files.into_iter().map(|(_, name)| name).collect(),
            bytes,
        }),
        Err(e) => {
            // Never leave a truncated archive behind
            let _ = fs::remove_file(&archive_path);
            Err(PipelineError::ArchiveFailed(format!(
                "failed to write {}: {}",
                archive_path.display(),
                e
            )))
        }
    }
}

/// Regular files below `root` with their `/`-separated relative names, sorted
fn collect_files(root: &Path) -> Result<Vec<(PathBuf, String)>, PipelineError> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            PipelineError::ArchiveFailed(format!("failed to walk {}: {}", root.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| PipelineError::ArchiveFailed(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), name));
    }

    Ok(files)
}

fn write_archive(archive_path: &Path, files: &[(PathBuf, String)]) -> std::io::Result<u64> {
    let file = File::create(archive_path)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);

    for (path, name) in files {
        debug!(file = %path.display(), entry = %name, "adding to archive");
        builder.append_path_with_name(path, name)?;
    }

    let mut writer = builder.into_inner()?.finish()?;
    writer.flush()?;
    drop(writer);

    Ok(fs::metadata(archive_path)?.len())
}
