/// Backup artifacts and where they currently live

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// One staging location in the container → host → local chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagingLocation {
    Container { container: String, path: String },
    RemoteHost { path: String },
    Local { path: PathBuf },
}

impl fmt::Display for StagingLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagingLocation::Container { container, path } => write!(f, "{}:{}", container, path),
            StagingLocation::RemoteHost { path } => write!(f, "host:{}", path),
            StagingLocation::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

/// The backup files of one run, at exactly one location at a time
///
/// Relocating consumes the set: the previous location is no longer
/// authoritative once the files have moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifactSet {
    location: StagingLocation,
    files: Vec<String>,
}

impl BackupArtifactSet {
    pub fn new(location: StagingLocation, files: Vec<String>) -> Self {
        Self { location, files }
    }

    pub fn location(&self) -> &StagingLocation {
        &self.location
    }

    /// File names, relative to the location
    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn relocate(self, location: StagingLocation) -> Self {
        Self {
            location,
            files: self.files,
        }
    }

    /// Replace an unknown file list with one discovered at the location
    pub fn with_files(self, files: Vec<String>) -> Self {
        Self {
            location: self.location,
            files,
        }
    }

    /// Expected files absent from `listing`
    pub fn missing_from(&self, listing: &[String]) -> Vec<String> {
        let present: BTreeSet<&str> = listing.iter().map(String::as_str).collect();
        self.files
            .iter()
            .filter(|file| !present.contains(file.as_str()))
            .cloned()
            .collect()
    }
}
