/// Persisted run state
///
/// The orchestrator records every stage transition so an aborted run can be
/// inspected with `state show` and continued with `run --resume`.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::artifacts::BackupArtifactSet;
use crate::core::context::RunContext;
use crate::core::error::PipelineError;
use crate::core::pipeline::Stage;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Done,
    Aborted,
}

/// Checkpoint record of one run
///
/// Credentials are not part of the record; a resumed run takes them from
/// the current configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub status: RunStatus,
    pub last_completed: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<BackupArtifactSet>,
    pub context: RunContext,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(context: RunContext) -> Self {
        Self {
            status: RunStatus::Running,
            last_completed: None,
            failed_stage: None,
            error: None,
            artifacts: None,
            context,
            updated_at: Utc::now(),
        }
    }

    /// Mark `stage` done, recording where the backup files now are
    pub fn complete(&mut self, stage: Stage, artifacts: Option<BackupArtifactSet>) {
        self.last_completed = Some(stage);
        self.artifacts = artifacts;
        self.updated_at = Utc::now();
    }

    pub fn abort(&mut self, stage: Stage, error: &PipelineError) {
        self.status = RunStatus::Aborted;
        self.failed_stage = Some(stage);
        self.error = Some(error.to_string());
        self.updated_at = Utc::now();
    }

    pub fn finish(&mut self) {
        self.status = RunStatus::Done;
        self.last_completed = Some(Stage::Done);
        self.updated_at = Utc::now();
    }

    /// Clear the failure of an aborted run so it can continue
    pub fn reopen(mut self) -> Result<Self> {
        if self.status == RunStatus::Done {
            return Err(anyhow!("Run {} already completed", self.context.run_name));
        }
        self.status = RunStatus::Running;
        self.failed_stage = None;
        self.error = None;
        self.updated_at = Utc::now();
        Ok(self)
    }
}

/// JSON checkpoint file next to the run's archive
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the state atomically (temp file, then rename)
    pub fn save(&self, state: &RunState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let contents =
            serde_json::to_string_pretty(state).context("Failed to serialize run state")?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(())
    }

    pub fn load(path: &Path) -> Result<RunState> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Run state file not found: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse run state {}", path.display()))
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}
