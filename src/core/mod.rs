pub mod archive;
pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod remote;
pub mod storage;
pub mod transfer;

pub use checkpoint::{CheckpointStore, RunState, RunStatus};
pub use config::BackupConfig;
pub use context::{DeploymentMode, RunContext};
pub use error::{exit_code_for, PipelineError};
pub use pipeline::{Gateways, Orchestrator, RunFailure, RunReport, Stage};
pub use progress::{ConsoleReporter, ProgressReporter};
