/// SQL Server backup constants
///
/// Engine-specific names, default paths and default timeouts shared by the
/// pipeline stages.

use std::time::Duration;

/// System databases that are never backed up
pub const SYSTEM_DATABASES: &[&str] = &["master", "tempdb", "model", "msdb"];

/// Extension of the files produced by `BACKUP DATABASE`
pub const BACKUP_FILE_EXTENSION: &str = "bak";

/// Prefix for every per-run directory and archive name
pub const RUN_NAME_PREFIX: &str = "DatabaseBackups";

/// Timestamp format used in run names (second resolution)
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Archive extension appended to the local staging directory
pub const ARCHIVE_EXTENSION: &str = "tar.gz";

/// Content type of the uploaded archive
pub const ARCHIVE_CONTENT_TYPE: &str = "application/gzip";

/// Default backup directory root on the database host / inside the container
pub const DEFAULT_BACKUP_ROOT: &str = "/var/opt/mssql/backups";

/// Default location of sqlcmd in the official mssql/server images
pub const DEFAULT_SQLCMD_PATH: &str = "/opt/mssql-tools18/bin/sqlcmd";

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SQL_SERVER_PORT: u16 = 1433;
pub const DEFAULT_REGION: &str = "us-east-1";

/// Environment variables consulted when a secret is missing from the config file
pub const ENV_SSH_PASS: &str = "SQLBACKUP_SSH_PASS";
pub const ENV_SQL_PASS: &str = "SQLBACKUP_SQL_PASS";
pub const ENV_MINIO_ACCESS_KEY: &str = "SQLBACKUP_MINIO_ACCESS_KEY";
pub const ENV_MINIO_SECRET_KEY: &str = "SQLBACKUP_MINIO_SECRET_KEY";

/// Default per-operation timeouts
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_BACKUP_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Returns true for the engine's reserved system databases
pub fn is_system_database(name: &str) -> bool {
    SYSTEM_DATABASES.iter().any(|db| db.eq_ignore_ascii_case(name))
}
