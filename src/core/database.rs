/// SQL Server backup invocation
///
/// Two ways to back up every user database:
/// - over TDS: enumerate `sys.databases` and issue one `BACKUP DATABASE`
///   statement per database on the open connection
/// - delegated: a single `sqlcmd` run inside the container through the
///   remote shell, iterating the same enumeration server-side
///
/// Statements are independent: a failure on one database does not undo the
/// backups already written.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tiberius::{AuthMethod, Client, Config};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::core::artifacts::{BackupArtifactSet, StagingLocation};
use crate::core::context::{backup_file_name, DatabaseServer, DeploymentMode, RunContext};
use crate::core::error::{bounded, ErrorKind, PipelineError};
use crate::core::remote::{CommandBuilder, RemoteExecutor};
use crate::utils::{is_system_database, SYSTEM_DATABASES};

const LIST_DATABASES_SQL: &str = "SELECT name FROM sys.databases ORDER BY database_id";

/// A database name discovered by enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseRef(String);

impl DatabaseRef {
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Keep user databases, preserving enumeration order
pub fn filter_user_databases<I, S>(names: I) -> Vec<DatabaseRef>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names
        .into_iter()
        .map(Into::into)
        .filter(|name| !name.trim().is_empty() && !is_system_database(name))
        .map(DatabaseRef)
        .collect()
}

/// Reject names that cannot be used as a `.bak` file name in the run directory
pub fn check_backup_file_name(database: &DatabaseRef) -> Result<(), PipelineError> {
    let name = database.name();
    if name.contains(['/', '\\']) || name.chars().any(char::is_control) {
        return Err(PipelineError::BackupFailed(format!(
            "database name {:?} cannot be used as a backup file name",
            name
        )));
    }
    Ok(())
}

/// `BACKUP DATABASE [<name>] TO DISK = N'<path>'`
pub fn backup_statement(database: &str, path: &str) -> String {
    format!(
        "BACKUP DATABASE [{}] TO DISK = N'{}'",
        database.replace(']', "]]"),
        path.replace('\'', "''")
    )
}

/// T-SQL run by sqlcmd inside the container
pub fn delegated_backup_script(backup_dir: &str) -> String {
    let excluded = SYSTEM_DATABASES
        .iter()
        .map(|name| format!("'{}'", name))
        .collect::<Vec<_>>()
        .join(", ");
    let dir = backup_dir.trim_end_matches('/').replace('\'', "''");

    format!(
        "SET NOCOUNT ON;\n\
         DECLARE @name sysname, @path nvarchar(4000);\n\
         IF EXISTS (SELECT 1 FROM sys.databases WHERE name NOT IN ({excluded}) \
         AND (CHARINDEX(N'/', name) > 0 OR CHARINDEX(N'\\', name) > 0))\n\
         BEGIN\n\
         RAISERROR(N'database name contains a path separator', 16, 1);\n\
         RETURN;\n\
         END\n\
         DECLARE db_cursor CURSOR LOCAL FAST_FORWARD FOR \
         SELECT name FROM sys.databases WHERE name NOT IN ({excluded}) ORDER BY database_id;\n\
         OPEN db_cursor;\n\
         FETCH NEXT FROM db_cursor INTO @name;\n\
         WHILE @@FETCH_STATUS = 0\n\
         BEGIN\n\
         SET @path = N'{dir}/' + @name + N'.bak';\n\
         BACKUP DATABASE @name TO DISK = @path;\n\
         PRINT N'Backup completed for ' + @name;\n\
         FETCH NEXT FROM db_cursor INTO @name;\n\
         END\n\
         CLOSE db_cursor;\n\
         DEALLOCATE db_cursor;"
    )
}

/// An open connection to the database server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatabaseSession: Send {
    /// Names of every database on the server, system databases included
    async fn list_databases(&mut self) -> Result<Vec<String>>;

    async fn backup_database(&mut self, database: &str, path: &str) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DatabaseSession>>;
}

/// TDS connector (SQL authentication, server certificate trusted)
pub struct TdsConnector {
    server: DatabaseServer,
    connect_timeout: Duration,
}

impl TdsConnector {
    pub fn new(server: DatabaseServer, connect_timeout: Duration) -> Self {
        Self {
            server,
            connect_timeout,
        }
    }
}

#[async_trait]
impl DatabaseConnector for TdsConnector {
    async fn connect(&self) -> Result<Box<dyn DatabaseSession>> {
        let mut config = Config::new();
        config.host(&self.server.host);
        config.port(self.server.port);
        config.authentication(AuthMethod::sql_server(
            &self.server.username,
            self.server.password.expose(),
        ));
        config.trust_cert();

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(config.get_addr()))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", self.server.endpoint()))?
            .with_context(|| format!("Failed to connect to {}", self.server.endpoint()))?;
        tcp.set_nodelay(true)?;

        let client = Client::connect(config, tcp.compat_write())
            .await
            .with_context(|| format!("SQL Server login as {} failed", self.server.username))?;

        debug!(server = %self.server.endpoint(), "SQL Server connection established");
        Ok(Box::new(TdsSession {
            client: Some(client),
        }))
    }
}

pub struct TdsSession {
    client: Option<Client<Compat<TcpStream>>>,
}

impl TdsSession {
    fn client(&mut self) -> Result<&mut Client<Compat<TcpStream>>> {
        self.client
            .as_mut()
            .ok_or_else(|| anyhow!("SQL Server connection is closed"))
    }
}

#[async_trait]
impl DatabaseSession for TdsSession {
    async fn list_databases(&mut self) -> Result<Vec<String>> {
        let rows = self
            .client()?
            .simple_query(LIST_DATABASES_SQL)
            .await
            .context("Failed to query sys.databases")?
            .into_first_result()
            .await
            .context("Failed to read sys.databases")?;

        Ok(rows
            .iter()
            .filter_map(|row| row.get::<&str, _>(0).map(str::to_string))
            .collect())
    }

    async fn backup_database(&mut self, database: &str, path: &str) -> Result<()> {
        self.client()?
            .simple_query(backup_statement(database, path))
            .await
            .with_context(|| format!("BACKUP DATABASE [{}] failed", database))?
            .into_results()
            .await
            .with_context(|| format!("BACKUP DATABASE [{}] failed", database))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.close().await.context("Failed to close SQL Server connection")?;
        }
        Ok(())
    }
}

/// Back up every user database over an open session
///
/// `on_backup` is called after each database's backup completes.
pub async fn backup_over_protocol(
    session: &mut dyn DatabaseSession,
    ctx: &RunContext,
    on_backup: &mut (dyn FnMut(&DatabaseRef) + Send),
) -> Result<BackupArtifactSet, PipelineError> {
    let names = bounded(
        ctx.timeouts.command,
        ErrorKind::BackupFailed,
        "database enumeration",
        session.list_databases(),
    )
    .await?;

    let databases = filter_user_databases(names);
    if databases.is_empty() {
        return Err(PipelineError::BackupFailed(format!(
            "no user databases found on {}",
            ctx.database.endpoint()
        )));
    }
    info!(count = databases.len(), "user databases enumerated");
    for database in &databases {
        check_backup_file_name(database)?;
    }

    let mut files = Vec::with_capacity(databases.len());
    for database in &databases {
        let path = ctx.backup_file_path(database.name());
        info!(database = database.name(), path = %path, "backing up database");

        bounded(
            ctx.timeouts.backup,
            ErrorKind::BackupFailed,
            &format!("backup of {}", database.name()),
            session.backup_database(database.name(), &path),
        )
        .await?;

        files.push(backup_file_name(database.name()));
        on_backup(database);
    }

    let location = match ctx.mode {
        DeploymentMode::Direct => StagingLocation::RemoteHost {
            path: ctx.backup_dir.clone(),
        },
        _ => StagingLocation::Container {
            container: ctx.container_id()?.to_string(),
            path: ctx.backup_dir.clone(),
        },
    };

    Ok(BackupArtifactSet::new(location, files))
}

/// Back up every user database with sqlcmd inside the container
///
/// The produced file names are unknown until the backup directory is
/// listed, so the returned set is empty.
pub async fn backup_in_container(
    shell: &dyn RemoteExecutor,
    commands: &CommandBuilder,
    ctx: &RunContext,
) -> Result<BackupArtifactSet, PipelineError> {
    let container = ctx.container_id()?;
    let script = delegated_backup_script(&ctx.backup_dir);
    let command = commands.container_sqlcmd(
        container,
        &ctx.commands.sqlcmd_path,
        &ctx.database.username,
        ctx.database.password.expose(),
        &script,
    );

    info!(container, backup_dir = %ctx.backup_dir, "running delegated backup");
    let output = bounded(
        ctx.timeouts.backup,
        ErrorKind::BackupFailed,
        "delegated sqlcmd backup",
        shell.execute(&command),
    )
    .await?
    .ensure_success(ErrorKind::BackupFailed, "sqlcmd backup")?;

    for line in output.lines() {
        info!(container, "{}", line);
    }

    Ok(BackupArtifactSet::new(
        StagingLocation::Container {
            container: container.to_string(),
            path: ctx.backup_dir.clone(),
        },
        Vec::new(),
    ))
}
