/// Remote command execution over SSH
///
/// Drives the remote host and its Docker containers: directory creation,
/// container-to-host copies, permission changes, listing and recursive
/// deletes. Commands return a structured [`CommandOutput`]; transport
/// problems (connect, authentication, channel loss) are errors.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ssh2::Session;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::Timeouts;
use crate::core::context::{CommandOptions, RemoteHost};
use crate::core::error::{ErrorKind, PipelineError};
use crate::core::transfer::{FileTransfer, SftpTransfer};
use crate::utils::shell_quote;

/// Result of one remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Non-empty stdout lines
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Turn a non-zero exit status into a pipeline error of `kind`
    pub fn ensure_success(self, kind: ErrorKind, action: &str) -> Result<Self, PipelineError> {
        if self.success() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        Err(kind.with_message(format!(
            "{} exited with status {}: {}",
            action, self.status, detail
        )))
    }
}

/// An authenticated command channel to the remote host
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> Result<CommandOutput>;

    /// Close the channel; later calls are no-ops
    async fn disconnect(&self) -> Result<()>;
}

/// Opens the channels a run needs on the remote host
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn open_shell(&self) -> Result<Box<dyn RemoteExecutor>>;
    async fn open_transfer(&self) -> Result<Box<dyn FileTransfer>>;
}

/// Establish an authenticated SSH session (blocking)
pub fn open_session(host: &RemoteHost, connect_timeout: Duration, io_timeout: Duration) -> Result<Session> {
    let endpoint = host.endpoint();
    let addr = (host.address.as_str(), host.port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}", endpoint))?
        .next()
        .ok_or_else(|| anyhow!("No address found for {}", endpoint))?;

    let tcp = TcpStream::connect_timeout(&addr, connect_timeout)
        .with_context(|| format!("Failed to connect to {}", endpoint))?;

    let mut session = Session::new().context("Failed to create SSH session")?;
    session.set_tcp_stream(tcp);
    session.set_timeout(io_timeout.as_millis().min(u32::MAX as u128) as u32);
    session
        .handshake()
        .with_context(|| format!("SSH handshake with {} failed", endpoint))?;
    session
        .userauth_password(&host.username, host.password.expose())
        .with_context(|| format!("SSH authentication as {} failed", host.username))?;

    if !session.authenticated() {
        return Err(anyhow!("SSH authentication as {} was rejected", host.username));
    }

    Ok(session)
}

/// SSH connector for a real remote host
#[derive(Clone)]
pub struct SshConnector {
    host: RemoteHost,
    timeouts: Timeouts,
}

impl SshConnector {
    pub fn new(host: RemoteHost, timeouts: Timeouts) -> Self {
        Self { host, timeouts }
    }

    /// Blocking-call ceiling: the longest operation a channel may serve
    fn io_timeout(&self) -> Duration {
        self.timeouts
            .command
            .max(self.timeouts.backup)
            .max(self.timeouts.transfer)
    }

    async fn connect(&self) -> Result<Session> {
        let host = self.host.clone();
        let connect = self.timeouts.connect;
        let io = self.io_timeout();
        tokio::task::spawn_blocking(move || open_session(&host, connect, io))
            .await
            .context("SSH connect task failed")?
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn open_shell(&self) -> Result<Box<dyn RemoteExecutor>> {
        let session = self.connect().await?;
        debug!(host = %self.host.endpoint(), "SSH shell channel established");
        Ok(Box::new(SshShell::new(session, self.host.endpoint())))
    }

    async fn open_transfer(&self) -> Result<Box<dyn FileTransfer>> {
        let session = self.connect().await?;
        debug!(host = %self.host.endpoint(), "SFTP channel established");
        Ok(Box::new(SftpTransfer::new(session, self.host.endpoint())))
    }
}

pub struct SshShell {
    session: Session,
    endpoint: String,
    released: AtomicBool,
}

impl SshShell {
    pub fn new(session: Session, endpoint: String) -> Self {
        Self {
            session,
            endpoint,
            released: AtomicBool::new(false),
        }
    }
}

fn run_command(session: &Session, command: &str) -> Result<CommandOutput> {
    let mut channel = session.channel_session().context("Failed to open SSH channel")?;
    channel.exec(command).context("Failed to start remote command")?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .context("Failed to read remote command output")?;
    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .context("Failed to read remote command error output")?;

    channel.wait_close().context("Failed to close SSH channel")?;
    let status = channel.exit_status().context("Failed to read exit status")?;

    Ok(CommandOutput { status, stdout, stderr })
}

#[async_trait]
impl RemoteExecutor for SshShell {
    async fn execute(&self, command: &str) -> Result<CommandOutput> {
        if self.released.load(Ordering::SeqCst) {
            return Err(anyhow!("SSH channel to {} is already closed", self.endpoint));
        }
        let session = self.session.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || run_command(&session, &command))
            .await
            .context("SSH command task failed")?
            .with_context(|| format!("Remote command on {} failed", self.endpoint))
    }

    async fn disconnect(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || session.disconnect(None, "backup run finished", None))
            .await
            .context("SSH disconnect task failed")?
            .with_context(|| format!("Failed to disconnect from {}", self.endpoint))
    }
}

impl Drop for SshShell {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.session.disconnect(None, "backup run dropped", None) {
                warn!(host = %self.endpoint, error = %e, "SSH disconnect on drop failed");
            }
        }
    }
}

/// Builds the shell commands the pipeline sends to the remote host
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    use_sudo: bool,
}

impl CommandBuilder {
    pub fn new(options: &CommandOptions) -> Self {
        Self {
            use_sudo: options.use_sudo,
        }
    }

    fn privileged(&self, command: String) -> String {
        if self.use_sudo {
            format!("sudo {}", command)
        } else {
            command
        }
    }

    fn docker_exec(&self, container: &str, command: String) -> String {
        self.privileged(format!("docker exec {} {}", shell_quote(container), command))
    }

    pub fn make_dir(&self, path: &str) -> String {
        self.privileged(format!("mkdir -p {}", shell_quote(path)))
    }

    pub fn container_make_dir(&self, container: &str, path: &str) -> String {
        self.docker_exec(container, format!("mkdir -p {}", shell_quote(path)))
    }

    pub fn container_copy(&self, container: &str, source: &str, destination: &str) -> String {
        self.privileged(format!(
            "docker cp {}:{} {}",
            shell_quote(container),
            shell_quote(source),
            shell_quote(destination)
        ))
    }

    pub fn chmod_recursive(&self, path: &str) -> String {
        self.privileged(format!("chmod -R 777 {}", shell_quote(path)))
    }

    pub fn list_dir(&self, path: &str) -> String {
        self.privileged(format!("ls -1A {}", shell_quote(path)))
    }

    pub fn container_list_dir(&self, container: &str, path: &str) -> String {
        self.docker_exec(container, format!("ls -1A {}", shell_quote(path)))
    }

    pub fn remove_dir(&self, path: &str) -> String {
        self.privileged(format!("rm -rf {}", shell_quote(path)))
    }

    pub fn container_remove_dir(&self, container: &str, path: &str) -> String {
        self.docker_exec(container, format!("rm -rf {}", shell_quote(path)))
    }

    /// Run a T-SQL script with sqlcmd inside the container
    ///
    /// `-b` makes sqlcmd exit non-zero when a statement fails.
    pub fn container_sqlcmd(
        &self,
        container: &str,
        sqlcmd_path: &str,
        username: &str,
        password: &str,
        script: &str,
    ) -> String {
        self.docker_exec(
            container,
            format!(
                "{} -b -C -S localhost -U {} -P {} -Q {}",
                shell_quote(sqlcmd_path),
                shell_quote(username),
                shell_quote(password),
                shell_quote(script)
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(use_sudo: bool) -> CommandBuilder {
        CommandBuilder::new(&CommandOptions {
            use_sudo,
            sqlcmd_path: "/opt/mssql-tools18/bin/sqlcmd".to_string(),
        })
    }

    #[test]
    fn test_container_commands() {
        let b = builder(true);
        assert_eq!(
            b.container_make_dir("mssql", "/var/opt/mssql/backups/run"),
            "sudo docker exec mssql mkdir -p /var/opt/mssql/backups/run"
        );
        assert_eq!(
            b.container_copy("mssql", "/var/opt/mssql/backups/run", "/home/deploy/run"),
            "sudo docker cp mssql:/var/opt/mssql/backups/run /home/deploy/run"
        );
        assert_eq!(
            b.container_remove_dir("mssql", "/var/opt/mssql/backups/run"),
            "sudo docker exec mssql rm -rf /var/opt/mssql/backups/run"
        );
    }

    #[test]
    fn test_host_commands_without_sudo() {
        let b = builder(false);
        assert_eq!(b.remove_dir("/home/deploy/run"), "rm -rf /home/deploy/run");
        assert_eq!(b.chmod_recursive("/home/deploy/run"), "chmod -R 777 /home/deploy/run");
        assert_eq!(b.list_dir("/home/my dir"), "ls -1A '/home/my dir'");
    }

    #[test]
    fn test_sqlcmd_quotes_script() {
        let b = builder(false);
        let cmd = b.container_sqlcmd("mssql", "/opt/sqlcmd", "sa", "p'w", "PRINT 'hi'");
        assert_eq!(
            cmd,
            r"docker exec mssql /opt/sqlcmd -b -C -S localhost -U sa -P 'p'\''w' -Q 'PRINT '\''hi'\'''"
        );
    }

    #[test]
    fn test_command_output() {
        let ok = CommandOutput {
            status: 0,
            stdout: "Sales.bak\n\nHR.bak\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(ok.lines(), vec!["Sales.bak", "HR.bak"]);
        assert!(ok.ensure_success(ErrorKind::TransferFailed, "ls").is_ok());

        let failed = CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: "Error: No such container: mssql\n".to_string(),
        };
        let err = failed.ensure_success(ErrorKind::TransferFailed, "docker cp").unwrap_err();
        assert_eq!(
            err,
            PipelineError::TransferFailed(
                "docker cp exited with status 1: Error: No such container: mssql".to_string()
            )
        );
    }
}
