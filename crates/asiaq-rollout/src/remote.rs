//! Remote command execution for integration tests.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use asiaq_scheduler::ssh_command;
use asiaq_state::Instance;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,

    #[error("instance {0} has no address")]
    NoAddress(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not reach {0}")]
    Unreachable(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("terminated by signal")]
    Signalled,
}

/// Runs a command on a host as a user and reports its exit code.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn run(&self, host: &Instance, user: &str, command: &[String]) -> Result<i32, ExecError>;
}

/// ssh exits 255 when the connection itself failed.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Executes over `ssh` in batch mode.
pub struct SshExec {
    timeout: Duration,
}

impl SshExec {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl RemoteExec for SshExec {
    async fn run(&self, host: &Instance, user: &str, command: &[String]) -> Result<i32, ExecError> {
        if command.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        let address = host
            .private_ip
            .ok_or_else(|| ExecError::NoAddress(host.id.clone()))?;
        let mut ssh = ssh_command(user, address, Duration::from_secs(10));
        ssh.args(command);
        let code = run_with_timeout(ssh, "ssh", self.timeout).await?;
        if code == SSH_TRANSPORT_FAILURE {
            return Err(ExecError::Unreachable(format!("{user}@{address}")));
        }
        Ok(code)
    }
}

/// Executes on this machine. Pairs with the local cloud, whose instances
/// have no real hosts behind them.
pub struct LocalExec {
    timeout: Duration,
}

impl LocalExec {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl RemoteExec for LocalExec {
    async fn run(&self, host: &Instance, user: &str, command: &[String]) -> Result<i32, ExecError> {
        let (program, args) = command.split_first().ok_or(ExecError::EmptyCommand)?;
        debug!(instance = %host.id, %user, %program, "running locally");
        let mut local = Command::new(program);
        local
            .args(args)
            .env("ASIAQ_HOST", host.id.as_str())
            .env("ASIAQ_USER", user)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        run_with_timeout(local, program, self.timeout).await
    }
}

async fn run_with_timeout(mut command: Command, program: &str, timeout: Duration) -> Result<i32, ExecError> {
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| ExecError::Timeout(timeout.as_secs()))?
        .map_err(|source| ExecError::Spawn {
            program: program.to_string(),
            source,
        })?;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        info!(%program, "{line}");
    }
    output.status.code().ok_or(ExecError::Signalled)
}
