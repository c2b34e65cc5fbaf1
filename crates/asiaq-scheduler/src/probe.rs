//! SSH-based smoke probe.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use asiaq_state::Instance;

use crate::cloud::{SmokeProbe, SmokeStatus};

/// `ssh` invocation that never prompts.
pub fn ssh_command(user: &str, host: Ipv4Addr, connect_timeout: Duration) -> Command {
    let mut command = Command::new("ssh");
    command
        .arg("-o")
        .arg("BatchMode=yes")
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg(format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)))
        .arg(format!("{user}@{host}"))
        .stdin(Stdio::null())
        .kill_on_drop(true);
    command
}

/// Runs a check command on the instance over SSH; exit 0 passes.
///
/// Connection failures count as pending, since a booting host refuses SSH
/// for a while.
pub struct SshProbe {
    user: String,
    command: String,
    connect_timeout: Duration,
}

impl SshProbe {
    pub fn new(user: &str, command: &str) -> Self {
        Self {
            user: user.to_string(),
            command: command.to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// ssh exits 255 when it could not reach the remote side.
const SSH_TRANSPORT_FAILURE: i32 = 255;

#[async_trait]
impl SmokeProbe for SshProbe {
    async fn probe(&self, instance: &Instance) -> SmokeStatus {
        let Some(host) = instance.private_ip else {
            return SmokeStatus::Pending;
        };
        let output = ssh_command(&self.user, host, self.connect_timeout)
            .arg(&self.command)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match output {
            Ok(status) if status.success() => SmokeStatus::Passed,
            Ok(status) if status.code() == Some(SSH_TRANSPORT_FAILURE) => {
                debug!(instance = %instance.id, %host, "ssh not reachable yet");
                SmokeStatus::Pending
            }
            Ok(status) => {
                debug!(instance = %instance.id, %host, code = ?status.code(), "smoke check not passing");
                SmokeStatus::Pending
            }
            Err(e) => SmokeStatus::Failed(format!("failed to spawn ssh: {e}")),
        }
    }
}
