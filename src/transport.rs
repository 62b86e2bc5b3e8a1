//! Peer connection - spawns the remote `snapsync server` and exposes its pipes.
//!
//! The protocol itself is handled by `ProtocolSession`.

use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::config::RemoteConfig;
use crate::error::{Error, Result};

/// A running peer process whose stdin/stdout carry the protocol.
pub struct PeerConnection {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

/// Reaps the peer once the session is over.
pub struct PeerProcess {
    child: Child,
}

impl PeerConnection {
    /// ssh argv for `config`; the first element is the program.
    pub fn ssh_command(config: &RemoteConfig) -> Result<Vec<String>> {
        let host = config
            .host
            .as_ref()
            .ok_or_else(|| Error::tool("ssh", "no remote host configured"))?;

        let mut argv = vec!["ssh".to_string()];
        if let Some(user) = &config.user {
            argv.extend(["-l".to_string(), user.clone()]);
        }
        if config.port != 22 {
            argv.extend(["-p".to_string(), config.port.to_string()]);
        }
        for key in &config.identity_file {
            argv.extend(["-i".to_string(), key.display().to_string()]);
        }
        argv.push(host.clone());
        argv.extend(config.command.iter().cloned());
        Ok(argv)
    }

    /// Connect to the remote peer via ssh
    pub fn connect_ssh(config: &RemoteConfig) -> Result<Self> {
        Self::spawn(&Self::ssh_command(config)?)
    }

    /// Run the peer as a local command (for testing)
    pub fn connect_local(argv: &[String]) -> Result<Self> {
        Self::spawn(argv)
    }

    fn spawn(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::tool("peer", "empty peer command"))?;
        debug!("spawning peer {} {:?}", program, args);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::tool(program.as_str(), "failed to open stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::tool(program.as_str(), "failed to open stdout"))?;

        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    /// Split into the process handle plus (read, write) halves.
    pub fn split(self) -> (PeerProcess, ChildStdout, ChildStdin) {
        (PeerProcess { child: self.child }, self.stdout, self.stdin)
    }
}

impl PeerProcess {
    /// Wait for the peer to exit after the session has been closed.
    pub async fn wait(mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        if !status.success() {
            warn!("peer exited with {}", status);
        }
        Ok(status)
    }

    /// Reap the peer after a session ended with `outcome`. On failure the
    /// peer may still be waiting for input, so it is killed first.
    pub async fn finish<T>(mut self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                self.wait().await?;
                Ok(value)
            }
            Err(e) => {
                warn!("session failed, stopping peer: {}", e);
                if let Err(kill_err) = self.child.kill().await {
                    warn!("failed to kill peer: {}", kill_err);
                }
                Err(e)
            }
        }
    }
}
