//! Producers of the envelope-framed send stream.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Writes the transfer stream for `snapshot` into `sink`, as a delta against
/// `parent` when one is given. Returns the number of bytes written.
#[async_trait]
pub trait StreamProducer: Send + Sync {
    async fn produce(
        &self,
        parent: Option<&Path>,
        snapshot: &Path,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64>;
}

/// Runs `<encap> -- btrfs send [-p <parent>] <snapshot>`; the wrapper frames
/// the raw send stream into envelopes on its stdout.
#[derive(Debug, Clone)]
pub struct EncapSend {
    encap: PathBuf,
    btrfs: PathBuf,
}

impl EncapSend {
    pub fn new(encap: impl Into<PathBuf>, btrfs: impl Into<PathBuf>) -> Self {
        Self {
            encap: encap.into(),
            btrfs: btrfs.into(),
        }
    }

    fn command(&self, parent: Option<&Path>, snapshot: &Path) -> Command {
        let mut cmd = Command::new(&self.encap);
        cmd.arg("--").arg(&self.btrfs).arg("send");
        if let Some(parent) = parent {
            cmd.arg("-p").arg(parent);
        }
        cmd.arg(snapshot);
        cmd
    }
}

#[async_trait]
impl StreamProducer for EncapSend {
    async fn produce(
        &self,
        parent: Option<&Path>,
        snapshot: &Path,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        match parent {
            Some(p) => info!("sending {} against {}", snapshot.display(), p.display()),
            None => info!("sending {} in full", snapshot.display()),
        }

        let mut child = self
            .command(parent, snapshot)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let mut stdout = child.stdout.take().ok_or_else(|| {
            Error::tool(self.encap.display().to_string(), "stdout not captured")
        })?;

        let copied = tokio::io::copy(&mut stdout, sink).await?;
        sink.flush().await?;

        let status = child.wait().await?;
        if !status.success() {
            return Err(Error::tool(
                self.encap.display().to_string(),
                format!("exited with {}", status),
            ));
        }

        debug!(bytes = copied, "send stream finished");
        Ok(copied)
    }
}
