//! Thin wrapper over the `btrfs` command line tool.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone};
use tokio::process::Command;
use tracing::{debug, info};

use crate::catalog::SnapshotCatalog;
use crate::error::{Error, Result};

/// Creates the read-only snapshot that gets shipped.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Snapshot `<root>/<source>` as `<root>/<name>` and return the new path.
    async fn create_snapshot(&self, root: &Path, source: &str, name: &str) -> Result<PathBuf>;
}

/// `<base>_<local time>` with no spaces, e.g. `home_2014-08-25T10:00:00.000000`.
pub fn snapshot_name<Tz>(base: &str, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("{}_{}", base, now.format("%Y-%m-%dT%H:%M:%S%.6f"))
}

#[derive(Debug, Clone)]
pub struct BtrfsTool {
    program: PathBuf,
}

impl Default for BtrfsTool {
    fn default() -> Self {
        Self::new("btrfs")
    }
}

impl BtrfsTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Execute a btrfs command and return its stdout.
    async fn execute(&self, args: &[&OsStr]) -> Result<String> {
        debug!("running {} {:?}", self.program.display(), args);
        let output = Command::new(&self.program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::tool(
                self.program.display().to_string(),
                stderr.trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Raw `btrfs subvolume list -uqt` output for `root`.
    pub async fn list_subvolumes(&self, root: &Path) -> Result<String> {
        self.execute(&[
            OsStr::new("subvolume"),
            OsStr::new("list"),
            root.as_os_str(),
            OsStr::new("-uqt"),
        ])
        .await
    }

    pub async fn load_catalog(&self, root: &Path) -> Result<SnapshotCatalog> {
        let listing = self.list_subvolumes(root).await?;
        let catalog = SnapshotCatalog::load_from(&listing)?;
        info!(
            "loaded {} subvolumes from {}",
            catalog.len(),
            root.display()
        );
        Ok(catalog)
    }

    pub async fn snapshot_readonly(&self, source: &Path, dest: &Path) -> Result<()> {
        self.execute(&[
            OsStr::new("subvolume"),
            OsStr::new("snapshot"),
            OsStr::new("-r"),
            source.as_os_str(),
            dest.as_os_str(),
        ])
        .await?;
        Ok(())
    }

    /// Flush filesystem buffers so the new snapshot is on disk before sending.
    pub async fn sync(&self) -> Result<()> {
        let status = Command::new("sync").status().await?;
        if !status.success() {
            return Err(Error::tool("sync", format!("exited with {}", status)));
        }
        Ok(())
    }
}

#[async_trait]
impl Snapshotter for BtrfsTool {
    async fn create_snapshot(&self, root: &Path, source: &str, name: &str) -> Result<PathBuf> {
        let dest = root.join(name);
        self.snapshot_readonly(&root.join(source), &dest).await?;
        self.sync().await?;
        info!("created snapshot {}", dest.display());
        Ok(dest)
    }
}
