//! Parent selection and the backup run built on it.
//!
//! 1. find local snapshots of the subvolume (candidates)
//! 2. ask the peer which candidates it already holds
//! 3. the held candidate with the highest generation is the parent
//! 4. snapshot, stream (incremental if a parent exists), exit

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;
use uuid::Uuid;

use crate::btrfs::Snapshotter;
use crate::catalog::{SnapshotCatalog, SnapshotRecord};
use crate::error::Result;
use crate::producer::StreamProducer;
use crate::protocol::{ProtocolSession, SessionState};

/// Outcome of a backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipReport {
    /// Base the stream was computed against; `None` means a full send.
    pub parent: Option<SnapshotRecord>,
    pub snapshot: PathBuf,
    pub bytes_sent: u64,
}

pub struct ParentSelector<'a> {
    catalog: &'a SnapshotCatalog,
}

impl<'a> ParentSelector<'a> {
    pub fn new(catalog: &'a SnapshotCatalog) -> Self {
        Self { catalog }
    }

    /// UUIDs of every local snapshot of `path`.
    pub fn candidates(&self, path: &str) -> Result<Vec<Uuid>> {
        Ok(self
            .catalog
            .find_snapshots_of_path(path)?
            .into_iter()
            .map(|r| r.uuid)
            .collect())
    }

    /// Best shared parent for `path`, or `None` if the peer holds none of
    /// its snapshots. Performs the handshake if the session is fresh.
    pub async fn select<R, W>(
        &self,
        session: &mut ProtocolSession<R, W>,
        path: &str,
    ) -> Result<Option<&'a SnapshotRecord>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let candidates = self.candidates(path)?;

        if session.state() == SessionState::Uninitialized {
            session.handshake().await?;
        }

        let remote_known: HashSet<Uuid> =
            session.find_nodes(&candidates).await?.into_iter().collect();
        let parent = self.catalog.find_latest(&remote_known);

        match parent {
            Some(p) => info!(
                "parent for {}: {} (generation {})",
                path, p.path, p.generation
            ),
            None => info!(
                "peer holds none of {} candidates for {}, sending in full",
                candidates.len(),
                path
            ),
        }
        Ok(parent)
    }

    /// Select a parent, create a fresh snapshot, upload it and end the session.
    pub async fn ship<R, W, S, P>(
        &self,
        session: &mut ProtocolSession<R, W>,
        root: &Path,
        subvolume: &str,
        snapshot_name: &str,
        snapshotter: &S,
        producer: &P,
    ) -> Result<ShipReport>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send,
        S: Snapshotter + ?Sized,
        P: StreamProducer + ?Sized,
    {
        let parent = self.select(session, subvolume).await?;
        let snapshot = snapshotter
            .create_snapshot(root, subvolume, snapshot_name)
            .await?;
        let parent_path = parent.map(|p| root.join(&p.path));

        let sink = session.upload_archive().await?;
        let bytes_sent = producer
            .produce(parent_path.as_deref(), &snapshot, sink)
            .await?;

        session.exit().await?;
        info!("shipped {} ({} bytes)", snapshot.display(), bytes_sent);

        Ok(ShipReport {
            parent: parent.cloned(),
            snapshot,
            bytes_sent,
        })
    }
}
