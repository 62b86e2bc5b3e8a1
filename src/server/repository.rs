//! Backup repository as seen by the server peer.
//!
//! On disk a repository is a directory. Every entry whose name is a UUID is a
//! node the peer holds, normally the btrfs send stream that created it;
//! `<uuid>.parent` files contain the UUID that node was sent against.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::Envelope;
use crate::send_stream::{self, StreamOrigin};

const PARENT_SUFFIX: &str = ".parent";

/// Streams are written under this suffix and renamed once complete.
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, Default)]
pub struct Repository {
    root: Option<PathBuf>,
    nodes: BTreeSet<Uuid>,
    edges: BTreeSet<(Uuid, Uuid)>,
    archives: Vec<Envelope>,
}

/// Diagnostic view returned by GetGraph.
#[derive(Debug, Serialize)]
struct Graph<'a> {
    nodes: &'a BTreeSet<Uuid>,
    edges: &'a BTreeSet<(Uuid, Uuid)>,
    archives: Vec<String>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `path` for held nodes and parent edges.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let mut repo = Self {
            root: Some(path.to_path_buf()),
            ..Self::default()
        };

        let mut entries = fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            if let Some(stem) = name.strip_suffix(PARENT_SUFFIX) {
                let Ok(child) = Uuid::parse_str(stem) else {
                    continue;
                };
                let contents = fs::read_to_string(entry.path()).await?;
                let parent = Uuid::parse_str(contents.trim()).map_err(|e| {
                    Error::parse(contents.trim(), format!("bad parent of {}: {}", child, e))
                })?;
                repo.edges.insert((parent, child));
            } else if let Ok(node) = Uuid::parse_str(name) {
                repo.nodes.insert(node);
            } else {
                debug!("ignoring repository entry {}", name);
            }
        }

        Ok(repo)
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn add_node(&mut self, node: Uuid) {
        self.nodes.insert(node);
    }

    pub fn add_edge(&mut self, parent: Uuid, child: Uuid) {
        self.edges.insert((parent, child));
    }

    pub fn record_archive(&mut self, envelope: Envelope) {
        self.archives.push(envelope);
    }

    pub fn contains(&self, node: &Uuid) -> bool {
        self.nodes.contains(node)
    }

    /// All held nodes in UUID order.
    pub fn nodes(&self) -> Vec<Uuid> {
        self.nodes.iter().copied().collect()
    }

    /// The subset of `asked` held here, in the order asked.
    pub fn intersect(&self, asked: &[Uuid]) -> Vec<Uuid> {
        asked.iter().copied().filter(|u| self.contains(u)).collect()
    }

    pub fn archives(&self) -> &[Envelope] {
        &self.archives
    }

    /// The node `node` was sent against, if one is recorded.
    pub fn parent_of(&self, node: &Uuid) -> Option<Uuid> {
        self.edges
            .iter()
            .find(|(_, child)| child == node)
            .map(|(parent, _)| *parent)
    }

    /// Held nodes whose recorded parent is not held, so they cannot be
    /// restored. Sorted by UUID.
    pub fn find_orphans(&self) -> Vec<Uuid> {
        let orphans: BTreeSet<Uuid> = self
            .edges
            .iter()
            .filter(|(parent, child)| self.contains(child) && !self.contains(parent))
            .map(|(_, child)| *child)
            .collect();
        orphans.into_iter().collect()
    }

    fn require_root(&self) -> Result<&Path> {
        self.root().ok_or_else(|| {
            Error::Transport(io::Error::new(
                io::ErrorKind::NotFound,
                "repository is not backed by a directory",
            ))
        })
    }

    /// Store a btrfs send stream as a new node. The node and its parent edge
    /// come from the stream's first command.
    pub async fn import_stream<R: AsyncRead + Unpin>(&mut self, reader: R) -> Result<StreamOrigin> {
        let root = self.require_root()?.to_path_buf();
        let (origin, first, rest) = send_stream::read_origin(reader).await?;
        let node = origin.uuid();
        if self.contains(&node) {
            return Err(Error::stream(format!("node {} is already held", node)));
        }
        if let Some(parent) = origin.parent() {
            if !self.contains(&parent) {
                warn!("importing {} whose parent {} is not held", node, parent);
            }
        }

        let partial = root.join(format!("{}{}", node, PARTIAL_SUFFIX));
        let mut file = fs::File::create(&partial).await?;
        file.write_all(&send_stream::encode_header()).await?;
        file.write_all(&first.encode()).await?;
        let mut rest = rest.into_inner();
        let copied = tokio::io::copy(&mut rest, &mut file).await?;
        file.sync_all().await?;
        drop(file);

        if let Some(parent) = origin.parent() {
            fs::write(
                root.join(format!("{}{}", node, PARENT_SUFFIX)),
                format!("{}\n", parent),
            )
            .await?;
            self.add_edge(parent, node);
        }
        fs::rename(&partial, root.join(node.to_string())).await?;
        self.add_node(node);

        info!(
            "imported {} ({}, {} bytes after the first command)",
            node,
            String::from_utf8_lossy(origin.name()),
            copied
        );
        Ok(origin)
    }

    /// Consistency check. `deep` also reads every stored stream, checks each
    /// command checksum and compares its first command with the recorded
    /// node and parent.
    pub async fn fsck(&self, deep: bool) -> Result<FsckReport> {
        let mut report = FsckReport {
            nodes: self.nodes.len(),
            orphans: self.find_orphans(),
            ..FsckReport::default()
        };
        if !deep {
            return Ok(report);
        }

        let root = self.require_root()?;
        for node in &self.nodes {
            let path = root.join(node.to_string());
            if fs::metadata(&path).await?.is_dir() {
                debug!("{} is a directory, not a stream", node);
                report.skipped.push(*node);
                continue;
            }

            let file = fs::File::open(&path).await?;
            match send_stream::verify_stream(BufReader::new(file)).await {
                Ok((origin, commands)) => {
                    debug!("{}: {} commands", node, commands);
                    if origin.uuid() != *node {
                        report
                            .problems
                            .push((*node, format!("stream creates {}", origin.uuid())));
                    } else if origin.parent() != self.parent_of(node) {
                        report.problems.push((
                            *node,
                            format!(
                                "stream parent {:?} does not match recorded parent {:?}",
                                origin.parent(),
                                self.parent_of(node)
                            ),
                        ));
                    } else {
                        report.verified += 1;
                    }
                }
                Err(Error::Transport(e)) => return Err(Error::Transport(e)),
                Err(e) => report.problems.push((*node, e.to_string())),
            }
        }
        Ok(report)
    }

    pub fn graph_json(&self) -> Result<Vec<u8>> {
        let graph = Graph {
            nodes: &self.nodes,
            edges: &self.edges,
            archives: self
                .archives
                .iter()
                .map(|a| String::from_utf8_lossy(a.name()).into_owned())
                .collect(),
        };
        serde_json::to_vec(&graph)
            .map_err(|e| Error::protocol(format!("cannot encode graph: {}", e)))
    }
}

/// Outcome of `Repository::fsck`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsckReport {
    pub nodes: usize,
    pub orphans: Vec<Uuid>,
    /// Streams read end to end with matching metadata.
    pub verified: usize,
    /// Nodes stored as directories rather than streams.
    pub skipped: Vec<Uuid>,
    pub problems: Vec<(Uuid, String)>,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty() && self.problems.is_empty()
    }
}
