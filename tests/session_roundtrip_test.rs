//! Client sessions against the in-crate server over an in-memory pipe.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use snapsync::btrfs::Snapshotter;
use snapsync::protocol::{write_envelope, Envelope, ProtocolSession, SessionState};
use snapsync::send_stream::{encode_header, CommandKind, SendCommand, SnapshotInfo, SubvolInfo};
use snapsync::server::{serve, Repository, ServeOptions};
use snapsync::{Error, ParentSelector, Result, SnapshotCatalog};
use tempfile::TempDir;
use tokio::io::{duplex, split, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use uuid::Uuid;

const HOME: &str = "3f1c8a52-0d6e-4b7a-9d38-6a1e2f4b5c01";
const SNAP_A: &str = "9a02c7e1-55b3-4e0f-8c61-1d2e3f405162";
const SNAP_B: &str = "b4e19d07-7c2a-4f58-a6b3-0e9d8c7b6a53";
const SNAP_C: &str = "c0ffee00-1234-4abc-8def-0123456789ab";

type ClientSession = ProtocolSession<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

fn uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap()
}

/// Start `serve` on one end of a pipe and hand back a client on the other.
fn start(repo: Repository) -> (ClientSession, JoinHandle<Result<Repository>>) {
    let (client, server) = duplex(64 * 1024);
    let server = tokio::spawn(async move {
        let mut repo = repo;
        let (r, w) = split(server);
        serve(&mut repo, r, w, &ServeOptions::default()).await?;
        Ok::<_, Error>(repo)
    });
    let (r, w) = split(client);
    (ProtocolSession::new(r, w), server)
}

fn local_catalog() -> SnapshotCatalog {
    SnapshotCatalog::from_lines([
        format!("256 1050 5 - {HOME} home"),
        format!("301 1040 5 {HOME} {SNAP_A} home_2014-08-24T10:00:00.000000"),
        format!("302 1045 5 {HOME} {SNAP_B} home_2014-08-25T10:00:00.000000"),
        format!("303 1049 5 {HOME} {SNAP_C} home_2014-08-26T10:00:00.000000"),
    ])
    .unwrap()
}

#[tokio::test]
async fn test_queries_against_loaded_repository() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    std::fs::create_dir(dir.path().join(SNAP_A))?;
    std::fs::create_dir(dir.path().join(SNAP_B))?;
    std::fs::write(dir.path().join(format!("{SNAP_B}.parent")), SNAP_A)?;
    std::fs::write(dir.path().join("README"), "not a node")?;

    let repo = Repository::load_from(dir.path()).await?;
    let (mut session, server) = start(repo);

    session.handshake().await?;
    assert_eq!(session.state(), SessionState::Ready);

    let found = session
        .find_nodes(&[uuid(SNAP_C), uuid(SNAP_B), uuid(SNAP_A)])
        .await?;
    assert_eq!(found, vec![uuid(SNAP_B), uuid(SNAP_A)]);

    let mut all = session.list_nodes().await?;
    all.sort();
    let mut expected = vec![uuid(SNAP_A), uuid(SNAP_B)];
    expected.sort();
    assert_eq!(all, expected);

    let graph: serde_json::Value = serde_json::from_slice(&session.get_graph().await?)?;
    assert_eq!(graph["nodes"].as_array().map(Vec::len), Some(2));
    assert_eq!(graph["edges"][0][0], SNAP_A);
    assert_eq!(graph["edges"][0][1], SNAP_B);

    session.exit().await?;
    assert_eq!(session.state(), SessionState::Closed);
    server.await??;
    Ok(())
}

#[tokio::test]
async fn test_empty_find_returns_empty() -> anyhow::Result<()> {
    let (mut session, server) = start(Repository::new());
    session.handshake().await?;
    assert!(session.find_nodes(&[]).await?.is_empty());
    assert!(session.list_nodes().await?.is_empty());
    session.exit().await?;
    server.await??;
    Ok(())
}

#[tokio::test]
async fn test_upload_then_query() -> anyhow::Result<()> {
    let (mut session, server) = start(Repository::new());
    session.handshake().await?;

    let envelopes = [
        Envelope::new(&b"home_2014-08-26"[..], vec![[0x11; 32], [0x22; 32]])?,
        Envelope::new(&b""[..], vec![[0x33; 32], [0x44; 32]])?,
    ];
    let sink = session.upload_archive().await?;
    for envelope in &envelopes {
        write_envelope(sink, envelope).await?;
    }
    assert_eq!(session.state(), SessionState::Uploading);

    // The next command ends the upload.
    assert!(session.list_nodes().await?.is_empty());
    session.exit().await?;

    let repo = server.await??;
    assert_eq!(repo.archives(), &envelopes);
    Ok(())
}

struct FakeSnapshotter;

#[async_trait]
impl Snapshotter for FakeSnapshotter {
    async fn create_snapshot(&self, root: &Path, _source: &str, name: &str) -> Result<PathBuf> {
        Ok(root.join(name))
    }
}

/// Emits a single envelope named after the parent it was given.
struct EnvelopeProducer;

#[async_trait]
impl snapsync::producer::StreamProducer for EnvelopeProducer {
    async fn produce(
        &self,
        parent: Option<&Path>,
        _snapshot: &Path,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let name = parent
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let envelope = Envelope::new(name.into_bytes(), vec![[0xEE; 32], [0xFF; 32]])?;
        let mut sink = sink;
        write_envelope(&mut sink, &envelope).await?;
        Ok(envelope.encoded_len() as u64)
    }
}

#[tokio::test]
async fn test_ship_picks_newest_shared_parent() -> anyhow::Result<()> {
    let mut repo = Repository::new();
    repo.add_node(uuid(SNAP_A));
    repo.add_node(uuid(SNAP_B));
    let (mut session, server) = start(repo);

    let catalog = local_catalog();
    let report = ParentSelector::new(&catalog)
        .ship(
            &mut session,
            Path::new("/mnt/pool"),
            "home",
            "home_2014-08-27T10:00:00.000000",
            &FakeSnapshotter,
            &EnvelopeProducer,
        )
        .await?;

    let parent = report.parent.expect("shared parent");
    assert_eq!(parent.uuid, uuid(SNAP_B));
    assert_eq!(parent.generation, 1045);
    assert_eq!(session.state(), SessionState::Closed);

    let repo = server.await??;
    assert_eq!(repo.archives().len(), 1);
    assert_eq!(
        repo.archives()[0].name(),
        b"/mnt/pool/home_2014-08-25T10:00:00.000000"
    );
    Ok(())
}

#[tokio::test]
async fn test_ship_full_when_peer_is_empty() -> anyhow::Result<()> {
    let (mut session, server) = start(Repository::new());
    let catalog = local_catalog();

    let report = ParentSelector::new(&catalog)
        .ship(
            &mut session,
            Path::new("/mnt/pool"),
            "home",
            "home_new",
            &FakeSnapshotter,
            &EnvelopeProducer,
        )
        .await?;

    assert!(report.parent.is_none());
    let repo = server.await??;
    assert_eq!(repo.archives()[0].name(), b"");
    Ok(())
}

#[tokio::test]
async fn test_server_hangup_fails_session() {
    let (client, server) = duplex(1024);
    drop(server);
    let (r, w) = split(client);
    let mut session = ProtocolSession::new(r, w);

    let err = session.handshake().await.unwrap_err();
    assert!(err.is_session_fatal());
    assert_eq!(session.state(), SessionState::Failed);
    assert!(matches!(
        session.list_nodes().await,
        Err(Error::ProtocolViolation { .. })
    ));
}

#[tokio::test]
async fn test_imported_streams_become_parents() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut repo = Repository::load_from(dir.path()).await?;

    let end = SendCommand::new(CommandKind::End, bytes::Bytes::new())?.encode();
    let mut full = encode_header().to_vec();
    full.extend_from_slice(
        &SubvolInfo {
            name: "home_2014-08-24T10:00:00.000000".into(),
            uuid: uuid(SNAP_A),
            ctransid: 1040,
        }
        .to_command()?
        .encode(),
    );
    full.extend_from_slice(&end);
    let mut incremental = encode_header().to_vec();
    incremental.extend_from_slice(
        &SnapshotInfo {
            name: "home_2014-08-25T10:00:00.000000".into(),
            uuid: uuid(SNAP_B),
            ctransid: 1045,
            clone_uuid: uuid(SNAP_A),
            clone_ctransid: 1040,
        }
        .to_command()?
        .encode(),
    );
    incremental.extend_from_slice(&end);

    repo.import_stream(full.as_slice()).await?;
    repo.import_stream(incremental.as_slice()).await?;
    assert!(repo.fsck(true).await?.is_clean());

    let (mut session, server) = start(Repository::load_from(dir.path()).await?);
    let catalog = local_catalog();
    let parent = ParentSelector::new(&catalog)
        .select(&mut session, "home")
        .await?
        .expect("imported parent");
    assert_eq!(parent.uuid, uuid(SNAP_B));

    let graph: serde_json::Value = serde_json::from_slice(&session.get_graph().await?)?;
    assert_eq!(graph["edges"][0][0], SNAP_A);
    assert_eq!(graph["edges"][0][1], SNAP_B);
    session.exit().await?;
    server.await??;
    Ok(())
}
