//! Client side of the node negotiation protocol.
//!
//! One request is outstanding at a time and responses arrive in command
//! order, so there is no request id on the wire. Any I/O or framing failure
//! while a command is in flight poisons the session.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::wire::{self, Command, CLIENT_MAGIC, SERVER_MAGIC};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake not yet performed.
    Uninitialized,
    /// Ready for the next command.
    Ready,
    /// UploadArchive sent; the caller owns the write side until the next command.
    Uploading,
    /// Exit sent.
    Closed,
    /// A command failed; the session cannot be resumed.
    Failed,
}

/// Decoded answer to a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Exit has no response.
    Closed,
    /// FindNodes / ListNodes.
    Nodes(Vec<Uuid>),
    /// UploadArchive has no response; the write side is open for envelopes.
    UploadOpen,
    /// GetGraph payload, uninterpreted.
    Graph(Bytes),
}

pub struct ProtocolSession<R, W> {
    reader: R,
    writer: W,
    state: SessionState,
}

impl<R, W> ProtocolSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            state: SessionState::Uninitialized,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Send the client magic and check the peer's reply.
    pub async fn handshake(&mut self) -> Result<()> {
        if self.state != SessionState::Uninitialized {
            return Err(Error::protocol(format!(
                "handshake in state {:?}",
                self.state
            )));
        }

        let result = self.exchange_magic().await;
        match &result {
            Ok(()) => {
                debug!("handshake complete");
                self.state = SessionState::Ready;
            }
            Err(e) => {
                warn!("handshake failed: {}", e);
                self.state = SessionState::Failed;
            }
        }
        result
    }

    async fn exchange_magic(&mut self) -> Result<()> {
        self.writer.write_all(&CLIENT_MAGIC).await?;
        self.writer.flush().await?;

        let mut reply = [0u8; 8];
        match self.reader.read_exact(&mut reply).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::protocol("peer closed during handshake"));
            }
            Err(e) => return Err(e.into()),
        }
        if reply != SERVER_MAGIC {
            return Err(Error::protocol(format!(
                "bad handshake reply {}",
                hex::encode(reply)
            )));
        }
        Ok(())
    }

    /// Send one command and read its response.
    pub async fn request(&mut self, command: Command) -> Result<Response> {
        match self.state {
            SessionState::Ready | SessionState::Uploading => {}
            state => {
                return Err(Error::protocol(format!(
                    "cannot send {:?} in state {:?}",
                    command.opcode(),
                    state
                )))
            }
        }

        let frame = command.encode()?;
        debug!(opcode = ?command.opcode(), bytes = frame.len(), "sending command");

        let result = self.exchange(&frame, &command).await;
        self.state = match (&result, &command) {
            (Err(_), _) => SessionState::Failed,
            (Ok(_), Command::Exit) => SessionState::Closed,
            (Ok(_), Command::UploadArchive) => SessionState::Uploading,
            (Ok(_), _) => SessionState::Ready,
        };
        result
    }

    async fn exchange(&mut self, frame: &[u8], command: &Command) -> Result<Response> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;

        Ok(match command {
            Command::Exit => Response::Closed,
            Command::FindNodes(_) | Command::ListNodes => {
                Response::Nodes(wire::read_uuid_list(&mut self.reader).await?)
            }
            Command::UploadArchive => Response::UploadOpen,
            Command::GetGraph => Response::Graph(wire::read_blob(&mut self.reader).await?),
        })
    }

    /// Ask which of `uuids` the peer already holds.
    pub async fn find_nodes(&mut self, uuids: &[Uuid]) -> Result<Vec<Uuid>> {
        match self.request(Command::FindNodes(uuids.to_vec())).await? {
            Response::Nodes(found) => {
                debug!(asked = uuids.len(), found = found.len(), "find_nodes");
                Ok(found)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Every node the peer knows about.
    pub async fn list_nodes(&mut self) -> Result<Vec<Uuid>> {
        match self.request(Command::ListNodes).await? {
            Response::Nodes(nodes) => Ok(nodes),
            other => Err(unexpected(other)),
        }
    }

    /// Opaque diagnostic graph from the peer.
    pub async fn get_graph(&mut self) -> Result<Bytes> {
        match self.request(Command::GetGraph).await? {
            Response::Graph(graph) => Ok(graph),
            other => Err(unexpected(other)),
        }
    }

    /// Announce an upload and hand out the raw write side. The caller frames
    /// envelopes onto it; the upload ends when the next command is sent.
    pub async fn upload_archive(&mut self) -> Result<&mut W> {
        match self.request(Command::UploadArchive).await? {
            Response::UploadOpen => Ok(&mut self.writer),
            other => Err(unexpected(other)),
        }
    }

    pub async fn exit(&mut self) -> Result<()> {
        match self.request(Command::Exit).await? {
            Response::Closed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Give the streams back, e.g. to wait on the peer process.
    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

fn unexpected(response: Response) -> Error {
    Error::protocol(format!("unexpected response {:?}", response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    type TestSession = ProtocolSession<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pair() -> (TestSession, DuplexStream) {
        let (client, peer) = duplex(64 * 1024);
        let (r, w) = split(client);
        (ProtocolSession::new(r, w), peer)
    }

    async fn read_n(peer: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        peer.read_exact(&mut buf).await.unwrap();
        buf
    }

    async fn ready_pair() -> (TestSession, DuplexStream) {
        let (mut session, mut peer) = pair();
        peer.write_all(&SERVER_MAGIC).await.unwrap();
        session.handshake().await.unwrap();
        assert_eq!(read_n(&mut peer, 8).await, CLIENT_MAGIC);
        (session, peer)
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (session, _peer) = ready_pair().await;
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_handshake_wrong_magic() {
        let (mut session, mut peer) = pair();
        peer.write_all(&CLIENT_MAGIC).await.unwrap();
        let err = session.handshake().await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { .. }));
        assert_eq!(session.state(), SessionState::Failed);

        // Nothing may be sent afterwards
        assert!(session.list_nodes().await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_truncated_reply() {
        let (mut session, mut peer) = pair();
        peer.write_all(&SERVER_MAGIC[..5]).await.unwrap();
        peer.shutdown().await.unwrap();
        let err = session.handshake().await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn test_command_before_handshake_rejected() {
        let (mut session, _peer) = pair();
        assert!(matches!(
            session.list_nodes().await,
            Err(Error::ProtocolViolation { .. })
        ));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_find_nodes_exchange() {
        let (mut session, mut peer) = ready_pair().await;
        let a = Uuid::from_u128(0xA);
        let b = Uuid::from_u128(0xB);

        peer.write_all(&wire::encode_uuid_list(&[b])).await.unwrap();
        let found = session.find_nodes(&[a, b]).await.unwrap();
        assert_eq!(found, vec![b]);

        let sent = read_n(&mut peer, 8 + 4 + 32).await;
        assert_eq!(&sent[..8], &1u64.to_be_bytes());
        assert_eq!(&sent[8..12], &2u32.to_be_bytes());
        assert_eq!(&sent[12..28], a.as_bytes());
        assert_eq!(&sent[28..44], b.as_bytes());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_list_nodes_and_graph() {
        let (mut session, mut peer) = ready_pair().await;
        let a = Uuid::from_u128(7);

        peer.write_all(&wire::encode_uuid_list(&[a])).await.unwrap();
        peer.write_all(&wire::encode_blob(b"graph").unwrap())
            .await
            .unwrap();

        assert_eq!(session.list_nodes().await.unwrap(), vec![a]);
        assert_eq!(session.get_graph().await.unwrap().as_ref(), b"graph");
        let sent = read_n(&mut peer, 16).await;
        assert_eq!(&sent[..8], &2u64.to_be_bytes());
        assert_eq!(&sent[8..], &4u64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_graph_larger_than_64mib() {
        let graph = vec![b'g'; 64 * 1024 * 1024 + 1];
        let mut script = SERVER_MAGIC.to_vec();
        script.extend_from_slice(&wire::encode_blob(&graph).unwrap());

        let mut session = ProtocolSession::new(script.as_slice(), Vec::new());
        session.handshake().await.unwrap();
        let fetched = session.get_graph().await.unwrap();
        assert_eq!(fetched.len(), graph.len());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_truncated_response_poisons_session() {
        let (mut session, mut peer) = ready_pair().await;
        peer.write_all(&[0x01, 0xAA, 0xBB]).await.unwrap();
        peer.shutdown().await.unwrap();

        assert!(matches!(
            session.list_nodes().await,
            Err(Error::Transport(_))
        ));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(
            session.get_graph().await,
            Err(Error::ProtocolViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_upload_then_next_command_then_exit() {
        let (mut session, mut peer) = ready_pair().await;

        let writer = session.upload_archive().await.unwrap();
        writer.write_all(b"payload").await.unwrap();
        assert_eq!(session.state(), SessionState::Uploading);

        session.exit().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        let sent = read_n(&mut peer, 8 + 7 + 8).await;
        assert_eq!(&sent[..8], &3u64.to_be_bytes());
        assert_eq!(&sent[8..15], b"payload");
        assert_eq!(&sent[15..], &0u64.to_be_bytes());

        assert!(session.list_nodes().await.is_err());
    }
}
