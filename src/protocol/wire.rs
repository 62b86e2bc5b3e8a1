//! Wire format for the node negotiation protocol.
//!
//! All multi-byte integers are big-endian.
//! Command frame: opcode:u64 | payload
//! UUID list: (flag:u8 != 0, uuid:[u8; 16])* | 0x00
//! Graph blob: len:u32 | bytes

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Sent by the client to open a session.
pub const CLIENT_MAGIC: [u8; 8] = *b"\xa8\x5b\x4b\x2b\x1b\x75\x4c\x0a";

/// Expected back from the peer before any command is issued.
pub const SERVER_MAGIC: [u8; 8] = *b"\xfb\x70\x4c\x63\x41\x1d\x9c\x0a";

/// Raw length of one node identifier on the wire.
pub const UUID_LEN: usize = 16;

/// Terminates a UUID list.
pub const LIST_END: u8 = 0x00;

/// Marks that another UUID follows.
pub const LIST_ENTRY: u8 = 0x01;

// =============================================================================
// Opcodes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Opcode {
    Exit = 0,
    FindNodes = 1,
    ListNodes = 2,
    UploadArchive = 3,
    GetGraph = 4,
}

impl Opcode {
    pub fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(Self::Exit),
            1 => Some(Self::FindNodes),
            2 => Some(Self::ListNodes),
            3 => Some(Self::UploadArchive),
            4 => Some(Self::GetGraph),
            _ => None,
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

/// A client request. Both the client session and the server peer match on
/// this exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    FindNodes(Vec<Uuid>),
    ListNodes,
    UploadArchive,
    GetGraph,
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Exit => Opcode::Exit,
            Command::FindNodes(_) => Opcode::FindNodes,
            Command::ListNodes => Opcode::ListNodes,
            Command::UploadArchive => Opcode::UploadArchive,
            Command::GetGraph => Opcode::GetGraph,
        }
    }

    /// Encode the opcode and payload.
    ///
    /// Fails only when a `FindNodes` list is too long for its u32 count.
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Command::FindNodes(uuids) => {
                let count = u32::try_from(uuids.len()).map_err(|_| {
                    Error::protocol(format!("too many nodes in one request: {}", uuids.len()))
                })?;
                let mut buf = BytesMut::with_capacity(8 + 4 + uuids.len() * UUID_LEN);
                buf.put_u64(Opcode::FindNodes as u64);
                buf.put_u32(count);
                for uuid in uuids {
                    buf.put_slice(uuid.as_bytes());
                }
                Ok(buf.freeze())
            }
            Command::Exit | Command::ListNodes | Command::UploadArchive | Command::GetGraph => {
                let mut buf = BytesMut::with_capacity(8);
                buf.put_u64(self.opcode() as u64);
                Ok(buf.freeze())
            }
        }
    }
}

/// Read one command from the client side of the stream.
pub async fn read_command<R: AsyncRead + Unpin>(r: &mut R) -> Result<Command> {
    let raw = r.read_u64().await?;
    let opcode =
        Opcode::from_u64(raw).ok_or_else(|| Error::protocol(format!("unknown opcode {}", raw)))?;

    Ok(match opcode {
        Opcode::Exit => Command::Exit,
        Opcode::FindNodes => {
            let count = r.read_u32().await? as usize;
            // Count comes off the wire; don't trust it for the allocation.
            let mut uuids = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                uuids.push(read_uuid(r).await?);
            }
            Command::FindNodes(uuids)
        }
        Opcode::ListNodes => Command::ListNodes,
        Opcode::UploadArchive => Command::UploadArchive,
        Opcode::GetGraph => Command::GetGraph,
    })
}

// =============================================================================
// UUID lists
// =============================================================================

pub fn encode_uuid_list(uuids: &[Uuid]) -> Bytes {
    let mut buf = BytesMut::with_capacity(uuids.len() * (1 + UUID_LEN) + 1);
    for uuid in uuids {
        buf.put_u8(LIST_ENTRY);
        buf.put_slice(uuid.as_bytes());
    }
    buf.put_u8(LIST_END);
    buf.freeze()
}

/// Read a flag-prefixed UUID list up to its terminator.
pub async fn read_uuid_list<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<Uuid>> {
    let mut out = Vec::new();
    loop {
        let flag = r.read_u8().await?;
        if flag == LIST_END {
            break;
        }
        out.push(read_uuid(r).await?);
    }
    Ok(out)
}

async fn read_uuid<R: AsyncRead + Unpin>(r: &mut R) -> Result<Uuid> {
    let mut raw = [0u8; UUID_LEN];
    r.read_exact(&mut raw).await?;
    Ok(Uuid::from_bytes(raw))
}

// =============================================================================
// Graph blob
// =============================================================================

pub fn encode_blob(data: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(data.len())
        .map_err(|_| Error::protocol(format!("graph too large: {} bytes", data.len())))?;
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u32(len);
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Any u32 length is accepted.
pub async fn read_blob<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes> {
    let len = r.read_u32().await?;
    Ok(Bytes::from(read_len(r, len).await?))
}

/// Read exactly `len` bytes, growing the buffer as data arrives so a bogus
/// length cannot force a large allocation up front.
pub(crate) async fn read_len<R: AsyncRead + Unpin>(r: &mut R, len: u32) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    let got = r.take(u64::from(len)).read_to_end(&mut data).await?;
    if got != len as usize {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {} bytes, got {}", len, got),
        ));
    }
    Ok(data)
}

// =============================================================================
// Tests
// =============================================================================
