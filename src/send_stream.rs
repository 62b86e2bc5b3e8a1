//! Reader for the btrfs send stream format (version 1).
//!
//! All integers are little-endian.
//! Stream:    magic:"btrfs-stream\0" | version:u32 | command*
//! Command:   len:u32 | kind:u16 | crc32c:u32 | attributes[len]
//! Attribute: type:u16 | len:u16 | data
//!
//! The checksum covers the command header (with the crc field zeroed) and
//! its attributes. Only the first command is decoded in detail: it names the
//! subvolume being sent and, for an incremental stream, the parent it was
//! computed against.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::wire::read_len;

pub const STREAM_MAGIC: &[u8; 13] = b"btrfs-stream\0";

pub const STREAM_VERSION: u32 = 1;

/// len + kind + crc
pub const COMMAND_HEADER_LEN: usize = 10;

// Attribute types used by the subvolume and snapshot commands.
const ATTR_UUID: u16 = 1;
const ATTR_CTRANSID: u16 = 2;
const ATTR_PATH: u16 = 15;
const ATTR_CLONE_UUID: u16 = 20;
const ATTR_CLONE_CTRANSID: u16 = 21;

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandKind {
    Unspec = 0,
    Subvol = 1,
    Snapshot = 2,
    Mkfile = 3,
    Mkdir = 4,
    Mknod = 5,
    Mkfifo = 6,
    Mksock = 7,
    Symlink = 8,
    Rename = 9,
    Link = 10,
    Unlink = 11,
    Rmdir = 12,
    SetXattr = 13,
    RemoveXattr = 14,
    Write = 15,
    Clone = 16,
    Truncate = 17,
    Chmod = 18,
    Chown = 19,
    Utimes = 20,
    End = 21,
    UpdateExtent = 22,
}

impl CommandKind {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Self::Unspec,
            1 => Self::Subvol,
            2 => Self::Snapshot,
            3 => Self::Mkfile,
            4 => Self::Mkdir,
            5 => Self::Mknod,
            6 => Self::Mkfifo,
            7 => Self::Mksock,
            8 => Self::Symlink,
            9 => Self::Rename,
            10 => Self::Link,
            11 => Self::Unlink,
            12 => Self::Rmdir,
            13 => Self::SetXattr,
            14 => Self::RemoveXattr,
            15 => Self::Write,
            16 => Self::Clone,
            17 => Self::Truncate,
            18 => Self::Chmod,
            19 => Self::Chown,
            20 => Self::Utimes,
            21 => Self::End,
            22 => Self::UpdateExtent,
            _ => return None,
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SendCommand {
    kind: CommandKind,
    crc32: u32,
    data: Bytes,
}

impl SendCommand {
    /// Build a command with a freshly computed checksum.
    pub fn new(kind: CommandKind, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        if u32::try_from(data.len()).is_err() {
            return Err(Error::stream(format!(
                "command of {} bytes does not fit a u32 length",
                data.len()
            )));
        }
        let crc32 = checksum(kind, &data);
        Ok(Self { kind, crc32, data })
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Checksum as stored in the stream.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn calculate_crc32(&self) -> u32 {
        checksum(self.kind, &self.data)
    }

    pub fn validate_crc32(&self) -> bool {
        self.crc32 == self.calculate_crc32()
    }

    pub fn encoded_len(&self) -> usize {
        COMMAND_HEADER_LEN + self.data.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(self.data.len() as u32);
        buf.put_u16_le(self.kind as u16);
        buf.put_u32_le(self.crc32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Read the next command. `None` means the stream ended cleanly before a
    /// new command started. The checksum is not checked here.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Self>> {
        let mut header = [0u8; COMMAND_HEADER_LEN];
        let first = r.read(&mut header).await?;
        if first == 0 {
            return Ok(None);
        }
        read_exact_or_truncated(r, &mut header[first..], "command header").await?;

        let mut fields = &header[..];
        let len = fields.get_u32_le();
        let raw_kind = fields.get_u16_le();
        let crc32 = fields.get_u32_le();
        let kind = CommandKind::from_u16(raw_kind)
            .ok_or_else(|| Error::stream(format!("unknown command type {}", raw_kind)))?;

        let data = read_len(r, len).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Error::stream(format!("{:?} command truncated", kind))
            }
            _ => e.into(),
        })?;

        Ok(Some(Self {
            kind,
            crc32,
            data: Bytes::from(data),
        }))
    }
}

impl fmt::Debug for SendCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendCommand")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("crc32", &format_args!("{:08x}", self.crc32))
            .finish()
    }
}

fn checksum(kind: CommandKind, data: &[u8]) -> u32 {
    let mut header = [0u8; COMMAND_HEADER_LEN];
    let mut fields = &mut header[..];
    fields.put_u32_le(data.len() as u32);
    fields.put_u16_le(kind as u16);

    // btrfs seeds with 0 and skips the final inversion.
    let crc = crc32c::crc32c_append(!0, &header);
    !crc32c::crc32c_append(crc, data)
}

async fn read_exact_or_truncated<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
    field: &str,
) -> Result<()> {
    match r.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::stream(format!("{} truncated", field)))
        }
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Stream header
// =============================================================================

pub fn encode_header() -> Bytes {
    let mut buf = BytesMut::with_capacity(STREAM_MAGIC.len() + 4);
    buf.put_slice(STREAM_MAGIC);
    buf.put_u32_le(STREAM_VERSION);
    buf.freeze()
}

/// Read and check the magic and version.
pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<u32> {
    let mut magic = [0u8; 13];
    read_exact_or_truncated(r, &mut magic, "stream header").await?;
    if &magic != STREAM_MAGIC {
        return Err(Error::stream(format!(
            "bad stream magic {}",
            hex::encode(magic)
        )));
    }

    let mut version = [0u8; 4];
    read_exact_or_truncated(r, &mut version, "stream version").await?;
    let version = u32::from_le_bytes(version);
    if version != STREAM_VERSION {
        return Err(Error::stream(format!(
            "unsupported stream version {}",
            version
        )));
    }
    Ok(version)
}

/// Iterates the commands of one stream, stopping after `End`.
pub struct CommandReader<R> {
    reader: R,
    finished: bool,
}

impl<R: AsyncRead + Unpin> CommandReader<R> {
    pub async fn open(mut reader: R) -> Result<Self> {
        read_header(&mut reader).await?;
        Ok(Self {
            reader,
            finished: false,
        })
    }

    pub async fn next(&mut self) -> Result<Option<SendCommand>> {
        if self.finished {
            return Ok(None);
        }
        let command = SendCommand::read(&mut self.reader).await?;
        match &command {
            Some(cmd) if cmd.kind() == CommandKind::End => self.finished = true,
            None => self.finished = true,
            Some(_) => {}
        }
        Ok(command)
    }

    /// Like `next`, but a checksum mismatch is an error.
    pub async fn next_verified(&mut self) -> Result<Option<SendCommand>> {
        let command = self.next().await?;
        if let Some(cmd) = &command {
            if !cmd.validate_crc32() {
                self.finished = true;
                return Err(Error::stream(format!(
                    "{:?} command checksum {:08x} != computed {:08x}",
                    cmd.kind(),
                    cmd.crc32(),
                    cmd.calculate_crc32()
                )));
            }
        }
        Ok(command)
    }

    /// The rest of the stream, positioned after the last command read.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

// =============================================================================
// Attributes
// =============================================================================

fn next_attr<'a>(buf: &mut &'a [u8]) -> Result<(u16, &'a [u8])> {
    if buf.remaining() < 4 {
        return Err(Error::stream("attribute header truncated"));
    }
    let kind = buf.get_u16_le();
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(Error::stream(format!(
            "attribute {} of {} bytes exceeds remaining {}",
            kind,
            len,
            buf.remaining()
        )));
    }
    let (data, rest) = buf.split_at(len);
    *buf = rest;
    Ok((kind, data))
}

fn expect_attr<'a>(buf: &mut &'a [u8], want: u16, what: &str) -> Result<&'a [u8]> {
    let (kind, data) = next_attr(buf)?;
    if kind != want {
        return Err(Error::stream(format!(
            "expected {} attribute ({}), found type {}",
            what, want, kind
        )));
    }
    Ok(data)
}

fn expect_uuid(buf: &mut &[u8], want: u16, what: &str) -> Result<Uuid> {
    let data = expect_attr(buf, want, what)?;
    Uuid::from_slice(data).map_err(|_| Error::stream(format!("bad {} of {} bytes", what, data.len())))
}

fn expect_u64(buf: &mut &[u8], want: u16, what: &str) -> Result<u64> {
    let data = expect_attr(buf, want, what)?;
    let raw: [u8; 8] = data
        .try_into()
        .map_err(|_| Error::stream(format!("bad {} of {} bytes", what, data.len())))?;
    Ok(u64::from_le_bytes(raw))
}

fn put_attr(buf: &mut BytesMut, kind: u16, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| Error::stream(format!("attribute {} too long: {} bytes", kind, data.len())))?;
    buf.put_u16_le(kind);
    buf.put_u16_le(len);
    buf.put_slice(data);
    Ok(())
}

// =============================================================================
// Stream origin
// =============================================================================

/// First command of a full send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubvolInfo {
    pub name: Bytes,
    pub uuid: Uuid,
    pub ctransid: u64,
}

impl SubvolInfo {
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        let name = expect_attr(&mut data, ATTR_PATH, "path")?;
        let uuid = expect_uuid(&mut data, ATTR_UUID, "uuid")?;
        let ctransid = expect_u64(&mut data, ATTR_CTRANSID, "ctransid")?;
        Ok(Self {
            name: Bytes::copy_from_slice(name),
            uuid,
            ctransid,
        })
    }

    pub fn to_command(&self) -> Result<SendCommand> {
        let mut data = BytesMut::with_capacity(3 * 4 + self.name.len() + 16 + 8);
        put_attr(&mut data, ATTR_PATH, &self.name)?;
        put_attr(&mut data, ATTR_UUID, self.uuid.as_bytes())?;
        put_attr(&mut data, ATTR_CTRANSID, &self.ctransid.to_le_bytes())?;
        SendCommand::new(CommandKind::Subvol, data.freeze())
    }
}

/// First command of an incremental send; `clone_uuid` is the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: Bytes,
    pub uuid: Uuid,
    pub ctransid: u64,
    pub clone_uuid: Uuid,
    pub clone_ctransid: u64,
}

impl SnapshotInfo {
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        let name = expect_attr(&mut data, ATTR_PATH, "path")?;
        let uuid = expect_uuid(&mut data, ATTR_UUID, "uuid")?;
        let ctransid = expect_u64(&mut data, ATTR_CTRANSID, "ctransid")?;
        let clone_uuid = expect_uuid(&mut data, ATTR_CLONE_UUID, "clone uuid")?;
        let clone_ctransid = expect_u64(&mut data, ATTR_CLONE_CTRANSID, "clone ctransid")?;
        Ok(Self {
            name: Bytes::copy_from_slice(name),
            uuid,
            ctransid,
            clone_uuid,
            clone_ctransid,
        })
    }

    pub fn to_command(&self) -> Result<SendCommand> {
        let mut data = BytesMut::with_capacity(5 * 4 + self.name.len() + 2 * 16 + 2 * 8);
        put_attr(&mut data, ATTR_PATH, &self.name)?;
        put_attr(&mut data, ATTR_UUID, self.uuid.as_bytes())?;
        put_attr(&mut data, ATTR_CTRANSID, &self.ctransid.to_le_bytes())?;
        put_attr(&mut data, ATTR_CLONE_UUID, self.clone_uuid.as_bytes())?;
        put_attr(
            &mut data,
            ATTR_CLONE_CTRANSID,
            &self.clone_ctransid.to_le_bytes(),
        )?;
        SendCommand::new(CommandKind::Snapshot, data.freeze())
    }
}

/// What a stream creates on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOrigin {
    Full(SubvolInfo),
    Incremental(SnapshotInfo),
}

impl StreamOrigin {
    /// Decode the first command of a stream, which must carry a valid checksum.
    pub fn from_command(command: &SendCommand) -> Result<Self> {
        if !command.validate_crc32() {
            return Err(Error::stream(format!(
                "{:?} command fails its checksum",
                command.kind()
            )));
        }
        match command.kind() {
            CommandKind::Subvol => Ok(Self::Full(SubvolInfo::parse(command.data())?)),
            CommandKind::Snapshot => Ok(Self::Incremental(SnapshotInfo::parse(command.data())?)),
            other => Err(Error::stream(format!(
                "stream starts with {:?}, expected a subvolume or snapshot",
                other
            ))),
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            Self::Full(s) => s.uuid,
            Self::Incremental(s) => s.uuid,
        }
    }

    /// The node this stream was computed against, if any.
    pub fn parent(&self) -> Option<Uuid> {
        match self {
            Self::Full(_) => None,
            Self::Incremental(s) => Some(s.clone_uuid),
        }
    }

    pub fn name(&self) -> &[u8] {
        match self {
            Self::Full(s) => &s.name,
            Self::Incremental(s) => &s.name,
        }
    }
}

/// Read the header and first command of a stream. The returned reader is
/// positioned after that command.
pub async fn read_origin<R: AsyncRead + Unpin>(
    reader: R,
) -> Result<(StreamOrigin, SendCommand, CommandReader<R>)> {
    let mut commands = CommandReader::open(reader).await?;
    let first = commands
        .next()
        .await?
        .ok_or_else(|| Error::stream("stream has no commands"))?;
    let origin = StreamOrigin::from_command(&first)?;
    Ok((origin, first, commands))
}

/// Read a whole stream, checking every command checksum. Returns the origin
/// and the number of commands read.
pub async fn verify_stream<R: AsyncRead + Unpin>(reader: R) -> Result<(StreamOrigin, usize)> {
    let (origin, _, mut commands) = read_origin(reader).await?;
    let mut count = 1;
    while commands.next_verified().await?.is_some() {
        count += 1;
    }
    Ok((origin, count))
}

// =============================================================================
// Tests
// =============================================================================
