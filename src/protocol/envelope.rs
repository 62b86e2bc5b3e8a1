//! Integrity envelope framed onto the upload stream.
//!
//! Layout: tag:[u8; 15] | name_len:u32 | name | checksum:[u8; 32]+
//!
//! The number of checksum blocks is not carried in the frame; the reader
//! has to be told how many to expect.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Size of one checksum block.
pub const CHECKSUM_LEN: usize = 32;

pub type Checksum = [u8; CHECKSUM_LEN];

#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    name: Bytes,
    checksums: Vec<Checksum>,
}

impl Envelope {
    /// Fixed frame identifier, null-terminated within 15 bytes.
    pub const TAG: &'static [u8; 15] = b"reliable-encap\0";

    pub fn new(name: impl Into<Bytes>, checksums: Vec<Checksum>) -> Result<Self> {
        let name = name.into();
        if u32::try_from(name.len()).is_err() {
            return Err(Error::envelope(format!(
                "name of {} bytes does not fit a u32 length",
                name.len()
            )));
        }
        if checksums.is_empty() {
            return Err(Error::envelope("at least one checksum block is required"));
        }
        Ok(Self { name, checksums })
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn checksums(&self) -> &[Checksum] {
        &self.checksums
    }

    pub fn encoded_len(&self) -> usize {
        Self::TAG.len() + 4 + self.name.len() + self.checksums.len() * CHECKSUM_LEN
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(Self::TAG);
        buf.put_u32(self.name.len() as u32);
        buf.put_slice(&self.name);
        for checksum in &self.checksums {
            buf.put_slice(checksum);
        }
        buf.freeze()
    }

    /// Decode one frame from the front of `buf`, expecting `checksum_blocks`
    /// checksums. Returns the envelope and the number of bytes consumed.
    pub fn decode(buf: &[u8], checksum_blocks: usize) -> Result<(Self, usize)> {
        if checksum_blocks == 0 {
            return Err(Error::envelope("at least one checksum block is required"));
        }

        let mut payload = buf;
        if payload.remaining() < Self::TAG.len() + 4 {
            return Err(Error::envelope(format!(
                "header truncated: {} bytes",
                payload.remaining()
            )));
        }
        check_tag(&payload[..Self::TAG.len()])?;
        payload.advance(Self::TAG.len());

        let name_len = payload.get_u32() as usize;
        if payload.remaining() < name_len {
            return Err(Error::envelope(format!(
                "name length {} exceeds remaining {} bytes",
                name_len,
                payload.remaining()
            )));
        }
        let name = Bytes::copy_from_slice(&payload[..name_len]);
        payload.advance(name_len);

        let required = checksum_blocks.checked_mul(CHECKSUM_LEN).ok_or_else(|| {
            Error::envelope(format!("{} checksum blocks overflow a length", checksum_blocks))
        })?;
        if payload.remaining() < required {
            return Err(Error::envelope(format!(
                "checksums truncated: expected {} blocks ({} bytes), got {} bytes",
                checksum_blocks,
                required,
                payload.remaining()
            )));
        }
        let checksums = payload[..required]
            .chunks_exact(CHECKSUM_LEN)
            .map(to_checksum)
            .collect();
        payload.advance(required);

        let consumed = buf.len() - payload.remaining();
        Ok((Self { name, checksums }, consumed))
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("name", &String::from_utf8_lossy(&self.name))
            .field(
                "checksums",
                &self.checksums.iter().map(hex::encode).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn check_tag(tag: &[u8]) -> Result<()> {
    if tag != Envelope::TAG {
        return Err(Error::envelope(format!(
            "unexpected tag {:?}",
            String::from_utf8_lossy(tag)
        )));
    }
    Ok(())
}

fn to_checksum(block: &[u8]) -> Checksum {
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(block);
    out
}

/// Read exactly one envelope from a stream.
pub async fn read_envelope<R: AsyncRead + Unpin>(
    r: &mut R,
    checksum_blocks: usize,
) -> Result<Envelope> {
    if checksum_blocks == 0 {
        return Err(Error::envelope("at least one checksum block is required"));
    }

    let mut tag = [0u8; 15];
    read_exact_or_truncated(r, &mut tag, "tag").await?;
    check_tag(&tag)?;

    let mut len = [0u8; 4];
    read_exact_or_truncated(r, &mut len, "name length").await?;
    let name_len = u32::from_be_bytes(len);
    let name = super::wire::read_len(r, name_len)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::envelope("name truncated"),
            _ => e.into(),
        })?;

    let mut checksums = Vec::with_capacity(checksum_blocks.min(64));
    for _ in 0..checksum_blocks {
        let mut block = [0u8; CHECKSUM_LEN];
        read_exact_or_truncated(r, &mut block, "checksum").await?;
        checksums.push(block);
    }

    Ok(Envelope {
        name: Bytes::from(name),
        checksums,
    })
}

pub async fn write_envelope<W: AsyncWrite + Unpin>(w: &mut W, envelope: &Envelope) -> Result<()> {
    w.write_all(&envelope.encode()).await?;
    Ok(())
}

async fn read_exact_or_truncated<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
    field: &str,
) -> Result<()> {
    match r.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::envelope(format!("{} truncated", field)))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// sha256 of the empty string.
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn checksum_from_hex(s: &str) -> Checksum {
        to_checksum(&hex::decode(s).unwrap())
    }

    /// Empty-name frame carrying the sha256 of no data twice.
    fn empty_stream_frame() -> Vec<u8> {
        let mut raw = b"reliable-encap\x00\x00\x00\x00\x00".to_vec();
        raw.extend_from_slice(&hex::decode(EMPTY_SHA256).unwrap());
        raw.extend_from_slice(&hex::decode(EMPTY_SHA256).unwrap());
        raw
    }

    #[test]
    fn test_encode_layout() {
        let env = Envelope::new(&b"foobarbaz\n"[..], vec![[0xABu8; 32]]).unwrap();
        let encoded = env.encode();

        assert_eq!(encoded.len(), env.encoded_len());
        assert_eq!(&encoded[..15], b"reliable-encap\0");
        assert_eq!(&encoded[15..19], &[0, 0, 0, 10]);
        assert_eq!(&encoded[19..29], b"foobarbaz\n");
        assert_eq!(&encoded[29..], &[0xABu8; 32]);
    }

    #[test]
    fn test_decode_empty_name_repeated_checksums() {
        let raw = empty_stream_frame();
        let (env, consumed) = Envelope::decode(&raw, 2).unwrap();

        assert!(env.name().is_empty());
        assert_eq!(env.checksums().len(), 2);
        assert_eq!(env.checksums()[0], checksum_from_hex(EMPTY_SHA256));
        assert_eq!(env.checksums()[0], env.checksums()[1]);
        assert_eq!(consumed, raw.len());
        assert_eq!(env.encode().as_ref(), raw.as_slice());
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let env = Envelope::new(&b"foobarbaz\n"[..], vec![[7; 32]]).unwrap();
        let mut raw = env.encode().to_vec();
        raw.extend_from_slice(&[0, 0, 0, 0]);
        raw.extend_from_slice(&[9; 64]);

        let (decoded, consumed) = Envelope::decode(&raw, 1).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(consumed, 15 + 4 + 10 + 32);
        assert_eq!(raw.len() - consumed, 68);
    }

    #[test]
    fn test_decode_name_length_overrun() {
        let mut raw = b"reliable-encap\0".to_vec();
        raw.extend_from_slice(&100u32.to_be_bytes());
        raw.extend_from_slice(b"short");
        match Envelope::decode(&raw, 1) {
            Err(Error::EnvelopeFormat { message }) => assert!(message.contains("name length")),
            other => panic!("Expected EnvelopeFormat, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_truncated() {
        let raw = empty_stream_frame();
        for cut in [0, 10, 18, raw.len() - 1] {
            assert!(
                matches!(
                    Envelope::decode(&raw[..cut], 2),
                    Err(Error::EnvelopeFormat { .. })
                ),
                "cut at {} should fail",
                cut
            );
        }
    }

    #[test]
    fn test_decode_wrong_tag() {
        let mut raw = empty_stream_frame();
        raw[0] = b'R';
        assert!(matches!(
            Envelope::decode(&raw, 2),
            Err(Error::EnvelopeFormat { .. })
        ));
    }

    #[test]
    fn test_zero_checksums_rejected() {
        assert!(Envelope::new(Bytes::new(), vec![]).is_err());
        assert!(Envelope::decode(&empty_stream_frame(), 0).is_err());
    }

    #[tokio::test]
    async fn test_stream_read_sequence() {
        let first = Envelope::new(Bytes::new(), vec![[1; 32], [1; 32]]).unwrap();
        let second = Envelope::new(&b"home_2014-08-25"[..], vec![[2; 32], [3; 32]]).unwrap();

        let mut wire = Vec::new();
        write_envelope(&mut wire, &first).await.unwrap();
        write_envelope(&mut wire, &second).await.unwrap();

        let mut reader: &[u8] = &wire;
        assert_eq!(read_envelope(&mut reader, 2).await.unwrap(), first);
        assert_eq!(read_envelope(&mut reader, 2).await.unwrap(), second);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_decode_huge_checksum_count() {
        match Envelope::decode(&empty_stream_frame(), usize::MAX / 16) {
            Err(Error::EnvelopeFormat { message }) => assert!(message.contains("overflow")),
            other => panic!("Expected EnvelopeFormat, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_read_name_over_64mib() {
        let name = vec![b'n'; 64 * 1024 * 1024 + 1];
        let env = Envelope::new(name, vec![[5; 32]]).unwrap();
        let wire = env.encode();

        let mut reader: &[u8] = &wire;
        let decoded = read_envelope(&mut reader, 1).await.unwrap();
        assert_eq!(decoded.name().len(), 64 * 1024 * 1024 + 1);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_stream_read_huge_checksum_count() {
        let raw = empty_stream_frame();
        let mut reader: &[u8] = &raw;
        assert!(matches!(
            read_envelope(&mut reader, usize::MAX).await,
            Err(Error::EnvelopeFormat { .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_read_truncated() {
        let raw = empty_stream_frame();
        let mut reader: &[u8] = &raw[..raw.len() - 5];
        assert!(matches!(
            read_envelope(&mut reader, 2).await,
            Err(Error::EnvelopeFormat { .. })
        ));
    }
}
