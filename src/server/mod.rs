//! Server mode - runs when invoked as `snapsync server <repository>`
//!
//! Answers node queries for a client over stdin/stdout and records the
//! envelopes it uploads.

pub mod repository;

pub use repository::{FsckReport, Repository};

use std::path::Path;

use tokio::io::{
    self, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{
    encode_blob, encode_uuid_list, read_command, read_envelope, Command, Envelope, CLIENT_MAGIC,
    SERVER_MAGIC,
};

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Checksum blocks following the name of every uploaded envelope.
    pub envelope_checksums: usize,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            envelope_checksums: 2,
        }
    }
}

/// Main server entry point
pub async fn run_server(repository: &Path, options: &ServeOptions) -> Result<()> {
    let mut repo = Repository::load_from(repository).await?;
    info!(
        "serving {} nodes from {}",
        repo.nodes().len(),
        repository.display()
    );

    serve(&mut repo, io::stdin(), io::stdout(), options).await
}

/// Run one session: handshake, then answer commands until Exit.
pub async fn serve<R, W>(
    repo: &mut Repository,
    reader: R,
    mut writer: W,
    options: &ServeOptions,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).await?;
    if magic != CLIENT_MAGIC {
        return Err(Error::protocol(format!(
            "bad client magic {}",
            hex::encode(magic)
        )));
    }
    writer.write_all(&SERVER_MAGIC).await?;
    writer.flush().await?;

    loop {
        let command = read_command(&mut reader).await?;
        debug!(opcode = ?command.opcode(), "received command");

        match command {
            Command::Exit => {
                info!("client sent exit");
                return Ok(());
            }
            Command::FindNodes(asked) => {
                let found = repo.intersect(&asked);
                debug!(asked = asked.len(), found = found.len(), "find_nodes");
                writer.write_all(&encode_uuid_list(&found)).await?;
            }
            Command::ListNodes => {
                writer.write_all(&encode_uuid_list(&repo.nodes())).await?;
            }
            Command::UploadArchive => {
                let received = receive_envelopes(&mut reader, options).await?;
                info!("upload finished with {} envelopes", received.len());
                for envelope in received {
                    repo.record_archive(envelope);
                }
            }
            Command::GetGraph => {
                writer.write_all(&encode_blob(&repo.graph_json()?)?).await?;
            }
        }
        writer.flush().await?;
    }
}

/// Read envelopes until the next byte can no longer start one. Opcodes are
/// small big-endian integers, so a pending command always starts with 0x00.
async fn receive_envelopes<R>(
    reader: &mut BufReader<R>,
    options: &ServeOptions,
) -> Result<Vec<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    loop {
        let next = reader.fill_buf().await?;
        if next.first() != Some(&Envelope::TAG[0]) {
            return Ok(out);
        }
        let envelope = read_envelope(reader, options.envelope_checksums).await?;
        debug!(?envelope, "received envelope");
        out.push(envelope);
    }
}
