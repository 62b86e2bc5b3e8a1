//! Node negotiation protocol.
//!
//! A client asks a peer which snapshots it already holds so a new snapshot
//! can be sent as a delta against one of them.
//!
//! # Conversation
//!
//! ```text
//! client                               peer
//!   | -- CLIENT_MAGIC ------------------> |
//!   | <-------------------- SERVER_MAGIC  |
//!   | -- FindNodes(n, uuids) -----------> |
//!   | <------------------ uuid list ----- |
//!   | -- UploadArchive, envelopes... ---> |
//!   | -- Exit --------------------------> |
//! ```

pub mod envelope;
pub mod session;
pub mod wire;

pub use envelope::{read_envelope, write_envelope, Checksum, Envelope, CHECKSUM_LEN};
pub use session::{ProtocolSession, Response, SessionState};
pub use wire::{
    encode_blob, encode_uuid_list, read_blob, read_command, read_uuid_list, Command, Opcode,
    CLIENT_MAGIC, SERVER_MAGIC,
};
