//! Error types shared by the catalog, the protocol session and the selector.

use std::path::PathBuf;

/// Every failure the library can surface. None of them are retried internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A snapshot listing row could not be parsed.
    #[error("invalid listing line: `{line}': {reason}")]
    Parse { line: String, reason: String },

    /// The requested subvolume path is not in the catalog.
    #[error("no path `{path}' found in snapshot catalog")]
    PathNotFound { path: String },

    /// The peer answered with something the protocol does not allow.
    #[error("protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// An envelope frame is truncated or malformed.
    #[error("envelope format error: {message}")]
    EnvelopeFormat { message: String },

    /// A btrfs send stream is malformed or fails its checksum.
    #[error("send stream error: {message}")]
    SendStream { message: String },

    /// The underlying stream failed or closed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The configuration file could not be read or parsed.
    #[error("config error in {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    /// An external tool exited unsuccessfully.
    #[error("`{program}` failed: {stderr}")]
    Tool { program: String, stderr: String },
}

impl Error {
    pub fn parse<L: Into<String>, R: Into<String>>(line: L, reason: R) -> Self {
        Self::Parse {
            line: line.into(),
            reason: reason.into(),
        }
    }

    pub fn path_not_found<S: Into<String>>(path: S) -> Self {
        Self::PathNotFound { path: path.into() }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    pub fn envelope<S: Into<String>>(message: S) -> Self {
        Self::EnvelopeFormat {
            message: message.into(),
        }
    }

    pub fn stream<S: Into<String>>(message: S) -> Self {
        Self::SendStream {
            message: message.into(),
        }
    }

    pub fn tool<P: Into<String>, S: Into<String>>(program: P, stderr: S) -> Self {
        Self::Tool {
            program: program.into(),
            stderr: stderr.into(),
        }
    }

    /// Whether this error leaves a protocol session unusable.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. } | Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
