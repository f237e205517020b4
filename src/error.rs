use std::{io, path::PathBuf};

use thiserror::Error;

use crate::world::ChunkPos;

/// Failures of the on-disk world. Fatal to the operation that hit them, never to the process.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("chunk view {0:?} outlived its section")]
    StaleView(ChunkPos),

    #[error("chunk {chunk:?} generated differently on a second run")]
    GenerationDeterminismViolation { chunk: ChunkPos },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> StorageError {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors that end a single connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("connection I/O: {0}")]
    Io(#[from] io::Error),

    #[error("unknown packet tag {0:#06x}")]
    UnknownTag(u16),

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("varint longer than 10 bytes")]
    VarIntTooLong,

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("unexpected {0} packet")]
    UnexpectedPacket(&'static str),

    #[error("protocol version {got} is not supported (expected {expected})")]
    VersionMismatch { got: i64, expected: i64 },

    #[error("peer disconnected: {0}")]
    Disconnected(String),

    #[error("timed out")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
