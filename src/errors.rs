use std::io;
use std::time::Duration;

use thiserror::Error;

/// Every failure the protocol core can report.
///
/// Variants carry the command name, sequence index or byte counts needed to
/// diagnose the failure from a log line alone.
#[derive(Debug, Error)]
pub enum CalError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timeout after {waited:?} waiting for response to {command}")]
    Timeout { command: String, waited: Duration },
    #[error("checksum mismatch (expected {expected:#04X}, got {actual:#04X})")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("{command} rejected by receiver: {response}")]
    ProtocolReject { command: String, response: String },
    #[error("packet too large ({size} bytes, limit 65535)")]
    PacketTooLarge { size: usize },
    #[error("transfer needs {packets} packets, protocol limit is 256")]
    ProtocolLimitExceeded { packets: usize },
    #[error("parameter {key} alone is {size} bytes, exceeds {limit} byte packet limit")]
    ParameterTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },
    #[error("{command}: missing packet {index}")]
    MissingPacket { command: String, index: usize },
    #[error("no channel byte mapping for {channel} ({variant})")]
    NoChannelMapping { channel: String, variant: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CalError {
    /// True for failures that a line-text exchange may retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CalError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, CalError>;
