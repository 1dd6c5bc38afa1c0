use thiserror::Error;

/// Errors produced by the reliable-endpoint core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Transient resource shortage (pool exhaustion, lower-transport queue
    /// full, credit exhaustion). Recovered by retrying after progress.
    #[error("resources temporarily exhausted, try again")]
    Again,
    #[error("peer is in receiver-not-ready backoff")]
    PeerBackoff,
    #[error("message exceeds the maximum transfer size")]
    MessageTooLarge,
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),
    #[error("unsupported protocol version {0}")]
    InvalidVersion(u8),
    #[error("truncated packet: need {need} bytes, have {have}")]
    TruncatedPacket { need: usize, have: usize },
    #[error("unknown transfer id {0}")]
    UnknownEntry(u32),
    #[error("memory registration failed")]
    MrRegFailed,
    #[error("no registered region for key {0:#x}")]
    UnknownRegion(u64),
    #[error("lower transport error {0}")]
    Lower(i32),
}

impl Error {
    /// Retryable errors are recovered locally by queueing the offending
    /// entry and re-driving it from the progress loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Again | Error::PeerBackoff)
    }

    /// Provider-style errno carried on error completions.
    pub fn prov_errno(&self) -> i32 {
        match self {
            Error::Again | Error::PeerBackoff => 11,
            Error::Cancelled => 125,
            Error::Lower(e) => *e,
            _ => 22,
        }
    }
}
