//! # Fabric Sequenced
//!
//! A reliable, message-oriented transport endpoint layered over an
//! unreliable, unordered datagram fabric, with an opportunistic
//! shared-memory shortcut for co-located peers.
//!
//! The endpoint presents two-sided messaging (untagged and tagged) and a
//! one-sided RMA surface, and internally multiplexes each logical
//! transfer onto wire packets subject to credit-based flow control,
//! receiver-granted windows, peer-level congestion backoff, and in-order
//! message starts when requested.
//!
//! ## Architecture
//!
//! - **Handshake**: eager messages ride entirely in the RTS; longer ones
//!   follow an RTS/CTS rendezvous with DATA streamed under the granted
//!   window.
//! - **Flow control**: windows are carved out of a shared receive-buffer
//!   budget, rationed per peer as fanout grows.
//! - **Memory management**: preallocated packet and entry pools; entry
//!   ids are pool indices and double as wire ids.
//! - **Progress**: a single per-endpoint engine drains completions,
//!   reposts receive buffers, retries queued control traffic, and pumps
//!   DATA.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod iovec;
pub mod lower;
pub mod peer;
pub mod pool;
pub mod progress;
pub mod protocol;
pub mod receive;
pub mod transmit;

use bitflags::bitflags;

bitflags! {
    /// Flags reported on completions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CompletionFlags: u64 {
        const RECV           = 1 << 0;
        const TRANSMIT       = 1 << 1;
        const MSG            = 1 << 2;
        const TAGGED         = 1 << 3;
        const RMA            = 1 << 4;
        const READ           = 1 << 5;
        const WRITE          = 1 << 6;
        const REMOTE_READ    = 1 << 7;
        const REMOTE_WRITE   = 1 << 8;
        /// The multi-recv buffer is released with this completion.
        const MULTI_RECV     = 1 << 9;
        const REMOTE_CQ_DATA = 1 << 10;
    }
}

/// A successful completion delivered to the application.
#[derive(Debug)]
pub struct Completion {
    pub context: u64,
    pub flags: CompletionFlags,
    pub len: usize,
    pub data: u64,
    pub tag: u64,
    /// The buffer handed back to the application: the posted receive
    /// segments, the retired send segments, or a released multi-recv
    /// buffer.
    pub buf: Option<Vec<Vec<u8>>>,
}

/// An error completion. Exactly one is produced per failed or cancelled
/// transfer.
#[derive(Debug)]
pub struct CompletionError {
    pub context: u64,
    pub flags: CompletionFlags,
    pub tag: u64,
    pub err: error::Error,
    pub prov_errno: i32,
}

/// One event drained from the endpoint's completion queue.
#[derive(Debug)]
pub enum CqEvent {
    Complete(Completion),
    Error(CompletionError),
}

pub use config::Config;
pub use endpoint::{Endpoint, ReadRequest, RecvRequest, SendRequest};
pub use error::Error;
pub use lower::{Domain, LowerCqEntry, LowerEndpoint, LowerError, MrHandle, ShmEndpoint};
pub use protocol::{MsgId, PeerAddr, RmaIov, RxId, TxId};
