//! The narrow contract the core consumes from its lower transports.
//!
//! The fabric is assumed to be an unordered, unreliable-datagram medium
//! with a completion queue reporting per-operation success or an error.
//! Calls never block: they succeed, fail with try-again, or fail
//! terminally.

use bitflags::bitflags;

use crate::protocol::PeerAddr;

/// Opaque handle to a memory region registered with the NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrHandle(pub u64);

/// Local descriptor for a pre-registered user segment.
pub type MrDesc = MrHandle;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendFlags: u32 {
        /// More operations follow immediately; the lower transport may
        /// defer doorbells until a send without this hint.
        const MORE   = 1 << 0;
        /// Fire-and-forget: no send completion will be reported.
        const INJECT = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerError {
    /// Transmit queue full or no receive slot free; retry later.
    Again,
    /// Receiver-not-ready reported by the fabric.
    Rnr,
    /// Terminal provider error.
    Other(i32),
}

/// One completion read from a lower transport's queue.
#[derive(Debug)]
pub enum LowerCqEntry {
    SendOk {
        ctx: u64,
    },
    SendErr {
        ctx: u64,
        err: LowerError,
    },
    /// A datagram landed in the posted buffer identified by `ctx`.
    Recv {
        ctx: u64,
        bytes: Vec<u8>,
        src: Option<PeerAddr>,
    },
}

/// A lower endpoint: posts sends and receive buffers, reports completions.
pub trait LowerEndpoint {
    /// Posts one datagram assembled from `frames` (gather list). `desc`
    /// carries the registration descriptor per frame where required.
    fn send(
        &mut self,
        frames: &[&[u8]],
        desc: &[Option<MrDesc>],
        dest: PeerAddr,
        ctx: u64,
        flags: SendFlags,
    ) -> Result<(), LowerError>;

    /// Posts one receive slot of `capacity` bytes identified by `ctx`.
    fn post_recv(&mut self, ctx: u64, capacity: usize) -> Result<(), LowerError>;

    /// Non-blocking read of the next completion.
    fn read_cq(&mut self) -> Option<LowerCqEntry>;

    /// Raw transport address of this endpoint.
    fn getname(&self) -> Vec<u8>;

    fn setname(&mut self, name: &[u8]);
}

/// Memory-registration surface of the lower domain.
pub trait Domain {
    fn mr_reg(&mut self, len: usize) -> Result<MrHandle, LowerError>;
    fn mr_close(&mut self, mr: MrHandle);
}

/// The shared-memory side channel for co-located peers. Adds the mapping
/// surface the large-message cross-process copy rides on.
pub trait ShmEndpoint: LowerEndpoint {
    /// Maps `bytes` into the shared medium, returning a token peers can
    /// read through.
    fn share(&mut self, bytes: Vec<u8>) -> u64;

    fn unshare(&mut self, token: u64);

    /// One-sided read of a shared region into `dst`.
    fn rma_read(
        &mut self,
        src: PeerAddr,
        token: u64,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<(), LowerError>;
}
