//! Logical receive entries: one per application-posted recv, unexpected
//! message, or inbound RMA operation.

use std::collections::VecDeque;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::pool::PktRef;
use crate::protocol::{MsgId, PacketFlags, PeerAddr, RmaIov, RxId, TxId};
use crate::transmit::{CqDescriptor, QueuedCtrl};

/// Operation kind of a receive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOp {
    Msg,
    Tagged,
    /// Requester-side sink for read-response data.
    ReadRsp,
    /// Target of an inbound RMA write.
    Write,
}

/// Receive state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Init,
    /// Created for an RTS with no matching posted recv.
    Unexp,
    Matched,
    /// Rendezvous data is streaming in.
    Recv,
    /// A CTS or EOR hit try-again; the progress loop retries.
    QueuedCtrl,
    /// A large shm cross-process read hit try-again.
    QueuedShmLargeRead,
}

bitflags! {
    /// Internal receive-entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RxFlags: u32 {
        /// Cancelled; further data is sunk and the user-visible
        /// completion suppressed.
        const RECV_CANCEL        = 1 << 0;
        /// Multi-recv master posted by the application.
        const MULTI_RECV_POSTED  = 1 << 1;
        /// Consumer split off a multi-recv master.
        const MULTI_RECV_CONSUMER = 1 << 2;
        /// Master removed from the expected list; freed once the last
        /// consumer completes.
        const MULTI_RECV_RELEASED = 1 << 3;
    }
}

/// Where an entry's incoming bytes land.
#[derive(Debug)]
pub enum RecvBuf {
    /// Entry owns its segments; they are handed back on completion.
    Owned(Vec<Vec<u8>>),
    /// Slice of a multi-recv master's buffer.
    Consumer { master: RxId, offset: usize },
    /// Registered-region targets of an inbound RMA write.
    Rma(SmallVec<[RmaIov; 4]>),
    /// Not yet known (unexpected entries before matching).
    None,
}

/// One transfer on the receive side.
#[derive(Debug)]
pub struct RxEntry {
    pub rx_id: RxId,
    pub op: RxOp,
    pub state: RxState,
    /// `None` for undirected receives.
    pub addr: Option<PeerAddr>,
    pub buf: RecvBuf,
    /// Filled from the matching RTS.
    pub total_len: usize,
    pub bytes_done: usize,
    /// Multi-recv master only: bytes of the buffer handed to consumers.
    pub consumed: usize,
    pub window: usize,
    /// The sender's credit ask, from the RTS.
    pub credit_request: u16,
    /// Credits granted in the last CTS.
    pub credit_cts: u16,
    pub tag: u64,
    pub ignore: u64,
    pub flags: RxFlags,
    pub cq: CqDescriptor,
    /// Retained RTS packet of an unexpected message.
    pub unexp_rts_pkt: Option<PktRef>,
    /// The sender's entry id, from RTS or READRSP.
    pub tx_id: Option<TxId>,
    pub msg_id: MsgId,
    /// Flags of the matching RTS.
    pub rts_flags: PacketFlags,
    pub queued_ctrl: Option<QueuedCtrl>,
    pub queued_pkts: VecDeque<PktRef>,
    /// Back-pointer from a consumer to its multi-recv master.
    pub master: Option<RxId>,
    /// A master's live consumers.
    pub consumers: Vec<RxId>,
    /// Shared-memory token of a large local message to read from.
    pub shm_token: Option<u64>,
}

impl RxEntry {
    /// Tag-matching hook: addr must match when directed, and the tag must
    /// agree outside the ignore mask.
    pub fn matches(&self, addr: PeerAddr, tag: u64) -> bool {
        let addr_ok = self.addr.map_or(true, |a| a == addr);
        addr_ok && (tag & !self.ignore) == (self.tag & !self.ignore)
    }

    pub fn bytes_left(&self) -> usize {
        self.total_len - self.bytes_done
    }

    pub fn cancelled(&self) -> bool {
        self.flags.contains(RxFlags::RECV_CANCEL)
    }
}
