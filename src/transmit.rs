//! Logical transmit entries: one per application-initiated send, write,
//! or read request, plus the read-response entries the responder side
//! allocates.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::iovec::IovCursor;
use crate::lower::{MrDesc, MrHandle, SendFlags};
use crate::pool::PktRef;
use crate::protocol::{MsgId, PacketType, PeerAddr, RmaIov, RxId, TxId};
use crate::CompletionFlags;

/// Operation kind of a transmit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOp {
    Msg,
    Tagged,
    Write,
    ReadReq,
    /// Responder-side entry streaming a read response.
    ReadRsp,
}

/// Transmit state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Created; the RTS (or READRSP) has not been accepted by the lower
    /// transport yet.
    Rts,
    /// A control packet hit try-again; the progress loop retries.
    QueuedCtrl,
    /// The RTS send completed with receiver-not-ready.
    QueuedRtsRnr,
    /// A DATA packet completed with receiver-not-ready; the packet sits
    /// on this entry's own queue.
    QueuedDataRnr,
    /// An shm-side RMA post hit try-again.
    QueuedShmRma,
    /// An shm-side RMA is in flight.
    ShmRma,
    /// Streaming DATA under the granted window.
    Send,
    /// Waiting for the peer's EOR to release this entry.
    WaitReadFinish,
}

/// Distinguishes app transmit entries from the read-response pool, whose
/// ids form an independent namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxHandle {
    App(TxId),
    ReadRsp(TxId),
}

impl TxHandle {
    pub fn id(&self) -> TxId {
        match self {
            TxHandle::App(id) | TxHandle::ReadRsp(id) => *id,
        }
    }
}

/// A control packet deferred on try-again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedCtrl {
    pub pkt_type: PacketType,
    pub inject: bool,
}

/// Completion descriptor accumulated while a transfer progresses.
#[derive(Debug, Clone, Default)]
pub struct CqDescriptor {
    pub context: u64,
    pub flags: CompletionFlags,
    pub data: u64,
    pub tag: u64,
    pub len: usize,
}

/// One application-initiated transfer on the send side.
#[derive(Debug)]
pub struct TxEntry {
    pub tx_id: TxId,
    pub op: TxOp,
    pub state: TxState,
    pub addr: PeerAddr,
    /// User IO segments.
    pub segments: Vec<Vec<u8>>,
    /// Application-provided registration descriptors, per segment.
    pub desc: Vec<Option<MrDesc>>,
    /// On-demand registrations, populated lazily post-RTS.
    pub mr: Vec<Option<MrHandle>>,
    pub cursor: IovCursor,
    /// First segment considered for on-demand registration.
    pub iov_mr_start: usize,
    pub total_len: usize,
    pub bytes_sent: usize,
    pub bytes_acked: usize,
    /// Bytes the receiver has granted and we have not yet sent.
    pub window: usize,
    pub credit_request: u16,
    pub tag: u64,
    pub msg_id: MsgId,
    /// The peer's receive entry, learned from CTS (or from the read RTS
    /// for read responses).
    pub rx_id: Option<RxId>,
    pub cq: CqDescriptor,
    pub cq_data: Option<u64>,
    pub send_flags: SendFlags,
    pub queued_ctrl: Option<QueuedCtrl>,
    /// Packets bounced by receiver-not-ready, waiting to be flushed.
    pub queued_pkts: VecDeque<PktRef>,
    /// Target iov for write and read requests.
    pub rma_iov: SmallVec<[RmaIov; 4]>,
    /// Shared-memory mapping token for large local transfers.
    pub shm_token: Option<u64>,
}

impl TxEntry {
    pub fn bytes_left(&self) -> usize {
        self.total_len - self.bytes_sent
    }

    pub fn is_tagged(&self) -> bool {
        self.op == TxOp::Tagged
    }
}
