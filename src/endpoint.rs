//! The reliable endpoint: pools, peer directory, transfer state machines,
//! credit and window computation, matching, and packet dispatch.
//!
//! All state lives behind `&mut self`; the endpoint is the lock domain.
//! Callers serialise application threads and the progress driver with one
//! coarse mutex around the whole object.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Error;
use crate::iovec::{self, IovCursor};
use crate::lower::{Domain, LowerEndpoint, LowerError, MrDesc, SendFlags, ShmEndpoint};
use crate::peer::{ConnState, PeerDirectory};
use crate::pool::{EntryPool, EntryRef, PacketId, PacketPool, PktRef, PoolKind};
use crate::protocol::{
    self, CtsHdr, EorHdr, MsgId, PacketFlags, PacketType, PeerAddr, ReadRspHdr, RmaIov,
    RtsHdr, RxId, TxId, CTS_HDR_SIZE, DATA_HDR_SIZE, EOR_HDR_SIZE, READRSP_HDR_SIZE, RTS_HDR_SIZE,
};
use crate::receive::{RecvBuf, RxEntry, RxFlags, RxOp, RxState};
use crate::transmit::{CqDescriptor, QueuedCtrl, TxEntry, TxHandle, TxOp, TxState};
use crate::{Completion, CompletionError, CompletionFlags, CqEvent};

/// One application send, write, or tagged send.
pub struct SendRequest {
    pub addr: PeerAddr,
    pub segments: Vec<Vec<u8>>,
    pub desc: Vec<Option<MrDesc>>,
    pub op: TxOp,
    pub tag: u64,
    pub cq_data: Option<u64>,
    pub context: u64,
    pub rma_iov: SmallVec<[RmaIov; 4]>,
}

impl SendRequest {
    pub fn msg(addr: PeerAddr, segments: Vec<Vec<u8>>, context: u64) -> Self {
        Self {
            addr,
            segments,
            desc: Vec::new(),
            op: TxOp::Msg,
            tag: 0,
            cq_data: None,
            context,
            rma_iov: SmallVec::new(),
        }
    }

    pub fn tagged(addr: PeerAddr, segments: Vec<Vec<u8>>, tag: u64, context: u64) -> Self {
        Self {
            op: TxOp::Tagged,
            tag,
            ..Self::msg(addr, segments, context)
        }
    }

    pub fn write(
        addr: PeerAddr,
        segments: Vec<Vec<u8>>,
        rma_iov: SmallVec<[RmaIov; 4]>,
        context: u64,
    ) -> Self {
        Self {
            op: TxOp::Write,
            rma_iov,
            ..Self::msg(addr, segments, context)
        }
    }
}

/// One application-posted receive.
pub struct RecvRequest {
    pub segments: Vec<Vec<u8>>,
    /// `None` accepts any source.
    pub addr: Option<PeerAddr>,
    pub tagged: bool,
    pub tag: u64,
    pub ignore: u64,
    pub context: u64,
    pub multi_recv: bool,
}

impl RecvRequest {
    pub fn msg(segments: Vec<Vec<u8>>, context: u64) -> Self {
        Self {
            segments,
            addr: None,
            tagged: false,
            tag: 0,
            ignore: 0,
            context,
            multi_recv: false,
        }
    }

    pub fn tagged(segments: Vec<Vec<u8>>, tag: u64, ignore: u64, context: u64) -> Self {
        Self {
            tagged: true,
            tag,
            ignore,
            ..Self::msg(segments, context)
        }
    }

    pub fn multi(segments: Vec<Vec<u8>>, context: u64) -> Self {
        Self {
            multi_recv: true,
            ..Self::msg(segments, context)
        }
    }
}

/// One application read request.
pub struct ReadRequest {
    pub addr: PeerAddr,
    pub rma_iov: SmallVec<[RmaIov; 4]>,
    /// Local sink for the read data.
    pub segments: Vec<Vec<u8>>,
    pub context: u64,
}

/// Reliable two-sided messaging and one-sided RMA endpoint over an
/// unreliable datagram fabric.
pub struct Endpoint {
    pub(crate) cfg: Config,
    pub(crate) mtu: usize,
    pub(crate) max_data_payload_size: usize,
    pub(crate) min_multi_recv_size: usize,
    pub(crate) max_outstanding_tx: usize,
    pub(crate) tx_pending: usize,

    pub(crate) fabric: Box<dyn LowerEndpoint>,
    pub(crate) shm: Option<Box<dyn ShmEndpoint>>,
    pub(crate) domain: Box<dyn Domain>,
    core_addr: Vec<u8>,

    pub(crate) tx_pkt_fabric: PacketPool,
    pub(crate) rx_pkt_fabric: PacketPool,
    pub(crate) tx_pkt_shm: Option<PacketPool>,
    pub(crate) rx_pkt_shm: Option<PacketPool>,
    rx_unexp_pkt: Option<PacketPool>,
    rx_ooo_pkt: Option<PacketPool>,

    pub(crate) tx_entries: EntryPool<TxEntry>,
    pub(crate) rx_entries: EntryPool<RxEntry>,
    pub(crate) readrsp_tx_entries: EntryPool<TxEntry>,

    pub(crate) peers: PeerDirectory,

    pub(crate) rx_list: VecDeque<RxId>,
    pub(crate) rx_tagged_list: VecDeque<RxId>,
    pub(crate) rx_unexp_list: VecDeque<RxId>,
    pub(crate) rx_unexp_tagged_list: VecDeque<RxId>,
    pub(crate) rx_entry_queued: VecDeque<RxId>,
    pub(crate) tx_entry_queued: VecDeque<TxHandle>,
    pub(crate) tx_pending_list: VecDeque<TxHandle>,
    pub(crate) peer_backoff_list: Vec<PeerAddr>,
    pub(crate) pending_connacks: VecDeque<PeerAddr>,

    pub(crate) posted_bufs_fabric: usize,
    pub(crate) posted_bufs_shm: usize,
    pub(crate) rx_bufs_fabric_to_post: usize,
    pub(crate) rx_bufs_shm_to_post: usize,
    pub(crate) available_data_bufs: usize,
    pub(crate) available_data_bufs_ts: Option<Instant>,

    registered: HashMap<u64, Vec<u8>>,
    /// Maps shm-side source handles back to fabric peer handles.
    pub(crate) shm_addr_map: HashMap<u64, PeerAddr>,
    cq: VecDeque<CqEvent>,
}

impl Endpoint {
    pub fn new(
        cfg: Config,
        fabric: Box<dyn LowerEndpoint>,
        shm: Option<Box<dyn ShmEndpoint>>,
        mut domain: Box<dyn Domain>,
    ) -> Result<Self, Error> {
        let mtu = cfg.mtu_size;
        let shm_on = cfg.enable_shm_transfer && shm.is_some();
        let mr = cfg.mr_local;

        let tx_pkt_fabric = PacketPool::new(
            cfg.tx_pkt_count,
            mtu,
            if mr { Some(domain.as_mut()) } else { None },
        )?;
        let rx_pkt_fabric = PacketPool::new(
            cfg.rx_pkt_count,
            mtu,
            if mr { Some(domain.as_mut()) } else { None },
        )?;
        let (tx_pkt_shm, rx_pkt_shm) = if shm_on {
            (
                Some(PacketPool::new(cfg.shm_tx_pkt_count, mtu, None)?),
                Some(PacketPool::new(cfg.shm_rx_pkt_count, mtu, None)?),
            )
        } else {
            (None, None)
        };
        let rx_unexp_pkt = if cfg.rx_copy_unexp {
            Some(PacketPool::new(cfg.rx_pkt_count, mtu, None)?)
        } else {
            None
        };
        let rx_ooo_pkt = if cfg.rx_copy_ooo {
            Some(PacketPool::new(cfg.recvwin_size.min(cfg.rx_pkt_count), mtu, None)?)
        } else {
            None
        };

        let mut max_outstanding_tx = cfg.max_outstanding_tx;
        if cfg.tx_queue_size > 0 && cfg.tx_queue_size < max_outstanding_tx {
            max_outstanding_tx = cfg.tx_queue_size;
        }

        Ok(Self {
            mtu,
            max_data_payload_size: mtu - DATA_HDR_SIZE,
            min_multi_recv_size: mtu - RTS_HDR_SIZE,
            max_outstanding_tx,
            tx_pending: 0,
            fabric,
            shm: if shm_on { shm } else { None },
            domain,
            core_addr: Vec::new(),
            tx_pkt_fabric,
            rx_pkt_fabric,
            tx_pkt_shm,
            rx_pkt_shm,
            rx_unexp_pkt,
            rx_ooo_pkt,
            tx_entries: EntryPool::new(cfg.tx_size),
            rx_entries: EntryPool::new(cfg.rx_size),
            readrsp_tx_entries: EntryPool::new(cfg.rx_size),
            peers: PeerDirectory::default(),
            rx_list: VecDeque::new(),
            rx_tagged_list: VecDeque::new(),
            rx_unexp_list: VecDeque::new(),
            rx_unexp_tagged_list: VecDeque::new(),
            rx_entry_queued: VecDeque::new(),
            tx_entry_queued: VecDeque::new(),
            tx_pending_list: VecDeque::new(),
            peer_backoff_list: Vec::new(),
            pending_connacks: VecDeque::new(),
            posted_bufs_fabric: 0,
            posted_bufs_shm: 0,
            rx_bufs_fabric_to_post: 0,
            rx_bufs_shm_to_post: 0,
            available_data_bufs: 0,
            available_data_bufs_ts: None,
            registered: HashMap::new(),
            shm_addr_map: HashMap::new(),
            cq: VecDeque::new(),
            cfg,
        })
    }

    /// Brings the endpoint up: learns the core address, names the shm side
    /// after it, and fills both receive rings.
    pub fn enable(&mut self) -> Result<(), Error> {
        self.core_addr = self.fabric.getname();
        if let Some(shm) = self.shm.as_mut() {
            let name = self.core_addr.clone();
            shm.setname(&name);
        }
        self.rx_bufs_fabric_to_post = self.rx_pkt_fabric.capacity();
        if let Some(pool) = self.rx_pkt_shm.as_ref() {
            self.rx_bufs_shm_to_post = pool.capacity();
        }
        self.bulk_post_recv();
        self.available_data_bufs = self.rx_pkt_fabric.capacity();
        Ok(())
    }

    /// Sizes the peer directory after address-vector binding.
    pub fn bind_av(&mut self, av_count: usize) {
        self.peers.bind(av_count);
    }

    /// Marks a peer co-located and reachable over shared memory.
    pub fn set_local_peer(&mut self, addr: PeerAddr, shm_addr: PeerAddr) {
        if self.shm.is_none() {
            return;
        }
        let peer = self.peers.get(addr);
        peer.is_local = true;
        peer.shm_addr = Some(shm_addr);
        self.shm_addr_map.insert(shm_addr.0, addr);
    }

    pub fn core_addr(&self) -> &[u8] {
        &self.core_addr
    }

    pub fn min_multi_recv(&self) -> usize {
        self.min_multi_recv_size
    }

    pub fn set_min_multi_recv(&mut self, size: usize) {
        self.min_multi_recv_size = size;
    }

    pub fn available_data_bufs(&self) -> usize {
        self.available_data_bufs
    }

    pub fn outstanding_tx(&self) -> usize {
        self.tx_pending
    }

    /// Registers a target region for inbound RMA.
    pub fn register_region(&mut self, key: u64, bytes: Vec<u8>) {
        self.registered.insert(key, bytes);
    }

    pub fn unregister_region(&mut self, key: u64) -> Option<Vec<u8>> {
        self.registered.remove(&key)
    }

    pub fn region(&self, key: u64) -> Option<&[u8]> {
        self.registered.get(&key).map(|v| v.as_slice())
    }

    pub(crate) fn region_mut(&mut self, key: u64) -> Option<&mut Vec<u8>> {
        self.registered.get_mut(&key)
    }

    pub fn poll_cq(&mut self) -> Option<CqEvent> {
        self.cq.pop_front()
    }

    pub(crate) fn push_completion(&mut self, c: Completion) {
        if self.cq.len() >= self.cfg.cq_size {
            warn!("completion queue overrun, dropping oldest event");
            self.cq.pop_front();
        }
        self.cq.push_back(CqEvent::Complete(c));
    }

    pub(crate) fn push_error(&mut self, e: CompletionError) {
        self.cq.push_back(CqEvent::Error(e));
    }

    // ---- entry accessors -------------------------------------------------

    pub(crate) fn tx_entry(&self, th: TxHandle) -> Option<&TxEntry> {
        match th {
            TxHandle::App(id) => self.tx_entries.get(id.0),
            TxHandle::ReadRsp(id) => self.readrsp_tx_entries.get(id.0),
        }
    }

    pub(crate) fn tx_entry_mut(&mut self, th: TxHandle) -> Option<&mut TxEntry> {
        match th {
            TxHandle::App(id) => self.tx_entries.get_mut(id.0),
            TxHandle::ReadRsp(id) => self.readrsp_tx_entries.get_mut(id.0),
        }
    }

    fn remove_tx_entry(&mut self, th: TxHandle) -> Option<TxEntry> {
        match th {
            TxHandle::App(id) => self.tx_entries.remove(id.0),
            TxHandle::ReadRsp(id) => self.readrsp_tx_entries.remove(id.0),
        }
    }

    fn entry_ref(th: TxHandle) -> EntryRef {
        match th {
            TxHandle::App(id) => EntryRef::Tx(id),
            TxHandle::ReadRsp(id) => EntryRef::ReadRsp(id),
        }
    }

    fn tx_handle(r: EntryRef) -> Option<TxHandle> {
        match r {
            EntryRef::Tx(id) => Some(TxHandle::App(id)),
            EntryRef::ReadRsp(id) => Some(TxHandle::ReadRsp(id)),
            EntryRef::Rx(_) => None,
        }
    }

    // ---- packet pool plumbing -------------------------------------------

    pub(crate) fn pkt_pool(&self, kind: PoolKind) -> &PacketPool {
        match kind {
            PoolKind::TxFabric => &self.tx_pkt_fabric,
            PoolKind::RxFabric => &self.rx_pkt_fabric,
            PoolKind::TxShm => self.tx_pkt_shm.as_ref().expect("shm tx pool"),
            PoolKind::RxShm => self.rx_pkt_shm.as_ref().expect("shm rx pool"),
            PoolKind::UnexpCopy => self.rx_unexp_pkt.as_ref().expect("unexp pool"),
            PoolKind::OooCopy => self.rx_ooo_pkt.as_ref().expect("ooo pool"),
        }
    }

    pub(crate) fn pkt_pool_mut(&mut self, kind: PoolKind) -> &mut PacketPool {
        match kind {
            PoolKind::TxFabric => &mut self.tx_pkt_fabric,
            PoolKind::RxFabric => &mut self.rx_pkt_fabric,
            PoolKind::TxShm => self.tx_pkt_shm.as_mut().expect("shm tx pool"),
            PoolKind::RxShm => self.rx_pkt_shm.as_mut().expect("shm rx pool"),
            PoolKind::UnexpCopy => self.rx_unexp_pkt.as_mut().expect("unexp pool"),
            PoolKind::OooCopy => self.rx_ooo_pkt.as_mut().expect("ooo pool"),
        }
    }

    pub(crate) fn release_pkt(&mut self, pkt: PktRef) {
        self.pkt_pool_mut(pkt.pool).release(pkt.id);
    }

    pub(crate) fn pkt_ctx(pkt: PktRef) -> u64 {
        let tag: u64 = match pkt.pool {
            PoolKind::TxFabric => 0,
            PoolKind::RxFabric => 1,
            PoolKind::TxShm => 2,
            PoolKind::RxShm => 3,
            PoolKind::UnexpCopy => 4,
            PoolKind::OooCopy => 5,
        };
        (tag << 32) | pkt.id.0 as u64
    }

    pub(crate) fn pkt_from_ctx(ctx: u64) -> PktRef {
        let pool = match ctx >> 32 {
            0 => PoolKind::TxFabric,
            1 => PoolKind::RxFabric,
            2 => PoolKind::TxShm,
            3 => PoolKind::RxShm,
            4 => PoolKind::UnexpCopy,
            _ => PoolKind::OooCopy,
        };
        PktRef {
            pool,
            id: PacketId(ctx as u32),
        }
    }

    /// Copies a packet into another pool, releasing the source. Falls back
    /// to the original on exhaustion.
    pub(crate) fn copy_pkt(&mut self, src: PktRef, dst_pool: PoolKind) -> PktRef {
        let dst_id = match self.pkt_pool_mut(dst_pool).acquire() {
            Some(id) => id,
            None => {
                warn!("copy pool exhausted, retaining posted buffer");
                return src;
            }
        };
        let (bytes, peer, owner) = {
            let s = self.pkt_pool(src.pool).get(src.id);
            (s.bytes().to_vec(), s.peer, s.owner)
        };
        {
            let d = self.pkt_pool_mut(dst_pool).get_mut(dst_id);
            d.buf[..bytes.len()].copy_from_slice(&bytes);
            d.pkt_size = bytes.len();
            d.peer = peer;
            d.owner = owner;
        }
        self.release_pkt(src);
        PktRef {
            pool: dst_pool,
            id: dst_id,
        }
    }

    // ---- allocation ------------------------------------------------------

    fn alloc_tx_entry(&mut self, req: SendRequest) -> Option<TxId> {
        let total_len = iovec::total_len(&req.segments);
        let nseg = req.segments.len();
        let mut desc = req.desc;
        desc.resize(nseg, None);
        let cq_flags = match req.op {
            TxOp::Tagged => CompletionFlags::TRANSMIT | CompletionFlags::MSG | CompletionFlags::TAGGED,
            TxOp::Msg => CompletionFlags::TRANSMIT | CompletionFlags::MSG,
            TxOp::Write => CompletionFlags::RMA | CompletionFlags::WRITE,
            TxOp::ReadReq => CompletionFlags::RMA | CompletionFlags::READ,
            TxOp::ReadRsp => CompletionFlags::REMOTE_READ | CompletionFlags::RMA,
        };
        let id = self.tx_entries.insert_with(|id| TxEntry {
            tx_id: TxId(id),
            op: req.op,
            state: TxState::Rts,
            addr: req.addr,
            segments: req.segments,
            desc,
            mr: vec![None; nseg],
            cursor: IovCursor::default(),
            iov_mr_start: 0,
            total_len,
            bytes_sent: 0,
            bytes_acked: 0,
            window: 0,
            credit_request: 0,
            tag: req.tag,
            msg_id: MsgId(0),
            rx_id: None,
            cq: CqDescriptor {
                context: req.context,
                flags: cq_flags,
                data: req.cq_data.unwrap_or(0),
                tag: req.tag,
                len: total_len,
            },
            cq_data: req.cq_data,
            send_flags: SendFlags::empty(),
            queued_ctrl: None,
            queued_pkts: VecDeque::new(),
            rma_iov: req.rma_iov,
            shm_token: None,
        })?;
        Some(TxId(id))
    }

    pub(crate) fn alloc_rx_entry(
        &mut self,
        buf: RecvBuf,
        addr: Option<PeerAddr>,
        op: RxOp,
        tag: u64,
        ignore: u64,
        context: u64,
    ) -> Option<RxId> {
        let capacity = match &buf {
            RecvBuf::Owned(segs) => iovec::total_len(segs),
            RecvBuf::Rma(iov) => iov.iter().map(|s| s.len as usize).sum(),
            _ => 0,
        };
        let (cq_flags, cq_tag, ignore) = match op {
            RxOp::Tagged => (
                CompletionFlags::RECV | CompletionFlags::MSG | CompletionFlags::TAGGED,
                tag,
                ignore,
            ),
            // Non-tagged receives match any tag.
            RxOp::Msg => (CompletionFlags::RECV | CompletionFlags::MSG, 0, !0),
            RxOp::ReadRsp => (CompletionFlags::RMA | CompletionFlags::READ, 0, !0),
            RxOp::Write => (CompletionFlags::REMOTE_WRITE | CompletionFlags::RMA, 0, !0),
        };
        let id = self.rx_entries.insert_with(|id| RxEntry {
            rx_id: RxId(id),
            op,
            state: RxState::Init,
            addr,
            buf,
            total_len: 0,
            bytes_done: 0,
            consumed: 0,
            window: 0,
            credit_request: 0,
            credit_cts: 0,
            tag,
            ignore,
            flags: RxFlags::empty(),
            cq: CqDescriptor {
                context,
                flags: cq_flags,
                data: 0,
                tag: cq_tag,
                len: capacity,
            },
            unexp_rts_pkt: None,
            tx_id: None,
            msg_id: MsgId(0),
            rts_flags: PacketFlags::empty(),
            queued_ctrl: None,
            queued_pkts: VecDeque::new(),
            master: None,
            consumers: Vec::new(),
            shm_token: None,
        })?;
        Some(RxId(id))
    }

    // ---- credits ---------------------------------------------------------

    /// Carves a credit request out of the per-peer budget for a new send.
    fn set_tx_credit_request(&mut self, tx_id: TxId) -> Result<(), Error> {
        let (addr, total_len) = {
            let e = self.tx_entries.get(tx_id.0).ok_or(Error::UnknownEntry(tx_id.0))?;
            (e.addr, e.total_len)
        };
        let max_payload = self.max_data_payload_size;
        let (tx_max, tx_min) = (self.cfg.tx_max_credits, self.cfg.tx_min_credits);
        let peer = self.peers.get(addr);
        if !peer.tx_init {
            peer.tx_credits = tx_max;
            peer.tx_init = true;
        }
        // Divvy available credits among outstanding transfers, capped by
        // what this message actually needs.
        let pending = peer.tx_pending as u64 + 1;
        let mut request = div_ceil(peer.tx_credits as u64, pending)
            .min(div_ceil(total_len as u64, max_payload as u64));
        request = request.max(tx_min as u64);
        if peer.tx_credits as u64 >= request {
            peer.tx_credits -= request as u32;
        }
        if request == 0 {
            return Err(Error::Again);
        }
        if let Some(e) = self.tx_entries.get_mut(tx_id.0) {
            e.credit_request = request.min(u16::MAX as u64) as u16;
        }
        Ok(())
    }

    /// Derives the byte window and credit count for a CTS, rationing the
    /// per-peer allowance as the address vector grows.
    fn calc_cts_window_credits(
        &mut self,
        addr: PeerAddr,
        size: usize,
        request: u16,
    ) -> (u64, u16) {
        let num_peers = self.peers.av_used().saturating_sub(1);
        let max_payload = self.max_data_payload_size as u64;
        let avail = self.available_data_bufs;
        let posted = self.posted_bufs_fabric;
        let (win_sz, tx_min) = (self.cfg.rx_window_size, self.cfg.tx_min_credits);

        let peer = self.peers.get(addr);
        if !peer.rx_init {
            peer.rx_credits = win_sz;
            peer.rx_init = true;
        }
        if num_peers > 0 && div_ceil(win_sz as u64, num_peers as u64) < peer.rx_credits as u64 {
            peer.rx_credits = div_ceil(peer.rx_credits as u64, num_peers as u64) as u32;
        }

        let mut credits = avail.min(posted).min(peer.rx_credits as usize);
        credits = credits.min(request as usize);
        credits = credits.max(tx_min as usize);

        let window = (size as u64).min(credits as u64 * max_payload);
        let used = div_ceil(window, max_payload);
        if peer.rx_credits as u64 > used {
            peer.rx_credits -= used as u32;
        }

        // Clamp the accounted grant to the remaining shared budget.
        let credit_cts = credits.min(avail).min(u16::MAX as usize) as u16;
        (window, credit_cts)
    }

    // ---- application send path ------------------------------------------

    /// Initiates a send, tagged send, or RMA write. Retryable errors mean
    /// the transfer was not accepted; nothing is queued.
    pub fn post_send(&mut self, req: SendRequest, now: Instant) -> Result<TxId, Error> {
        debug_assert!(matches!(req.op, TxOp::Msg | TxOp::Tagged | TxOp::Write));
        if self.peers.get(req.addr).in_backoff() {
            return Err(Error::PeerBackoff);
        }
        let addr = req.addr;
        let op = req.op;
        let tx_id = self.alloc_tx_entry(req).ok_or(Error::Again)?;
        if let Err(e) = self.set_tx_credit_request(tx_id) {
            self.tx_entries.remove(tx_id.0);
            return Err(e);
        }
        // Message sequence is assigned once the send is accepted.
        if self.cfg.in_order_delivery {
            let peer = self.peers.get(addr);
            let msg_id = peer.next_msg_id;
            peer.next_msg_id = peer.next_msg_id.wrapping_add(1);
            if let Some(e) = self.tx_entries.get_mut(tx_id.0) {
                e.msg_id = msg_id;
            }
        }
        let local = self.peer_is_local(addr);
        if local && op == TxOp::Write {
            // Local one-sided ops ride the shm RMA path.
            if let Some(e) = self.tx_entries.get_mut(tx_id.0) {
                e.state = TxState::ShmRma;
            }
            self.post_shm_rma(TxHandle::App(tx_id), now)?;
        } else {
            self.post_ctrl_or_queue(EntryRef::Tx(tx_id), PacketType::Rts, false, now)?;
        }
        Ok(tx_id)
    }

    /// Initiates an RMA read: the peer streams the named regions back into
    /// `segments`. One completion is delivered, from the receive side.
    pub fn post_read(&mut self, req: ReadRequest, now: Instant) -> Result<TxId, Error> {
        if self.peers.get(req.addr).in_backoff() {
            return Err(Error::PeerBackoff);
        }
        let total: usize = req.rma_iov.iter().map(|s| s.len as usize).sum();
        let rx_id = self
            .alloc_rx_entry(
                RecvBuf::Owned(req.segments),
                Some(req.addr),
                RxOp::ReadRsp,
                0,
                0,
                req.context,
            )
            .ok_or(Error::Again)?;
        let (window, credits) = {
            let request = div_ceil(total as u64, self.max_data_payload_size as u64)
                .min(u16::MAX as u64) as u16;
            self.calc_cts_window_credits(req.addr, total, request)
        };
        {
            let e = self.rx_entries.get_mut(rx_id.0).unwrap();
            e.total_len = total;
            e.cq.len = total;
            e.window = window as usize;
            e.credit_cts = credits;
            e.state = RxState::Recv;
        }
        let send = SendRequest {
            addr: req.addr,
            segments: Vec::new(),
            desc: Vec::new(),
            op: TxOp::ReadReq,
            tag: 0,
            cq_data: None,
            context: req.context,
            rma_iov: req.rma_iov,
        };
        let tx_id = match self.alloc_tx_entry(send) {
            Some(id) => id,
            None => {
                self.rx_entries.remove(rx_id.0);
                return Err(Error::Again);
            }
        };
        {
            let e = self.tx_entries.get_mut(tx_id.0).unwrap();
            e.total_len = total;
            e.rx_id = Some(rx_id);
            e.credit_request = credits;
        }
        if let Some(r) = self.rx_entries.get_mut(rx_id.0) {
            r.tx_id = Some(tx_id);
        }
        let local = self.peer_is_local(req.addr);
        if local {
            if let Some(e) = self.tx_entries.get_mut(tx_id.0) {
                e.state = TxState::ShmRma;
            }
            self.post_shm_rma(TxHandle::App(tx_id), now)?;
        } else {
            self.post_ctrl_or_queue(EntryRef::Tx(tx_id), PacketType::Rts, false, now)?;
        }
        Ok(tx_id)
    }

    fn peer_is_local(&mut self, addr: PeerAddr) -> bool {
        self.shm.is_some() && self.peers.get(addr).is_local
    }

    /// Publishes a transfer's payload into the shared medium and records
    /// the token for teardown.
    fn share_segments(&mut self, th: TxHandle, total_len: usize) -> u64 {
        let blob = {
            let e = self.tx_entry(th).unwrap();
            let mut b = vec![0u8; total_len];
            iovec::copy_from_iov(&mut b, &e.segments, 0);
            b
        };
        let token = self.shm.as_mut().expect("shm endpoint").share(blob);
        if let Some(e) = self.tx_entry_mut(th) {
            e.shm_token = Some(token);
        }
        token
    }

    /// Posts a local RMA operation over the shm channel, queueing it on
    /// try-again.
    pub(crate) fn post_shm_rma(&mut self, th: TxHandle, now: Instant) -> Result<(), Error> {
        match self.post_ctrl(Self::entry_ref(th), PacketType::Rts, false, now) {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                if let Some(entry) = self.tx_entry_mut(th) {
                    entry.state = TxState::QueuedShmRma;
                    entry.queued_ctrl = Some(QueuedCtrl {
                        pkt_type: PacketType::Rts,
                        inject: false,
                    });
                }
                if !self.tx_entry_queued.contains(&th) {
                    self.tx_entry_queued.push_back(th);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ---- application receive path ---------------------------------------

    /// Posts a receive. Matches the unexpected lists first; otherwise the
    /// entry joins the expected list for its kind.
    pub fn post_recv(&mut self, req: RecvRequest, now: Instant) -> Result<RxId, Error> {
        let op = if req.tagged { RxOp::Tagged } else { RxOp::Msg };
        let rx_id = self
            .alloc_rx_entry(
                RecvBuf::Owned(req.segments),
                req.addr,
                op,
                req.tag,
                req.ignore,
                req.context,
            )
            .ok_or(Error::Again)?;
        if req.multi_recv {
            if let Some(e) = self.rx_entries.get_mut(rx_id.0) {
                e.flags |= RxFlags::MULTI_RECV_POSTED;
            }
        }

        // Drain matching unexpected arrivals, oldest first.
        loop {
            let unexp_id = self.find_unexpected_match(rx_id, req.tagged);
            let Some(unexp_id) = unexp_id else { break };
            let pkt = {
                let u = self.rx_entries.get_mut(unexp_id.0).unwrap();
                u.unexp_rts_pkt.take()
            };
            let Some(pkt) = pkt else {
                self.release_rx_entry(unexp_id);
                continue;
            };
            let multi = self
                .rx_entries
                .get(rx_id.0)
                .map_or(false, |e| e.flags.contains(RxFlags::MULTI_RECV_POSTED));
            if multi {
                match self.split_rx_entry(rx_id, pkt) {
                    Some(consumer) => {
                        self.release_rx_entry(unexp_id);
                        let exhausted = self.multi_recv_exhausted(rx_id);
                        if exhausted {
                            self.release_multi_recv_master(rx_id, now);
                        }
                        self.proc_matched_rts(consumer, pkt, now);
                        if exhausted {
                            return Ok(rx_id);
                        }
                    }
                    None => {
                        // Consumer pool exhausted: leave the message
                        // unexpected for a later post.
                        if let Some(u) = self.rx_entries.get_mut(unexp_id.0) {
                            u.unexp_rts_pkt = Some(pkt);
                        }
                        break;
                    }
                }
            } else {
                self.release_rx_entry(unexp_id);
                self.proc_matched_rts(rx_id, pkt, now);
                return Ok(rx_id);
            }
        }

        let list = if req.tagged {
            &mut self.rx_tagged_list
        } else {
            &mut self.rx_list
        };
        list.push_back(rx_id);
        Ok(rx_id)
    }

    /// First unexpected entry the posted entry matches, if any. For a
    /// multi-recv master, only messages that still fit are taken.
    fn find_unexpected_match(&self, rx_id: RxId, tagged: bool) -> Option<RxId> {
        let posted = self.rx_entries.get(rx_id.0)?;
        let list = if tagged {
            &self.rx_unexp_tagged_list
        } else {
            &self.rx_unexp_list
        };
        let multi = posted.flags.contains(RxFlags::MULTI_RECV_POSTED);
        let remaining = self.multi_recv_remaining(posted);
        for &id in list {
            let Some(u) = self.rx_entries.get(id.0) else {
                continue;
            };
            let Some(addr) = u.addr else { continue };
            if !posted.matches(addr, u.tag) {
                continue;
            }
            if multi && u.total_len > remaining {
                continue;
            }
            return Some(id);
        }
        None
    }

    pub(crate) fn multi_recv_remaining(&self, master: &RxEntry) -> usize {
        match &master.buf {
            RecvBuf::Owned(segs) => iovec::total_len(segs) - master.consumed,
            _ => 0,
        }
    }

    pub(crate) fn multi_recv_exhausted(&self, master_id: RxId) -> bool {
        self.rx_entries
            .get(master_id.0)
            .map_or(false, |m| self.multi_recv_remaining(m) < self.min_multi_recv_size)
    }

    /// Splits a consumer entry off a multi-recv master for one incoming
    /// message. The master's cursor advances by the consumed length.
    pub(crate) fn split_rx_entry(&mut self, master_id: RxId, pkt: PktRef) -> Option<RxId> {
        let hdr = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            RtsHdr::decode(p.bytes()).ok()?
        };
        let (offset, consumed_len, context) = {
            let m = self.rx_entries.get(master_id.0)?;
            let remaining = self.multi_recv_remaining(m);
            (
                m.consumed,
                remaining.min(hdr.data_len as usize),
                m.cq.context,
            )
        };
        let consumer = self.alloc_rx_entry(
            RecvBuf::Consumer {
                master: master_id,
                offset,
            },
            None,
            RxOp::Msg,
            hdr.tag,
            !0,
            context,
        )?;
        {
            let c = self.rx_entries.get_mut(consumer.0).unwrap();
            c.flags |= RxFlags::MULTI_RECV_CONSUMER;
            c.master = Some(master_id);
            c.cq.len = consumed_len;
        }
        let m = self.rx_entries.get_mut(master_id.0).unwrap();
        m.consumed += consumed_len;
        m.consumers.push(consumer);
        debug!(
            "split multi_recv consumer {} from master {}",
            consumer, master_id
        );
        Some(consumer)
    }

    /// Removes an exhausted master from its list; the buffer is handed
    /// back with the last consumer's completion.
    pub(crate) fn release_multi_recv_master(&mut self, master_id: RxId, _now: Instant) {
        self.rx_list.retain(|&id| id != master_id);
        self.rx_tagged_list.retain(|&id| id != master_id);
        let done = {
            let Some(m) = self.rx_entries.get_mut(master_id.0) else {
                return;
            };
            m.flags |= RxFlags::MULTI_RECV_RELEASED;
            m.consumers.is_empty()
        };
        if done {
            // Nothing in flight: surface the release on its own completion.
            let m = self.rx_entries.remove(master_id.0).unwrap();
            let buf = match m.buf {
                RecvBuf::Owned(segs) => Some(segs),
                _ => None,
            };
            if !m.flags.contains(RxFlags::RECV_CANCEL) {
                self.push_completion(Completion {
                    context: m.cq.context,
                    flags: m.cq.flags | CompletionFlags::MULTI_RECV,
                    len: 0,
                    data: 0,
                    tag: 0,
                    buf,
                });
            }
        }
    }

    /// Cancels the first posted receive whose context matches, or marks an
    /// in-flight one so its data is sunk and the completion suppressed.
    pub fn cancel(&mut self, context: u64, now: Instant) -> bool {
        for tagged in [false, true] {
            let pos = {
                let list = if tagged {
                    &self.rx_tagged_list
                } else {
                    &self.rx_list
                };
                list.iter().position(|&id| {
                    self.rx_entries
                        .get(id.0)
                        .map_or(false, |e| e.cq.context == context)
                })
            };
            if let Some(pos) = pos {
                let rx_id = if tagged {
                    self.rx_tagged_list.remove(pos)
                } else {
                    self.rx_list.remove(pos)
                }
                .unwrap();
                self.cancel_entry(rx_id, now);
                return true;
            }
        }
        // Matched but incomplete: sink further data, suppress completion.
        let live = self
            .rx_entries
            .iter()
            .find(|(_, e)| {
                e.cq.context == context
                    && !e.cancelled()
                    && matches!(e.state, RxState::Matched | RxState::Recv | RxState::QueuedCtrl)
                    && !e.flags.contains(RxFlags::MULTI_RECV_CONSUMER)
            })
            .map(|(id, _)| RxId(id));
        if let Some(rx_id) = live {
            let e = self.rx_entries.get_mut(rx_id.0).unwrap();
            e.flags |= RxFlags::RECV_CANCEL;
            let (ctx, flags, tag) = (e.cq.context, e.cq.flags, e.tag);
            self.push_error(CompletionError {
                context: ctx,
                flags,
                tag,
                err: Error::Cancelled,
                prov_errno: Error::Cancelled.prov_errno(),
            });
            return true;
        }
        false
    }

    fn cancel_entry(&mut self, rx_id: RxId, _now: Instant) {
        let Some(e) = self.rx_entries.get_mut(rx_id.0) else {
            return;
        };
        e.flags |= RxFlags::RECV_CANCEL;
        let (ctx, flags, tag, state) = (e.cq.context, e.cq.flags, e.tag, e.state);
        let multi_master = e.flags.contains(RxFlags::MULTI_RECV_POSTED);
        self.push_error(CompletionError {
            context: ctx,
            flags,
            tag,
            err: Error::Cancelled,
            prov_errno: Error::Cancelled.prov_errno(),
        });
        if multi_master {
            let has_consumers = self
                .rx_entries
                .get(rx_id.0)
                .map_or(false, |m| !m.consumers.is_empty());
            if has_consumers {
                // Consumers finish on the wire; the buffer frees with the
                // last of them.
                if let Some(m) = self.rx_entries.get_mut(rx_id.0) {
                    m.flags |= RxFlags::MULTI_RECV_RELEASED;
                }
                return;
            }
            self.rx_entries.remove(rx_id.0);
            return;
        }
        if matches!(state, RxState::Init | RxState::Unexp | RxState::Matched) {
            self.release_rx_entry(rx_id);
        }
    }

    pub(crate) fn release_rx_entry(&mut self, rx_id: RxId) {
        if let Some(e) = self.rx_entries.remove(rx_id.0) {
            if let Some(pkt) = e.unexp_rts_pkt {
                self.release_pkt(pkt);
            }
            for pkt in e.queued_pkts {
                self.release_pkt(pkt);
            }
        }
        self.rx_entry_queued.retain(|&id| id != rx_id);
    }

    // ---- control packets -------------------------------------------------

    /// Posts a control packet, falling back to the queued-retry list on a
    /// retryable failure. The progress loop re-drives it.
    pub(crate) fn post_ctrl_or_queue(
        &mut self,
        ent: EntryRef,
        ctrl: PacketType,
        inject: bool,
        now: Instant,
    ) -> Result<(), Error> {
        match self.post_ctrl(ent, ctrl, inject, now) {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                match ent {
                    EntryRef::Tx(id) | EntryRef::ReadRsp(id) => {
                        let th = Self::tx_handle(ent).unwrap();
                        if let Some(entry) = self.tx_entry_mut(th) {
                            entry.state = TxState::QueuedCtrl;
                            entry.queued_ctrl = Some(QueuedCtrl {
                                pkt_type: ctrl,
                                inject,
                            });
                        }
                        let _ = id;
                        if !self.tx_entry_queued.contains(&th) {
                            self.tx_entry_queued.push_back(th);
                        }
                    }
                    EntryRef::Rx(id) => {
                        if let Some(entry) = self.rx_entries.get_mut(id.0) {
                            entry.state = RxState::QueuedCtrl;
                            entry.queued_ctrl = Some(QueuedCtrl {
                                pkt_type: ctrl,
                                inject,
                            });
                        }
                        if !self.rx_entry_queued.contains(&id) {
                            self.rx_entry_queued.push_back(id);
                        }
                    }
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn post_ctrl(
        &mut self,
        ent: EntryRef,
        ctrl: PacketType,
        inject: bool,
        now: Instant,
    ) -> Result<(), Error> {
        let addr = match ent {
            EntryRef::Tx(id) => self.tx_entries.get(id.0).ok_or(Error::UnknownEntry(id.0))?.addr,
            EntryRef::ReadRsp(id) => {
                self.readrsp_tx_entries
                    .get(id.0)
                    .ok_or(Error::UnknownEntry(id.0))?
                    .addr
            }
            EntryRef::Rx(id) => self
                .rx_entries
                .get(id.0)
                .and_then(|e| e.addr)
                .ok_or(Error::UnknownEntry(id.0))?,
        };
        let local = self.peer_is_local(addr);
        let pool = if local {
            PoolKind::TxShm
        } else {
            PoolKind::TxFabric
        };
        let pkt_id = self.pkt_pool_mut(pool).acquire().ok_or(Error::Again)?;
        let pkt = PktRef { pool, id: pkt_id };

        if let Err(e) = self.init_ctrl_pkt(ent, ctrl, pkt) {
            self.release_pkt(pkt);
            return Err(e);
        }
        let flags = if inject {
            SendFlags::INJECT
        } else {
            SendFlags::empty()
        };
        if let Err(e) = self.send_pkt(pkt, flags) {
            self.release_pkt(pkt);
            return Err(e);
        }
        self.handle_ctrl_sent(pkt, now);
        if inject {
            self.release_pkt(pkt);
        }
        Ok(())
    }

    fn init_ctrl_pkt(&mut self, ent: EntryRef, ctrl: PacketType, pkt: PktRef) -> Result<(), Error> {
        match (ctrl, ent) {
            (PacketType::Rts, EntryRef::Tx(id)) => self.init_rts_pkt(TxHandle::App(id), pkt),
            (PacketType::ReadRsp, EntryRef::ReadRsp(id)) => {
                self.init_readrsp_pkt(TxHandle::ReadRsp(id), pkt)
            }
            (PacketType::Cts, EntryRef::Rx(id)) => self.init_cts_pkt(id, pkt),
            (PacketType::Eor, EntryRef::Rx(id)) => self.init_eor_pkt(id, pkt),
            _ => Err(Error::InvalidPacketType(ctrl as u8)),
        }
    }

    /// Builds an RTS: header, optional cq-data and source address, then the
    /// eager payload, shm inline payload or mapping token, or RMA tables.
    fn init_rts_pkt(&mut self, th: TxHandle, pkt: PktRef) -> Result<(), Error> {
        let mtu = self.mtu;
        let mut scratch = vec![0u8; mtu];

        let (addr, op, total_len, tag, msg_id, credit_request, cq_data, tx_id) = {
            let e = self.tx_entry(th).ok_or(Error::UnknownEntry(th.id().0))?;
            (
                e.addr,
                e.op,
                e.total_len,
                e.tag,
                e.msg_id,
                e.credit_request,
                e.cq_data,
                e.tx_id,
            )
        };
        let local = self.peer_is_local(addr);
        let peer_acked = self.peers.get(addr).conn_state == ConnState::Acked;

        let mut flags = PacketFlags::CREDIT_REQUEST;
        if op == TxOp::Tagged {
            flags |= PacketFlags::TAGGED;
        }
        if cq_data.is_some() {
            flags |= PacketFlags::REMOTE_CQ_DATA;
        }
        if op == TxOp::ReadReq {
            flags |= PacketFlags::READ_REQ;
        }
        if op == TxOp::Write {
            flags |= PacketFlags::RMA_WRITE;
        }
        if local {
            flags |= PacketFlags::SHM_HDR;
        }
        let addrlen = if !peer_acked {
            flags |= PacketFlags::REMOTE_SRC_ADDR;
            self.core_addr.len() as u16
        } else {
            0
        };

        let mut off = RTS_HDR_SIZE;
        if let Some(data) = cq_data {
            scratch[off..off + 8].copy_from_slice(&data.to_le_bytes());
            off += 8;
        }
        if addrlen > 0 {
            scratch[off..off + addrlen as usize].copy_from_slice(&self.core_addr);
            off += addrlen as usize;
        }

        match op {
            TxOp::ReadReq => {
                // Payload: requester rx id, initial window, then the
                // target iov table. No data bytes.
                let e = self.tx_entry(th).unwrap();
                let rx_id = e.rx_id.expect("read request pairs an rx entry");
                let window = self
                    .rx_entries
                    .get(rx_id.0)
                    .map_or(0, |r| r.window as u64);
                let e = self.tx_entry(th).unwrap();
                scratch[off..off + 4].copy_from_slice(&rx_id.0.to_le_bytes());
                off += 4;
                scratch[off..off + 4].copy_from_slice(&0u32.to_le_bytes());
                off += 4;
                scratch[off..off + 8].copy_from_slice(&window.to_le_bytes());
                off += 8;
                off = protocol::encode_rma_iov_table(&mut scratch, off, &e.rma_iov);
            }
            TxOp::Write => {
                let rma_iov = self.tx_entry(th).unwrap().rma_iov.clone();
                off = protocol::encode_rma_iov_table(&mut scratch, off, &rma_iov);
                if local {
                    if total_len <= self.cfg.shm_max_medium_size && off + total_len <= mtu {
                        flags |= PacketFlags::SHM_HDR_DATA;
                        let e = self.tx_entry(th).unwrap();
                        let copied = iovec::copy_from_iov(
                            &mut scratch[off..off + total_len],
                            &e.segments,
                            0,
                        );
                        off += copied;
                    } else {
                        let token = self.share_segments(th, total_len);
                        scratch[off..off + 8].copy_from_slice(&token.to_le_bytes());
                        off += 8;
                    }
                } else {
                    let e = self.tx_entry(th).unwrap();
                    let n = (mtu - off).min(total_len);
                    let copied = iovec::copy_from_iov(&mut scratch[off..off + n], &e.segments, 0);
                    off += copied;
                }
            }
            _ if local => {
                if total_len <= self.cfg.shm_max_medium_size && off + total_len <= mtu {
                    flags |= PacketFlags::SHM_HDR_DATA;
                    let e = self.tx_entry(th).unwrap();
                    let copied =
                        iovec::copy_from_iov(&mut scratch[off..off + total_len], &e.segments, 0);
                    off += copied;
                } else {
                    // Rendezvous over shm: publish the message and let the
                    // receiver pull it in one cross-process read.
                    let token = self.share_segments(th, total_len);
                    scratch[off..off + 8].copy_from_slice(&token.to_le_bytes());
                    off += 8;
                }
            }
            _ => {
                let e = self.tx_entry(th).unwrap();
                let n = (mtu - off).min(total_len);
                let copied = iovec::copy_from_iov(&mut scratch[off..off + n], &e.segments, 0);
                off += copied;
            }
        }

        RtsHdr {
            flags,
            credit_request,
            addrlen,
            tx_id,
            msg_id,
            tag,
            data_len: total_len as u64,
        }
        .encode(&mut scratch);

        if !peer_acked && !local {
            self.peers.get(addr).conn_state = ConnState::ConnReqSent;
        }

        let entry = self.pkt_pool_mut(pkt.pool).get_mut(pkt.id);
        entry.buf[..off].copy_from_slice(&scratch[..off]);
        entry.pkt_size = off;
        entry.peer = addr;
        entry.owner = Some(Self::entry_ref(th));
        Ok(())
    }

    /// Builds a CTS. Fails retryably when the shared receive-buffer budget
    /// is spent, which is what queues grants under credit starvation.
    fn init_cts_pkt(&mut self, rx_id: RxId, pkt: PktRef) -> Result<(), Error> {
        if self.available_data_bufs == 0 {
            return Err(Error::Again);
        }
        let (addr, bytes_left, request, op, tx_id) = {
            let e = self
                .rx_entries
                .get(rx_id.0)
                .ok_or(Error::UnknownEntry(rx_id.0))?;
            (
                e.addr.ok_or(Error::UnknownEntry(rx_id.0))?,
                e.bytes_left(),
                e.credit_request,
                e.op,
                // The peer's entry id can lag the first data on an
                // unordered fabric; retry once it lands.
                e.tx_id.ok_or(Error::Again)?,
            )
        };
        let (window, credits) = self.calc_cts_window_credits(addr, bytes_left, request);
        {
            let e = self.rx_entries.get_mut(rx_id.0).unwrap();
            e.credit_cts = credits;
        }
        let mut flags = PacketFlags::empty();
        if op == RxOp::ReadRsp {
            flags |= PacketFlags::READ_REQ;
        }
        let mut scratch = [0u8; CTS_HDR_SIZE];
        CtsHdr {
            flags,
            tx_id,
            rx_id,
            window,
        }
        .encode(&mut scratch);
        let entry = self.pkt_pool_mut(pkt.pool).get_mut(pkt.id);
        entry.buf[..CTS_HDR_SIZE].copy_from_slice(&scratch);
        entry.pkt_size = CTS_HDR_SIZE;
        entry.peer = addr;
        entry.owner = Some(EntryRef::Rx(rx_id));
        Ok(())
    }

    /// Builds the first read-response packet: header carrying this entry's
    /// id plus the opening data slice. Later slices go out as DATA.
    fn init_readrsp_pkt(&mut self, th: TxHandle, pkt: PktRef) -> Result<(), Error> {
        let mtu = self.mtu;
        let mut scratch = vec![0u8; mtu];
        let (addr, rx_id, tx_id, payload) = {
            let e = self.tx_entry(th).ok_or(Error::UnknownEntry(th.id().0))?;
            let rx_id = e.rx_id.ok_or(Error::UnknownEntry(th.id().0))?;
            let n = e
                .total_len
                .min(mtu - READRSP_HDR_SIZE)
                .min(e.window);
            let mut payload = vec![0u8; n];
            iovec::copy_from_iov(&mut payload, &e.segments, 0);
            (e.addr, rx_id, e.tx_id, payload)
        };
        let seg_size = payload.len() as u16;
        ReadRspHdr {
            flags: PacketFlags::READ_REQ,
            tx_id,
            rx_id,
            seg_size,
            seg_offset: 0,
        }
        .encode(&mut scratch);
        scratch[READRSP_HDR_SIZE..READRSP_HDR_SIZE + payload.len()].copy_from_slice(&payload);
        let size = READRSP_HDR_SIZE + payload.len();
        let entry = self.pkt_pool_mut(pkt.pool).get_mut(pkt.id);
        entry.buf[..size].copy_from_slice(&scratch[..size]);
        entry.pkt_size = size;
        entry.peer = addr;
        entry.owner = Some(Self::entry_ref(th));
        Ok(())
    }

    /// Builds an EOR releasing the data sender's waiting entry.
    fn init_eor_pkt(&mut self, rx_id: RxId, pkt: PktRef) -> Result<(), Error> {
        let (addr, tx_id, op) = {
            let e = self
                .rx_entries
                .get(rx_id.0)
                .ok_or(Error::UnknownEntry(rx_id.0))?;
            (
                e.addr.ok_or(Error::UnknownEntry(rx_id.0))?,
                e.tx_id.ok_or(Error::Again)?,
                e.op,
            )
        };
        let mut flags = PacketFlags::empty();
        if op == RxOp::ReadRsp {
            flags |= PacketFlags::READ_REQ;
        }
        let mut scratch = [0u8; EOR_HDR_SIZE];
        EorHdr { flags, tx_id, rx_id }.encode(&mut scratch);
        let entry = self.pkt_pool_mut(pkt.pool).get_mut(pkt.id);
        entry.buf[..EOR_HDR_SIZE].copy_from_slice(&scratch);
        entry.pkt_size = EOR_HDR_SIZE;
        entry.peer = addr;
        entry.owner = Some(EntryRef::Rx(rx_id));
        Ok(())
    }

    /// Reacts to a control packet the lower transport accepted.
    fn handle_ctrl_sent(&mut self, pkt: PktRef, now: Instant) {
        let (pkt_type, owner) = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            let Ok(t) = PacketType::from_u8(p.buf[0]) else {
                return;
            };
            (t, p.owner)
        };
        match (pkt_type, owner) {
            (PacketType::Rts, Some(r @ (EntryRef::Tx(_) | EntryRef::ReadRsp(_)))) => {
                self.handle_rts_sent(Self::tx_handle(r).unwrap(), pkt, now);
            }
            (PacketType::Cts, Some(EntryRef::Rx(rx_id))) => {
                let (window, credit_cts) = {
                    let p = self.pkt_pool(pkt.pool).get(pkt.id);
                    let hdr = CtsHdr::decode(p.bytes()).expect("own cts");
                    let e = self.rx_entries.get(rx_id.0);
                    (hdr.window, e.map_or(0, |e| e.credit_cts))
                };
                if let Some(e) = self.rx_entries.get_mut(rx_id.0) {
                    e.window = window as usize;
                    e.state = RxState::Recv;
                }
                self.available_data_bufs =
                    self.available_data_bufs.saturating_sub(credit_cts as usize);
                // Fallback timer for unresponsive peers.
                if self.available_data_bufs == 0 {
                    self.available_data_bufs_ts = Some(now);
                }
            }
            (PacketType::ReadRsp, Some(r @ EntryRef::ReadRsp(_))) => {
                let th = Self::tx_handle(r).unwrap();
                let seg = {
                    let p = self.pkt_pool(pkt.pool).get(pkt.id);
                    ReadRspHdr::decode(p.bytes()).map_or(0, |h| h.seg_size as usize)
                };
                let mut pending = false;
                if let Some(e) = self.tx_entry_mut(th) {
                    e.bytes_sent += seg;
                    e.window = e.window.saturating_sub(seg);
                    if e.bytes_sent < e.total_len {
                        e.state = TxState::Send;
                        pending = true;
                    } else {
                        e.state = TxState::WaitReadFinish;
                    }
                }
                if pending && !self.tx_pending_list.contains(&th) {
                    self.tx_pending_list.push_back(th);
                }
            }
            (PacketType::Eor, Some(EntryRef::Rx(rx_id))) => {
                // The read (or shm pull) is complete on this side.
                self.rx_completion(rx_id, now);
            }
            _ => {}
        }
    }

    fn handle_rts_sent(&mut self, th: TxHandle, pkt: PktRef, now: Instant) {
        let (hdr, data_sent) = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            let hdr = RtsHdr::decode(p.bytes()).expect("own rts");
            let data = rts_data_size(&hdr, p.bytes());
            (hdr, data)
        };
        let local = pkt.pool == PoolKind::TxShm;
        if self.tx_entry(th).map_or(true, |e| e.op == TxOp::ReadReq) {
            // The window in a read RTS is carved out of the shared budget
            // the same way a CTS grant is.
            let rx = {
                let Some(e) = self.tx_entry_mut(th) else { return };
                e.bytes_sent = 0;
                e.state = TxState::WaitReadFinish;
                e.rx_id
            };
            if let Some(rx_id) = rx {
                let credit = self.rx_entries.get(rx_id.0).map_or(0, |r| r.credit_cts);
                self.available_data_bufs =
                    self.available_data_bufs.saturating_sub(credit as usize);
                if self.available_data_bufs == 0 {
                    self.available_data_bufs_ts = Some(now);
                }
            }
            return;
        }
        let (total_len, desc0) = {
            let Some(e) = self.tx_entry_mut(th) else {
                return;
            };
            e.bytes_sent += data_sent;
            let shm_large = hdr.flags.contains(PacketFlags::SHM_HDR)
                && !hdr.flags.contains(PacketFlags::SHM_HDR_DATA);
            let state = if shm_large {
                TxState::WaitReadFinish
            } else if e.bytes_sent < e.total_len {
                TxState::Send
            } else {
                e.state
            };
            e.state = state;
            (e.total_len, e.desc.first().copied().flatten())
        };
        // Long fabric transfers with no application descriptors register
        // their remaining segments on demand.
        if !local && total_len > data_sent && desc0.is_none() && self.cfg.mr_local {
            self.inline_mr_reg(th);
        }
    }

    /// Registers remaining segments longer than the memcpy threshold so
    /// DATA packets can reference them directly.
    fn inline_mr_reg(&mut self, th: TxHandle) {
        let (bytes_sent, nseg) = {
            let Some(e) = self.tx_entry(th) else { return };
            (e.bytes_sent, e.segments.len())
        };
        let mut cursor = IovCursor::default();
        if let Some(e) = self.tx_entry(th) {
            iovec::seek(&e.segments, &mut cursor, bytes_sent);
        }
        let start = cursor.index;
        for index in start..nseg {
            let len = match self.tx_entry(th) {
                Some(e) => e.segments[index].len(),
                None => return,
            };
            if len <= self.cfg.max_memcpy_size {
                continue;
            }
            let mr = self.domain.mr_reg(len).ok();
            if let Some(e) = self.tx_entry_mut(th) {
                e.mr[index] = mr;
            }
        }
        if let Some(e) = self.tx_entry_mut(th) {
            e.cursor = cursor;
            e.iov_mr_start = start;
        }
    }

    // ---- raw sends -------------------------------------------------------

    /// Hands one staged packet to the lower transport, honouring the
    /// outstanding-send cap and peer backoff.
    pub(crate) fn send_pkt(&mut self, pkt: PktRef, extra: SendFlags) -> Result<(), Error> {
        let (addr, size, mr) = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            (p.peer, p.pkt_size, p.mr)
        };
        let local = matches!(pkt.pool, PoolKind::TxShm);
        {
            let peer = self.peers.get(addr);
            if peer.in_backoff() {
                return Err(Error::Again);
            }
        }
        if !local && self.tx_pending == self.max_outstanding_tx {
            return Err(Error::Again);
        }
        let ctx = Self::pkt_ctx(pkt);
        let dest = if local {
            self.peers.get(addr).shm_addr.unwrap_or(addr)
        } else {
            addr
        };
        let res = {
            // Field-disjoint borrows: the packet pool feeds the frame
            // slice while the lower endpoint takes the send.
            let pool = match pkt.pool {
                PoolKind::TxFabric => &self.tx_pkt_fabric,
                PoolKind::RxFabric => &self.rx_pkt_fabric,
                PoolKind::TxShm => self.tx_pkt_shm.as_ref().expect("shm tx pool"),
                PoolKind::RxShm => self.rx_pkt_shm.as_ref().expect("shm rx pool"),
                PoolKind::UnexpCopy => self.rx_unexp_pkt.as_ref().expect("unexp pool"),
                PoolKind::OooCopy => self.rx_ooo_pkt.as_ref().expect("ooo pool"),
            };
            let p = pool.get(pkt.id);
            let frames = [&p.buf[..size]];
            let desc = [mr];
            if local {
                self.shm
                    .as_mut()
                    .expect("shm endpoint")
                    .send(&frames, &desc, dest, ctx, extra)
            } else {
                self.fabric.send(&frames, &desc, dest, ctx, extra)
            }
        };
        match res {
            Ok(()) => {
                if !local && !extra.contains(SendFlags::INJECT) {
                    self.tx_pending += 1;
                    self.peers.get(addr).tx_pending += 1;
                }
                Ok(())
            }
            Err(LowerError::Again) => Err(Error::Again),
            Err(LowerError::Rnr) => Err(Error::Again),
            Err(LowerError::Other(e)) => Err(Error::Lower(e)),
        }
    }

    /// Flushes packets bounced by receiver-not-ready. Local-peer packets
    /// are dropped from the queue, as the shm channel never RNRs.
    pub(crate) fn send_queued_pkts(&mut self, queued: &mut VecDeque<PktRef>) -> Result<(), Error> {
        while let Some(&pkt) = queued.front() {
            let addr = self.pkt_pool(pkt.pool).get(pkt.id).peer;
            if self.peer_is_local(addr) && pkt.pool != PoolKind::TxShm {
                queued.pop_front();
                self.release_pkt(pkt);
                continue;
            }
            self.send_pkt(pkt, SendFlags::empty())?;
            queued.pop_front();
        }
        Ok(())
    }

    pub(crate) fn send_connack(&mut self, addr: PeerAddr) -> Result<(), Error> {
        let local = self.peer_is_local(addr);
        let pool = if local {
            PoolKind::TxShm
        } else {
            PoolKind::TxFabric
        };
        let pkt_id = self.pkt_pool_mut(pool).acquire().ok_or(Error::Again)?;
        let pkt = PktRef { pool, id: pkt_id };
        {
            let entry = self.pkt_pool_mut(pool).get_mut(pkt_id);
            let mut scratch = [0u8; protocol::CONNACK_HDR_SIZE];
            protocol::encode_connack(&mut scratch);
            entry.buf[..scratch.len()].copy_from_slice(&scratch);
            entry.pkt_size = scratch.len();
            entry.peer = addr;
            entry.owner = None;
        }
        let res = self.send_pkt(pkt, SendFlags::INJECT);
        self.release_pkt(pkt);
        res
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // Deregister on-demand registrations still held by live entries,
        // then the pool slabs themselves.
        let mut mrs: Vec<crate::lower::MrHandle> = Vec::new();
        for (_, e) in self.tx_entries.iter() {
            mrs.extend(e.mr.iter().flatten().copied());
        }
        for (_, e) in self.readrsp_tx_entries.iter() {
            mrs.extend(e.mr.iter().flatten().copied());
        }
        for mr in mrs {
            self.domain.mr_close(mr);
        }
        self.tx_pkt_fabric.close(self.domain.as_mut());
        self.rx_pkt_fabric.close(self.domain.as_mut());
    }
}

pub(crate) fn div_ceil(a: u64, b: u64) -> u64 {
    if b == 0 {
        return 0;
    }
    a.div_ceil(b)
}

/// Bytes of message payload an RTS carries, recovered from the packet
/// itself.
pub(crate) fn rts_data_size(hdr: &RtsHdr, bytes: &[u8]) -> usize {
    if hdr.flags.contains(PacketFlags::READ_REQ) {
        return 0;
    }
    let mut off = hdr.payload_offset();
    if hdr.flags.contains(PacketFlags::RMA_WRITE) {
        if let Ok((_, next)) = protocol::decode_rma_iov_table(bytes, off) {
            off = next;
        }
    }
    if hdr.flags.contains(PacketFlags::SHM_HDR) && !hdr.flags.contains(PacketFlags::SHM_HDR_DATA) {
        // Payload is a mapping token, not data.
        return 0;
    }
    bytes.len().saturating_sub(off)
}

// Packet dispatch and data-path handlers live alongside the progress
// engine in `progress.rs`; completion bookkeeping shared by both sides is
// defined here.
impl Endpoint {
    /// Retires a finished application transfer: returns its credits,
    /// closes on-demand registrations, and emits the completion.
    pub(crate) fn tx_completion(&mut self, th: TxHandle, _now: Instant) {
        self.tx_pending_list.retain(|&h| h != th);
        self.tx_entry_queued.retain(|&h| h != th);
        let Some(entry) = self.remove_tx_entry(th) else {
            return;
        };
        let peer = self.peers.get(entry.addr);
        peer.tx_credits = peer
            .tx_credits
            .saturating_add(entry.credit_request as u32)
            .min(self.cfg.tx_max_credits);
        for mr in entry.mr.iter().flatten() {
            self.domain.mr_close(*mr);
        }
        if let Some(token) = entry.shm_token {
            if let Some(shm) = self.shm.as_mut() {
                shm.unshare(token);
            }
        }
        for pkt in entry.queued_pkts {
            self.release_pkt(pkt);
        }
        debug!("tx {} complete, {} bytes", entry.tx_id, entry.total_len);
        self.push_completion(Completion {
            context: entry.cq.context,
            flags: entry.cq.flags,
            len: entry.cq.len,
            data: entry.cq.data,
            tag: entry.cq.tag,
            buf: Some(entry.segments),
        });
    }

    /// Emits exactly one error completion for a failed transfer and
    /// releases it.
    pub(crate) fn tx_error(&mut self, th: TxHandle, err: Error) {
        self.tx_pending_list.retain(|&h| h != th);
        self.tx_entry_queued.retain(|&h| h != th);
        let Some(entry) = self.remove_tx_entry(th) else {
            return;
        };
        let peer = self.peers.get(entry.addr);
        peer.tx_credits = peer
            .tx_credits
            .saturating_add(entry.credit_request as u32)
            .min(self.cfg.tx_max_credits);
        for mr in entry.mr.iter().flatten() {
            self.domain.mr_close(*mr);
        }
        for pkt in entry.queued_pkts {
            self.release_pkt(pkt);
        }
        warn!("tx {} failed: {}", entry.tx_id, err);
        let prov = err.prov_errno();
        self.push_error(CompletionError {
            context: entry.cq.context,
            flags: entry.cq.flags,
            tag: entry.cq.tag,
            err,
            prov_errno: prov,
        });
    }

    /// Retires a finished receive, with the multi-recv consumer and
    /// release bookkeeping.
    pub(crate) fn rx_completion(&mut self, rx_id: RxId, _now: Instant) {
        let Some(entry) = self.rx_entries.get(rx_id.0) else {
            return;
        };
        let is_consumer = entry.flags.contains(RxFlags::MULTI_RECV_CONSUMER);
        if is_consumer {
            self.consumer_completion(rx_id);
            return;
        }
        let is_read = entry.op == RxOp::ReadRsp;
        let entry = self.rx_entries.remove(rx_id.0).unwrap();
        self.rx_entry_queued.retain(|&id| id != rx_id);
        if is_read {
            // The paired read request retires with this completion; the
            // entry's tx_id names the responder's entry, so the local
            // request is found through its own rx link.
            let paired = self
                .tx_entries
                .iter()
                .find(|(_, t)| t.op == TxOp::ReadReq && t.rx_id == Some(rx_id))
                .map(|(id, _)| TxHandle::App(TxId(id)));
            if let Some(th) = paired {
                self.tx_pending_list.retain(|&h| h != th);
                self.tx_entry_queued.retain(|&h| h != th);
                self.remove_tx_entry(th);
            }
        }
        let cancelled = entry.cancelled();
        for pkt in entry.queued_pkts {
            self.release_pkt(pkt);
        }
        if let Some(pkt) = entry.unexp_rts_pkt {
            self.release_pkt(pkt);
        }
        if cancelled {
            return;
        }
        let buf = match entry.buf {
            RecvBuf::Owned(segs) => Some(segs),
            _ => None,
        };
        debug!("rx {} complete, {} bytes", entry.rx_id, entry.bytes_done);
        self.push_completion(Completion {
            context: entry.cq.context,
            flags: entry.cq.flags,
            len: entry.cq.len,
            data: entry.cq.data,
            tag: entry.cq.tag,
            buf,
        });
    }

    fn consumer_completion(&mut self, rx_id: RxId) {
        let Some(entry) = self.rx_entries.remove(rx_id.0) else {
            return;
        };
        self.rx_entry_queued.retain(|&id| id != rx_id);
        let master_id = entry.master.expect("consumer links a master");
        let mut flags = entry.cq.flags;
        let mut buf = None;
        let mut master_cancelled = false;
        let mut free_master = false;
        if let Some(m) = self.rx_entries.get_mut(master_id.0) {
            m.consumers.retain(|&c| c != rx_id);
            master_cancelled = m.flags.contains(RxFlags::RECV_CANCEL);
            if m.flags.contains(RxFlags::MULTI_RECV_RELEASED) && m.consumers.is_empty() {
                free_master = true;
            }
        }
        if free_master {
            // Last outstanding consumer of a released master: the buffer
            // travels back with this completion.
            let m = self.rx_entries.remove(master_id.0).unwrap();
            flags |= CompletionFlags::MULTI_RECV;
            if let RecvBuf::Owned(segs) = m.buf {
                buf = Some(segs);
            }
        }
        if entry.cancelled() || master_cancelled {
            return;
        }
        self.push_completion(Completion {
            context: entry.cq.context,
            flags,
            len: entry.cq.len,
            data: entry.cq.data,
            tag: entry.cq.tag,
            buf,
        });
    }
}
