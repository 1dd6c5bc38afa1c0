//! The per-endpoint progress engine.
//!
//! One tick: check the buffer-budget timer, drain both completion
//! queues, repost receive buffers, expire peer backoff, retry queued
//! control traffic (receive side first), then pump DATA for every
//! pending transmit entry while window and send slots remain.

use std::collections::VecDeque;
use std::mem;
use std::time::Instant;

use tracing::{debug, warn};

use crate::endpoint::{rts_data_size, Endpoint};
use crate::error::Error;
use crate::lower::{LowerCqEntry, LowerError, SendFlags};
use crate::peer::Recvwin;
use crate::pool::{EntryRef, PktRef, PoolKind};
use crate::protocol::{
    BaseHdr, CtsHdr, DataHdr, EorHdr, MsgId, PacketFlags, PacketType, PeerAddr, ReadRspHdr,
    RtsHdr, RxId, TxId, DATA_HDR_SIZE, READRSP_HDR_SIZE,
};
use crate::receive::{RecvBuf, RxFlags, RxOp, RxState};
use crate::transmit::{TxHandle, TxOp, TxState};
use crate::{CompletionError, CompletionFlags};

impl Endpoint {
    /// Drives the endpoint forward. Non-blocking; call from the send and
    /// receive paths or a dedicated progress thread, serialised by the
    /// endpoint lock.
    pub fn progress(&mut self, now: Instant) {
        self.check_available_data_bufs_timer(now);
        self.poll_lower_cq(false, self.cfg.fabric_cq_read_size, now);
        if self.shm.is_some() {
            self.poll_lower_cq(true, self.cfg.shm_cq_read_size, now);
        }
        self.bulk_post_recv();
        self.check_peer_backoff_timer(now);
        self.flush_pending_connacks();
        self.drain_rx_queued(now);
        self.drain_tx_queued(now);
        self.pump_tx_pending(now);
    }

    /// Liveness fallback: an unresponsive peer must not pin the shared
    /// receive-buffer budget at zero forever.
    fn check_available_data_bufs_timer(&mut self, now: Instant) {
        if self.available_data_bufs != 0 {
            return;
        }
        if let Some(ts) = self.available_data_bufs_ts {
            if now.saturating_duration_since(ts) >= self.cfg.available_data_bufs_timeout {
                self.available_data_bufs = self.rx_pkt_fabric.capacity();
                self.available_data_bufs_ts = None;
                warn!("reset available buffers for large message receives");
            }
        }
    }

    fn poll_lower_cq(&mut self, is_shm: bool, budget: usize, now: Instant) {
        for _ in 0..budget {
            let entry = if is_shm {
                match self.shm.as_mut() {
                    Some(shm) => shm.read_cq(),
                    None => return,
                }
            } else {
                self.fabric.read_cq()
            };
            let Some(entry) = entry else { return };
            match entry {
                LowerCqEntry::SendOk { ctx } => self.handle_send_completion(ctx, now),
                LowerCqEntry::SendErr { ctx, err } => self.handle_send_error(ctx, err, now),
                LowerCqEntry::Recv { ctx, bytes, src } => {
                    let pkt = Self::pkt_from_ctx(ctx);
                    let src = match (pkt.pool, src) {
                        (PoolKind::RxShm, Some(s)) => {
                            Some(self.shm_addr_map.get(&s.0).copied().unwrap_or(s))
                        }
                        (_, s) => s,
                    };
                    {
                        let p = self.pkt_pool_mut(pkt.pool).get_mut(pkt.id);
                        let n = bytes.len().min(p.buf.len());
                        p.buf[..n].copy_from_slice(&bytes[..n]);
                        p.pkt_size = n;
                        p.owner = None;
                        if let Some(src) = src {
                            p.peer = src;
                        }
                    }
                    match pkt.pool {
                        PoolKind::RxFabric => {
                            self.posted_bufs_fabric = self.posted_bufs_fabric.saturating_sub(1);
                            self.rx_bufs_fabric_to_post += 1;
                        }
                        PoolKind::RxShm => {
                            self.posted_bufs_shm = self.posted_bufs_shm.saturating_sub(1);
                            self.rx_bufs_shm_to_post += 1;
                        }
                        _ => {}
                    }
                    self.handle_recv_completion(pkt, now);
                }
            }
        }
    }

    // ---- send-side completion handling ----------------------------------

    pub(crate) fn handle_send_completion(&mut self, ctx: u64, now: Instant) {
        let pkt = Self::pkt_from_ctx(ctx);
        let (type_byte, owner, addr) = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            (p.buf[0], p.owner, p.peer)
        };
        if pkt.pool == PoolKind::TxFabric {
            self.tx_pending = self.tx_pending.saturating_sub(1);
            let peer = self.peers.get(addr);
            peer.tx_pending = peer.tx_pending.saturating_sub(1);
        }
        let th = owner.and_then(|r| match r {
            EntryRef::Tx(id) => Some(TxHandle::App(id)),
            EntryRef::ReadRsp(id) => Some(TxHandle::ReadRsp(id)),
            EntryRef::Rx(_) => None,
        });
        match PacketType::from_u8(type_byte) {
            Ok(PacketType::Rts) => {
                if let Some(th) = th {
                    let acked = {
                        let p = self.pkt_pool(pkt.pool).get(pkt.id);
                        RtsHdr::decode(p.bytes())
                            .map(|h| rts_data_size(&h, p.bytes()))
                            .unwrap_or(0)
                    };
                    self.ack_tx_bytes(th, acked, now);
                }
            }
            Ok(PacketType::Data) => {
                if let Some(th) = th {
                    let acked = {
                        let p = self.pkt_pool(pkt.pool).get(pkt.id);
                        DataHdr::decode(p.bytes()).map_or(0, |h| h.seg_size as usize)
                    };
                    self.ack_tx_bytes(th, acked, now);
                }
            }
            Ok(PacketType::ReadRsp) => {
                if let Some(th) = th {
                    let acked = {
                        let p = self.pkt_pool(pkt.pool).get(pkt.id);
                        ReadRspHdr::decode(p.bytes()).map_or(0, |h| h.seg_size as usize)
                    };
                    self.ack_tx_bytes(th, acked, now);
                }
            }
            _ => {}
        }
        self.release_pkt(pkt);
    }

    /// Advances a transmit entry's acknowledged byte count; the transfer
    /// retires when everything sent has been delivered.
    fn ack_tx_bytes(&mut self, th: TxHandle, acked: usize, now: Instant) {
        let done = {
            let Some(e) = self.tx_entry_mut(th) else {
                // Completions may outlive an entry torn down by EOR.
                return;
            };
            e.bytes_acked += acked;
            if e.op == TxOp::ReadReq {
                return;
            }
            if e.bytes_acked < e.total_len || e.state == TxState::WaitReadFinish {
                if e.bytes_acked >= e.total_len && e.op == TxOp::ReadRsp {
                    e.state = TxState::WaitReadFinish;
                }
                false
            } else if e.op == TxOp::ReadRsp {
                e.state = TxState::WaitReadFinish;
                false
            } else {
                true
            }
        };
        if done {
            self.tx_completion(th, now);
        }
    }

    /// Routes a failed send. Receiver-not-ready starts peer backoff and
    /// parks the packet on its entry's queue; anything else is terminal.
    pub(crate) fn handle_send_error(&mut self, ctx: u64, err: LowerError, now: Instant) {
        let pkt = Self::pkt_from_ctx(ctx);
        let (owner, addr) = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            (p.owner, p.peer)
        };
        if pkt.pool == PoolKind::TxFabric {
            self.tx_pending = self.tx_pending.saturating_sub(1);
            let peer = self.peers.get(addr);
            peer.tx_pending = peer.tx_pending.saturating_sub(1);
        }
        match err {
            LowerError::Rnr | LowerError::Again => {
                if err == LowerError::Rnr {
                    let (initial, max) = (self.cfg.rnr_backoff_initial, self.cfg.rnr_backoff_max);
                    self.peers.get(addr).enter_backoff(now, initial, max);
                    if !self.peer_backoff_list.contains(&addr) {
                        self.peer_backoff_list.push(addr);
                    }
                    debug!("peer {} entered rnr backoff", addr);
                }
                match owner {
                    Some(EntryRef::Tx(id)) | Some(EntryRef::ReadRsp(id)) => {
                        let th = match owner {
                            Some(EntryRef::ReadRsp(_)) => TxHandle::ReadRsp(id),
                            _ => TxHandle::App(id),
                        };
                        let requeued = {
                            let Some(e) = self.tx_entry_mut(th) else {
                                self.release_pkt(pkt);
                                return;
                            };
                            e.queued_pkts.push_back(pkt);
                            match e.state {
                                TxState::Send => {
                                    e.state = TxState::QueuedDataRnr;
                                    true
                                }
                                TxState::Rts => {
                                    e.state = TxState::QueuedRtsRnr;
                                    false
                                }
                                _ => false,
                            }
                        };
                        if requeued {
                            self.tx_pending_list.retain(|&h| h != th);
                        }
                        if !self.tx_entry_queued.contains(&th) {
                            self.tx_entry_queued.push_back(th);
                        }
                    }
                    Some(EntryRef::Rx(rx_id)) => {
                        if let Some(e) = self.rx_entries.get_mut(rx_id.0) {
                            e.queued_pkts.push_back(pkt);
                            if !self.rx_entry_queued.contains(&rx_id) {
                                self.rx_entry_queued.push_back(rx_id);
                            }
                        } else {
                            self.release_pkt(pkt);
                        }
                    }
                    None => self.release_pkt(pkt),
                }
            }
            LowerError::Other(e) => {
                match owner {
                    Some(EntryRef::Tx(id)) => self.tx_error(TxHandle::App(id), Error::Lower(e)),
                    Some(EntryRef::ReadRsp(id)) => {
                        self.tx_error(TxHandle::ReadRsp(id), Error::Lower(e))
                    }
                    Some(EntryRef::Rx(id)) => self.rx_error(id, Error::Lower(e)),
                    None => warn!("send error {} on unowned packet", e),
                }
                self.release_pkt(pkt);
            }
        }
    }

    pub(crate) fn rx_error(&mut self, rx_id: RxId, err: Error) {
        self.rx_list.retain(|&id| id != rx_id);
        self.rx_tagged_list.retain(|&id| id != rx_id);
        self.rx_unexp_list.retain(|&id| id != rx_id);
        self.rx_unexp_tagged_list.retain(|&id| id != rx_id);
        let Some(entry) = self.rx_entries.remove(rx_id.0) else {
            return;
        };
        self.rx_entry_queued.retain(|&id| id != rx_id);
        warn!("rx {} failed: {}", rx_id, err);
        let prov = err.prov_errno();
        self.push_error(CompletionError {
            context: entry.cq.context,
            flags: entry.cq.flags,
            tag: entry.tag,
            err,
            prov_errno: prov,
        });
        if let Some(pkt) = entry.unexp_rts_pkt {
            self.release_pkt(pkt);
        }
        for pkt in entry.queued_pkts {
            self.release_pkt(pkt);
        }
    }

    // ---- receive-side dispatch ------------------------------------------

    pub(crate) fn handle_recv_completion(&mut self, pkt: PktRef, now: Instant) {
        let base = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            BaseHdr::decode(p.bytes())
        };
        let base = match base {
            Ok(b) => b,
            Err(err) => {
                warn!("dropping malformed packet: {}", err);
                self.release_pkt(pkt);
                return;
            }
        };
        match base.pkt_type {
            PacketType::Rts => self.handle_rts(pkt, now),
            PacketType::Connack => {
                let addr = self.pkt_pool(pkt.pool).get(pkt.id).peer;
                self.peers.get(addr).conn_state = crate::peer::ConnState::Acked;
                self.release_pkt(pkt);
            }
            PacketType::Cts => self.handle_cts(pkt),
            PacketType::Data => self.handle_data(pkt, false, now),
            PacketType::ReadRsp => self.handle_data(pkt, true, now),
            PacketType::Eor => self.handle_eor(pkt, now),
        }
    }

    /// Handles an incoming RTS: connection handshake, then the per-peer
    /// reorder window, then matching.
    fn handle_rts(&mut self, pkt: PktRef, now: Instant) {
        let hdr = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            match RtsHdr::decode(p.bytes()) {
                Ok(h) => h,
                Err(err) => {
                    warn!("dropping malformed rts: {}", err);
                    self.release_pkt(pkt);
                    return;
                }
            }
        };
        let src = self.pkt_pool(pkt.pool).get(pkt.id).peer;

        // First contact: the sender piggybacked its raw address and waits
        // for an acknowledgement before dropping it from later packets.
        if hdr.flags.contains(PacketFlags::REMOTE_SRC_ADDR)
            && self.send_connack(src).is_err()
            && !self.pending_connacks.contains(&src)
        {
            self.pending_connacks.push_back(src);
        }

        let in_order = self.cfg.in_order_delivery && !hdr.flags.contains(PacketFlags::SHM_HDR);
        {
            let recvwin_size = self.cfg.recvwin_size;
            let win_init = self.cfg.rx_window_size;
            let ordering = self.cfg.in_order_delivery;
            let peer = self.peers.get(src);
            if !peer.rx_init {
                peer.rx_init = true;
                peer.rx_credits = win_init;
            }
            if ordering && peer.robuf.is_none() {
                peer.robuf = Some(Recvwin::new(recvwin_size, MsgId(0)));
            }
        }
        if !in_order {
            self.proc_rts(pkt, now);
            return;
        }

        enum Order {
            Expected,
            Behind,
            Stash,
            OutOfWindow,
        }
        let decision = {
            let robuf = self.peers.get(src).robuf.as_ref().expect("reorder window");
            if robuf.is_behind(hdr.msg_id) {
                Order::Behind
            } else if hdr.msg_id == robuf.expected() {
                Order::Expected
            } else if robuf.in_window(hdr.msg_id) {
                Order::Stash
            } else {
                Order::OutOfWindow
            }
        };
        match decision {
            Order::Behind => {
                debug!("duplicate message {} from {}", hdr.msg_id, src);
                self.release_pkt(pkt);
            }
            Order::OutOfWindow => {
                warn!("message {} from {} beyond reorder window", hdr.msg_id, src);
                self.release_pkt(pkt);
            }
            Order::Stash => {
                let stash = if self.cfg.rx_copy_ooo
                    && matches!(pkt.pool, PoolKind::RxFabric | PoolKind::RxShm)
                {
                    self.copy_pkt(pkt, PoolKind::OooCopy)
                } else {
                    pkt
                };
                let inserted = self
                    .peers
                    .get(src)
                    .robuf
                    .as_mut()
                    .expect("reorder window")
                    .insert(hdr.msg_id, stash);
                if !inserted {
                    self.release_pkt(stash);
                }
            }
            Order::Expected => {
                self.proc_rts(pkt, now);
                self.peers
                    .get(src)
                    .robuf
                    .as_mut()
                    .expect("reorder window")
                    .advance();
                loop {
                    let next = {
                        let robuf = self.peers.get(src).robuf.as_mut().expect("reorder window");
                        match robuf.take_expected() {
                            Some(p) => {
                                robuf.advance();
                                Some(p)
                            }
                            None => None,
                        }
                    };
                    match next {
                        Some(p) => self.proc_rts(p, now),
                        None => break,
                    }
                }
            }
        }
    }

    /// Matches one in-order RTS against the posted lists, splitting
    /// multi-recv consumers, or records it as unexpected.
    fn proc_rts(&mut self, pkt: PktRef, now: Instant) {
        let (hdr, src) = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            match RtsHdr::decode(p.bytes()) {
                Ok(h) => (h, p.peer),
                Err(err) => {
                    warn!("dropping malformed rts: {}", err);
                    self.release_pkt(pkt);
                    return;
                }
            }
        };
        if hdr.flags.contains(PacketFlags::READ_REQ) {
            self.handle_read_req_rts(pkt, &hdr, now);
            return;
        }
        if hdr.flags.contains(PacketFlags::RMA_WRITE) {
            self.handle_write_rts(pkt, &hdr, now);
            return;
        }
        let tagged = hdr.flags.contains(PacketFlags::TAGGED);
        let pos = {
            let list = if tagged {
                &self.rx_tagged_list
            } else {
                &self.rx_list
            };
            list.iter().position(|&id| {
                self.rx_entries
                    .get(id.0)
                    .map_or(false, |e| !e.cancelled() && e.matches(src, hdr.tag))
            })
        };
        if let Some(pos) = pos {
            let rx_id = if tagged {
                self.rx_tagged_list[pos]
            } else {
                self.rx_list[pos]
            };
            let multi = self
                .rx_entries
                .get(rx_id.0)
                .map_or(false, |e| e.flags.contains(RxFlags::MULTI_RECV_POSTED));
            if multi {
                let remaining = self
                    .rx_entries
                    .get(rx_id.0)
                    .map_or(0, |m| self.multi_recv_remaining(m));
                if hdr.data_len as usize <= remaining {
                    if let Some(consumer) = self.split_rx_entry(rx_id, pkt) {
                        // Mark the release before the consumer completes so
                        // its completion carries the buffer-released flag.
                        if self.multi_recv_exhausted(rx_id) {
                            self.release_multi_recv_master(rx_id, now);
                        }
                        self.proc_matched_rts(consumer, pkt, now);
                        return;
                    }
                }
                // Too big for the remaining buffer, or no consumer entry:
                // treat as unexpected.
            } else {
                if tagged {
                    self.rx_tagged_list.remove(pos);
                } else {
                    self.rx_list.remove(pos);
                }
                self.proc_matched_rts(rx_id, pkt, now);
                return;
            }
        }
        self.store_unexpected(pkt, &hdr, src, tagged);
    }

    fn store_unexpected(&mut self, pkt: PktRef, hdr: &RtsHdr, src: PeerAddr, tagged: bool) {
        let retained = if self.cfg.rx_copy_unexp
            && matches!(pkt.pool, PoolKind::RxFabric | PoolKind::RxShm)
        {
            self.copy_pkt(pkt, PoolKind::UnexpCopy)
        } else {
            pkt
        };
        let op = if tagged { RxOp::Tagged } else { RxOp::Msg };
        let Some(rx_id) = self.alloc_rx_entry(RecvBuf::None, Some(src), op, hdr.tag, !0, 0)
        else {
            warn!("RX entries exhausted, dropping unexpected message");
            self.release_pkt(retained);
            return;
        };
        {
            let e = self.rx_entries.get_mut(rx_id.0).unwrap();
            e.state = RxState::Unexp;
            e.total_len = hdr.data_len as usize;
            e.tx_id = Some(hdr.tx_id);
            e.msg_id = hdr.msg_id;
            e.rts_flags = hdr.flags;
            e.unexp_rts_pkt = Some(retained);
        }
        {
            let p = self.pkt_pool_mut(retained.pool).get_mut(retained.id);
            p.owner = Some(EntryRef::Rx(rx_id));
        }
        if tagged {
            self.rx_unexp_tagged_list.push_back(rx_id);
        } else {
            self.rx_unexp_list.push_back(rx_id);
        }
        debug!("unexpected message from {} held as rx {}", src, rx_id);
    }

    /// Applies a matched RTS to its receive entry: fills metadata, copies
    /// any inline payload, and either completes (eager) or answers with a
    /// CTS (rendezvous).
    pub(crate) fn proc_matched_rts(&mut self, rx_id: RxId, pkt: PktRef, now: Instant) {
        let (hdr, src, payload, shm_token) = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            let bytes = p.bytes();
            let hdr = match RtsHdr::decode(bytes) {
                Ok(h) => h,
                Err(err) => {
                    warn!("dropping malformed rts: {}", err);
                    self.release_pkt(pkt);
                    return;
                }
            };
            let mut off = hdr.payload_offset();
            if hdr.flags.contains(PacketFlags::RMA_WRITE) {
                if let Ok((_, next)) = crate::protocol::decode_rma_iov_table(bytes, off) {
                    off = next;
                }
            }
            let shm_large = hdr.flags.contains(PacketFlags::SHM_HDR)
                && !hdr.flags.contains(PacketFlags::SHM_HDR_DATA);
            if shm_large {
                let mut t = [0u8; 8];
                t.copy_from_slice(&bytes[off..off + 8]);
                (hdr, p.peer, Vec::new(), Some(u64::from_le_bytes(t)))
            } else {
                (hdr, p.peer, bytes[off..].to_vec(), None)
            }
        };
        let cq_data = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            hdr.cq_data(p.bytes())
        };
        let tx_min = self.cfg.tx_min_credits as u16;
        {
            let Some(e) = self.rx_entries.get_mut(rx_id.0) else {
                self.release_pkt(pkt);
                return;
            };
            e.addr = Some(src);
            e.tx_id = Some(hdr.tx_id);
            e.msg_id = hdr.msg_id;
            e.rts_flags = hdr.flags;
            e.total_len = hdr.data_len as usize;
            e.credit_request = if hdr.flags.contains(PacketFlags::CREDIT_REQUEST) {
                hdr.credit_request
            } else {
                tx_min
            };
            if hdr.flags.contains(PacketFlags::TAGGED) {
                e.cq.tag = hdr.tag;
            }
            if let Some(d) = cq_data {
                e.cq.data = d;
                e.cq.flags |= CompletionFlags::REMOTE_CQ_DATA;
            }
            if !e.flags.contains(RxFlags::MULTI_RECV_CONSUMER) {
                let capacity = match &e.buf {
                    RecvBuf::Owned(segs) => crate::iovec::total_len(segs),
                    RecvBuf::Rma(iov) => iov.iter().map(|s| s.len as usize).sum(),
                    _ => 0,
                };
                e.cq.len = e.total_len.min(capacity);
            }
            e.state = RxState::Matched;
            e.shm_token = shm_token;
        }
        self.release_pkt(pkt);

        if shm_token.is_some() {
            match self.recv_shm_large(rx_id, now) {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    if let Some(entry) = self.rx_entries.get_mut(rx_id.0) {
                        entry.state = RxState::QueuedShmLargeRead;
                    }
                    if !self.rx_entry_queued.contains(&rx_id) {
                        self.rx_entry_queued.push_back(rx_id);
                    }
                }
                Err(e) => self.rx_error(rx_id, e),
            }
            return;
        }

        if !payload.is_empty() {
            self.write_rx_data(rx_id, 0, &payload);
            if let Some(e) = self.rx_entries.get_mut(rx_id.0) {
                e.bytes_done += payload.len();
            }
        }
        let done = self
            .rx_entries
            .get(rx_id.0)
            .map_or(true, |e| e.bytes_done >= e.total_len);
        if done {
            self.rx_completion(rx_id, now);
        } else if let Err(e) = self.post_ctrl_or_queue(EntryRef::Rx(rx_id), PacketType::Cts, false, now)
        {
            self.rx_error(rx_id, e);
        }
    }

    /// Responds to a read request: resolves the target regions into a
    /// read-response entry and opens the stream.
    fn handle_read_req_rts(&mut self, pkt: PktRef, hdr: &RtsHdr, now: Instant) {
        let (src, requester_rx, window, rma_iov) = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            let bytes = p.bytes();
            let off = hdr.payload_offset();
            if bytes.len() < off + 16 {
                warn!("truncated read request from {}", p.peer);
                self.release_pkt(pkt);
                return;
            }
            let mut rx = [0u8; 4];
            rx.copy_from_slice(&bytes[off..off + 4]);
            let mut win = [0u8; 8];
            win.copy_from_slice(&bytes[off + 8..off + 16]);
            let table = crate::protocol::decode_rma_iov_table(bytes, off + 16);
            match table {
                Ok((iov, _)) => (
                    p.peer,
                    RxId(u32::from_le_bytes(rx)),
                    u64::from_le_bytes(win),
                    iov,
                ),
                Err(err) => {
                    warn!("bad read request from {}: {}", p.peer, err);
                    self.release_pkt(pkt);
                    return;
                }
            }
        };
        self.release_pkt(pkt);

        let mut segments = Vec::with_capacity(rma_iov.len());
        for seg in &rma_iov {
            let ok = self.region(seg.key).and_then(|region| {
                let start = seg.offset as usize;
                let end = start.checked_add(seg.len as usize)?;
                region.get(start..end).map(|s| s.to_vec())
            });
            match ok {
                Some(bytes) => segments.push(bytes),
                None => {
                    let err = Error::UnknownRegion(seg.key);
                    warn!("read request from {}: {}", src, err);
                    let prov = err.prov_errno();
                    self.push_error(CompletionError {
                        context: 0,
                        flags: CompletionFlags::REMOTE_READ | CompletionFlags::RMA,
                        tag: 0,
                        err,
                        prov_errno: prov,
                    });
                    return;
                }
            }
        }
        let total: usize = segments.iter().map(|s| s.len()).sum();
        let window = (window as usize).min(total);
        let msg_id = hdr.msg_id;
        let id = self.alloc_readrsp_entry(src, segments, total, window, requester_rx, msg_id);
        let Some(id) = id else {
            warn!("read-response entries exhausted");
            return;
        };
        let th = TxHandle::ReadRsp(id);
        if let Err(e) = self.post_ctrl_or_queue(
            match th {
                TxHandle::ReadRsp(id) => EntryRef::ReadRsp(id),
                TxHandle::App(id) => EntryRef::Tx(id),
            },
            PacketType::ReadRsp,
            false,
            now,
        ) {
            warn!("failed to open read response: {}", e);
            self.tx_error(th, e);
        }
    }

    /// Creates a receive entry targeting registered regions for an
    /// inbound RMA write, then runs the normal matched path.
    fn handle_write_rts(&mut self, pkt: PktRef, hdr: &RtsHdr, now: Instant) {
        let (src, rma_iov) = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            let bytes = p.bytes();
            match crate::protocol::decode_rma_iov_table(bytes, hdr.payload_offset()) {
                Ok((iov, _)) => (p.peer, iov),
                Err(err) => {
                    warn!("bad rma write from {}: {}", p.peer, err);
                    self.release_pkt(pkt);
                    return;
                }
            }
        };
        let Some(rx_id) =
            self.alloc_rx_entry(RecvBuf::Rma(rma_iov), Some(src), RxOp::Write, 0, 0, 0)
        else {
            warn!("RX entries exhausted, dropping rma write");
            self.release_pkt(pkt);
            return;
        };
        self.proc_matched_rts(rx_id, pkt, now);
    }

    fn handle_cts(&mut self, pkt: PktRef) {
        let hdr = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            CtsHdr::decode(p.bytes())
        };
        self.release_pkt(pkt);
        let Ok(hdr) = hdr else { return };
        let th = if hdr.flags.contains(PacketFlags::READ_REQ) {
            TxHandle::ReadRsp(hdr.tx_id)
        } else {
            TxHandle::App(hdr.tx_id)
        };
        let pending = {
            let Some(e) = self.tx_entry_mut(th) else {
                // Stale grant for a terminated transfer.
                return;
            };
            e.window = hdr.window as usize;
            if e.bytes_sent < e.total_len && e.window > 0 {
                e.state = TxState::Send;
                true
            } else {
                false
            }
        };
        if pending && !self.tx_pending_list.contains(&th) {
            self.tx_pending_list.push_back(th);
        }
    }

    /// DATA and READRSP share the windowed payload path; READRSP also
    /// teaches the requester which responder entry to address.
    fn handle_data(&mut self, pkt: PktRef, is_readrsp: bool, now: Instant) {
        // One granted credit returns to the shared budget per segment.
        if self.available_data_bufs == 0 {
            self.available_data_bufs_ts = None;
        }
        self.available_data_bufs =
            (self.available_data_bufs + 1).min(self.rx_pkt_fabric.capacity());

        let (rx_id, seg_offset, payload, responder) = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            let bytes = p.bytes();
            if is_readrsp {
                match ReadRspHdr::decode(bytes) {
                    Ok(h) => {
                        let end = (READRSP_HDR_SIZE + h.seg_size as usize).min(bytes.len());
                        (
                            h.rx_id,
                            h.seg_offset as usize,
                            bytes[READRSP_HDR_SIZE..end].to_vec(),
                            Some(h.tx_id),
                        )
                    }
                    Err(err) => {
                        warn!("dropping malformed readrsp: {}", err);
                        self.release_pkt(pkt);
                        return;
                    }
                }
            } else {
                match DataHdr::decode(bytes) {
                    Ok(h) => {
                        let end = (DATA_HDR_SIZE + h.seg_size as usize).min(bytes.len());
                        (
                            h.rx_id,
                            h.seg_offset as usize,
                            bytes[DATA_HDR_SIZE..end].to_vec(),
                            None,
                        )
                    }
                    Err(err) => {
                        warn!("dropping malformed data: {}", err);
                        self.release_pkt(pkt);
                        return;
                    }
                }
            }
        };
        self.release_pkt(pkt);

        let live = {
            match self.rx_entries.get_mut(rx_id.0) {
                Some(e) => {
                    if let Some(tx) = responder {
                        e.tx_id = Some(tx);
                    }
                    !e.cancelled()
                }
                // Stale or torn down: the segment is silently discarded.
                None => false,
            }
        };
        let seg = payload.len();
        if live {
            self.write_rx_data(rx_id, seg_offset, &payload);
        }
        let Some(e) = self.rx_entries.get_mut(rx_id.0) else {
            return;
        };
        e.bytes_done += seg;
        e.window = e.window.saturating_sub(seg);
        let done = e.bytes_done >= e.total_len;
        let dry = e.window == 0;
        let is_read_sink = e.op == RxOp::ReadRsp;
        let cancelled = e.cancelled();
        if done {
            if cancelled {
                self.release_rx_entry(rx_id);
            } else if is_read_sink {
                // Everything landed; tell the responder to let go.
                if let Err(err) =
                    self.post_ctrl_or_queue(EntryRef::Rx(rx_id), PacketType::Eor, false, now)
                {
                    self.rx_error(rx_id, err);
                }
            } else {
                self.rx_completion(rx_id, now);
            }
        } else if dry {
            // Cancelled transfers keep draining the wire; only the
            // user-visible completion is suppressed.
            if let Err(err) =
                self.post_ctrl_or_queue(EntryRef::Rx(rx_id), PacketType::Cts, false, now)
            {
                self.rx_error(rx_id, err);
            }
        }
    }

    fn handle_eor(&mut self, pkt: PktRef, now: Instant) {
        let hdr = {
            let p = self.pkt_pool(pkt.pool).get(pkt.id);
            EorHdr::decode(p.bytes())
        };
        self.release_pkt(pkt);
        let Ok(hdr) = hdr else { return };
        let th = if hdr.flags.contains(PacketFlags::READ_REQ) {
            TxHandle::ReadRsp(hdr.tx_id)
        } else {
            TxHandle::App(hdr.tx_id)
        };
        if self.tx_entry(th).is_some() {
            self.tx_completion(th, now);
        }
    }

    /// Pulls a large co-located message through the shared medium in one
    /// cross-process read, then releases the sender with an EOR.
    pub(crate) fn recv_shm_large(&mut self, rx_id: RxId, now: Instant) -> Result<(), Error> {
        let (src, token, total) = {
            let e = self
                .rx_entries
                .get(rx_id.0)
                .ok_or(Error::UnknownEntry(rx_id.0))?;
            (
                e.addr.ok_or(Error::UnknownEntry(rx_id.0))?,
                e.shm_token.ok_or(Error::UnknownEntry(rx_id.0))?,
                e.total_len,
            )
        };
        let shm_src = self.peers.get(src).shm_addr.unwrap_or(src);
        let mut tmp = vec![0u8; total];
        let res = self
            .shm
            .as_mut()
            .ok_or(Error::Again)?
            .rma_read(shm_src, token, 0, &mut tmp);
        match res {
            Ok(()) => {}
            Err(LowerError::Again) => return Err(Error::Again),
            Err(LowerError::Rnr) => return Err(Error::Again),
            Err(LowerError::Other(e)) => return Err(Error::Lower(e)),
        }
        self.write_rx_data(rx_id, 0, &tmp);
        if let Some(e) = self.rx_entries.get_mut(rx_id.0) {
            e.bytes_done = total;
        }
        self.post_ctrl_or_queue(EntryRef::Rx(rx_id), PacketType::Eor, false, now)
    }

    /// Routes received bytes into the entry's buffer: its own segments, a
    /// slice of a multi-recv master, or registered RMA regions. Cancelled
    /// entries sink the bytes.
    pub(crate) fn write_rx_data(&mut self, rx_id: RxId, offset: usize, data: &[u8]) {
        enum Route {
            Own,
            Master(RxId, usize),
            Rma(smallvec::SmallVec<[crate::protocol::RmaIov; 4]>),
            Sink,
        }
        let route = match self.rx_entries.get(rx_id.0) {
            Some(e) if e.cancelled() => Route::Sink,
            Some(e) => match &e.buf {
                RecvBuf::Owned(_) => Route::Own,
                RecvBuf::Consumer { master, offset } => Route::Master(*master, *offset),
                RecvBuf::Rma(iov) => Route::Rma(iov.clone()),
                RecvBuf::None => Route::Sink,
            },
            None => Route::Sink,
        };
        match route {
            Route::Own => {
                if let Some(e) = self.rx_entries.get_mut(rx_id.0) {
                    if let RecvBuf::Owned(segs) = &mut e.buf {
                        crate::iovec::copy_to_iov(segs, offset, data);
                    }
                }
            }
            Route::Master(master, base) => {
                if let Some(m) = self.rx_entries.get_mut(master.0) {
                    if let RecvBuf::Owned(segs) = &mut m.buf {
                        crate::iovec::copy_to_iov(segs, base + offset, data);
                    }
                }
            }
            Route::Rma(iov) => {
                let mut skip = offset;
                let mut done = 0usize;
                for seg in &iov {
                    let seg_len = seg.len as usize;
                    if skip >= seg_len {
                        skip -= seg_len;
                        continue;
                    }
                    let n = (seg_len - skip).min(data.len() - done);
                    let start = seg.offset as usize + skip;
                    if let Some(region) = self.region_mut(seg.key) {
                        if start + n <= region.len() {
                            region[start..start + n].copy_from_slice(&data[done..done + n]);
                        }
                    }
                    done += n;
                    skip = 0;
                    if done == data.len() {
                        break;
                    }
                }
            }
            Route::Sink => {}
        }
    }

    // ---- repost, timers, queued drains ----------------------------------

    /// Bulk-reposts receive buffers on both lower endpoints, batching with
    /// the MORE hint; the last post of a batch clears it.
    pub(crate) fn bulk_post_recv(&mut self) {
        while self.rx_bufs_fabric_to_post > 0 {
            let flags = if self.rx_bufs_fabric_to_post == 1 {
                SendFlags::empty()
            } else {
                SendFlags::MORE
            };
            if self.post_one_recv(false, flags).is_err() {
                break;
            }
        }
        while self.shm.is_some() && self.rx_bufs_shm_to_post > 0 {
            let flags = if self.rx_bufs_shm_to_post == 1 {
                SendFlags::empty()
            } else {
                SendFlags::MORE
            };
            if self.post_one_recv(true, flags).is_err() {
                break;
            }
        }
    }

    fn post_one_recv(&mut self, shm: bool, _flags: SendFlags) -> Result<(), Error> {
        let pool = if shm {
            PoolKind::RxShm
        } else {
            PoolKind::RxFabric
        };
        let pkt_id = self.pkt_pool_mut(pool).acquire().ok_or(Error::Again)?;
        let pkt = PktRef { pool, id: pkt_id };
        let ctx = Self::pkt_ctx(pkt);
        let mtu = self.mtu;
        let res = if shm {
            self.shm.as_mut().expect("shm endpoint").post_recv(ctx, mtu)
        } else {
            self.fabric.post_recv(ctx, mtu)
        };
        match res {
            Ok(()) => {
                if shm {
                    self.posted_bufs_shm += 1;
                    self.rx_bufs_shm_to_post -= 1;
                } else {
                    self.posted_bufs_fabric += 1;
                    self.rx_bufs_fabric_to_post -= 1;
                }
                Ok(())
            }
            Err(_) => {
                self.release_pkt(pkt);
                Err(Error::Again)
            }
        }
    }

    fn check_peer_backoff_timer(&mut self, now: Instant) {
        if self.peer_backoff_list.is_empty() {
            return;
        }
        let addrs: Vec<PeerAddr> = self.peer_backoff_list.clone();
        for addr in addrs {
            let peer = self.peers.get(addr);
            peer.rnr_state.remove(crate::peer::RnrState::BACKED_OFF);
            if peer.backoff_expired(now) {
                peer.clear_backoff();
                self.peer_backoff_list.retain(|&a| a != addr);
                debug!("peer {} left rnr backoff", addr);
            }
        }
    }

    fn flush_pending_connacks(&mut self) {
        while let Some(&addr) = self.pending_connacks.front() {
            match self.send_connack(addr) {
                Ok(()) => {
                    self.pending_connacks.pop_front();
                }
                Err(e) if e.is_retryable() => break,
                Err(_) => {
                    self.pending_connacks.pop_front();
                }
            }
        }
    }

    /// Retries queued CTS/EOR posts, queued shm large reads, and bounced
    /// packets on receive entries. Stops at the first retryable failure.
    fn drain_rx_queued(&mut self, now: Instant) {
        while let Some(&rx_id) = self.rx_entry_queued.front() {
            let Some(e) = self.rx_entries.get(rx_id.0) else {
                self.rx_entry_queued.pop_front();
                continue;
            };
            let state = e.state;
            let ctrl = e.queued_ctrl;
            let res = match state {
                RxState::QueuedCtrl => {
                    let Some(ctrl) = ctrl else {
                        self.rx_entry_queued.pop_front();
                        continue;
                    };
                    self.post_ctrl(EntryRef::Rx(rx_id), ctrl.pkt_type, ctrl.inject, now)
                }
                RxState::QueuedShmLargeRead => self.recv_shm_large(rx_id, now),
                _ => {
                    let mut queued = match self.rx_entries.get_mut(rx_id.0) {
                        Some(e) => mem::take(&mut e.queued_pkts),
                        None => VecDeque::new(),
                    };
                    let r = self.send_queued_pkts(&mut queued);
                    if let Some(e) = self.rx_entries.get_mut(rx_id.0) {
                        e.queued_pkts = queued;
                    }
                    r
                }
            };
            match res {
                Ok(()) => {
                    self.rx_entry_queued.pop_front();
                    if let Some(e) = self.rx_entries.get_mut(rx_id.0) {
                        e.queued_ctrl = None;
                        e.state = RxState::Recv;
                    }
                }
                Err(e) if e.is_retryable() => break,
                Err(e) => {
                    self.rx_entry_queued.pop_front();
                    self.rx_error(rx_id, e);
                }
            }
        }
    }

    /// Retries queued RTS/control posts, queued shm RMA, and bounced
    /// packets on transmit entries, restoring each entry's running state.
    fn drain_tx_queued(&mut self, now: Instant) {
        while let Some(&th) = self.tx_entry_queued.front() {
            let Some(e) = self.tx_entry(th) else {
                self.tx_entry_queued.pop_front();
                continue;
            };
            let state = e.state;
            let ctrl = e.queued_ctrl;
            let ent = match th {
                TxHandle::App(id) => EntryRef::Tx(id),
                TxHandle::ReadRsp(id) => EntryRef::ReadRsp(id),
            };
            let res = match state {
                TxState::QueuedCtrl => {
                    let Some(ctrl) = ctrl else {
                        self.tx_entry_queued.pop_front();
                        continue;
                    };
                    self.post_ctrl(ent, ctrl.pkt_type, ctrl.inject, now)
                }
                TxState::QueuedShmRma => self.post_ctrl(ent, PacketType::Rts, false, now),
                _ => {
                    let mut queued = match self.tx_entry_mut(th) {
                        Some(e) => mem::take(&mut e.queued_pkts),
                        None => VecDeque::new(),
                    };
                    let r = self.send_queued_pkts(&mut queued);
                    if let Some(e) = self.tx_entry_mut(th) {
                        e.queued_pkts = queued;
                    }
                    r
                }
            };
            match res {
                Ok(()) => {
                    self.tx_entry_queued.pop_front();
                    let relink = {
                        match self.tx_entry_mut(th) {
                            Some(e) => {
                                e.queued_ctrl = None;
                                match state {
                                    TxState::QueuedRtsRnr => {
                                        e.state = TxState::Rts;
                                        false
                                    }
                                    TxState::QueuedDataRnr => {
                                        e.state = TxState::Send;
                                        true
                                    }
                                    TxState::QueuedShmRma => {
                                        if e.state == TxState::QueuedShmRma {
                                            e.state = TxState::ShmRma;
                                        }
                                        false
                                    }
                                    _ => false,
                                }
                            }
                            None => false,
                        }
                    };
                    if relink && !self.tx_pending_list.contains(&th) {
                        self.tx_pending_list.push_back(th);
                    }
                }
                Err(e) if e.is_retryable() => break,
                Err(e) => {
                    self.tx_entry_queued.pop_front();
                    self.tx_error(th, e);
                }
            }
        }
    }

    /// Streams DATA for every pending entry while window and lower
    /// capacity remain. All but the last packet of a burst carry MORE.
    fn pump_tx_pending(&mut self, now: Instant) {
        let mut idx = 0;
        'outer: while idx < self.tx_pending_list.len() {
            let th = self.tx_pending_list[idx];
            let runnable = {
                match self.tx_entry(th) {
                    Some(e) => e.state == TxState::Send && e.window > 0 && e.bytes_left() > 0,
                    None => {
                        self.tx_pending_list.remove(idx);
                        continue;
                    }
                }
            };
            if !runnable {
                idx += 1;
                continue;
            }
            if let Some(e) = self.tx_entry_mut(th) {
                e.send_flags |= SendFlags::MORE;
            }
            loop {
                let (window, left) = match self.tx_entry(th) {
                    Some(e) => (e.window, e.bytes_left()),
                    None => break,
                };
                if window == 0 || left == 0 {
                    break;
                }
                if self.max_outstanding_tx - self.tx_pending <= 1
                    || window <= self.max_data_payload_size
                {
                    if let Some(e) = self.tx_entry_mut(th) {
                        e.send_flags.remove(SendFlags::MORE);
                    }
                }
                if self.tx_pending == self.max_outstanding_tx {
                    break 'outer;
                }
                match self.post_data(th, now) {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => {
                        if let Some(en) = self.tx_entry_mut(th) {
                            en.send_flags.remove(SendFlags::MORE);
                        }
                        break 'outer;
                    }
                    Err(e) => {
                        self.tx_error(th, e);
                        continue 'outer;
                    }
                }
            }
            if let Some(e) = self.tx_entry_mut(th) {
                e.send_flags.remove(SendFlags::MORE);
            }
            idx += 1;
        }
    }

    /// Builds and posts one DATA packet for a transmit entry, staging
    /// small segments through the packet buffer and sending registered
    /// segments by reference.
    pub(crate) fn post_data(&mut self, th: TxHandle, _now: Instant) -> Result<(), Error> {
        let (addr, rx_id, bytes_sent, window, left, has_reg) = {
            let e = self.tx_entry(th).ok_or(Error::UnknownEntry(th.id().0))?;
            let rx_id = e.rx_id.ok_or(Error::UnknownEntry(th.id().0))?;
            let has_reg = e.desc.iter().any(Option::is_some) || e.mr.iter().any(Option::is_some);
            (
                e.addr,
                rx_id,
                e.bytes_sent,
                e.window,
                e.bytes_left(),
                has_reg,
            )
        };
        let local = {
            let is_local = self.shm.is_some() && self.peers.get(addr).is_local;
            is_local
        };
        let pool = if local {
            PoolKind::TxShm
        } else {
            PoolKind::TxFabric
        };
        let payload_size = left.min(self.max_data_payload_size).min(window);
        let pkt_id = self.pkt_pool_mut(pool).acquire().ok_or(Error::Again)?;
        let pkt = PktRef { pool, id: pkt_id };

        let hdr = DataHdr {
            flags: PacketFlags::empty(),
            rx_id,
            seg_size: payload_size as u16,
            seg_offset: bytes_sent as u64,
        };
        if has_reg {
            self.post_data_vectored(th, pkt, hdr, payload_size, addr)?;
        } else {
            let mut scratch = vec![0u8; DATA_HDR_SIZE + payload_size];
            hdr.encode(&mut scratch);
            {
                let e = self.tx_entry(th).unwrap();
                crate::iovec::copy_from_iov(&mut scratch[DATA_HDR_SIZE..], &e.segments, bytes_sent);
            }
            {
                let p = self.pkt_pool_mut(pool).get_mut(pkt_id);
                p.buf[..scratch.len()].copy_from_slice(&scratch);
                p.pkt_size = scratch.len();
                p.peer = addr;
                p.owner = Some(match th {
                    TxHandle::App(id) => EntryRef::Tx(id),
                    TxHandle::ReadRsp(id) => EntryRef::ReadRsp(id),
                });
            }
            let flags = self.tx_entry(th).map_or(SendFlags::empty(), |e| e.send_flags);
            if let Err(e) = self.send_pkt(pkt, flags) {
                self.release_pkt(pkt);
                return Err(e);
            }
        }
        if let Some(e) = self.tx_entry_mut(th) {
            e.bytes_sent += payload_size;
            e.window -= payload_size;
        }
        Ok(())
    }

    /// Gather-list DATA: header and coalesced small segments come from
    /// the packet staging buffer; registered segments are referenced in
    /// place with their descriptors.
    fn post_data_vectored(
        &mut self,
        th: TxHandle,
        pkt: PktRef,
        hdr: DataHdr,
        payload_size: usize,
        addr: PeerAddr,
    ) -> Result<(), Error> {
        enum Frame {
            Staged(usize, usize),
            Seg(usize, usize, usize),
        }
        let owner = match th {
            TxHandle::App(id) => EntryRef::Tx(id),
            TxHandle::ReadRsp(id) => EntryRef::ReadRsp(id),
        };
        let send_flags = self.tx_entry(th).map_or(SendFlags::empty(), |e| e.send_flags);
        let bytes_sent = hdr.seg_offset as usize;

        // Phase one: stage the header plus small-segment runs into the
        // packet buffer and plan the gather list.
        let mut plan: Vec<Frame> = Vec::new();
        {
            let entries = match th {
                TxHandle::App(_) => &self.tx_entries,
                TxHandle::ReadRsp(_) => &self.readrsp_tx_entries,
            };
            let e = entries.get(th.id().0).ok_or(Error::UnknownEntry(th.id().0))?;
            let pool = match pkt.pool {
                PoolKind::TxShm => self.tx_pkt_shm.as_mut().expect("shm tx pool"),
                _ => &mut self.tx_pkt_fabric,
            };
            let p = pool.get_mut(pkt.id);
            hdr.encode(&mut p.buf);
            let mut cursor = crate::iovec::IovCursor::default();
            crate::iovec::seek(&e.segments, &mut cursor, bytes_sent);
            let mut staged_end = DATA_HDR_SIZE;
            let mut remaining = payload_size;
            while remaining > 0 && cursor.index < e.segments.len() {
                let registered =
                    e.mr[cursor.index].is_some() || e.desc[cursor.index].is_some();
                if registered {
                    let seg_left = e.segments[cursor.index].len() - cursor.offset;
                    let n = seg_left.min(remaining);
                    plan.push(Frame::Seg(cursor.index, cursor.offset, n));
                    if n == seg_left {
                        cursor.index += 1;
                        cursor.offset = 0;
                    } else {
                        cursor.offset += n;
                    }
                    remaining -= n;
                } else {
                    let n = crate::iovec::copy_from_cursor(
                        &mut p.buf[staged_end..staged_end + remaining],
                        &e.segments,
                        &e.mr,
                        &mut cursor,
                        remaining,
                    );
                    if n == 0 {
                        break;
                    }
                    plan.push(Frame::Staged(staged_end, n));
                    staged_end += n;
                    remaining -= n;
                }
            }
            p.pkt_size = staged_end;
            p.peer = addr;
            p.owner = Some(owner);
        }

        // Backoff and queue-depth gates, as for any packet.
        if self.peers.get(addr).in_backoff() {
            self.release_pkt(pkt);
            return Err(Error::Again);
        }
        let local = pkt.pool == PoolKind::TxShm;
        if !local && self.tx_pending == self.max_outstanding_tx {
            self.release_pkt(pkt);
            return Err(Error::Again);
        }

        // Phase two: assemble the gather list and hand it down.
        let ctx = Self::pkt_ctx(pkt);
        let res = {
            let entries = match th {
                TxHandle::App(_) => &self.tx_entries,
                TxHandle::ReadRsp(_) => &self.readrsp_tx_entries,
            };
            let e = entries.get(th.id().0).ok_or(Error::UnknownEntry(th.id().0))?;
            let pool = match pkt.pool {
                PoolKind::TxShm => self.tx_pkt_shm.as_ref().expect("shm tx pool"),
                _ => &self.tx_pkt_fabric,
            };
            let p = pool.get(pkt.id);
            let mut frames: Vec<&[u8]> = Vec::with_capacity(plan.len() + 1);
            let mut desc: Vec<Option<crate::lower::MrDesc>> = Vec::with_capacity(plan.len() + 1);
            frames.push(&p.buf[..DATA_HDR_SIZE]);
            desc.push(p.mr);
            for frame in &plan {
                match *frame {
                    Frame::Staged(off, len) => {
                        frames.push(&p.buf[off..off + len]);
                        desc.push(p.mr);
                    }
                    Frame::Seg(index, off, len) => {
                        frames.push(&e.segments[index][off..off + len]);
                        desc.push(e.desc[index].or(e.mr[index]));
                    }
                }
            }
            if local {
                self.shm
                    .as_mut()
                    .expect("shm endpoint")
                    .send(&frames, &desc, addr, ctx, send_flags)
            } else {
                self.fabric.send(&frames, &desc, addr, ctx, send_flags)
            }
        };
        match res {
            Ok(()) => {
                if !local {
                    self.tx_pending += 1;
                    let peer = self.peers.get(addr);
                    peer.tx_pending += 1;
                }
                Ok(())
            }
            Err(err) => {
                self.release_pkt(pkt);
                match err {
                    LowerError::Again | LowerError::Rnr => Err(Error::Again),
                    LowerError::Other(e) => Err(Error::Lower(e)),
                }
            }
        }
    }
}

impl Endpoint {
    pub(crate) fn alloc_readrsp_entry(
        &mut self,
        addr: PeerAddr,
        segments: Vec<Vec<u8>>,
        total: usize,
        window: usize,
        requester_rx: RxId,
        msg_id: MsgId,
    ) -> Option<TxId> {
        let nseg = segments.len();
        let id = self.readrsp_tx_entries.insert_with(|id| crate::transmit::TxEntry {
            tx_id: TxId(id),
            op: TxOp::ReadRsp,
            state: TxState::Rts,
            addr,
            segments,
            desc: vec![None; nseg],
            mr: vec![None; nseg],
            cursor: crate::iovec::IovCursor::default(),
            iov_mr_start: 0,
            total_len: total,
            bytes_sent: 0,
            bytes_acked: 0,
            window,
            credit_request: 0,
            tag: 0,
            msg_id,
            rx_id: Some(requester_rx),
            cq: crate::transmit::CqDescriptor {
                context: 0,
                flags: CompletionFlags::REMOTE_READ | CompletionFlags::RMA,
                data: 0,
                tag: 0,
                len: total,
            },
            cq_data: None,
            send_flags: SendFlags::empty(),
            queued_ctrl: None,
            queued_pkts: VecDeque::new(),
            rma_iov: smallvec::SmallVec::new(),
            shm_token: None,
        })?;
        Some(TxId(id))
    }
}
