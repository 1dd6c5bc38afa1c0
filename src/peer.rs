//! Per-peer state and the lazily populated peer directory.

use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::pool::PktRef;
use crate::protocol::{MsgId, PeerAddr};

/// Connection handshake progress with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    New,
    /// We sent an RTS carrying our raw address and await CONNACK.
    ConnReqSent,
    Acked,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RnrState: u8 {
        /// Peer reported receiver-not-ready; sends return try-again until
        /// the deadline passes.
        const IN_BACKOFF = 1 << 0;
        /// Set while the backoff deadline has not yet been re-checked.
        const BACKED_OFF = 1 << 1;
    }
}

/// Mutable per-peer state. Mutation happens only from the progress loop
/// and post paths, under the endpoint lock.
#[derive(Debug)]
pub struct Peer {
    pub conn_state: ConnState,
    /// Co-located peer reachable over the shared-memory side channel.
    pub is_local: bool,
    pub shm_addr: Option<PeerAddr>,
    /// Sender-side credit budget, replenished as transfers retire.
    pub tx_credits: u32,
    /// Receiver-side ceiling on window grants to this peer, rationed down
    /// as the address vector grows.
    pub rx_credits: u32,
    /// Packets in flight to this peer.
    pub tx_pending: u32,
    pub tx_init: bool,
    pub rx_init: bool,
    pub rnr_state: RnrState,
    pub rnr_ts: Option<Instant>,
    pub rnr_timeout: Duration,
    pub rnr_retries: u32,
    /// Next message sequence number to assign on send.
    pub next_msg_id: MsgId,
    /// Reorder window for incoming message starts, created on first recv.
    pub robuf: Option<Recvwin>,
}

impl Default for Peer {
    fn default() -> Self {
        Self {
            conn_state: ConnState::New,
            is_local: false,
            shm_addr: None,
            tx_credits: 0,
            rx_credits: 0,
            tx_pending: 0,
            tx_init: false,
            rx_init: false,
            rnr_state: RnrState::empty(),
            rnr_ts: None,
            rnr_timeout: Duration::ZERO,
            rnr_retries: 0,
            next_msg_id: MsgId(0),
            robuf: None,
        }
    }
}

impl Peer {
    pub fn in_backoff(&self) -> bool {
        self.rnr_state.contains(RnrState::IN_BACKOFF)
    }

    /// Enters or escalates backoff. The interval doubles per RNR up to
    /// the ceiling.
    pub fn enter_backoff(&mut self, now: Instant, initial: Duration, max: Duration) {
        if self.in_backoff() {
            self.rnr_retries += 1;
            self.rnr_timeout = (self.rnr_timeout * 2).min(max);
        } else {
            self.rnr_state = RnrState::IN_BACKOFF | RnrState::BACKED_OFF;
            self.rnr_retries = 0;
            self.rnr_timeout = initial;
        }
        self.rnr_ts = Some(now);
    }

    pub fn backoff_expired(&self, now: Instant) -> bool {
        match self.rnr_ts {
            Some(ts) => now.saturating_duration_since(ts) >= self.rnr_timeout,
            None => true,
        }
    }

    pub fn clear_backoff(&mut self) {
        self.rnr_state = RnrState::empty();
        self.rnr_ts = None;
    }
}

/// Circular reorder window over message sequence numbers. Holds the
/// packet reference of each out-of-order message start until the gap
/// before it closes.
#[derive(Debug)]
pub struct Recvwin {
    base: MsgId,
    slots: Vec<Option<PktRef>>,
}

impl Recvwin {
    pub fn new(size: usize, base: MsgId) -> Self {
        Self {
            base,
            slots: vec![None; size],
        }
    }

    /// The next message sequence expected in order.
    pub fn expected(&self) -> MsgId {
        self.base
    }

    /// Whether `id` falls inside the window starting at the expected
    /// sequence.
    pub fn in_window(&self, id: MsgId) -> bool {
        (id.wrapping_sub(self.base) as usize) < self.slots.len()
    }

    /// Whether `id` is older than the expected sequence (a duplicate).
    pub fn is_behind(&self, id: MsgId) -> bool {
        id.wrapping_sub(self.base) > u32::MAX / 2
    }

    pub fn insert(&mut self, id: MsgId, pkt: PktRef) -> bool {
        if !self.in_window(id) {
            return false;
        }
        let idx = (id.0 as usize) % self.slots.len();
        if self.slots[idx].is_some() {
            return false;
        }
        self.slots[idx] = Some(pkt);
        true
    }

    /// Advances past the expected sequence.
    pub fn advance(&mut self) {
        self.base = self.base.wrapping_add(1);
    }

    /// Takes the buffered packet at the expected sequence, if any.
    pub fn take_expected(&mut self) -> Option<PktRef> {
        let idx = (self.base.0 as usize) % self.slots.len();
        self.slots[idx].take()
    }

    /// Drains every buffered packet, for teardown.
    pub fn drain(&mut self) -> Vec<PktRef> {
        self.slots.iter_mut().filter_map(|s| s.take()).collect()
    }
}

/// Mapping from peer handle to per-peer state. Peers are created lazily
/// on first reference; the directory is sized after address-vector
/// binding.
#[derive(Default)]
pub struct PeerDirectory {
    peers: Vec<Option<Peer>>,
    av_used: usize,
}

impl PeerDirectory {
    /// Sizes the directory for the bound address vector.
    pub fn bind(&mut self, av_count: usize) {
        if av_count > self.peers.len() {
            self.peers.resize_with(av_count, || None);
        }
    }

    pub fn get(&mut self, addr: PeerAddr) -> &mut Peer {
        let idx = addr.0 as usize;
        if idx >= self.peers.len() {
            self.peers.resize_with(idx + 1, || None);
        }
        let slot = &mut self.peers[idx];
        if slot.is_none() {
            *slot = Some(Peer::default());
            self.av_used += 1;
        }
        slot.as_mut().unwrap()
    }

    pub fn peek(&self, addr: PeerAddr) -> Option<&Peer> {
        self.peers.get(addr.0 as usize).and_then(|p| p.as_ref())
    }

    /// Number of peers the endpoint actively tracks.
    pub fn av_used(&self) -> usize {
        self.av_used
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PeerAddr, &mut Peer)> {
        self.peers
            .iter_mut()
            .enumerate()
            .filter_map(|(i, p)| p.as_mut().map(|p| (PeerAddr(i as u64), p)))
    }
}
