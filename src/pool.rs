//! Fixed-capacity pools for packet entries and logical transfer entries.
//!
//! Packet pools preallocate every MTU-sized buffer up front and hand out
//! indices from a free list; when the lower transport requires local
//! registration, each buffer is registered at construction and
//! deregistered at teardown. Logical-entry pools are slab-backed so an
//! entry's id is its slab key, which is also its wire id.

use slab::Slab;
use tracing::warn;

use crate::error::Error;
use crate::lower::{Domain, MrHandle};
use crate::protocol::{PeerAddr, RxId, TxId};

/// Index of a packet entry within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId(pub u32);

/// Which pool a packet entry lives in. Doubles as the provenance tag:
/// `RxFabric`/`RxShm` entries were posted for recv, `UnexpCopy` and
/// `OooCopy` hold copied packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    TxFabric,
    RxFabric,
    TxShm,
    RxShm,
    UnexpCopy,
    OooCopy,
}

/// A packet entry addressed by pool and index. Never on more than one
/// list at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PktRef {
    pub pool: PoolKind,
    pub id: PacketId,
}

/// The logical entry a live packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRef {
    Tx(TxId),
    ReadRsp(TxId),
    Rx(RxId),
}

/// One on-wire packet plus bookkeeping.
#[derive(Debug)]
pub struct PacketEntry {
    pub buf: Box<[u8]>,
    pub pkt_size: usize,
    /// Destination (TX) or source (RX) peer.
    pub peer: PeerAddr,
    pub owner: Option<EntryRef>,
    pub mr: Option<MrHandle>,
    in_use: bool,
}

impl PacketEntry {
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.pkt_size]
    }
}

/// Slab allocator of packet entries with O(1) acquire/release.
pub struct PacketPool {
    entries: Vec<PacketEntry>,
    free: Vec<u32>,
}

impl PacketPool {
    /// Preallocates `capacity` MTU-sized entries, registering each buffer
    /// when a domain is supplied.
    pub fn new(
        capacity: usize,
        mtu: usize,
        domain: Option<&mut dyn Domain>,
    ) -> Result<Self, Error> {
        let mut entries = Vec::with_capacity(capacity);
        let mut free = Vec::with_capacity(capacity);
        match domain {
            Some(domain) => {
                for i in 0..capacity {
                    let mr = domain.mr_reg(mtu).map_err(|_| Error::MrRegFailed)?;
                    entries.push(Self::blank(mtu, Some(mr)));
                    free.push(i as u32);
                }
            }
            None => {
                for i in 0..capacity {
                    entries.push(Self::blank(mtu, None));
                    free.push(i as u32);
                }
            }
        }
        free.reverse();
        Ok(Self { entries, free })
    }

    fn blank(mtu: usize, mr: Option<MrHandle>) -> PacketEntry {
        PacketEntry {
            buf: vec![0u8; mtu].into_boxed_slice(),
            pkt_size: 0,
            peer: PeerAddr(0),
            owner: None,
            mr,
            in_use: false,
        }
    }

    /// `None` iff the pool is exhausted.
    pub fn acquire(&mut self) -> Option<PacketId> {
        let idx = self.free.pop()?;
        let entry = &mut self.entries[idx as usize];
        entry.pkt_size = 0;
        entry.peer = PeerAddr(0);
        entry.owner = None;
        entry.in_use = true;
        Some(PacketId(idx))
    }

    pub fn release(&mut self, id: PacketId) {
        let entry = &mut self.entries[id.0 as usize];
        if !entry.in_use {
            warn!("double release of packet entry {}", id.0);
            return;
        }
        entry.in_use = false;
        self.free.push(id.0);
    }

    pub fn get(&self, id: PacketId) -> &PacketEntry {
        &self.entries[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: PacketId) -> &mut PacketEntry {
        &mut self.entries[id.0 as usize]
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Deregisters every buffer. Called on endpoint teardown.
    pub fn close(&mut self, domain: &mut dyn Domain) {
        for entry in &mut self.entries {
            if let Some(mr) = entry.mr.take() {
                domain.mr_close(mr);
            }
        }
    }
}

/// Slab-backed pool of logical entries. An entry's id equals its slab
/// key; ids are reused only after the transfer terminates and releases
/// the entry.
pub struct EntryPool<T> {
    slab: Slab<T>,
    capacity: usize,
}

impl<T> EntryPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            capacity,
        }
    }

    /// Allocates an entry built from its own id. `None` iff exhausted.
    pub fn insert_with(&mut self, f: impl FnOnce(u32) -> T) -> Option<u32> {
        if self.slab.len() >= self.capacity {
            return None;
        }
        let entry = self.slab.vacant_entry();
        let id = entry.key() as u32;
        entry.insert(f(id));
        Some(id)
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.slab.get(id as usize)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slab.get_mut(id as usize)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.slab.try_remove(id as usize)
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slab.iter().map(|(k, v)| (k as u32, v))
    }
}
