//! In-memory lower transports for driving two endpoints against each
//! other deterministically: posted-buffer accounting, receiver-not-ready
//! on exhaustion, optional held deliveries for reordering, and a shared
//! medium for the shm side channel.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use fabric_sequenced::lower::{MrDesc, SendFlags};
use fabric_sequenced::{
    Config, CqEvent, Domain, Endpoint, LowerCqEntry, LowerEndpoint, LowerError, MrHandle,
    PeerAddr, ShmEndpoint,
};

pub struct Node {
    posted: VecDeque<u64>,
    cq: VecDeque<LowerCqEntry>,
    name: Vec<u8>,
    /// Sends to fail immediately with queue-full.
    pub send_fail: usize,
}

struct Delivery {
    dest: u64,
    src: u64,
    bytes: Vec<u8>,
}

pub struct Net {
    nodes: HashMap<u64, Node>,
    /// When set, deliveries are buffered until released.
    pub hold: bool,
    held: Vec<Delivery>,
    /// First byte of every packet handed to the medium, in send order.
    pub sent_types: Vec<u8>,
}

impl Net {
    pub fn new() -> Rc<RefCell<Net>> {
        Rc::new(RefCell::new(Net {
            nodes: HashMap::new(),
            hold: false,
            held: Vec::new(),
            sent_types: Vec::new(),
        }))
    }
}

fn deliver(net: &mut Net, dest: u64, src: u64, bytes: Vec<u8>) -> Result<(), LowerError> {
    match net.nodes.get_mut(&dest) {
        Some(d) => match d.posted.pop_front() {
            Some(slot) => {
                d.cq.push_back(LowerCqEntry::Recv {
                    ctx: slot,
                    bytes,
                    src: Some(PeerAddr(src)),
                });
                Ok(())
            }
            None => Err(LowerError::Rnr),
        },
        None => Err(LowerError::Other(22)),
    }
}

pub fn release_held(net: &Rc<RefCell<Net>>, order: &[usize]) {
    let mut net = net.borrow_mut();
    let held = std::mem::take(&mut net.held);
    for &i in order {
        let d = &held[i];
        let _ = deliver(&mut net, d.dest, d.src, d.bytes.clone());
    }
}

pub fn held_count(net: &Rc<RefCell<Net>>) -> usize {
    net.borrow().held.len()
}

pub fn set_send_fail(net: &Rc<RefCell<Net>>, addr: u64, count: usize) {
    net.borrow_mut().nodes.get_mut(&addr).unwrap().send_fail = count;
}

pub fn posted_slots(net: &Rc<RefCell<Net>>, addr: u64) -> usize {
    net.borrow().nodes.get(&addr).unwrap().posted.len()
}

/// Counts packets of one wire type the medium has carried.
pub fn sent_of_type(net: &Rc<RefCell<Net>>, type_byte: u8) -> usize {
    net.borrow()
        .sent_types
        .iter()
        .filter(|&&t| t == type_byte)
        .count()
}

pub struct FakeFabric {
    net: Rc<RefCell<Net>>,
    addr: u64,
}

impl FakeFabric {
    pub fn new(net: &Rc<RefCell<Net>>, addr: u64) -> Self {
        net.borrow_mut().nodes.insert(
            addr,
            Node {
                posted: VecDeque::new(),
                cq: VecDeque::new(),
                name: addr.to_le_bytes().to_vec(),
                send_fail: 0,
            },
        );
        Self {
            net: Rc::clone(net),
            addr,
        }
    }
}

impl LowerEndpoint for FakeFabric {
    fn send(
        &mut self,
        frames: &[&[u8]],
        _desc: &[Option<MrDesc>],
        dest: PeerAddr,
        ctx: u64,
        flags: SendFlags,
    ) -> Result<(), LowerError> {
        let mut net = self.net.borrow_mut();
        {
            let me = net.nodes.get_mut(&self.addr).unwrap();
            if me.send_fail > 0 {
                me.send_fail -= 1;
                return Err(LowerError::Again);
            }
        }
        let bytes: Vec<u8> = frames.concat();
        if let Some(&t) = bytes.first() {
            net.sent_types.push(t);
        }
        let inject = flags.contains(SendFlags::INJECT);
        let outcome = if net.hold {
            net.held.push(Delivery {
                dest: dest.0,
                src: self.addr,
                bytes,
            });
            Ok(())
        } else {
            deliver(&mut net, dest.0, self.addr, bytes)
        };
        if !inject {
            let me = net.nodes.get_mut(&self.addr).unwrap();
            me.cq.push_back(match outcome {
                Ok(()) => LowerCqEntry::SendOk { ctx },
                Err(err) => LowerCqEntry::SendErr { ctx, err },
            });
        }
        Ok(())
    }

    fn post_recv(&mut self, ctx: u64, _capacity: usize) -> Result<(), LowerError> {
        let mut net = self.net.borrow_mut();
        net.nodes.get_mut(&self.addr).unwrap().posted.push_back(ctx);
        Ok(())
    }

    fn read_cq(&mut self) -> Option<LowerCqEntry> {
        self.net
            .borrow_mut()
            .nodes
            .get_mut(&self.addr)?
            .cq
            .pop_front()
    }

    fn getname(&self) -> Vec<u8> {
        self.net.borrow().nodes.get(&self.addr).unwrap().name.clone()
    }

    fn setname(&mut self, name: &[u8]) {
        self.net.borrow_mut().nodes.get_mut(&self.addr).unwrap().name = name.to_vec();
    }
}

/// The shared-memory medium: a second datagram channel plus mapped
/// regions for cross-process reads.
pub struct ShmMedium {
    regions: HashMap<u64, Vec<u8>>,
    next_token: u64,
    /// Reads to fail with try-again.
    pub read_fail: usize,
}

impl ShmMedium {
    pub fn new() -> Rc<RefCell<ShmMedium>> {
        Rc::new(RefCell::new(ShmMedium {
            regions: HashMap::new(),
            next_token: 1,
            read_fail: 0,
        }))
    }
}

pub fn shm_region_count(medium: &Rc<RefCell<ShmMedium>>) -> usize {
    medium.borrow().regions.len()
}

pub struct FakeShm {
    fabric: FakeFabric,
    medium: Rc<RefCell<ShmMedium>>,
}

impl FakeShm {
    pub fn new(net: &Rc<RefCell<Net>>, medium: &Rc<RefCell<ShmMedium>>, addr: u64) -> Self {
        Self {
            fabric: FakeFabric::new(net, addr),
            medium: Rc::clone(medium),
        }
    }
}

impl LowerEndpoint for FakeShm {
    fn send(
        &mut self,
        frames: &[&[u8]],
        desc: &[Option<MrDesc>],
        dest: PeerAddr,
        ctx: u64,
        flags: SendFlags,
    ) -> Result<(), LowerError> {
        self.fabric.send(frames, desc, dest, ctx, flags)
    }

    fn post_recv(&mut self, ctx: u64, capacity: usize) -> Result<(), LowerError> {
        self.fabric.post_recv(ctx, capacity)
    }

    fn read_cq(&mut self) -> Option<LowerCqEntry> {
        self.fabric.read_cq()
    }

    fn getname(&self) -> Vec<u8> {
        self.fabric.getname()
    }

    fn setname(&mut self, name: &[u8]) {
        self.fabric.setname(name)
    }
}

impl ShmEndpoint for FakeShm {
    fn share(&mut self, bytes: Vec<u8>) -> u64 {
        let mut m = self.medium.borrow_mut();
        let token = m.next_token;
        m.next_token += 1;
        m.regions.insert(token, bytes);
        token
    }

    fn unshare(&mut self, token: u64) {
        self.medium.borrow_mut().regions.remove(&token);
    }

    fn rma_read(
        &mut self,
        _src: PeerAddr,
        token: u64,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<(), LowerError> {
        let mut m = self.medium.borrow_mut();
        if m.read_fail > 0 {
            m.read_fail -= 1;
            return Err(LowerError::Again);
        }
        let region = m.regions.get(&token).ok_or(LowerError::Other(14))?;
        let start = offset as usize;
        let end = start + dst.len();
        if end > region.len() {
            return Err(LowerError::Other(14));
        }
        dst.copy_from_slice(&region[start..end]);
        Ok(())
    }
}

/// Registration bookkeeping so tests can assert reg/dereg balance.
pub struct FakeDomain {
    next: u64,
    pub live: Rc<RefCell<i64>>,
}

impl FakeDomain {
    pub fn new() -> (Self, Rc<RefCell<i64>>) {
        let live = Rc::new(RefCell::new(0));
        (
            Self {
                next: 1,
                live: Rc::clone(&live),
            },
            live,
        )
    }
}

impl Domain for FakeDomain {
    fn mr_reg(&mut self, _len: usize) -> Result<MrHandle, LowerError> {
        let h = MrHandle(self.next);
        self.next += 1;
        *self.live.borrow_mut() += 1;
        Ok(h)
    }

    fn mr_close(&mut self, _mr: MrHandle) {
        *self.live.borrow_mut() -= 1;
    }
}

pub struct Harness {
    pub a: Endpoint,
    pub b: Endpoint,
    pub net: Rc<RefCell<Net>>,
    pub shm_net: Rc<RefCell<Net>>,
    pub medium: Rc<RefCell<ShmMedium>>,
}

pub const ADDR_A: PeerAddr = PeerAddr(1);
pub const ADDR_B: PeerAddr = PeerAddr(2);
const SHM_A: u64 = 101;
const SHM_B: u64 = 102;

/// A connected endpoint pair over the fake fabric (and fake shm medium).
pub fn pair(cfg: Config) -> Harness {
    let net = Net::new();
    let shm_net = Net::new();
    let medium = ShmMedium::new();

    let mut a = Endpoint::new(
        cfg.clone(),
        Box::new(FakeFabric::new(&net, ADDR_A.0)),
        Some(Box::new(FakeShm::new(&shm_net, &medium, SHM_A))),
        Box::new(FakeDomain::new().0),
    )
    .unwrap();
    let mut b = Endpoint::new(
        cfg,
        Box::new(FakeFabric::new(&net, ADDR_B.0)),
        Some(Box::new(FakeShm::new(&shm_net, &medium, SHM_B))),
        Box::new(FakeDomain::new().0),
    )
    .unwrap();

    a.bind_av(4);
    b.bind_av(4);
    a.enable().unwrap();
    b.enable().unwrap();
    Harness {
        a,
        b,
        net,
        shm_net,
        medium,
    }
}

/// Marks the pair as co-located so traffic takes the shm side channel.
pub fn make_local(h: &mut Harness) {
    h.a.set_local_peer(ADDR_B, PeerAddr(SHM_B));
    h.b.set_local_peer(ADDR_A, PeerAddr(SHM_A));
}

/// A config scaled down for tests: small pools, deterministic knobs.
pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.mtu_size = 4096;
    cfg.tx_pkt_count = 64;
    cfg.rx_pkt_count = 64;
    cfg.shm_tx_pkt_count = 32;
    cfg.shm_rx_pkt_count = 32;
    cfg.tx_size = 32;
    cfg.rx_size = 64;
    cfg.max_outstanding_tx = 32;
    cfg.recvwin_size = 64;
    cfg
}

/// Ticks both endpoints until `done` reports true or the round budget is
/// spent, panicking on timeout.
pub fn drive(h: &mut Harness, rounds: usize, mut done: impl FnMut(&mut Harness) -> bool) {
    let now = Instant::now();
    for _ in 0..rounds {
        h.a.progress(now);
        h.b.progress(now);
        if done(h) {
            return;
        }
    }
    panic!("harness did not settle within {} rounds", rounds);
}

/// Ticks both endpoints a fixed number of rounds.
pub fn run(h: &mut Harness, rounds: usize) {
    let now = Instant::now();
    for _ in 0..rounds {
        h.a.progress(now);
        h.b.progress(now);
    }
}

/// Drains every completion currently queued on an endpoint.
pub fn drain_cq(ep: &mut Endpoint) -> Vec<CqEvent> {
    let mut out = Vec::new();
    while let Some(ev) = ep.poll_cq() {
        out.push(ev);
    }
    out
}

/// One flat buffer as a single-segment iov.
pub fn seg(bytes: Vec<u8>) -> Vec<Vec<u8>> {
    vec![bytes]
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn flatten(buf: &[Vec<u8>]) -> Vec<u8> {
    buf.concat()
}
