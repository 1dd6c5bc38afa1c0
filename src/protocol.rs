//! On-wire packet layouts.
//!
//! All headers are little-endian and packed at fixed offsets so a receiver
//! can dispatch on the base header before consuming the variant. Unknown
//! flag bits are ignored; unknown types and version mismatches are fatal
//! packet errors.

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::error::Error;

/// Current protocol version. Receivers drop packets from other versions.
pub const PROTOCOL_VERSION: u8 = 3;

macro_rules! wire_id {
    ($name:ident, $inner:ty, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub $inner);

        impl From<$inner> for $name {
            fn from(val: $inner) -> Self {
                $name(val)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

wire_id!(
    TxId,
    u32,
    "Transmit entry id. Equals the entry's index in its pool."
);
wire_id!(
    RxId,
    u32,
    "Receive entry id. Equals the entry's index in its pool."
);
wire_id!(
    MsgId,
    u32,
    "Per-peer message sequence number assigned at send time."
);
wire_id!(PeerAddr, u64, "Opaque peer handle from the address vector.");

impl MsgId {
    pub fn wrapping_add(self, val: u32) -> Self {
        MsgId(self.0.wrapping_add(val))
    }
    pub fn wrapping_sub(self, other: MsgId) -> u32 {
        self.0.wrapping_sub(other.0)
    }
}

/// The transport-level packet type, first byte of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Rts = 1,
    Connack = 2,
    Cts = 3,
    Data = 4,
    ReadRsp = 5,
    Eor = 6,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Result<Self, Error> {
        match v {
            1 => Ok(PacketType::Rts),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Cts),
            4 => Ok(PacketType::Data),
            5 => Ok(PacketType::ReadRsp),
            6 => Ok(PacketType::Eor),
            other => Err(Error::InvalidPacketType(other)),
        }
    }
}

bitflags! {
    /// Base-header flag bits. Forward compatible: unknown bits are ignored
    /// on receive except those that change packet length (`addrlen`,
    /// `cq_data`), which are mandatory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u16 {
        /// Tagged message.
        const TAGGED          = 1 << 0;
        /// A remote-completion data word follows the RTS header.
        const REMOTE_CQ_DATA  = 1 << 1;
        /// The initiator's raw core address follows the RTS header.
        const REMOTE_SRC_ADDR = 1 << 2;
        /// The RTS carries a credit request.
        const CREDIT_REQUEST  = 1 << 3;
        /// Packet travels on the shared-memory side channel.
        const SHM_HDR         = 1 << 4;
        /// The whole payload is inlined in an shm RTS.
        const SHM_HDR_DATA    = 1 << 5;
        /// CTS/EOR answering a read request; ids refer to the read-response
        /// entry pool.
        const READ_REQ        = 1 << 6;
        /// RMA write: an rma-iov table precedes the payload.
        const RMA_WRITE       = 1 << 7;
    }
}

pub const BASE_HDR_SIZE: usize = 4;
pub const RTS_HDR_SIZE: usize = 32;
pub const CONNACK_HDR_SIZE: usize = BASE_HDR_SIZE;
pub const CTS_HDR_SIZE: usize = 20;
pub const DATA_HDR_SIZE: usize = 20;
pub const READRSP_HDR_SIZE: usize = 24;
pub const EOR_HDR_SIZE: usize = 12;
/// One (key, offset, len) triple in an rma-iov table.
pub const RMA_IOV_LEN: usize = 24;

/// Base header shared by every packet: `{type, version, flags}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseHdr {
    pub pkt_type: PacketType,
    pub version: u8,
    pub flags: PacketFlags,
}

impl BaseHdr {
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        need(buf, BASE_HDR_SIZE)?;
        let pkt_type = PacketType::from_u8(buf[0])?;
        if buf[1] != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion(buf[1]));
        }
        Ok(BaseHdr {
            pkt_type,
            version: buf[1],
            flags: PacketFlags::from_bits_truncate(get_u16(buf, 2)),
        })
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.pkt_type as u8;
        buf[1] = self.version;
        put_u16(buf, 2, self.flags.bits());
    }
}

/// One segment of an RMA iov table: (key, offset, len) into a registered
/// region on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaIov {
    pub key: u64,
    pub offset: u64,
    pub len: u64,
}

/// Request-to-send. Opens a transfer; may inline the whole payload (eager)
/// or carry metadata only (rendezvous).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtsHdr {
    pub flags: PacketFlags,
    pub credit_request: u16,
    pub addrlen: u16,
    pub tx_id: TxId,
    pub msg_id: MsgId,
    pub tag: u64,
    pub data_len: u64,
}

impl RtsHdr {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        BaseHdr {
            pkt_type: PacketType::Rts,
            version: PROTOCOL_VERSION,
            flags: self.flags,
        }
        .encode(buf);
        put_u16(buf, 4, self.credit_request);
        put_u16(buf, 6, self.addrlen);
        put_u32(buf, 8, self.tx_id.0);
        put_u32(buf, 12, self.msg_id.0);
        put_u64(buf, 16, self.tag);
        put_u64(buf, 24, self.data_len);
        RTS_HDR_SIZE
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let base = BaseHdr::decode(buf)?;
        need(buf, RTS_HDR_SIZE)?;
        Ok(RtsHdr {
            flags: base.flags,
            credit_request: get_u16(buf, 4),
            addrlen: get_u16(buf, 6),
            tx_id: TxId(get_u32(buf, 8)),
            msg_id: MsgId(get_u32(buf, 12)),
            tag: get_u64(buf, 16),
            data_len: get_u64(buf, 24),
        })
    }

    /// Byte offset of the payload region: header, then the optional
    /// cq-data word, then the optional piggybacked source address.
    pub fn payload_offset(&self) -> usize {
        let mut off = RTS_HDR_SIZE;
        if self.flags.contains(PacketFlags::REMOTE_CQ_DATA) {
            off += 8;
        }
        if self.flags.contains(PacketFlags::REMOTE_SRC_ADDR) {
            off += self.addrlen as usize;
        }
        off
    }

    pub fn cq_data(&self, buf: &[u8]) -> Option<u64> {
        if self.flags.contains(PacketFlags::REMOTE_CQ_DATA) {
            Some(get_u64(buf, RTS_HDR_SIZE))
        } else {
            None
        }
    }

    pub fn src_addr<'a>(&self, buf: &'a [u8]) -> Option<&'a [u8]> {
        if self.flags.contains(PacketFlags::REMOTE_SRC_ADDR) {
            let mut off = RTS_HDR_SIZE;
            if self.flags.contains(PacketFlags::REMOTE_CQ_DATA) {
                off += 8;
            }
            Some(&buf[off..off + self.addrlen as usize])
        } else {
            None
        }
    }
}

/// Clear-to-send: grants the sender a byte window for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtsHdr {
    pub flags: PacketFlags,
    pub tx_id: TxId,
    pub rx_id: RxId,
    pub window: u64,
}

impl CtsHdr {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        BaseHdr {
            pkt_type: PacketType::Cts,
            version: PROTOCOL_VERSION,
            flags: self.flags,
        }
        .encode(buf);
        put_u32(buf, 4, self.tx_id.0);
        put_u32(buf, 8, self.rx_id.0);
        put_u64(buf, 12, self.window);
        CTS_HDR_SIZE
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let base = BaseHdr::decode(buf)?;
        need(buf, CTS_HDR_SIZE)?;
        Ok(CtsHdr {
            flags: base.flags,
            tx_id: TxId(get_u32(buf, 4)),
            rx_id: RxId(get_u32(buf, 8)),
            window: get_u64(buf, 12),
        })
    }
}

/// One slice of a long transfer, addressed by the receiver's entry id and
/// absolute byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHdr {
    pub flags: PacketFlags,
    pub rx_id: RxId,
    pub seg_size: u16,
    pub seg_offset: u64,
}

impl DataHdr {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        BaseHdr {
            pkt_type: PacketType::Data,
            version: PROTOCOL_VERSION,
            flags: self.flags,
        }
        .encode(buf);
        put_u32(buf, 4, self.rx_id.0);
        put_u16(buf, 8, self.seg_size);
        put_u16(buf, 10, 0);
        put_u64(buf, 12, self.seg_offset);
        DATA_HDR_SIZE
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let base = BaseHdr::decode(buf)?;
        need(buf, DATA_HDR_SIZE)?;
        Ok(DataHdr {
            flags: base.flags,
            rx_id: RxId(get_u32(buf, 4)),
            seg_size: get_u16(buf, 8),
            seg_offset: get_u64(buf, 12),
        })
    }
}

/// First response to a read request. Carries the responder's entry id so
/// later CTS and EOR can address it, plus the first data slice; subsequent
/// slices flow as DATA packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRspHdr {
    pub flags: PacketFlags,
    pub tx_id: TxId,
    pub rx_id: RxId,
    pub seg_size: u16,
    pub seg_offset: u64,
}

impl ReadRspHdr {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        BaseHdr {
            pkt_type: PacketType::ReadRsp,
            version: PROTOCOL_VERSION,
            flags: self.flags,
        }
        .encode(buf);
        put_u32(buf, 4, self.tx_id.0);
        put_u32(buf, 8, self.rx_id.0);
        put_u16(buf, 12, self.seg_size);
        put_u16(buf, 14, 0);
        put_u64(buf, 16, self.seg_offset);
        READRSP_HDR_SIZE
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let base = BaseHdr::decode(buf)?;
        need(buf, READRSP_HDR_SIZE)?;
        Ok(ReadRspHdr {
            flags: base.flags,
            tx_id: TxId(get_u32(buf, 4)),
            rx_id: RxId(get_u32(buf, 8)),
            seg_size: get_u16(buf, 12),
            seg_offset: get_u64(buf, 16),
        })
    }
}

/// End-of-read marker, sent by the data receiver to release the data
/// sender's waiting entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EorHdr {
    pub flags: PacketFlags,
    pub tx_id: TxId,
    pub rx_id: RxId,
}

impl EorHdr {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        BaseHdr {
            pkt_type: PacketType::Eor,
            version: PROTOCOL_VERSION,
            flags: self.flags,
        }
        .encode(buf);
        put_u32(buf, 4, self.tx_id.0);
        put_u32(buf, 8, self.rx_id.0);
        EOR_HDR_SIZE
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let base = BaseHdr::decode(buf)?;
        need(buf, EOR_HDR_SIZE)?;
        Ok(EorHdr {
            flags: base.flags,
            tx_id: TxId(get_u32(buf, 4)),
            rx_id: RxId(get_u32(buf, 8)),
        })
    }
}

/// First-contact acknowledgement, base header only.
pub fn encode_connack(buf: &mut [u8]) -> usize {
    BaseHdr {
        pkt_type: PacketType::Connack,
        version: PROTOCOL_VERSION,
        flags: PacketFlags::empty(),
    }
    .encode(buf);
    CONNACK_HDR_SIZE
}

/// Appends an rma-iov table at `off`, returning the new offset.
pub fn encode_rma_iov_table(buf: &mut [u8], mut off: usize, iov: &[RmaIov]) -> usize {
    put_u64(buf, off, iov.len() as u64);
    off += 8;
    for seg in iov {
        put_u64(buf, off, seg.key);
        put_u64(buf, off + 8, seg.offset);
        put_u64(buf, off + 16, seg.len);
        off += RMA_IOV_LEN;
    }
    off
}

/// Reads an rma-iov table at `off`, returning the table and the offset
/// past it.
pub fn decode_rma_iov_table(
    buf: &[u8],
    mut off: usize,
) -> Result<(SmallVec<[RmaIov; 4]>, usize), Error> {
    need(buf, off + 8)?;
    let count = get_u64(buf, off) as usize;
    off += 8;
    need(buf, off + count * RMA_IOV_LEN)?;
    let mut iov = SmallVec::new();
    for _ in 0..count {
        iov.push(RmaIov {
            key: get_u64(buf, off),
            offset: get_u64(buf, off + 8),
            len: get_u64(buf, off + 16),
        });
        off += RMA_IOV_LEN;
    }
    Ok((iov, off))
}

fn need(buf: &[u8], len: usize) -> Result<(), Error> {
    if buf.len() < len {
        return Err(Error::TruncatedPacket {
            need: len,
            have: buf.len(),
        });
    }
    Ok(())
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}
