use proptest::prelude::*;

use fabric_sequenced::protocol::{
    CtsHdr, DataHdr, EorHdr, MsgId, PacketFlags, ReadRspHdr, RtsHdr, RxId, TxId,
};

proptest! {
    #[test]
    fn test_rts_header_roundtrip(
        credit_request in any::<u16>(),
        tx_id in any::<u32>(),
        msg_id in any::<u32>(),
        tag in any::<u64>(),
        data_len in any::<u64>(),
        tagged in any::<bool>(),
        cq_data in any::<bool>(),
    ) {
        let mut flags = PacketFlags::CREDIT_REQUEST;
        if tagged {
            flags |= PacketFlags::TAGGED;
        }
        if cq_data {
            flags |= PacketFlags::REMOTE_CQ_DATA;
        }
        let hdr = RtsHdr {
            flags,
            credit_request,
            addrlen: 0,
            tx_id: TxId(tx_id),
            msg_id: MsgId(msg_id),
            tag,
            data_len,
        };
        let mut buf = vec![0u8; 64];
        hdr.encode(&mut buf);
        prop_assert_eq!(RtsHdr::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_cts_header_roundtrip(
        tx_id in any::<u32>(),
        rx_id in any::<u32>(),
        window in any::<u64>(),
        read in any::<bool>(),
    ) {
        let hdr = CtsHdr {
            flags: if read { PacketFlags::READ_REQ } else { PacketFlags::empty() },
            tx_id: TxId(tx_id),
            rx_id: RxId(rx_id),
            window,
        };
        let mut buf = vec![0u8; 32];
        hdr.encode(&mut buf);
        prop_assert_eq!(CtsHdr::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_data_header_roundtrip(
        rx_id in any::<u32>(),
        seg_size in any::<u16>(),
        seg_offset in any::<u64>(),
    ) {
        let hdr = DataHdr {
            flags: PacketFlags::empty(),
            rx_id: RxId(rx_id),
            seg_size,
            seg_offset,
        };
        let mut buf = vec![0u8; 32];
        hdr.encode(&mut buf);
        prop_assert_eq!(DataHdr::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_readrsp_header_roundtrip(
        tx_id in any::<u32>(),
        rx_id in any::<u32>(),
        seg_size in any::<u16>(),
        seg_offset in any::<u64>(),
    ) {
        let hdr = ReadRspHdr {
            flags: PacketFlags::READ_REQ,
            tx_id: TxId(tx_id),
            rx_id: RxId(rx_id),
            seg_size,
            seg_offset,
        };
        let mut buf = vec![0u8; 32];
        hdr.encode(&mut buf);
        prop_assert_eq!(ReadRspHdr::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_eor_header_roundtrip(tx_id in any::<u32>(), rx_id in any::<u32>()) {
        let hdr = EorHdr {
            flags: PacketFlags::empty(),
            tx_id: TxId(tx_id),
            rx_id: RxId(rx_id),
        };
        let mut buf = vec![0u8; 16];
        hdr.encode(&mut buf);
        prop_assert_eq!(EorHdr::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_iov_copy_roundtrip(
        data in prop::collection::vec(any::<u8>(), 1..4096),
        cut1 in 0usize..4096,
        cut2 in 0usize..4096,
        offset in 0usize..512,
    ) {
        let len = data.len();
        let a = cut1 % len;
        let b = a + (cut2 % (len - a + 1));
        let segs = vec![
            data[..a].to_vec(),
            data[a..b].to_vec(),
            data[b..].to_vec(),
        ];
        let offset = offset % len;

        let mut out = vec![0u8; len - offset];
        let copied = fabric_sequenced::iovec::copy_from_iov(&mut out, &segs, offset);
        prop_assert_eq!(copied, len - offset);
        prop_assert_eq!(out.as_slice(), &data[offset..]);

        let mut target = vec![vec![0u8; a], vec![0u8; b - a], vec![0u8; len - b]];
        let wrote = fabric_sequenced::iovec::copy_to_iov(&mut target, offset, &out);
        prop_assert_eq!(wrote, len - offset);
        prop_assert_eq!(target.concat()[offset..].to_vec(), data[offset..].to_vec());
    }
}
