mod common;

use common::*;
use fabric_sequenced::peer::Recvwin;
use fabric_sequenced::pool::{PacketId, PktRef, PoolKind};
use fabric_sequenced::protocol::MsgId;
use fabric_sequenced::{CqEvent, RecvRequest, SendRequest};
use std::time::Instant;

fn pkt(n: u32) -> PktRef {
    PktRef {
        pool: PoolKind::OooCopy,
        id: PacketId(n),
    }
}

#[test]
fn test_recvwin_orders_message_starts() {
    let mut win = Recvwin::new(8, MsgId(0));
    assert_eq!(win.expected(), MsgId(0));
    assert!(win.in_window(MsgId(7)));
    assert!(!win.in_window(MsgId(8)));

    assert!(win.insert(MsgId(2), pkt(2)));
    assert!(win.insert(MsgId(1), pkt(1)));
    // Duplicate slot refused.
    assert!(!win.insert(MsgId(2), pkt(9)));

    // Nothing buffered at the expected sequence yet.
    assert!(win.take_expected().is_none());
    win.advance();
    assert_eq!(win.take_expected(), Some(pkt(1)));
    win.advance();
    assert_eq!(win.take_expected(), Some(pkt(2)));
    win.advance();
    assert_eq!(win.expected(), MsgId(3));
    assert!(win.is_behind(MsgId(1)));
}

#[test]
fn test_out_of_order_arrival_delivers_in_sequence() {
    let mut h = pair(test_config());
    let now = Instant::now();

    for ctx in [1u64, 2, 3] {
        h.b.post_recv(RecvRequest::msg(seg(vec![0u8; 512]), ctx), now)
            .unwrap();
    }

    // Hold the fabric so the three message starts can be released in a
    // scrambled order.
    h.net.borrow_mut().hold = true;
    let payloads: Vec<Vec<u8>> = (0..3).map(|i| pattern(100 + i, i as u8)).collect();
    for (i, p) in payloads.iter().enumerate() {
        h.a.post_send(SendRequest::msg(ADDR_B, seg(p.clone()), 10 + i as u64), now)
            .unwrap();
    }
    assert_eq!(held_count(&h.net), 3);
    h.net.borrow_mut().hold = false;
    release_held(&h.net, &[2, 0, 1]);

    let mut recvs = Vec::new();
    drive(&mut h, 50, |h| {
        for ev in drain_cq(&mut h.b) {
            if let CqEvent::Complete(c) = ev {
                recvs.push(c);
            }
        }
        recvs.len() == 3
    });

    // Completions surface in message order despite scrambled arrival,
    // filling the posted receives first to last.
    for (i, c) in recvs.iter().enumerate() {
        assert_eq!(c.context, 1 + i as u64);
        assert_eq!(c.len, payloads[i].len());
        assert_eq!(&flatten(c.buf.as_ref().unwrap())[..c.len], payloads[i].as_slice());
    }
}

#[test]
fn test_duplicate_message_start_dropped() {
    let mut h = pair(test_config());
    let now = Instant::now();

    h.b.post_recv(RecvRequest::msg(seg(vec![0u8; 512]), 1), now)
        .unwrap();

    h.net.borrow_mut().hold = true;
    h.a.post_send(SendRequest::msg(ADDR_B, seg(pattern(64, 1)), 2), now)
        .unwrap();
    // Deliver the same RTS twice.
    h.net.borrow_mut().hold = false;
    release_held(&h.net, &[0, 0]);

    let mut recvs = 0;
    drive(&mut h, 50, |h| {
        recvs += drain_cq(&mut h.b)
            .iter()
            .filter(|e| matches!(e, CqEvent::Complete(_)))
            .count();
        recvs >= 1
    });
    run(&mut h, 10);
    assert_eq!(recvs + drain_cq(&mut h.b).len(), 1, "duplicate must be dropped");
}
