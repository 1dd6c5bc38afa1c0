mod common;

use common::*;
use fabric_sequenced::{CompletionFlags, CqEvent, RecvRequest, SendRequest};
use std::time::Instant;

#[test]
fn test_multi_recv_consumers_and_release() {
    let mut h = pair(test_config());
    h.b.set_min_multi_recv(2048);
    let now = Instant::now();

    h.b.post_recv(RecvRequest::multi(seg(vec![0u8; 8192]), 99), now)
        .unwrap();

    let m1 = pattern(3000, 1);
    let m2 = pattern(3000, 2);
    h.a.post_send(SendRequest::msg(ADDR_B, seg(m1.clone()), 1), now)
        .unwrap();
    h.a.post_send(SendRequest::msg(ADDR_B, seg(m2.clone()), 2), now)
        .unwrap();

    let mut evs = Vec::new();
    drive(&mut h, 50, |h| {
        evs.extend(drain_cq(&mut h.b));
        evs.len() >= 2
    });
    for (i, ev) in evs.iter().enumerate() {
        match ev {
            CqEvent::Complete(c) => {
                assert_eq!(c.context, 99);
                assert_eq!(c.len, 3000);
                assert!(c.flags.contains(CompletionFlags::RECV | CompletionFlags::MSG));
                assert!(
                    !c.flags.contains(CompletionFlags::MULTI_RECV),
                    "buffer must not be released yet (consumer {})",
                    i
                );
            }
            CqEvent::Error(e) => panic!("unexpected error: {:?}", e),
        }
    }

    // Third 3000-byte message exceeds the 2192 bytes left: unexpected.
    let m3 = pattern(3000, 3);
    h.a.post_send(SendRequest::msg(ADDR_B, seg(m3.clone()), 3), now)
        .unwrap();
    run(&mut h, 20);
    assert!(h.b.poll_cq().is_none());

    // A 2000-byte message still fits; consuming it drops the remainder
    // below the threshold, so this completion releases the buffer.
    let m4 = pattern(2000, 4);
    h.a.post_send(SendRequest::msg(ADDR_B, seg(m4.clone()), 4), now)
        .unwrap();
    let mut release = None;
    drive(&mut h, 50, |h| {
        if let Some(CqEvent::Complete(c)) = h.b.poll_cq() {
            release = Some(c);
        }
        release.is_some()
    });
    let release = release.unwrap();
    assert_eq!(release.len, 2000);
    assert!(release.flags.contains(CompletionFlags::MULTI_RECV));
    let master = release.buf.expect("released master buffer");
    let flat = flatten(&master);
    assert_eq!(&flat[..3000], m1.as_slice());
    assert_eq!(&flat[3000..6000], m2.as_slice());
    assert_eq!(&flat[6000..8000], m4.as_slice());

    // The oversized message is still waiting; a plain recv picks it up.
    h.b.post_recv(RecvRequest::msg(seg(vec![0u8; 4096]), 5), now)
        .unwrap();
    let mut third = None;
    drive(&mut h, 50, |h| {
        if let Some(CqEvent::Complete(c)) = h.b.poll_cq() {
            third = Some(c);
        }
        third.is_some()
    });
    let third = third.unwrap();
    assert_eq!(third.context, 5);
    assert_eq!(&flatten(&third.buf.unwrap())[..3000], m3.as_slice());
}

#[test]
fn test_multi_recv_absorbs_unexpected_backlog() {
    let mut h = pair(test_config());
    h.b.set_min_multi_recv(1024);
    let now = Instant::now();

    let m1 = pattern(1500, 5);
    let m2 = pattern(1500, 6);
    h.a.post_send(SendRequest::msg(ADDR_B, seg(m1.clone()), 1), now)
        .unwrap();
    h.a.post_send(SendRequest::msg(ADDR_B, seg(m2.clone()), 2), now)
        .unwrap();
    run(&mut h, 10);

    // Both messages sit unexpected; one multi-recv post absorbs them.
    h.b.post_recv(RecvRequest::multi(seg(vec![0u8; 4096]), 50), now)
        .unwrap();
    let mut evs = Vec::new();
    drive(&mut h, 50, |h| {
        evs.extend(drain_cq(&mut h.b));
        evs.len() >= 2
    });
    let lens: Vec<usize> = evs
        .iter()
        .map(|e| match e {
            CqEvent::Complete(c) => c.len,
            CqEvent::Error(e) => panic!("unexpected error: {:?}", e),
        })
        .collect();
    assert_eq!(lens, vec![1500, 1500]);
}

#[test]
fn test_cancel_multi_recv_master_without_consumers() {
    let mut h = pair(test_config());
    let now = Instant::now();

    h.b.post_recv(RecvRequest::multi(seg(vec![0u8; 8192]), 77), now)
        .unwrap();
    assert!(h.b.cancel(77, now));
    match h.b.poll_cq() {
        Some(CqEvent::Error(e)) => {
            assert_eq!(e.context, 77);
            assert_eq!(e.err, fabric_sequenced::Error::Cancelled);
        }
        other => panic!("expected cancellation error, got {:?}", other),
    }
}
