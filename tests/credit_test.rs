mod common;

use common::*;
use fabric_sequenced::{CqEvent, RecvRequest, SendRequest};
use std::time::{Duration, Instant};

const MB: usize = 1024 * 1024;

#[test]
fn test_concurrent_transfers_under_tiny_budget() {
    // Shared receive-buffer budget of eight packets for two megabyte
    // transfers: the second CTS has to wait for DATA arrivals to
    // replenish the pool.
    let mut cfg = test_config();
    cfg.rx_pkt_count = 8;
    let mut h = pair(cfg);
    let now = Instant::now();

    let p1 = pattern(MB, 21);
    let p2 = pattern(MB, 22);
    h.b.post_recv(RecvRequest::msg(seg(vec![0u8; MB]), 1), now)
        .unwrap();
    h.b.post_recv(RecvRequest::msg(seg(vec![0u8; MB]), 2), now)
        .unwrap();
    h.a.post_send(SendRequest::msg(ADDR_B, seg(p1.clone()), 11), now)
        .unwrap();
    h.a.post_send(SendRequest::msg(ADDR_B, seg(p2.clone()), 12), now)
        .unwrap();

    let mut recvs = Vec::new();
    drive(&mut h, 20_000, |h| {
        for ev in drain_cq(&mut h.b) {
            if let CqEvent::Complete(c) = ev {
                recvs.push(c);
            }
        }
        recvs.len() == 2
    });

    recvs.sort_by_key(|c| c.context);
    assert_eq!(recvs[0].context, 1);
    assert_eq!(recvs[1].context, 2);
    for c in &recvs {
        assert_eq!(c.len, MB);
    }
    // In-order per-peer delivery means the first posted recv got the
    // first message.
    assert_eq!(flatten(recvs[0].buf.as_ref().unwrap()), p1);
    assert_eq!(flatten(recvs[1].buf.as_ref().unwrap()), p2);
    assert!(h.b.available_data_bufs() > 0);
}

#[test]
fn test_window_grants_drain_shared_budget() {
    let mut cfg = test_config();
    cfg.rx_pkt_count = 8;
    cfg.tx_min_credits = 4;
    let mut h = pair(cfg);
    let now = Instant::now();

    h.b.post_recv(RecvRequest::msg(seg(vec![0u8; MB]), 1), now)
        .unwrap();
    h.b.post_recv(RecvRequest::msg(seg(vec![0u8; MB]), 2), now)
        .unwrap();
    // Two rendezvous starts: the first grant takes seven of the eight
    // buffers (one is holding the RTS itself), the second takes the rest.
    h.a.post_send(SendRequest::msg(ADDR_B, seg(pattern(MB, 23)), 3), now)
        .unwrap();
    h.a.post_send(SendRequest::msg(ADDR_B, seg(pattern(MB, 27)), 4), now)
        .unwrap();
    h.b.progress(now);
    assert_eq!(h.b.available_data_bufs(), 0);
}

#[test]
fn test_available_bufs_timer_resets_budget() {
    let mut cfg = test_config();
    cfg.rx_pkt_count = 8;
    cfg.available_data_bufs_timeout = Duration::from_millis(10);
    let mut h = pair(cfg);
    let t0 = Instant::now();

    h.b.post_recv(RecvRequest::msg(seg(vec![0u8; MB]), 1), t0)
        .unwrap();
    h.b.post_recv(RecvRequest::msg(seg(vec![0u8; MB]), 2), t0)
        .unwrap();
    h.a.post_send(SendRequest::msg(ADDR_B, seg(pattern(MB, 24)), 3), t0)
        .unwrap();
    h.a.post_send(SendRequest::msg(ADDR_B, seg(pattern(MB, 28)), 4), t0)
        .unwrap();
    h.b.progress(t0);
    assert_eq!(h.b.available_data_bufs(), 0);

    // The sender goes quiet with the budget pinned at zero; the liveness
    // fallback restores it once the timeout elapses.
    h.b.progress(t0 + Duration::from_millis(5));
    assert_eq!(h.b.available_data_bufs(), 0);
    h.b.progress(t0 + Duration::from_millis(20));
    assert_eq!(h.b.available_data_bufs(), 8);
}

#[test]
fn test_send_rejected_when_peer_credits_exhausted() {
    // With a zero floor, a sender that has spent its per-peer credits is
    // pushed back with a retryable error.
    let mut cfg = test_config();
    cfg.tx_min_credits = 0;
    cfg.tx_max_credits = 4;
    let mut h = pair(cfg);
    let now = Instant::now();

    h.a.post_send(SendRequest::msg(ADDR_B, seg(pattern(MB, 25)), 1), now)
        .unwrap();
    let err = h
        .a
        .post_send(SendRequest::msg(ADDR_B, seg(pattern(MB, 26)), 2), now)
        .unwrap_err();
    assert!(err.is_retryable());
}
