mod common;

use common::*;
use fabric_sequenced::{CqEvent, Error, RecvRequest, SendRequest};
use std::time::{Duration, Instant};

#[test]
fn test_rnr_enters_backoff_and_recovers() {
    let mut cfg = test_config();
    cfg.rx_pkt_count = 4;
    cfg.rnr_backoff_initial = Duration::from_millis(5);
    let mut h = pair(cfg);
    let t0 = Instant::now();

    // The receiver stops posting buffers: four in-flight sends soak its
    // ring, the fifth bounces with receiver-not-ready.
    for i in 0..5u64 {
        h.a.post_send(
            SendRequest::msg(ADDR_B, seg(pattern(64, i as u8)), i),
            t0,
        )
        .unwrap();
    }
    assert_eq!(posted_slots(&h.net, ADDR_B.0), 0);

    // Draining the send completions surfaces the RNR and starts backoff.
    h.a.progress(t0);
    let err = h
        .a
        .post_send(SendRequest::msg(ADDR_B, seg(pattern(64, 9)), 9), t0)
        .unwrap_err();
    assert_eq!(err, Error::PeerBackoff);
    assert!(err.is_retryable());

    // Still inside the backoff interval.
    h.a.progress(t0 + Duration::from_millis(1));
    assert!(h
        .a
        .post_send(SendRequest::msg(ADDR_B, seg(pattern(64, 9)), 9), t0)
        .is_err());

    // The receiver comes back; after the deadline the queued message and
    // new sends flow again.
    let t1 = t0 + Duration::from_millis(10);
    h.b.progress(t1);
    h.a.progress(t1);
    h.a.post_send(SendRequest::msg(ADDR_B, seg(pattern(64, 10)), 10), t1)
        .unwrap();

    for i in 0..6u64 {
        h.b.post_recv(RecvRequest::msg(seg(vec![0u8; 256]), 100 + i), t1)
            .unwrap();
    }
    let mut recv_count = 0;
    let mut rounds = 0;
    loop {
        let now = t1 + Duration::from_millis(rounds);
        h.a.progress(now);
        h.b.progress(now);
        recv_count += drain_cq(&mut h.b)
            .iter()
            .filter(|e| matches!(e, CqEvent::Complete(_)))
            .count();
        if recv_count >= 6 {
            break;
        }
        rounds += 1;
        assert!(rounds < 200, "messages did not recover after backoff");
    }
}

#[test]
fn test_backoff_doubles_while_peer_stays_dry() {
    let mut cfg = test_config();
    cfg.rx_pkt_count = 1;
    cfg.rnr_backoff_initial = Duration::from_millis(2);
    cfg.rnr_backoff_max = Duration::from_millis(8);
    let mut h = pair(cfg);
    let t0 = Instant::now();

    // One slot, three sends: two bounce back to back, so the second RNR
    // lands while the peer is already backed off and doubles the wait.
    h.a.post_send(SendRequest::msg(ADDR_B, seg(pattern(32, 1)), 1), t0)
        .unwrap();
    h.a.post_send(SendRequest::msg(ADDR_B, seg(pattern(32, 2)), 2), t0)
        .unwrap();
    h.a.post_send(SendRequest::msg(ADDR_B, seg(pattern(32, 3)), 3), t0)
        .unwrap();
    h.a.progress(t0);

    // The doubled interval (4ms) is still running after the initial one
    // (2ms) would have expired.
    h.a.progress(t0 + Duration::from_millis(3));
    assert!(h
        .a
        .post_send(SendRequest::msg(ADDR_B, seg(pattern(32, 4)), 4), t0)
        .is_err());

    // Past the doubled deadline sends are accepted again.
    h.a.progress(t0 + Duration::from_millis(5));
    h.a.post_send(
        SendRequest::msg(ADDR_B, seg(pattern(32, 5)), 5),
        t0 + Duration::from_millis(5),
    )
    .unwrap();
}
