mod common;

use common::*;
use fabric_sequenced::endpoint::ReadRequest;
use fabric_sequenced::{CompletionFlags, CqEvent, RmaIov, SendRequest};
use smallvec::smallvec;
use std::time::Instant;

#[test]
fn test_rma_write_into_registered_region() {
    let mut h = pair(test_config());
    let now = Instant::now();

    h.b.register_region(0x10, vec![0u8; 8192]);
    let payload = pattern(6000, 41);
    h.a.post_send(
        SendRequest::write(
            ADDR_B,
            seg(payload.clone()),
            smallvec![RmaIov {
                key: 0x10,
                offset: 100,
                len: 6000,
            }],
            1,
        ),
        now,
    )
    .unwrap();

    let mut wrote = None;
    let mut remote = None;
    drive(&mut h, 200, |h| {
        if let Some(CqEvent::Complete(c)) = h.a.poll_cq() {
            wrote = Some(c);
        }
        if let Some(CqEvent::Complete(c)) = h.b.poll_cq() {
            remote = Some(c);
        }
        wrote.is_some() && remote.is_some()
    });
    let wrote = wrote.unwrap();
    assert!(wrote.flags.contains(CompletionFlags::RMA | CompletionFlags::WRITE));
    assert_eq!(wrote.len, 6000);
    let remote = remote.unwrap();
    assert!(remote
        .flags
        .contains(CompletionFlags::REMOTE_WRITE | CompletionFlags::RMA));

    let region = h.b.region(0x10).unwrap();
    assert_eq!(&region[100..6100], payload.as_slice());
    assert!(region[..100].iter().all(|&b| b == 0));
    assert!(region[6100..].iter().all(|&b| b == 0));
}

#[test]
fn test_rma_read_streams_region_back() {
    let mut h = pair(test_config());
    let now = Instant::now();

    let region = pattern(100_000, 42);
    h.b.register_region(0x20, region.clone());

    h.a.post_read(
        ReadRequest {
            addr: ADDR_B,
            rma_iov: smallvec![RmaIov {
                key: 0x20,
                offset: 1000,
                len: 80_000,
            }],
            segments: seg(vec![0u8; 80_000]),
            context: 9,
        },
        now,
    )
    .unwrap();

    let mut read = None;
    let mut remote = None;
    drive(&mut h, 500, |h| {
        if let Some(CqEvent::Complete(c)) = h.a.poll_cq() {
            read = Some(c);
        }
        if let Some(CqEvent::Complete(c)) = h.b.poll_cq() {
            remote = Some(c);
        }
        read.is_some() && remote.is_some()
    });
    let read = read.unwrap();
    assert_eq!(read.context, 9);
    assert!(read.flags.contains(CompletionFlags::RMA | CompletionFlags::READ));
    assert_eq!(read.len, 80_000);
    assert_eq!(flatten(&read.buf.unwrap()), region[1000..81_000]);

    let remote = remote.unwrap();
    assert!(remote
        .flags
        .contains(CompletionFlags::REMOTE_READ | CompletionFlags::RMA));
}

#[test]
fn test_rma_read_unknown_region_reports_error() {
    let mut h = pair(test_config());
    let now = Instant::now();

    h.a.post_read(
        ReadRequest {
            addr: ADDR_B,
            rma_iov: smallvec![RmaIov {
                key: 0xDEAD,
                offset: 0,
                len: 64,
            }],
            segments: seg(vec![0u8; 64]),
            context: 3,
        },
        now,
    )
    .unwrap();

    let mut errored = false;
    drive(&mut h, 50, |h| {
        if let Some(CqEvent::Error(e)) = h.b.poll_cq() {
            assert_eq!(e.err, fabric_sequenced::Error::UnknownRegion(0xDEAD));
            errored = true;
        }
        errored
    });
}

#[test]
fn test_scattered_rma_write_across_regions() {
    let mut h = pair(test_config());
    let now = Instant::now();

    h.b.register_region(1, vec![0u8; 1000]);
    h.b.register_region(2, vec![0u8; 1000]);
    let payload = pattern(1500, 43);
    h.a.post_send(
        SendRequest::write(
            ADDR_B,
            seg(payload.clone()),
            smallvec![
                RmaIov {
                    key: 1,
                    offset: 0,
                    len: 1000,
                },
                RmaIov {
                    key: 2,
                    offset: 500,
                    len: 500,
                },
            ],
            5,
        ),
        now,
    )
    .unwrap();

    let mut done = false;
    drive(&mut h, 100, |h| {
        if matches!(h.b.poll_cq(), Some(CqEvent::Complete(_))) {
            done = true;
        }
        done
    });
    assert_eq!(h.b.region(1).unwrap(), &payload[..1000]);
    assert_eq!(&h.b.region(2).unwrap()[500..], &payload[1000..]);
}
