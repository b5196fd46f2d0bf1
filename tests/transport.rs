//! Ring transport properties exercised across real threads.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use vclink::transport::wire::{pack_msg_id, MsgKind, SLOT_SIZE};
use vclink::{Error, FourCc, Side, SimConfig, SlotArena};

/// A reader racing the writer never observes a partially written message:
/// the write position is published only after the full body is in place.
#[test]
fn concurrent_reader_never_sees_torn_messages() {
    const COUNT: u64 = 2_000;
    let arena = SlotArena::with_capacity(64 * SLOT_SIZE).unwrap();

    let writer = {
        let arena = Arc::clone(&arena);
        std::thread::spawn(move || {
            for seq in 0..COUNT {
                // Lengths sweep across slot boundaries to force padding.
                let len = 9 + (seq as usize * 37) % 1_400;
                let mut payload = vec![(seq % 251) as u8; len];
                payload[..8].copy_from_slice(&seq.to_le_bytes());
                arena
                    .send(
                        Side::Host,
                        pack_msg_id(MsgKind::Data, 1, 2),
                        &payload,
                        Duration::from_secs(5),
                    )
                    .unwrap();
            }
        })
    };

    let mut cursor = 0u32;
    let mut received = 0u64;
    let deadline = Instant::now() + Duration::from_secs(20);
    while received < COUNT {
        assert!(Instant::now() < deadline, "reader starved at {received}");
        arena.wait_incoming(Side::Remote, Duration::from_millis(10));
        // Run the writer-side slot validator, as the reclaim thread would.
        arena.reclaim(Side::Host).unwrap();
        arena
            .drain(Side::Remote, &mut cursor, |_, payload| {
                let seq = u64::from_le_bytes(payload[..8].try_into().unwrap());
                assert_eq!(seq, received, "messages reordered");
                let fill = (seq % 251) as u8;
                assert!(
                    payload[8..].iter().all(|&b| b == fill),
                    "torn message body at seq {seq}"
                );
                received += 1;
                Ok(())
            })
            .unwrap();
    }
    writer.join().unwrap();

    let (messages, padding, _) = arena.traffic(Side::Host);
    assert_eq!(messages as u64, COUNT);
    assert!(padding > 0, "length sweep should have crossed slot boundaries");
}

/// Inbound data for a port that was never opened poisons the transport:
/// the service tables disagree and nothing after that can be trusted.
#[test]
fn data_for_unopened_port_poisons_the_transport() {
    let stack = common::stack(common::fast_transport(), SimConfig::default());
    stack.transport.connect().unwrap();
    assert!(!stack.transport.is_failed());

    stack
        .arena
        .send(
            Side::Remote,
            pack_msg_id(MsgKind::Data, 90, 5),
            b"not for anyone",
            Duration::from_secs(1),
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while !stack.transport.is_failed() {
        assert!(Instant::now() < deadline, "transport never poisoned");
        std::thread::sleep(Duration::from_millis(5));
    }

    // Every later operation fails with the corruption error, sticky.
    let noop: vclink::service::ServiceCallback = Arc::new(|_| Ok(()));
    let err = stack
        .transport
        .open_service(FourCc::new(b"test"), 1, 1, noop)
        .unwrap_err();
    assert!(matches!(err, Error::Corrupted(_)));
}

/// The connect handshake completes against a live remote and is idempotent.
#[test]
fn connect_handshake_completes() {
    let stack = common::stack(common::fast_transport(), SimConfig::default());
    let started = Instant::now();
    stack.transport.connect().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    stack.transport.connect().unwrap();
}
