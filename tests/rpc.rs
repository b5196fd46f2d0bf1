//! Synchronous RPC behavior against the scripted remote.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use vclink::mmal::wire::{MmalMsgType, PortKind};
use vclink::mmal::encodings;
use vclink::{Error, MmalStatus, RpcClient, SimConfig};

/// Opening the media service binds a remote port within the timeout.
#[test]
fn service_open_binds_a_remote_port() {
    let stack = common::stack(common::fast_transport(), SimConfig::default());
    stack.transport.connect().unwrap();

    let started = Instant::now();
    let rpc = RpcClient::connect(&stack.transport).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    let service = rpc.service();
    assert!(service.local_port >= 1);
    assert_eq!(service.remote_port, 90);
}

/// A remote that never acknowledges opens produces a bounded timeout, not
/// a hang.
#[test]
fn silent_remote_times_out_the_open() {
    let mut cfg = common::fast_transport();
    cfg.open_timeout_ms = 300;
    let stack = common::stack(
        cfg,
        SimConfig {
            answer_opens: false,
            ..SimConfig::default()
        },
    );
    stack.transport.connect().unwrap();

    let started = Instant::now();
    let err = RpcClient::connect(&stack.transport).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!stack.transport.is_failed());
}

/// A non-success reply fails only that call, carrying the remote's own
/// status code; the transport stays healthy.
#[test]
fn rejection_surfaces_the_remote_status() {
    let stack = common::stack(
        common::fast_transport(),
        SimConfig {
            status_overrides: vec![(MmalMsgType::ComponentCreate, MmalStatus::ENOMEM)],
            ..SimConfig::default()
        },
    );
    stack.transport.connect().unwrap();
    let rpc = RpcClient::connect(&stack.transport).unwrap();

    match rpc.component_create("vc.ril.camera") {
        Err(Error::Rejected(status)) => assert_eq!(status, MmalStatus::ENOMEM),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(!stack.transport.is_failed());

    // A later call on the same client still works.
    match rpc.component_destroy(0x9999) {
        Err(Error::Rejected(status)) => assert_eq!(status, MmalStatus::ENOENT),
        other => panic!("expected rejection, got {other:?}"),
    }
}

/// A wedged remote mid-call surfaces as a timeout on that call.
#[test]
fn muted_reply_times_out_the_call() {
    let mut cfg = common::fast_transport();
    cfg.rpc_timeout_ms = 300;
    let stack = common::stack(
        cfg,
        SimConfig {
            mute: vec![MmalMsgType::ComponentCreate],
            ..SimConfig::default()
        },
    );
    stack.transport.connect().unwrap();
    let rpc = RpcClient::connect(&stack.transport).unwrap();

    let started = Instant::now();
    assert!(matches!(
        rpc.component_create("vc.ril.camera"),
        Err(Error::Timeout(_))
    ));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!stack.transport.is_failed());
}

/// A successful reply lands byte-exact in the caller's view of the port.
#[test]
fn port_info_reply_is_exact() {
    let stack = common::stack(common::fast_transport(), SimConfig::default());
    stack.transport.connect().unwrap();
    let rpc = RpcClient::connect(&stack.transport).unwrap();

    let (component, input_count, output_count) =
        rpc.component_create("vc.ril.video_encode").unwrap();
    assert_eq!((input_count, output_count), (1, 1));

    let (settings, format) = rpc.port_info(component, PortKind::Output, 0).unwrap();
    assert_eq!(settings.buffer_num_min, 1);
    assert_eq!(settings.buffer_num_recommended, 8);
    assert_eq!(settings.buffer_size_min, 65_536);
    assert_eq!(settings.buffer_size_recommended, 262_144);
    assert_eq!(settings.buffer_alignment_min, 16);
    assert!(!settings.enabled);
    assert_eq!(format.encoding, encodings::OPAQUE);
}

/// N concurrent callers each get their own reply; nothing cross-delivers.
#[test]
fn concurrent_calls_never_cross_deliver() {
    let stack = common::stack(common::fast_transport(), SimConfig::default());
    stack.transport.connect().unwrap();
    let rpc = RpcClient::connect(&stack.transport).unwrap();

    let mut workers = Vec::new();
    for _ in 0..8 {
        let rpc = Arc::clone(&rpc);
        workers.push(std::thread::spawn(move || {
            (0..10)
                .map(|_| rpc.component_create("vc.ril.camera").unwrap().0)
                .collect::<Vec<u32>>()
        }));
    }
    let mut handles: Vec<u32> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();
    handles.sort_unstable();
    let before = handles.len();
    handles.dedup();
    assert_eq!(handles.len(), before, "a reply was delivered twice");
    assert_eq!(before, 80);
}

/// Oversized inline parameters are refused locally, before anything is
/// put on the wire.
#[test]
fn oversized_parameter_is_rejected_locally() {
    let stack = common::stack(common::fast_transport(), SimConfig::default());
    stack.transport.connect().unwrap();
    let rpc = RpcClient::connect(&stack.transport).unwrap();

    let blob = vec![0u8; 385];
    assert!(matches!(
        rpc.parameter_set(1, 1, 7, &blob),
        Err(Error::PayloadTooLarge { got: 385, limit: 384 })
    ));
}

/// The camera-info query round-trips through the parameter path.
#[test]
fn camera_info_reports_the_sensor() {
    let stack = common::stack(common::fast_transport(), SimConfig::default());
    stack.transport.connect().unwrap();
    let rpc = RpcClient::connect(&stack.transport).unwrap();

    let (component, _, _) = rpc.component_create("vc.ril.camera").unwrap();
    let (control, _) = rpc.port_info(component, PortKind::Control, 0).unwrap();
    let info = rpc.camera_info(component, control.port_handle).unwrap();
    assert_eq!(info.cameras.len(), 1);
    assert_eq!(info.cameras[0].max_width, 3280);
    assert_eq!(info.cameras[0].max_height, 2464);
}
