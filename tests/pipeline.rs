//! End-to-end pipeline runs over the simulated remote.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vclink::pipeline::RunState;
use vclink::storage::{BusyDisplay, CountingDisplay, MemoryStreamWriter};
use vclink::{
    Error, PipelineConfig, PipelineDriver, PreviewMode, RpcClient, SimConfig,
};

fn small_pipeline() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.encoder.output_buffer_count = 16;
    cfg.encoder.output_buffer_bytes = 256 * 1024;
    cfg.preview.buffer_count = 4;
    cfg.preview.queue_depth = 4;
    cfg
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) {
    let end = Instant::now() + deadline;
    while !done() {
        assert!(Instant::now() < end, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Sixteen 256KB buffers cycle through a remote that echoes them after
/// pseudo-random delays: completions process in submission order and every
/// buffer stays in exactly one ownership queue throughout.
#[test]
fn buffers_cycle_in_order_and_conserve_membership() {
    let stack = common::stack(
        common::fast_transport(),
        SimConfig {
            completion_delay_us: (100, 2_000),
            echo_requires_capture: true,
            ..SimConfig::default()
        },
    );
    stack.transport.connect().unwrap();
    let rpc = RpcClient::connect(&stack.transport).unwrap();

    let writer = Arc::new(Mutex::new(MemoryStreamWriter::new()));
    let display = Arc::new(CountingDisplay::new());
    let pipeline = PipelineDriver::create(
        &rpc,
        &stack.imports,
        &small_pipeline(),
        writer.clone(),
        display,
    )
    .unwrap();
    assert_eq!(pipeline.video_pool().len(), 16);
    assert_eq!(pipeline.state(), RunState::BuffersPrimed);

    pipeline.start_capture().unwrap();
    wait_until(Duration::from_secs(20), || {
        // Conservation must hold at every sampled instant, under load.
        let video = pipeline.video_pool().census();
        assert_eq!(video.iter().sum::<usize>(), pipeline.video_pool().len());
        let preview = pipeline.preview_pool().census();
        assert_eq!(preview.iter().sum::<usize>(), pipeline.preview_pool().len());
        writer.lock().unwrap().chunks.len() >= 48
    });
    pipeline.stop_capture().unwrap();

    // Encode order is preserved end to end: the stored stream's timestamps
    // are strictly increasing.
    let stored = writer.lock().unwrap();
    assert!(stored.chunks.len() >= 48);
    for pair in stored.chunks.windows(2) {
        assert!(pair[0].pts < pair[1].pts, "stream written out of order");
    }

    let stats = pipeline.stats();
    assert!(stats.encoded_frames >= stored.chunks.len() as u64);
    assert!(stats.encoded_bytes > 0);
    drop(stored);

    pipeline.shutdown();
    assert_eq!(pipeline.state(), RunState::ShutDown);
}

/// Nothing is produced until capture is switched on, and production stops
/// when it is switched off.
#[test]
fn capture_toggle_gates_production() {
    let stack = common::stack(
        common::fast_transport(),
        SimConfig {
            echo_requires_capture: true,
            ..SimConfig::default()
        },
    );
    stack.transport.connect().unwrap();
    let rpc = RpcClient::connect(&stack.transport).unwrap();

    let writer = Arc::new(Mutex::new(MemoryStreamWriter::new()));
    let pipeline = PipelineDriver::create(
        &rpc,
        &stack.imports,
        &small_pipeline(),
        writer.clone(),
        Arc::new(CountingDisplay::new()),
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(stack.remote.frames_produced(), 0);
    assert!(writer.lock().unwrap().chunks.is_empty());

    pipeline.start_capture().unwrap();
    assert!(stack.remote.capturing());
    wait_until(Duration::from_secs(10), || {
        writer.lock().unwrap().chunks.len() >= 10
    });

    pipeline.stop_capture().unwrap();
    assert!(!stack.remote.capturing());
    std::thread::sleep(Duration::from_millis(100));
    let settled = stack.remote.frames_produced();
    std::thread::sleep(Duration::from_millis(200));
    // At most one completion can have been mid-flight past the gate.
    assert!(stack.remote.frames_produced() <= settled + 1);

    pipeline.shutdown();
}

/// Strict preview holds each buffer through the full ownership cycle, and
/// a busy display only costs dropped frames, never buffers.
#[test]
fn strict_preview_with_busy_display_drops_frames_not_buffers() {
    let stack = common::stack(
        common::fast_transport(),
        SimConfig {
            completion_delay_us: (0, 500),
            ..SimConfig::default()
        },
    );
    stack.transport.connect().unwrap();
    let rpc = RpcClient::connect(&stack.transport).unwrap();

    let mut cfg = small_pipeline();
    cfg.preview.mode = PreviewMode::Strict;
    let writer = Arc::new(Mutex::new(MemoryStreamWriter::new()));
    let pipeline = PipelineDriver::create(
        &rpc,
        &stack.imports,
        &cfg,
        writer.clone(),
        Arc::new(BusyDisplay),
    )
    .unwrap();

    pipeline.start_capture().unwrap();
    wait_until(Duration::from_secs(10), || {
        let preview = pipeline.preview_pool().census();
        assert_eq!(preview.iter().sum::<usize>(), pipeline.preview_pool().len());
        pipeline.stats().preview_dropped >= 5
    });

    let stats = pipeline.stats();
    assert_eq!(stats.preview_frames, 0, "busy display cannot have drawn");
    assert!(pipeline.latest_preview().is_some());

    pipeline.stop_capture().unwrap();
    pipeline.shutdown();
    // Membership is still conserved after teardown.
    let census = pipeline.preview_pool().census();
    assert_eq!(census.iter().sum::<usize>(), pipeline.preview_pool().len());
}

/// The shortcut policy returns preview buffers straight from the dispatch
/// path; they never pass through the worker's queues.
#[test]
fn shortcut_preview_bypasses_the_worker() {
    let stack = common::stack(
        common::fast_transport(),
        SimConfig {
            completion_delay_us: (0, 500),
            ..SimConfig::default()
        },
    );
    stack.transport.connect().unwrap();
    let rpc = RpcClient::connect(&stack.transport).unwrap();

    let display = Arc::new(CountingDisplay::new());
    let writer = Arc::new(Mutex::new(MemoryStreamWriter::new()));
    let pipeline = PipelineDriver::create(
        &rpc,
        &stack.imports,
        &small_pipeline(),
        writer.clone(),
        display.clone(),
    )
    .unwrap();

    pipeline.start_capture().unwrap();
    wait_until(Duration::from_secs(10), || {
        let preview = pipeline.preview_pool().census();
        assert_eq!(
            preview[2] + preview[3],
            0,
            "shortcut buffers must not reach the worker queues"
        );
        display.drawn() >= 10
    });

    pipeline.stop_capture().unwrap();
    pipeline.shutdown();
}

/// After teardown the pipeline fails fast: no submissions, no restart.
#[test]
fn shutdown_is_terminal() {
    let stack = common::stack(common::fast_transport(), SimConfig::default());
    stack.transport.connect().unwrap();
    let rpc = RpcClient::connect(&stack.transport).unwrap();

    let writer = Arc::new(Mutex::new(MemoryStreamWriter::new()));
    let pipeline = PipelineDriver::create(
        &rpc,
        &stack.imports,
        &small_pipeline(),
        writer.clone(),
        Arc::new(CountingDisplay::new()),
    )
    .unwrap();

    pipeline.shutdown();
    assert_eq!(pipeline.state(), RunState::ShutDown);
    assert!(matches!(pipeline.top_up(), Err(Error::NotReady)));
    assert!(matches!(pipeline.start_capture(), Err(Error::NotReady)));
}

/// Bring-up failures name the stage that failed and carry the remote's
/// status code.
#[test]
fn setup_failure_reports_the_stage() {
    use vclink::mmal::wire::MmalMsgType;
    use vclink::MmalStatus;

    let stack = common::stack(
        common::fast_transport(),
        SimConfig {
            status_overrides: vec![(MmalMsgType::ComponentCreate, MmalStatus::ENOMEM)],
            ..SimConfig::default()
        },
    );
    stack.transport.connect().unwrap();
    let rpc = RpcClient::connect(&stack.transport).unwrap();

    let writer = Arc::new(Mutex::new(MemoryStreamWriter::new()));
    let err = PipelineDriver::create(
        &rpc,
        &stack.imports,
        &small_pipeline(),
        writer.clone(),
        Arc::new(CountingDisplay::new()),
    )
    .unwrap_err();

    match err {
        Error::Setup { stage, source } => {
            assert_eq!(stage, "camera create");
            assert!(matches!(*source, Error::Rejected(MmalStatus::ENOMEM)));
        }
        other => panic!("expected a staged setup error, got {other:?}"),
    }
}
