//! Demo: full pipeline against the simulated remote processor

use std::sync::{Arc, Mutex};
use std::time::Duration;

use color_eyre::Result;
use tracing::info;

use vclink::storage::{CountingDisplay, MemoryStreamWriter, StreamWriter};
use vclink::{
    Config, ImportTable, PipelineDriver, RpcClient, SimConfig, SimRemote, SlotArena,
    TransportContext,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("vclink=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("vclink demo starting");

    let config = Config::default();

    // Shared region + the scripted remote on its far side.
    let arena = SlotArena::with_capacity(config.transport.region_bytes)?;
    let imports = ImportTable::new();
    let mut remote = SimRemote::spawn(
        Arc::clone(&arena),
        Arc::clone(&imports),
        SimConfig {
            completion_delay_us: (500, 3_000),
            echo_requires_capture: true,
            ..SimConfig::default()
        },
    );

    // Host side: transport, handshake, media service.
    let transport = TransportContext::start(Arc::clone(&arena), config.transport.clone());
    transport.connect()?;
    let rpc = RpcClient::connect(&transport)?;

    // A smaller pool than the production default keeps the demo light.
    let mut pipeline_cfg = config.pipeline.clone();
    pipeline_cfg.encoder.output_buffer_count = 16;

    let writer: Arc<Mutex<dyn StreamWriter>> = Arc::new(Mutex::new(MemoryStreamWriter::new()));
    let display = Arc::new(CountingDisplay::new());
    let pipeline = PipelineDriver::create(
        &rpc,
        &imports,
        &pipeline_cfg,
        Arc::clone(&writer),
        display.clone(),
    )?;

    pipeline.start_capture()?;
    info!("capturing; ctrl-c to stop early");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(3)) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
    }

    pipeline.stop_capture()?;
    let stats = pipeline.stats();
    pipeline.shutdown();
    transport.shutdown();
    remote.stop();

    let written = writer.lock().unwrap().bytes_written();
    let drawn = display.drawn();
    info!(
        encoded_frames = stats.encoded_frames,
        encoded_bytes = stats.encoded_bytes,
        preview_frames = stats.preview_frames,
        preview_dropped = stats.preview_dropped,
        stored_bytes = written,
        drawn = drawn,
        "demo finished"
    );
    Ok(())
}
