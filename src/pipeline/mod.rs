//! Camera → encoder → storage/preview graph driver
//!
//! Builds the component graph over RPC, negotiates formats, primes the
//! buffer pools, and wires the two return paths: encoded buffers append to
//! the stream writer through the IO worker, preview buffers go to the
//! display with a configurable latency policy. The dispatch-side handler
//! only moves buffers between queues; every byte of real IO happens on the
//! worker thread.

pub mod preview;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, info, warn};

use crate::buffers::work::{IoWorker, WorkItem};
use crate::buffers::{BufferPool, ImportTable};
use crate::error::{Error, Result};
use crate::mmal::wire::{ElementaryFormat, EsType, PortActionKind, PortKind};
use crate::mmal::{encodings, params, BufferHandler, ComponentId, ComponentStore, PortRef, RpcClient};
use crate::pipeline::preview::{PreviewFrame, PreviewPayload, PreviewQueue};
use crate::storage::{DisplaySink, StreamWriter};
use crate::{PipelineConfig, PreviewMode};

/// Where a pipeline run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    ComponentsCreated,
    PortsConnected,
    BuffersPrimed,
    Capturing,
    Stopped,
    /// Torn down; there is no path back to capturing.
    ShutDown,
}

/// Remote addressing for one host-facing port.
#[derive(Debug, Clone, Copy)]
struct PortBinding {
    component: u32,
    port_handle: u32,
}

#[derive(Default)]
struct Counters {
    encoded_frames: AtomicU64,
    encoded_bytes: AtomicU64,
    preview_frames: AtomicU64,
    preview_dropped: AtomicU64,
    work_errors: AtomicU64,
    preview_sequence: AtomicU64,
}

/// Snapshot of pipeline throughput for callers and logs.
#[derive(Debug, Clone, Copy)]
pub struct PipelineStats {
    pub encoded_frames: u64,
    pub encoded_bytes: u64,
    pub preview_frames: u64,
    pub preview_dropped: u64,
    pub work_errors: u64,
    pub video_census: [usize; 4],
    pub preview_census: [usize; 4],
}

pub struct PipelineDriver {
    rpc: Arc<RpcClient>,
    store: Mutex<ComponentStore>,
    camera: ComponentId,
    encoder: ComponentId,
    resizer: Option<ComponentId>,
    camera_handle: u32,
    camera_video_handle: u32,
    encoder_out: PortBinding,
    preview_out: PortBinding,
    video_pool: Arc<BufferPool>,
    preview_pool: Arc<BufferPool>,
    preview_queue: Arc<Mutex<PreviewQueue>>,
    worker: Mutex<IoWorker>,
    capturing: Arc<AtomicBool>,
    counters: Arc<Counters>,
    state: Mutex<RunState>,
}

impl std::fmt::Debug for PipelineDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDriver")
            .field("camera", &self.camera)
            .field("encoder", &self.encoder)
            .field("resizer", &self.resizer)
            .finish_non_exhaustive()
    }
}

impl PipelineDriver {
    /// Build the whole graph and leave it primed, one RPC at a time. Any
    /// failure reports the stage it happened in and aborts bring-up.
    pub fn create(
        rpc: &Arc<RpcClient>,
        imports: &Arc<ImportTable>,
        cfg: &PipelineConfig,
        writer: Arc<Mutex<dyn StreamWriter>>,
        display: Arc<dyn DisplaySink>,
    ) -> Result<Arc<Self>> {
        let mut store = ComponentStore::new();

        // Components first; the remote reports each one's port complement.
        let camera = create_component(rpc, &mut store, "vc.ril.camera")
            .map_err(Error::at_stage("camera create"))?;
        let encoder = create_component(rpc, &mut store, "vc.ril.video_encode")
            .map_err(Error::at_stage("encoder create"))?;
        let resizer = if cfg.preview.use_resizer {
            Some(
                create_component(rpc, &mut store, "vc.ril.resizer")
                    .map_err(Error::at_stage("resizer create"))?,
            )
        } else {
            None
        };
        info!(resizer = resizer.is_some(), "components created");

        let camera_handle = store.get(camera)?.handle;
        let encoder_handle = store.get(encoder)?.handle;

        let camera_preview = out_port(camera, 0);
        let camera_video = out_port(camera, 1);
        let encoder_in = PortRef {
            component: encoder,
            kind: PortKind::Input,
            index: 0,
        };
        let encoder_out_ref = out_port(encoder, 0);
        // The host-facing preview port: the resizer's output when scaling,
        // otherwise the camera's preview port directly.
        let preview_out_ref = match resizer {
            Some(r) => out_port(r, 0),
            None => camera_preview,
        };

        // Camera module selection precedes any format work.
        let camera_control = store.get(camera)?.control.settings.port_handle;
        rpc.parameter_set_u32(
            camera_handle,
            camera_control,
            params::CAMERA_NUM,
            cfg.camera.camera_num,
        )
        .map_err(Error::at_stage("camera select"))?;

        // Format negotiation. Every set is followed by an info refresh so
        // the local cache always mirrors what the remote actually accepted.
        let video_format = ElementaryFormat {
            es_type: EsType::Video,
            encoding: encodings::I420,
            encoding_variant: NO_VARIANT,
            width: cfg.camera.width,
            height: cfg.camera.height,
            frame_rate_num: cfg.camera.fps,
            frame_rate_den: 1,
            bitrate: 0,
        };
        set_format(rpc, &mut store, camera_video, video_format)
            .map_err(Error::at_stage("camera video format"))?;

        let preview_format = ElementaryFormat {
            width: cfg.preview.width,
            height: cfg.preview.height,
            ..video_format
        };
        if let Some(r) = resizer {
            let tunnel_format = ElementaryFormat {
                encoding: encodings::OPAQUE,
                ..preview_format
            };
            set_format(rpc, &mut store, camera_preview, tunnel_format)
                .map_err(Error::at_stage("camera preview format"))?;
            set_format(rpc, &mut store, in_port(r), tunnel_format)
                .map_err(Error::at_stage("resizer input format"))?;
        }
        set_format(rpc, &mut store, preview_out_ref, preview_format)
            .map_err(Error::at_stage("preview format"))?;

        set_format(rpc, &mut store, encoder_in, video_format)
            .map_err(Error::at_stage("encoder input format"))?;
        let encoder_format = ElementaryFormat {
            encoding: encodings::H264,
            bitrate: cfg.encoder.bitrate,
            ..video_format
        };
        set_format(rpc, &mut store, encoder_out_ref, encoder_format)
            .map_err(Error::at_stage("encoder output format"))?;

        // Encoder tuning, set once at creation time.
        let encoder_out_handle = store.port(encoder_out_ref)?.settings.port_handle;
        {
            let tune = |id, value| rpc.parameter_set_u32(encoder_handle, encoder_out_handle, id, value);
            tune(params::VIDEO_BIT_RATE, cfg.encoder.bitrate)
                .and_then(|_| tune(params::VIDEO_INTRAPERIOD, cfg.encoder.intra_period))
                .and_then(|_| tune(params::VIDEO_ENCODE_MIN_QUANT, cfg.encoder.quant_min))
                .and_then(|_| tune(params::VIDEO_ENCODE_MAX_QUANT, cfg.encoder.quant_max))
                .map_err(Error::at_stage("encoder tuning"))?;
            let mut profile = [0u8; 8];
            profile[0..4].copy_from_slice(&(cfg.encoder.profile as u32).to_le_bytes());
            profile[4..8].copy_from_slice(&cfg.encoder.level_idc.to_le_bytes());
            rpc.parameter_set(encoder_handle, encoder_out_handle, params::VIDEO_PROFILE, &profile)
                .map_err(Error::at_stage("encoder tuning"))?;
            rpc.parameter_set_bool(
                encoder_handle,
                encoder_out_handle,
                params::VIDEO_ENCODE_INLINE_HEADER,
                cfg.encoder.inline_headers,
            )
            .map_err(Error::at_stage("encoder tuning"))?;
        }

        // Every port that crosses the host boundary runs zero-copy.
        let preview_binding = binding(&store, preview_out_ref)?;
        rpc.parameter_set_bool(
            preview_binding.component,
            preview_binding.port_handle,
            params::ZERO_COPY,
            true,
        )
        .map_err(Error::at_stage("zero copy"))?;
        rpc.parameter_set_bool(encoder_handle, encoder_out_handle, params::ZERO_COPY, true)
            .map_err(Error::at_stage("zero copy"))?;

        // Tunnel connections stay entirely on the remote side.
        let camera_video_handle = store.port(camera_video)?.settings.port_handle;
        let encoder_in_handle = store.port(encoder_in)?.settings.port_handle;
        rpc.port_action(
            camera_handle,
            camera_video_handle,
            PortActionKind::Connect,
            Some((encoder_handle, encoder_in_handle)),
        )
        .map_err(Error::at_stage("port connect"))?;
        if let Some(r) = resizer {
            let resizer_handle = store.get(r)?.handle;
            let camera_preview_handle = store.port(camera_preview)?.settings.port_handle;
            let resizer_in_handle = store.port(in_port(r))?.settings.port_handle;
            rpc.port_action(
                camera_handle,
                camera_preview_handle,
                PortActionKind::Connect,
                Some((resizer_handle, resizer_in_handle)),
            )
            .map_err(Error::at_stage("port connect"))?;
        }
        info!("ports connected");

        // Enable the data ports, then the components themselves, then
        // refresh so the cached enabled flags are authoritative.
        enable_port(rpc, &mut store, camera_video).map_err(Error::at_stage("port enable"))?;
        enable_port(rpc, &mut store, encoder_in).map_err(Error::at_stage("port enable"))?;
        enable_port(rpc, &mut store, encoder_out_ref).map_err(Error::at_stage("port enable"))?;
        if let Some(r) = resizer {
            enable_port(rpc, &mut store, camera_preview).map_err(Error::at_stage("port enable"))?;
            enable_port(rpc, &mut store, in_port(r)).map_err(Error::at_stage("port enable"))?;
        }
        enable_port(rpc, &mut store, preview_out_ref).map_err(Error::at_stage("port enable"))?;
        rpc.component_enable(camera_handle)
            .map_err(Error::at_stage("component enable"))?;
        rpc.component_enable(encoder_handle)
            .map_err(Error::at_stage("component enable"))?;
        if let Some(r) = resizer {
            rpc.component_enable(store.get(r)?.handle)
                .map_err(Error::at_stage("component enable"))?;
        }

        // Pool sizing: honor the remote's minimums, take its recommended
        // counts, and apply our own headroom policy on top for the encoded
        // stream so storage jitter never starves the encoder.
        let encoder_port = store.port(encoder_out_ref)?;
        let video_count = (encoder_port.settings.buffer_num_recommended)
            .max(encoder_port.settings.buffer_num_min)
            .max(cfg.encoder.output_buffer_count) as usize;
        let video_bytes = (encoder_port.settings.buffer_size_recommended)
            .max(encoder_port.settings.buffer_size_min)
            .max(cfg.encoder.output_buffer_bytes) as usize;
        let preview_port = store.port(preview_out_ref)?;
        let preview_count = (preview_port.settings.buffer_num_recommended)
            .max(preview_port.settings.buffer_num_min)
            .max(cfg.preview.buffer_count) as usize;
        let preview_bytes = (preview_port.settings.buffer_size_recommended)
            .max(preview_port.settings.buffer_size_min)
            .max((cfg.preview.width * cfg.preview.height * 3 / 2) as u32)
            as usize;

        let video_pool = BufferPool::new(video_count, video_bytes, imports);
        let preview_pool = BufferPool::new(preview_count, preview_bytes, imports);
        let preview_queue = Arc::new(Mutex::new(PreviewQueue::new(cfg.preview.queue_depth)));
        let capturing = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let encoder_out = PortBinding {
            component: encoder_handle,
            port_handle: encoder_out_handle,
        };
        let preview_out = preview_binding;

        // IO worker: consumes returned buffers in completion order and is
        // the only place storage or display work happens.
        let worker = {
            let video_pool = Arc::clone(&video_pool);
            let preview_pool = Arc::clone(&preview_pool);
            let writer = Arc::clone(&writer);
            let display = Arc::clone(&display);
            let preview_queue = Arc::clone(&preview_queue);
            let capturing = Arc::clone(&capturing);
            let counters = Arc::clone(&counters);
            let rpc_weak = Arc::downgrade(rpc);
            IoWorker::spawn("vclink-io", move |item| {
                let result = process_item(
                    &item,
                    encoder_out,
                    preview_out,
                    &video_pool,
                    &preview_pool,
                    &writer,
                    &display,
                    &preview_queue,
                    &capturing,
                    &counters,
                    &rpc_weak,
                );
                if let Err(err) = result {
                    error!(%err, buffer = item.buffer, "buffer work failed");
                    counters.work_errors.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        // Dispatch-side handler: queue moves only, never IO. Registered
        // before the first submission so no return can be missed.
        {
            let video_pool = Arc::clone(&video_pool);
            let preview_pool = Arc::clone(&preview_pool);
            let preview_queue = Arc::clone(&preview_queue);
            let display = Arc::clone(&display);
            let counters = Arc::clone(&counters);
            let rpc_weak = Arc::downgrade(rpc);
            let work_tx = worker.sender();
            let mode = cfg.preview.mode;
            rpc.register_buffer_handler(BufferHandler(Box::new(move |transfer, status| {
                if !status.is_ok() {
                    warn!(%status, "buffer returned with error status");
                }
                if transfer.port_handle == encoder_out.port_handle {
                    let idx = video_pool
                        .by_context(transfer.client_context)
                        .ok_or(Error::Corrupted("returned buffer context unknown"))?;
                    video_pool.complete(idx, &transfer)?;
                    let _ = work_tx.send(WorkItem {
                        buffer: idx,
                        transfer,
                    });
                    Ok(())
                } else if transfer.port_handle == preview_out.port_handle {
                    let idx = preview_pool
                        .by_context(transfer.client_context)
                        .ok_or(Error::Corrupted("returned buffer context unknown"))?;
                    match mode {
                        PreviewMode::Shortcut => {
                            // Low-latency path: the buffer goes back to the
                            // remote before the display has read it. A
                            // redraw racing the refill can tear; the stall
                            // it avoids costs more than the tear.
                            preview_pool.requeue_remote(idx)?;
                            let frame = PreviewFrame {
                                sequence: counters.preview_sequence.fetch_add(1, Ordering::Relaxed),
                                pts: transfer.pts,
                                payload: PreviewPayload::Shared {
                                    buffer: Arc::clone(preview_pool.buffer(idx)),
                                    length: transfer.length as usize,
                                },
                            };
                            preview_queue.lock().unwrap().push(frame.clone());
                            if display.try_draw(&frame) {
                                counters.preview_frames.fetch_add(1, Ordering::Relaxed);
                            } else {
                                counters.preview_dropped.fetch_add(1, Ordering::Relaxed);
                                metrics::counter!("vclink_preview_dropped").increment(1);
                            }
                            if let Some(rpc) = rpc_weak.upgrade() {
                                rpc.submit_buffer(&preview_pool.transfer_for(
                                    idx,
                                    preview_out.component,
                                    preview_out.port_handle,
                                ))?;
                            }
                            Ok(())
                        }
                        PreviewMode::Strict => {
                            preview_pool.complete(idx, &transfer)?;
                            let _ = work_tx.send(WorkItem {
                                buffer: idx,
                                transfer,
                            });
                            Ok(())
                        }
                    }
                } else {
                    Err(Error::Corrupted("buffer returned for unknown port"))
                }
            })));
        }

        let driver = Arc::new(PipelineDriver {
            rpc: Arc::clone(rpc),
            store: Mutex::new(store),
            camera,
            encoder,
            resizer,
            camera_handle,
            camera_video_handle,
            encoder_out,
            preview_out,
            video_pool,
            preview_pool,
            preview_queue,
            worker: Mutex::new(worker),
            capturing,
            counters,
            state: Mutex::new(RunState::PortsConnected),
        });

        driver
            .prime(&driver.video_pool, driver.encoder_out)
            .map_err(Error::at_stage("buffer priming"))?;
        driver
            .prime(&driver.preview_pool, driver.preview_out)
            .map_err(Error::at_stage("buffer priming"))?;
        *driver.state.lock().unwrap() = RunState::BuffersPrimed;
        info!(
            video_buffers = driver.video_pool.len(),
            preview_buffers = driver.preview_pool.len(),
            "pipeline primed"
        );
        Ok(driver)
    }

    /// Re-submit whatever sits in the free queues, e.g. after a transient
    /// submission failure parked buffers there. Same fail-fast rule as the
    /// initial priming: disabled ports take nothing.
    pub fn top_up(&self) -> Result<usize> {
        let video = self.prime(&self.video_pool, self.encoder_out)?;
        let preview = self.prime(&self.preview_pool, self.preview_out)?;
        Ok(video + preview)
    }

    /// Hand every free buffer of `pool` to the remote port. Fails fast if
    /// the port is not enabled — nothing is ever queued for a dead port.
    fn prime(&self, pool: &Arc<BufferPool>, to: PortBinding) -> Result<usize> {
        {
            let store = self.store.lock().unwrap();
            if !port_enabled(&store, to.port_handle) {
                return Err(Error::NotReady);
            }
        }
        let mut submitted = 0;
        while let Some(idx) = pool.claim_free() {
            let transfer = pool.transfer_for(idx, to.component, to.port_handle);
            if let Err(err) = self.rpc.submit_buffer(&transfer) {
                pool.abort_submit(idx);
                return Err(err);
            }
            submitted += 1;
        }
        debug!(submitted, port = to.port_handle, "buffers primed");
        Ok(submitted)
    }

    /// Toggle capture on the camera's video port.
    #[tracing::instrument(skip(self))]
    pub fn start_capture(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match *state {
            RunState::BuffersPrimed | RunState::Stopped => {}
            _ => return Err(Error::NotReady),
        }
        self.rpc.parameter_set_u32(
            self.camera_handle,
            self.camera_video_handle,
            params::CAPTURE,
            1,
        )?;
        self.capturing.store(true, Ordering::Release);
        *state = RunState::Capturing;
        drop(state);
        // Anything that drained back to free while idle goes out again.
        self.top_up()?;
        info!("capture started");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn stop_capture(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != RunState::Capturing {
            return Err(Error::NotReady);
        }
        self.capturing.store(false, Ordering::Release);
        self.rpc.parameter_set_u32(
            self.camera_handle,
            self.camera_video_handle,
            params::CAPTURE,
            0,
        )?;
        *state = RunState::Stopped;
        info!("capture stopped");
        Ok(())
    }

    /// Stop capture, quiesce the return paths, disable the remote graph,
    /// and join the worker. Remote failures are logged, not fatal — the
    /// teardown keeps going.
    pub fn shutdown(&self) {
        if self.capturing.load(Ordering::Acquire) {
            if let Err(err) = self.stop_capture() {
                warn!(%err, "stop capture during shutdown");
            }
        }
        self.rpc.clear_buffer_handler();

        let mut store = self.store.lock().unwrap();
        let mut targets = vec![
            (self.encoder_out.component, self.encoder_out.port_handle),
            (self.preview_out.component, self.preview_out.port_handle),
            (self.camera_handle, self.camera_video_handle),
        ];
        let mut components = vec![self.camera_handle];
        if let Ok(encoder) = store.get(self.encoder) {
            components.push(encoder.handle);
        }
        if let Some(r) = self.resizer {
            if let Ok(resizer) = store.get(r) {
                components.push(resizer.handle);
            }
        }
        // Mirror the disables into the cache so later submissions fail
        // fast locally instead of querying a dead graph.
        for id in [Some(self.camera), Some(self.encoder), self.resizer]
            .into_iter()
            .flatten()
        {
            if let Ok(component) = store.get_mut(id) {
                component.control.settings.enabled = false;
                for port in component.inputs.iter_mut().chain(component.outputs.iter_mut()) {
                    port.settings.enabled = false;
                }
            }
        }
        drop(store);
        targets.dedup();
        for (component, port_handle) in targets {
            if let Err(err) =
                self.rpc
                    .port_action(component, port_handle, PortActionKind::Disable, None)
            {
                warn!(%err, port_handle, "port disable during shutdown");
            }
        }
        for component in components {
            if let Err(err) = self.rpc.component_disable(component) {
                warn!(%err, component, "component disable during shutdown");
            }
        }
        self.worker.lock().unwrap().shutdown();
        *self.state.lock().unwrap() = RunState::ShutDown;
        info!("pipeline shut down");
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap()
    }

    pub fn video_pool(&self) -> &Arc<BufferPool> {
        &self.video_pool
    }

    pub fn preview_pool(&self) -> &Arc<BufferPool> {
        &self.preview_pool
    }

    /// Newest preview frame, if any arrived yet.
    pub fn latest_preview(&self) -> Option<Arc<PreviewFrame>> {
        self.preview_queue.lock().unwrap().latest()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            encoded_frames: self.counters.encoded_frames.load(Ordering::Relaxed),
            encoded_bytes: self.counters.encoded_bytes.load(Ordering::Relaxed),
            preview_frames: self.counters.preview_frames.load(Ordering::Relaxed),
            preview_dropped: self.counters.preview_dropped.load(Ordering::Relaxed),
            work_errors: self.counters.work_errors.load(Ordering::Relaxed),
            video_census: self.video_pool.census(),
            preview_census: self.preview_pool.census(),
        }
    }
}

/// Zero fourcc for "no variant".
const NO_VARIANT: crate::transport::FourCc = crate::transport::FourCc(0);

fn out_port(component: ComponentId, index: usize) -> PortRef {
    PortRef {
        component,
        kind: PortKind::Output,
        index,
    }
}

fn in_port(component: ComponentId) -> PortRef {
    PortRef {
        component,
        kind: PortKind::Input,
        index: 0,
    }
}

fn binding(store: &ComponentStore, port: PortRef) -> Result<PortBinding> {
    Ok(PortBinding {
        component: store.get(port.component)?.handle,
        port_handle: store.port(port)?.settings.port_handle,
    })
}

fn port_enabled(store: &ComponentStore, port_handle: u32) -> bool {
    // Linear scan over the cached graph; it is tiny.
    for id in 0.. {
        let Ok(component) = store.get(id) else { break };
        for port in std::iter::once(&component.control)
            .chain(component.inputs.iter())
            .chain(component.outputs.iter())
        {
            if port.settings.port_handle == port_handle {
                return port.settings.enabled;
            }
        }
    }
    false
}

/// Create a component and pull the initial info for every port it has.
fn create_component(
    rpc: &Arc<RpcClient>,
    store: &mut ComponentStore,
    name: &str,
) -> Result<ComponentId> {
    let (handle, input_count, output_count) = rpc.component_create(name)?;
    let id = store.add(name, handle, input_count, output_count);
    refresh_port(rpc, store, PortRef {
        component: id,
        kind: PortKind::Control,
        index: 0,
    })?;
    for index in 0..input_count as usize {
        refresh_port(rpc, store, PortRef {
            component: id,
            kind: PortKind::Input,
            index,
        })?;
    }
    for index in 0..output_count as usize {
        refresh_port(rpc, store, PortRef {
            component: id,
            kind: PortKind::Output,
            index,
        })?;
    }
    Ok(id)
}

fn refresh_port(rpc: &Arc<RpcClient>, store: &mut ComponentStore, port: PortRef) -> Result<()> {
    let component = store.get(port.component)?.handle;
    let (settings, format) = rpc.port_info(component, port.kind, store.port(port)?.index)?;
    store.apply_port_info(port, settings, format)
}

/// Push a format to the remote, then refresh the cache with what it
/// actually accepted.
fn set_format(
    rpc: &Arc<RpcClient>,
    store: &mut ComponentStore,
    port: PortRef,
    format: ElementaryFormat,
) -> Result<()> {
    let component = store.get(port.component)?.handle;
    let current = store.port(port)?;
    rpc.set_port_info(component, port.kind, current.index, current.settings, format)?;
    refresh_port(rpc, store, port)
}

fn enable_port(rpc: &Arc<RpcClient>, store: &mut ComponentStore, port: PortRef) -> Result<()> {
    let component = store.get(port.component)?.handle;
    let port_handle = store.port(port)?.settings.port_handle;
    rpc.port_action(component, port_handle, PortActionKind::Enable, None)?;
    refresh_port(rpc, store, port)
}

/// Worker-side processing for one returned buffer.
#[allow(clippy::too_many_arguments)]
fn process_item(
    item: &WorkItem,
    encoder_out: PortBinding,
    preview_out: PortBinding,
    video_pool: &Arc<BufferPool>,
    preview_pool: &Arc<BufferPool>,
    writer: &Arc<Mutex<dyn StreamWriter>>,
    display: &Arc<dyn DisplaySink>,
    preview_queue: &Arc<Mutex<PreviewQueue>>,
    capturing: &AtomicBool,
    counters: &Arc<Counters>,
    rpc: &Weak<RpcClient>,
) -> Result<()> {
    if item.transfer.port_handle == encoder_out.port_handle {
        video_pool.begin_processing(item.buffer)?;
        let (payload, flags, pts) = video_pool.buffer(item.buffer).snapshot();
        counters.encoded_frames.fetch_add(1, Ordering::Relaxed);
        counters
            .encoded_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        metrics::histogram!("vclink_encoded_buffer_bytes").record(payload.len() as f64);
        // A failed write loses the frame, never the buffer: it still goes
        // back into circulation below.
        if let Err(err) = writer.lock().unwrap().append(payload, flags, pts) {
            error!(%err, "storage append failed, frame lost");
            counters.work_errors.fetch_add(1, Ordering::Relaxed);
        }
        recycle(video_pool, item.buffer, encoder_out, capturing, rpc)
    } else {
        preview_pool.begin_processing(item.buffer)?;
        let (payload, _flags, pts) = preview_pool.buffer(item.buffer).snapshot();
        let frame = PreviewFrame {
            sequence: counters.preview_sequence.fetch_add(1, Ordering::Relaxed),
            pts,
            payload: PreviewPayload::Copied(payload),
        };
        preview_queue.lock().unwrap().push(frame.clone());
        if display.try_draw(&frame) {
            counters.preview_frames.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.preview_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("vclink_preview_dropped").increment(1);
        }
        recycle(preview_pool, item.buffer, preview_out, capturing, rpc)
    }
}

/// Close the ownership cycle: back to the remote while capturing, back to
/// the free queue otherwise.
fn recycle(
    pool: &Arc<BufferPool>,
    index: usize,
    to: PortBinding,
    capturing: &AtomicBool,
    rpc: &Weak<RpcClient>,
) -> Result<()> {
    if capturing.load(Ordering::Acquire) {
        if let Some(rpc) = rpc.upgrade() {
            pool.resubmit(index)?;
            let transfer = pool.transfer_for(index, to.component, to.port_handle);
            if let Err(err) = rpc.submit_buffer(&transfer) {
                warn!(%err, index, "resubmission failed, buffer parked as free");
                pool.abort_submit(index);
            }
            return Ok(());
        }
    }
    pool.finish(index)
}
