//! Scripted remote endpoint for tests and bring-up
//!
//! Drives the far side of the slot arena the way the real co-processor
//! would: answers the connect handshake, acknowledges service opens, keeps
//! its own opaque component/port handle space, and echoes submitted buffers
//! back in submission order after a configurable (deterministic) delay,
//! filling their shared backing memory first. Reply statuses can be
//! scripted per message type to exercise every rejection path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, warn};

use crate::buffers::ImportTable;
use crate::error::Result;
use crate::mmal::wire::{
    self, BufferFlags, BufferTransfer, ElementaryFormat, EsType, MmalFrame, MmalMsgType,
    MmalReply, MmalRequest, MmalStatus, PortActionKind, PortKind, PortSettings,
};
use crate::mmal::{params, CameraInfo, CameraModel, SERVICE_NAME};
use crate::service;
use crate::transport::wire::{pack_msg_id, MsgId, MsgKind};
use crate::transport::{FourCc, Side, SlotArena};

/// How the simulated remote behaves. Everything is deterministic; the
/// "random" completion delay comes from a seeded xorshift.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Acknowledge service opens. `false` simulates a hung remote.
    pub answer_opens: bool,
    /// Protocol version granted in open acknowledgments.
    pub open_version: u16,
    /// Reply to these message types with a fixed status instead of
    /// processing them.
    pub status_overrides: Vec<(MmalMsgType, MmalStatus)>,
    /// Never reply to these message types at all. Simulates a remote that
    /// wedged mid-call.
    pub mute: Vec<MmalMsgType>,
    /// Completion delay range in microseconds, inclusive.
    pub completion_delay_us: (u64, u64),
    /// Bytes of payload written into each echoed buffer.
    pub frame_bytes: usize,
    /// Every n-th frame is flagged as a keyframe.
    pub keyframe_interval: u64,
    /// Presentation-timestamp step between frames.
    pub frame_interval_us: u64,
    /// Hold buffer echoes until the capture parameter is switched on,
    /// the way a real encoder only produces while the camera captures.
    pub echo_requires_capture: bool,
    /// Seed for the delay generator.
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            answer_opens: true,
            open_version: 14,
            status_overrides: Vec::new(),
            mute: Vec::new(),
            completion_delay_us: (0, 0),
            frame_bytes: 8_192,
            keyframe_interval: 30,
            frame_interval_us: 33_333, // 30fps
            echo_requires_capture: false,
            seed: 0x2545_f491_4f6c_dd1d,
        }
    }
}

struct SimPort {
    kind: PortKind,
    index: u32,
    settings: PortSettings,
    format: ElementaryFormat,
}

struct SimComponent {
    name: String,
    handle: u32,
    enabled: bool,
    ports: Vec<SimPort>,
}

struct SimState {
    connected: bool,
    next_port: u16,
    media_ports: Option<(u16, u16)>, // (host port, our port)
    components: Vec<SimComponent>,
    next_component_handle: u32,
    next_port_handle: u32,
    parameters: HashMap<(u32, u32), Bytes>,
    frames: u64,
    rng: XorShift,
}

struct EchoJob {
    transfer: BufferTransfer,
    delay_us: u64,
    src_port: u16,
    dst_port: u16,
}

struct SimInner {
    arena: Arc<SlotArena>,
    imports: Arc<ImportTable>,
    cfg: SimConfig,
    stop: Arc<AtomicBool>,
    capturing: AtomicBool,
    echo_tx: flume::Sender<EchoJob>,
    state: Mutex<SimState>,
}

/// Handle to the running simulator threads.
pub struct SimRemote {
    inner: Arc<SimInner>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const IDLE_WAIT: Duration = Duration::from_millis(50);

impl SimRemote {
    /// Start the remote over an initialized arena. The import table must be
    /// the one the host registers its buffer memory with — that is the
    /// shared-memory half of the zero-copy contract.
    pub fn spawn(arena: Arc<SlotArena>, imports: Arc<ImportTable>, cfg: SimConfig) -> SimRemote {
        if let Err(err) = arena.verify_header() {
            warn!(%err, "arena header check failed");
        }
        let stop = Arc::new(AtomicBool::new(false));
        let (echo_tx, echo_rx) = flume::unbounded();
        let seed = cfg.seed;
        let inner = Arc::new(SimInner {
            arena,
            imports,
            cfg,
            stop: Arc::clone(&stop),
            capturing: AtomicBool::new(false),
            echo_tx,
            state: Mutex::new(SimState {
                connected: false,
                next_port: 90,
                media_ports: None,
                components: Vec::new(),
                next_component_handle: 0x1000,
                next_port_handle: 0x300,
                parameters: HashMap::new(),
                frames: 0,
                rng: XorShift::new(seed),
            }),
        });

        let mut threads = Vec::new();
        {
            let inner = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name("sim-vc-rx".into())
                    .spawn(move || inner.run_reader())
                    .expect("spawn sim reader"),
            );
        }
        {
            let inner = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name("sim-vc-echo".into())
                    .spawn(move || inner.run_completer(echo_rx))
                    .expect("spawn sim completer"),
            );
        }
        info!("simulated remote running");
        SimRemote {
            inner,
            stop,
            threads,
        }
    }

    /// Buffers echoed so far.
    pub fn frames_produced(&self) -> u64 {
        self.inner.state.lock().unwrap().frames
    }

    /// Whether the host has switched capture on.
    pub fn capturing(&self) -> bool {
        self.inner.capturing.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SimRemote {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SimInner {
    fn run_reader(&self) {
        let mut cursor = 0u32;
        while !self.stop.load(Ordering::Acquire) {
            self.arena.wait_incoming(Side::Remote, IDLE_WAIT);
            // Reclaim doubles up on this thread; the traffic is light
            // enough that a dedicated validator buys nothing here.
            if let Err(err) = self.arena.reclaim(Side::Remote) {
                error!(%err, "remote reclaim failed");
                break;
            }
            let drained = self
                .arena
                .drain(Side::Remote, &mut cursor, |id, payload| self.handle(id, payload));
            if let Err(err) = drained {
                error!(%err, "remote dispatch failed");
                break;
            }
        }
        debug!("sim reader stopped");
    }

    fn send(&self, msg_id: u32, payload: &[u8]) {
        if let Err(err) = self.arena.send(Side::Remote, msg_id, payload, SEND_TIMEOUT) {
            warn!(%err, "remote send failed");
        }
    }

    fn handle(&self, id: MsgId, payload: Bytes) -> Result<()> {
        match id.kind()? {
            MsgKind::Connect => {
                let mut st = self.state.lock().unwrap();
                if !st.connected {
                    st.connected = true;
                    drop(st);
                    self.send(pack_msg_id(MsgKind::Connect, 0, 0), &[]);
                }
                Ok(())
            }
            MsgKind::Open => {
                if !self.cfg.answer_opens {
                    debug!("ignoring service open");
                    return Ok(());
                }
                let (fourcc, version, version_min) = service::decode_open(payload)?;
                let granted = self.cfg.open_version.clamp(version_min, version);
                let remote_port = {
                    let mut st = self.state.lock().unwrap();
                    let port = st.next_port;
                    st.next_port += 1;
                    if fourcc == SERVICE_NAME {
                        st.media_ports = Some((id.src_port(), port));
                    }
                    port
                };
                debug!(%fourcc, host_port = id.src_port(), remote_port, granted, "service open");
                self.send(
                    pack_msg_id(MsgKind::OpenAck, remote_port, id.src_port()),
                    &service::encode_open_ack(granted),
                );
                Ok(())
            }
            MsgKind::Data => {
                let frame = wire::decode_frame(payload)?;
                self.handle_media(id.src_port(), id.dst_port(), frame)
            }
            MsgKind::OpenAck => {
                warn!("unexpected open acknowledgment from host");
                Ok(())
            }
            MsgKind::Padding => Ok(()),
        }
    }

    fn handle_media(&self, host_port: u16, our_port: u16, frame: MmalFrame) -> Result<()> {
        if frame.msg_type == MmalMsgType::BufferFromHost {
            let transfer = BufferTransfer::decode(&mut frame.payload.clone())?;
            let delay_us = {
                let mut st = self.state.lock().unwrap();
                let (lo, hi) = self.cfg.completion_delay_us;
                st.rng.range(lo, hi)
            };
            let _ = self.echo_tx.send(EchoJob {
                transfer,
                delay_us,
                src_port: our_port,
                dst_port: host_port,
            });
            return Ok(());
        }

        if self.cfg.mute.contains(&frame.msg_type) {
            debug!(msg_type = ?frame.msg_type, "muted, not replying");
            return Ok(());
        }

        if let Some(&(_, status)) = self
            .cfg
            .status_overrides
            .iter()
            .find(|(t, _)| *t == frame.msg_type)
        {
            return self.reply(our_port, host_port, frame.msg_type, frame.context, status, &[]);
        }

        let request = MmalRequest::decode(frame.msg_type, frame.payload.clone())?;
        let (status, reply) = self.apply(request);
        let mut body = BytesMut::new();
        if status.is_ok() {
            reply.encode(&mut body);
        }
        self.reply(our_port, host_port, frame.msg_type, frame.context, status, &body)
    }

    fn reply(
        &self,
        src_port: u16,
        dst_port: u16,
        msg_type: MmalMsgType,
        context: u32,
        status: MmalStatus,
        body: &[u8],
    ) -> Result<()> {
        let frame = wire::encode_frame(msg_type, 0, context, status, body)?;
        self.send(pack_msg_id(MsgKind::Data, src_port, dst_port), &frame);
        Ok(())
    }

    /// Process a decoded request against the simulated object space.
    fn apply(&self, request: MmalRequest) -> (MmalStatus, MmalReply) {
        let mut st = self.state.lock().unwrap();
        match request {
            MmalRequest::ComponentCreate { name, .. } => {
                let (input_count, output_count) = match name.as_str() {
                    "vc.ril.camera" => (0u32, 3u32),
                    "vc.ril.video_encode" => (1, 1),
                    "vc.ril.resizer" => (1, 1),
                    _ => return (MmalStatus::ENOENT, MmalReply::Ack),
                };
                let handle = st.next_component_handle;
                st.next_component_handle += 1;
                let mut ports = Vec::new();
                ports.push(st.new_port(PortKind::Control, 0, &name));
                for index in 0..input_count {
                    ports.push(st.new_port(PortKind::Input, index, &name));
                }
                for index in 0..output_count {
                    ports.push(st.new_port(PortKind::Output, index, &name));
                }
                st.components.push(SimComponent {
                    name: name.clone(),
                    handle,
                    enabled: false,
                    ports,
                });
                debug!(%name, handle, "component created");
                (
                    MmalStatus::SUCCESS,
                    MmalReply::ComponentCreate {
                        component: handle,
                        input_count,
                        output_count,
                    },
                )
            }
            MmalRequest::ComponentDestroy { component } => {
                let before = st.components.len();
                st.components.retain(|c| c.handle != component);
                if st.components.len() == before {
                    (MmalStatus::ENOENT, MmalReply::Ack)
                } else {
                    (MmalStatus::SUCCESS, MmalReply::Ack)
                }
            }
            MmalRequest::ComponentEnable { component } => {
                st.set_component_enabled(component, true)
            }
            MmalRequest::ComponentDisable { component } => {
                st.set_component_enabled(component, false)
            }
            MmalRequest::PortInfoGet {
                component,
                kind,
                index,
            } => match st.port(component, kind, index) {
                Some(port) => (
                    MmalStatus::SUCCESS,
                    MmalReply::PortInfo {
                        port: port.settings,
                        format: port.format,
                    },
                ),
                None => (MmalStatus::EINVAL, MmalReply::Ack),
            },
            MmalRequest::PortInfoSet {
                component,
                kind,
                index,
                port,
                format,
            } => match st.port_mut(component, kind, index) {
                Some(slot) => {
                    // The host may steer counts and sizes within our
                    // limits; minimums and recommendations stay ours.
                    if port.buffer_num != 0 {
                        slot.settings.buffer_num = port.buffer_num.max(slot.settings.buffer_num_min);
                    }
                    if port.buffer_size != 0 {
                        slot.settings.buffer_size =
                            port.buffer_size.max(slot.settings.buffer_size_min);
                    }
                    slot.format = format;
                    (MmalStatus::SUCCESS, MmalReply::Ack)
                }
                None => (MmalStatus::EINVAL, MmalReply::Ack),
            },
            MmalRequest::PortAction {
                port_handle,
                action,
                ..
            } => match st.port_by_handle(port_handle) {
                Some(port) => {
                    match action {
                        PortActionKind::Enable => port.settings.enabled = true,
                        PortActionKind::Disable => port.settings.enabled = false,
                        PortActionKind::Flush
                        | PortActionKind::Connect
                        | PortActionKind::Disconnect => {}
                    }
                    (MmalStatus::SUCCESS, MmalReply::Ack)
                }
                None => (MmalStatus::EINVAL, MmalReply::Ack),
            },
            MmalRequest::PortParameterSet {
                port_handle,
                id,
                value,
                ..
            } => {
                if id == params::CAPTURE {
                    let on = value.first().copied().unwrap_or(0) != 0;
                    self.capturing.store(on, Ordering::Release);
                    debug!(on, "capture toggled");
                }
                st.parameters.insert((port_handle, id), value);
                (MmalStatus::SUCCESS, MmalReply::Ack)
            }
            MmalRequest::PortParameterGet {
                port_handle, id, ..
            } => {
                if id == params::CAMERA_INFO {
                    let info = CameraInfo {
                        cameras: vec![CameraModel {
                            max_width: 3280,
                            max_height: 2464,
                        }],
                    };
                    return (
                        MmalStatus::SUCCESS,
                        MmalReply::ParameterValue {
                            id,
                            value: info.encode(),
                        },
                    );
                }
                match st.parameters.get(&(port_handle, id)) {
                    Some(value) => (
                        MmalStatus::SUCCESS,
                        MmalReply::ParameterValue {
                            id,
                            value: value.clone(),
                        },
                    ),
                    None => (MmalStatus::ENOENT, MmalReply::Ack),
                }
            }
            MmalRequest::BufferFromHost(_) => {
                // Routed to the completer before decode; getting here means
                // the dispatcher above changed and this arm went stale.
                (MmalStatus::ENOSYS, MmalReply::Ack)
            }
        }
    }

    /// Echo thread: fill each submitted buffer's shared memory and send it
    /// back, strictly in submission order.
    fn run_completer(&self, rx: flume::Receiver<EchoJob>) {
        while !self.stop.load(Ordering::Acquire) {
            let job = match rx.recv_timeout(IDLE_WAIT) {
                Ok(job) => job,
                Err(flume::RecvTimeoutError::Timeout) => continue,
                Err(flume::RecvTimeoutError::Disconnected) => break,
            };
            if self.cfg.echo_requires_capture {
                while !self.capturing.load(Ordering::Acquire) {
                    if self.stop.load(Ordering::Acquire) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            if job.delay_us > 0 {
                std::thread::sleep(Duration::from_micros(job.delay_us));
            }

            let length = self.cfg.frame_bytes.min(job.transfer.alloc_size as usize);
            let frame_no = {
                let mut st = self.state.lock().unwrap();
                let n = st.frames;
                st.frames += 1;
                n
            };
            match self.imports.lookup(job.transfer.import_handle) {
                Some(buffer) => {
                    // Writing through the import token is the zero-copy
                    // path: the payload lands in host-visible memory and
                    // only the descriptor crosses the ring.
                    let mut data = buffer.data();
                    let n = length.min(data.bytes.len());
                    for (i, byte) in data.bytes[..n].iter_mut().enumerate() {
                        *byte = (frame_no as u8).wrapping_add(i as u8);
                    }
                }
                None => warn!(
                    token = job.transfer.import_handle,
                    "echo for unknown import token"
                ),
            }

            let mut flags = BufferFlags::FRAME;
            if frame_no == 0 {
                flags = flags | BufferFlags::CONFIG;
            }
            if self.cfg.keyframe_interval > 0 && frame_no % self.cfg.keyframe_interval == 0 {
                flags = flags | BufferFlags::KEYFRAME;
            }
            let pts = (frame_no * self.cfg.frame_interval_us) as i64;
            let back = BufferTransfer {
                length: length as u32,
                flags,
                pts,
                dts: pts,
                ..job.transfer
            };
            let mut body = BytesMut::new();
            back.encode(&mut body);
            match wire::encode_frame(MmalMsgType::BufferToHost, 0, 0, MmalStatus::SUCCESS, &body) {
                Ok(frame) => self.send(
                    pack_msg_id(MsgKind::Data, job.src_port, job.dst_port),
                    &frame,
                ),
                Err(err) => warn!(%err, "buffer echo encode failed"),
            }
        }
        debug!("sim completer stopped");
    }
}

impl SimState {
    fn new_port(&mut self, kind: PortKind, index: u32, component_name: &str) -> SimPort {
        let handle = self.next_port_handle;
        self.next_port_handle += 1;
        // Requirement policy mirrors what the firmware suggests for these
        // components: small pools for raw frames, deeper for encoded output.
        let (num_min, num_rec, size_min, size_rec) = match (component_name, kind) {
            ("vc.ril.video_encode", PortKind::Output) => (1, 8, 65_536, 262_144),
            (_, PortKind::Output) => (1, 4, 4_096, 307_200),
            _ => (1, 2, 4_096, 307_200),
        };
        SimPort {
            kind,
            index,
            settings: PortSettings {
                port_handle: handle,
                enabled: false,
                buffer_num_min: num_min,
                buffer_num_recommended: num_rec,
                buffer_num: num_rec,
                buffer_size_min: size_min,
                buffer_size_recommended: size_rec,
                buffer_size: size_rec,
                buffer_alignment_min: 16,
            },
            format: ElementaryFormat {
                es_type: EsType::Video,
                encoding: FourCc::new(b"OPQV"),
                ..ElementaryFormat::default()
            },
        }
    }

    fn set_component_enabled(&mut self, handle: u32, enabled: bool) -> (MmalStatus, MmalReply) {
        match self.components.iter_mut().find(|c| c.handle == handle) {
            Some(component) => {
                component.enabled = enabled;
                (MmalStatus::SUCCESS, MmalReply::Ack)
            }
            None => (MmalStatus::ENOENT, MmalReply::Ack),
        }
    }

    fn port(&self, component: u32, kind: PortKind, index: u32) -> Option<&SimPort> {
        self.components
            .iter()
            .find(|c| c.handle == component)?
            .ports
            .iter()
            .find(|p| p.kind == kind && p.index == index)
    }

    fn port_mut(&mut self, component: u32, kind: PortKind, index: u32) -> Option<&mut SimPort> {
        self.components
            .iter_mut()
            .find(|c| c.handle == component)?
            .ports
            .iter_mut()
            .find(|p| p.kind == kind && p.index == index)
    }

    fn port_by_handle(&mut self, port_handle: u32) -> Option<&mut SimPort> {
        self.components
            .iter_mut()
            .flat_map(|c| c.ports.iter_mut())
            .find(|p| p.settings.port_handle == port_handle)
    }
}

/// Small deterministic generator; no randomness crates, no global state.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        XorShift(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn range(&mut self, lo: u64, hi: u64) -> u64 {
        if hi <= lo {
            return lo;
        }
        lo + self.next() % (hi - lo + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorshift_stays_in_range() {
        let mut rng = XorShift::new(7);
        for _ in 0..1000 {
            let v = rng.range(100, 200);
            assert!((100..=200).contains(&v));
        }
        assert_eq!(XorShift::new(7).range(5, 5), 5);
    }

    #[test]
    fn camera_info_payload_round_trips() {
        let info = CameraInfo {
            cameras: vec![CameraModel {
                max_width: 3280,
                max_height: 2464,
            }],
        };
        let decoded = CameraInfo::decode(info.encode()).unwrap();
        assert_eq!(decoded, info);
    }
}
