//! Shared-memory message transport to the remote processor
//!
//! `TransportContext` owns the host end of the slot arena: the CONNECT
//! handshake, the send path, and the two service threads — one pumping
//! inbound messages to their services, one validating and reclaiming slots
//! the peer has finished with. Any detected violation of the shared-memory
//! contract poisons the context; there is no resynchronization path.

pub mod arena;
pub mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::service::{self, ServiceCallback, ServiceHandle, ServiceTable};
use crate::TransportConfig;

pub use arena::{Side, SlotArena};
pub use wire::{FourCc, MsgId, MsgKind};

/// How long the pump threads sleep between stop-flag checks when idle.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Host endpoint of the link: arena + service table + pump threads.
pub struct TransportContext {
    arena: Arc<SlotArena>,
    cfg: TransportConfig,
    services: ServiceTable,
    connected: AtomicBool,
    connect_ack: (flume::Sender<()>, flume::Receiver<()>),
    failed: AtomicBool,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TransportContext {
    /// Bring up the host endpoint over an initialized arena and start the
    /// receive and reclaim threads.
    pub fn start(arena: Arc<SlotArena>, cfg: TransportConfig) -> Arc<Self> {
        let ctx = Arc::new(TransportContext {
            arena,
            cfg,
            services: ServiceTable::new(),
            connected: AtomicBool::new(false),
            connect_ack: flume::bounded(1),
            failed: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = ctx.threads.lock().unwrap();
        {
            let ctx = Arc::clone(&ctx);
            threads.push(
                std::thread::Builder::new()
                    .name("vclink-rx".into())
                    .spawn(move || ctx.pump())
                    .expect("spawn rx thread"),
            );
        }
        {
            let ctx = Arc::clone(&ctx);
            threads.push(
                std::thread::Builder::new()
                    .name("vclink-reclaim".into())
                    .spawn(move || ctx.reclaim_loop())
                    .expect("spawn reclaim thread"),
            );
        }
        drop(threads);
        ctx
    }

    pub fn arena(&self) -> &Arc<SlotArena> {
        &self.arena
    }

    pub fn config(&self) -> &TransportConfig {
        &self.cfg
    }

    /// True once the context has been poisoned by detected corruption.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_failed() {
            return Err(Error::Corrupted("transport poisoned"));
        }
        Ok(())
    }

    fn poison(&self, err: &Error) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            error!(%err, "shared-memory contract violated, transport poisoned");
            metrics::counter!("vclink_transport_poisoned").increment(1);
        }
    }

    /// Poison the context for corruption detected outside the pump threads
    /// (e.g. a reply that fails validation in the calling thread).
    pub(crate) fn report_corruption(&self, err: &Error) {
        if err.is_fatal() {
            self.poison(err);
        }
    }

    /// Exchange CONNECT with the remote. Must complete before any service
    /// can be opened.
    pub fn connect(&self) -> Result<()> {
        self.ensure_live()?;
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        self.arena.send(
            Side::Host,
            wire::pack_msg_id(MsgKind::Connect, 0, 0),
            &[],
            self.cfg.slot_wait(),
        )?;
        self.connect_ack
            .1
            .recv_timeout(self.cfg.connect_timeout())
            .map_err(|_| Error::Timeout("connect handshake"))?;
        info!("link connected");
        Ok(())
    }

    /// Open a named service and block until the remote acknowledges it,
    /// binding the remote port. Times out instead of hanging when the
    /// remote never answers.
    pub fn open_service(
        &self,
        fourcc: FourCc,
        version: u16,
        version_min: u16,
        callback: ServiceCallback,
    ) -> Result<ServiceHandle> {
        self.ensure_live()?;
        let (local_port, ack_rx) = self.services.begin_open(fourcc, callback)?;
        let open = service::encode_open(fourcc, version, version_min);
        self.arena.send(
            Side::Host,
            wire::pack_msg_id(MsgKind::Open, local_port, 0),
            &open,
            self.cfg.slot_wait(),
        )?;
        match ack_rx.recv_timeout(self.cfg.open_timeout()) {
            Ok((remote_port, _version)) => Ok(ServiceHandle {
                local_port,
                remote_port,
            }),
            Err(_) => {
                self.services.abort_open(local_port);
                Err(Error::Timeout("service open acknowledgment"))
            }
        }
    }

    /// Send a data payload on an opened service.
    pub fn send_data(&self, handle: ServiceHandle, payload: &[u8]) -> Result<()> {
        self.ensure_live()?;
        self.arena.send(
            Side::Host,
            wire::pack_msg_id(MsgKind::Data, handle.local_port, handle.remote_port),
            payload,
            self.cfg.slot_wait(),
        )
    }

    /// Stop the pump threads and join them. The arena itself stays mapped
    /// until every reference is gone.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        debug!("transport stopped");
    }

    /// Receive thread: wake on the trigger, walk every committed inbound
    /// message, dispatch by kind. Buffer work is never done here — service
    /// callbacks hand it to the IO worker.
    fn pump(&self) {
        let mut cursor = 0u32;
        while !self.stop.load(Ordering::Acquire) {
            self.arena.wait_incoming(Side::Host, IDLE_WAIT);
            let drained = self
                .arena
                .drain(Side::Host, &mut cursor, |id, payload| self.dispatch(id, payload));
            if let Err(err) = drained {
                self.poison(&err);
                break;
            }
        }
    }

    /// Reclaim thread: wake when the peer returns slots, re-validate their
    /// framing, then release them to the send path.
    fn reclaim_loop(&self) {
        while !self.stop.load(Ordering::Acquire) {
            self.arena.wait_returned(Side::Host, IDLE_WAIT);
            if let Err(err) = self.arena.reclaim(Side::Host) {
                self.poison(&err);
                break;
            }
        }
    }

    fn dispatch(&self, id: MsgId, payload: Bytes) -> Result<()> {
        match id.kind()? {
            MsgKind::Connect => {
                self.connected.store(true, Ordering::Release);
                let _ = self.connect_ack.0.try_send(());
                Ok(())
            }
            MsgKind::OpenAck => {
                self.services
                    .complete_open(id.dst_port(), id.src_port(), payload)
            }
            MsgKind::Data => self.services.dispatch(id.dst_port(), id.src_port(), payload),
            MsgKind::Open => Err(Error::Corrupted("unexpected inbound service open")),
            MsgKind::Padding => Ok(()),
        }
    }
}

impl Drop for TransportContext {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
