//! Synchronous request/reply calls over the media service
//!
//! Each call borrows a context slot, tags the outgoing message with a
//! generation-checked handle, and blocks on its own completion channel
//! until the dispatch thread routes the matching reply back. Buffer
//! submissions are the one exception: fire-and-forget, no context, because
//! the data path cannot pay a round trip per buffer.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::mmal::wire::{
    self, BufferTransfer, ElementaryFormat, MmalFrame, MmalMsgType, MmalReply, MmalRequest,
    MmalStatus, PortActionKind, PortKind, PortSettings,
};
use crate::mmal::{params, CameraInfo, SERVICE_NAME, SERVICE_VERSION, SERVICE_VERSION_MIN};
use crate::service::{ServiceCallback, ServiceHandle};
use crate::transport::TransportContext;

/// Outstanding-call slots. Replies are matched by handle, so this bounds
/// how many synchronous calls can be in flight at once.
pub const CONTEXT_SLOTS: usize = 32;

/// Handler invoked on the dispatch thread for every buffer the remote
/// returns. Must hand real work off; it runs in the message pump.
pub struct BufferHandler(pub Box<dyn Fn(BufferTransfer, MmalStatus) -> Result<()> + Send + Sync>);

struct Pending {
    tx: flume::Sender<MmalFrame>,
}

struct CtxSlot {
    generation: u16,
    pending: Option<Pending>,
}

struct TableInner {
    slots: Vec<CtxSlot>,
    free: Vec<u16>,
}

/// Fixed pool of call contexts with generation-checked handles.
///
/// A handle packs `index + 1` in the low half and the slot generation in
/// the high half; the generation bumps on release, so a stale handle in a
/// late reply is detected instead of completing the wrong call.
struct ContextTable {
    inner: Mutex<TableInner>,
    freed: Condvar,
}

impl ContextTable {
    fn new(capacity: usize) -> Self {
        ContextTable {
            inner: Mutex::new(TableInner {
                slots: (0..capacity)
                    .map(|_| CtxSlot {
                        generation: 1,
                        pending: None,
                    })
                    .collect(),
                free: (0..capacity as u16).rev().collect(),
            }),
            freed: Condvar::new(),
        }
    }

    /// Claim a slot, blocking up to `timeout` when every context is in
    /// flight. Exhaustion never misroutes; it only delays or fails here.
    fn alloc(&self, timeout: Duration) -> Result<(u32, flume::Receiver<MmalFrame>)> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(idx) = inner.free.pop() {
                let (tx, rx) = flume::bounded(1);
                let slot = &mut inner.slots[idx as usize];
                slot.pending = Some(Pending { tx });
                let handle = (idx as u32 + 1) | ((slot.generation as u32) << 16);
                return Ok((handle, rx));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout("free call context"));
            }
            let (guard, _) = self.freed.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    fn release(&self, handle: u32) {
        let idx = (handle & 0xffff) as usize - 1;
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.slots[idx];
        slot.pending = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(idx as u16);
        drop(inner);
        self.freed.notify_one();
    }

    /// Route a reply to the call that owns its context handle.
    fn complete(&self, frame: MmalFrame) -> Result<()> {
        let idx = (frame.context & 0xffff) as usize;
        let generation = (frame.context >> 16) as u16;
        let mut inner = self.inner.lock().unwrap();
        if idx == 0 || idx > inner.slots.len() {
            return Err(Error::Corrupted("reply context out of range"));
        }
        let slot = &mut inner.slots[idx - 1];
        if slot.generation != generation {
            // The call most likely timed out and released its slot just
            // before this straggler arrived. Count it and move on.
            warn!(context = frame.context, "stale reply context, dropping");
            metrics::counter!("vclink_rpc_stale_replies").increment(1);
            return Ok(());
        }
        match slot.pending.take() {
            Some(pending) => {
                let _ = pending.tx.send(frame);
                Ok(())
            }
            None => Err(Error::Corrupted("duplicate reply for one call")),
        }
    }
}

/// Synchronous client over an opened media service.
pub struct RpcClient {
    transport: Arc<TransportContext>,
    service: ServiceHandle,
    contexts: Arc<ContextTable>,
    buffer_sink: Arc<ArcSwapOption<BufferHandler>>,
    rpc_timeout: Duration,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("rpc_timeout", &self.rpc_timeout)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Open the media service on a connected transport and wire the
    /// dispatch callback that completes calls and routes buffer returns.
    pub fn connect(transport: &Arc<TransportContext>) -> Result<Arc<RpcClient>> {
        let contexts = Arc::new(ContextTable::new(CONTEXT_SLOTS));
        let buffer_sink: Arc<ArcSwapOption<BufferHandler>> = Arc::new(ArcSwapOption::empty());

        let callback: ServiceCallback = {
            let contexts = Arc::clone(&contexts);
            let buffer_sink = Arc::clone(&buffer_sink);
            Arc::new(move |payload: Bytes| -> Result<()> {
                let frame = wire::decode_frame(payload)?;
                match frame.msg_type {
                    MmalMsgType::BufferToHost => {
                        let mut body = frame.payload.clone();
                        let transfer = BufferTransfer::decode(&mut body)?;
                        match buffer_sink.load_full() {
                            Some(handler) => (handler.0)(transfer, frame.status),
                            None => {
                                warn!("buffer returned with no handler registered");
                                Ok(())
                            }
                        }
                    }
                    _ => contexts.complete(frame),
                }
            })
        };

        let service =
            transport.open_service(SERVICE_NAME, SERVICE_VERSION, SERVICE_VERSION_MIN, callback)?;
        debug!(?service, "media service open");

        Ok(Arc::new(RpcClient {
            transport: Arc::clone(transport),
            service,
            contexts,
            buffer_sink,
            rpc_timeout: transport.config().rpc_timeout(),
        }))
    }

    pub fn service(&self) -> ServiceHandle {
        self.service
    }

    /// Install the handler that receives every buffer the remote returns.
    pub fn register_buffer_handler(&self, handler: BufferHandler) {
        self.buffer_sink.store(Some(Arc::new(handler)));
    }

    /// Drop the buffer handler (and everything it captured). Buffers that
    /// arrive afterwards are logged and ignored.
    pub fn clear_buffer_handler(&self) {
        self.buffer_sink.store(None);
    }

    /// Issue one synchronous call: allocate a context, send, block for the
    /// matching reply, then validate type and status.
    pub fn call(&self, request: &MmalRequest) -> Result<MmalReply> {
        let started = Instant::now();
        let expected = request.msg_type();
        let (handle, rx) = self.contexts.alloc(self.rpc_timeout)?;
        let result = self.call_with_context(request, expected, handle, &rx);
        self.contexts.release(handle);
        metrics::histogram!("vclink_rpc_latency_us").record(started.elapsed().as_micros() as f64);
        if let Err(ref err) = result {
            self.transport.report_corruption(err);
        }
        result
    }

    fn call_with_context(
        &self,
        request: &MmalRequest,
        expected: MmalMsgType,
        handle: u32,
        rx: &flume::Receiver<MmalFrame>,
    ) -> Result<MmalReply> {
        let mut body = BytesMut::new();
        request.encode(&mut body)?;
        let frame = wire::encode_frame(
            expected,
            self.service.remote_port as u32,
            handle,
            MmalStatus::SUCCESS,
            &body,
        )?;
        self.transport.send_data(self.service, &frame)?;

        let reply = rx
            .recv_timeout(self.rpc_timeout)
            .map_err(|_| Error::Timeout("rpc reply"))?;
        if reply.msg_type != expected {
            return Err(Error::Corrupted("reply type does not match request"));
        }
        if !reply.status.is_ok() {
            return Err(Error::Rejected(reply.status));
        }
        MmalReply::decode(expected, reply.payload)
    }

    /// Hand a buffer to the remote. No context, no reply: the completion
    /// comes back later as a buffer-return message.
    pub fn submit_buffer(&self, transfer: &BufferTransfer) -> Result<()> {
        let mut body = BytesMut::new();
        transfer.encode(&mut body);
        let frame = wire::encode_frame(
            MmalMsgType::BufferFromHost,
            self.service.remote_port as u32,
            0,
            MmalStatus::SUCCESS,
            &body,
        )?;
        self.transport.send_data(self.service, &frame)
    }

    // --- component lifecycle -------------------------------------------------

    pub fn component_create(&self, name: &str) -> Result<(u32, u32, u32)> {
        match self.call(&MmalRequest::ComponentCreate {
            client_component: 0,
            name: name.to_owned(),
        })? {
            MmalReply::ComponentCreate {
                component,
                input_count,
                output_count,
            } => Ok((component, input_count, output_count)),
            _ => Err(Error::Corrupted("component create reply shape")),
        }
    }

    pub fn component_destroy(&self, component: u32) -> Result<()> {
        self.call(&MmalRequest::ComponentDestroy { component })?;
        Ok(())
    }

    pub fn component_enable(&self, component: u32) -> Result<()> {
        self.call(&MmalRequest::ComponentEnable { component })?;
        Ok(())
    }

    pub fn component_disable(&self, component: u32) -> Result<()> {
        self.call(&MmalRequest::ComponentDisable { component })?;
        Ok(())
    }

    // --- port configuration --------------------------------------------------

    pub fn port_info(
        &self,
        component: u32,
        kind: PortKind,
        index: u32,
    ) -> Result<(PortSettings, ElementaryFormat)> {
        match self.call(&MmalRequest::PortInfoGet {
            component,
            kind,
            index,
        })? {
            MmalReply::PortInfo { port, format } => Ok((port, format)),
            _ => Err(Error::Corrupted("port info reply shape")),
        }
    }

    pub fn set_port_info(
        &self,
        component: u32,
        kind: PortKind,
        index: u32,
        port: PortSettings,
        format: ElementaryFormat,
    ) -> Result<()> {
        self.call(&MmalRequest::PortInfoSet {
            component,
            kind,
            index,
            port,
            format,
        })?;
        Ok(())
    }

    pub fn port_action(
        &self,
        component: u32,
        port_handle: u32,
        action: PortActionKind,
        connect: Option<(u32, u32)>,
    ) -> Result<()> {
        self.call(&MmalRequest::PortAction {
            component,
            port_handle,
            action,
            connect,
        })?;
        Ok(())
    }

    // --- parameters ----------------------------------------------------------

    pub fn parameter_set(
        &self,
        component: u32,
        port_handle: u32,
        id: u32,
        value: &[u8],
    ) -> Result<()> {
        if value.len() > wire::MAX_INLINE_PARAM {
            return Err(Error::PayloadTooLarge {
                got: value.len(),
                limit: wire::MAX_INLINE_PARAM,
            });
        }
        self.call(&MmalRequest::PortParameterSet {
            component,
            port_handle,
            id,
            value: Bytes::copy_from_slice(value),
        })?;
        Ok(())
    }

    pub fn parameter_set_u32(
        &self,
        component: u32,
        port_handle: u32,
        id: u32,
        value: u32,
    ) -> Result<()> {
        self.parameter_set(component, port_handle, id, &value.to_le_bytes())
    }

    pub fn parameter_set_bool(
        &self,
        component: u32,
        port_handle: u32,
        id: u32,
        value: bool,
    ) -> Result<()> {
        self.parameter_set_u32(component, port_handle, id, value as u32)
    }

    pub fn parameter_get(&self, component: u32, port_handle: u32, id: u32) -> Result<Bytes> {
        match self.call(&MmalRequest::PortParameterGet {
            component,
            port_handle,
            id,
        })? {
            MmalReply::ParameterValue {
                id: reply_id,
                value,
            } => {
                if reply_id != id {
                    return Err(Error::Corrupted("parameter id does not match request"));
                }
                Ok(value)
            }
            _ => Err(Error::Corrupted("parameter reply shape")),
        }
    }

    /// Query the attached camera modules via the control port.
    pub fn camera_info(&self, component: u32, control_port: u32) -> Result<CameraInfo> {
        let raw = self.parameter_get(component, control_port, params::CAMERA_INFO)?;
        CameraInfo::decode(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_embed_generation() {
        let table = ContextTable::new(4);
        let (first, _rx) = table.alloc(Duration::from_millis(10)).unwrap();
        table.release(first);
        let (second, _rx) = table.alloc(Duration::from_millis(10)).unwrap();
        // Same slot, different generation: the stale handle must not match.
        assert_eq!(first & 0xffff, second & 0xffff);
        assert_ne!(first, second);
    }

    #[test]
    fn exhaustion_blocks_instead_of_misrouting() {
        let table = ContextTable::new(2);
        let (_a, _rxa) = table.alloc(Duration::from_millis(10)).unwrap();
        let (_b, _rxb) = table.alloc(Duration::from_millis(10)).unwrap();
        assert!(matches!(
            table.alloc(Duration::from_millis(20)),
            Err(Error::Timeout(_))
        ));
    }

    #[test]
    fn stale_reply_is_dropped_not_fatal() {
        let table = ContextTable::new(2);
        let (handle, rx) = table.alloc(Duration::from_millis(10)).unwrap();
        table.release(handle);
        let frame = MmalFrame {
            msg_type: MmalMsgType::ComponentEnable,
            control_service: 0,
            context: handle,
            status: MmalStatus::SUCCESS,
            payload: Bytes::new(),
        };
        table.complete(frame).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn out_of_range_context_is_fatal() {
        let table = ContextTable::new(2);
        let frame = MmalFrame {
            msg_type: MmalMsgType::ComponentEnable,
            control_service: 0,
            context: 0x0001_0009,
            status: MmalStatus::SUCCESS,
            payload: Bytes::new(),
        };
        assert!(matches!(table.complete(frame), Err(Error::Corrupted(_))));
    }
}
