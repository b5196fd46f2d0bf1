//! Logical channels multiplexed over the slot ring
//!
//! A service is a named channel bound to a (local, remote) port pair. The
//! table is a small fixed pool; entries are claimed at open time and live
//! for the transport's lifetime — nothing in this system ever closes one.

use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::FourCc;

/// Size of the service table. Port numbers 1..=MAX_SERVICES map to entries;
/// port 0 is the control channel handling opens.
pub const MAX_SERVICES: usize = 16;

/// Inbound payload handler for one service. Runs on the transport's
/// dispatch thread, so it must hand real work off instead of blocking.
pub type ServiceCallback = Arc<dyn Fn(Bytes) -> Result<()> + Send + Sync>;

/// Bound channel returned by a successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHandle {
    pub local_port: u16,
    pub remote_port: u16,
}

enum ServiceState {
    /// OPEN sent, waiting for the remote to acknowledge and name its port.
    Opening { ack: flume::Sender<(u16, u16)> },
    Open,
}

struct ServiceEntry {
    fourcc: FourCc,
    state: ServiceState,
    remote_port: u16,
    callback: ServiceCallback,
}

pub(crate) struct ServiceTable {
    entries: Mutex<Vec<Option<ServiceEntry>>>,
}

impl ServiceTable {
    pub(crate) fn new() -> Self {
        ServiceTable {
            entries: Mutex::new((0..MAX_SERVICES).map(|_| None).collect()),
        }
    }

    /// Claim a table slot and stage the open handshake. Returns the local
    /// port and the channel the acknowledgment will arrive on.
    pub(crate) fn begin_open(
        &self,
        fourcc: FourCc,
        callback: ServiceCallback,
    ) -> Result<(u16, flume::Receiver<(u16, u16)>)> {
        let mut entries = self.entries.lock().unwrap();
        let idx = entries
            .iter()
            .position(Option::is_none)
            .ok_or(Error::Exhausted("service table entry"))?;
        let (ack_tx, ack_rx) = flume::bounded(1);
        entries[idx] = Some(ServiceEntry {
            fourcc,
            state: ServiceState::Opening { ack: ack_tx },
            remote_port: 0,
            callback,
        });
        let local_port = (idx + 1) as u16;
        debug!(%fourcc, local_port, "service open staged");
        Ok((local_port, ack_rx))
    }

    /// Drop a staged open that never got acknowledged.
    pub(crate) fn abort_open(&self, local_port: u16) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(slot) = (local_port as usize)
            .checked_sub(1)
            .and_then(|idx| entries.get_mut(idx))
        {
            *slot = None;
        }
    }

    /// Handle an OPENACK naming `remote_port` for our `local_port`.
    ///
    /// An acknowledgment for a port we are not opening is tolerated (the
    /// open may have timed out moments earlier); it is logged and dropped.
    pub(crate) fn complete_open(
        &self,
        local_port: u16,
        remote_port: u16,
        payload: Bytes,
    ) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = match (local_port as usize)
            .checked_sub(1)
            .and_then(|idx| entries.get_mut(idx))
            .and_then(Option::as_mut)
        {
            Some(entry) => entry,
            None => {
                warn!(local_port, "acknowledgment for a port not being opened");
                return Ok(());
            }
        };
        let version = decode_open_ack(payload);
        match std::mem::replace(&mut entry.state, ServiceState::Open) {
            ServiceState::Opening { ack } => {
                entry.remote_port = remote_port;
                debug!(fourcc = %entry.fourcc, local_port, remote_port, version, "service open");
                let _ = ack.send((remote_port, version));
                Ok(())
            }
            ServiceState::Open => Err(Error::Corrupted("duplicate open acknowledgment")),
        }
    }

    /// Route an inbound data payload to the service bound to `local_port`.
    /// The remote addressing a port that was never opened means the two
    /// sides disagree about the service table — not locally recoverable.
    pub(crate) fn dispatch(&self, local_port: u16, src_port: u16, payload: Bytes) -> Result<()> {
        let callback = {
            let entries = self.entries.lock().unwrap();
            let entry = (local_port as usize)
                .checked_sub(1)
                .and_then(|idx| entries.get(idx))
                .and_then(Option::as_ref)
                .ok_or(Error::Corrupted("data for unopened port"))?;
            if !matches!(entry.state, ServiceState::Open) {
                return Err(Error::Corrupted("data before open acknowledgment"));
            }
            if entry.remote_port != src_port {
                return Err(Error::Corrupted("data from wrong remote port"));
            }
            Arc::clone(&entry.callback)
        };
        callback(payload)
    }
}

/// OPEN payload: fourcc + supported version range.
pub fn encode_open(fourcc: FourCc, version: u16, version_min: u16) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&fourcc.0.to_le_bytes());
    out[4..6].copy_from_slice(&version.to_le_bytes());
    out[6..8].copy_from_slice(&version_min.to_le_bytes());
    out
}

/// Parse an OPEN payload. Used by whatever sits on the far end.
pub fn decode_open(mut payload: Bytes) -> Result<(FourCc, u16, u16)> {
    if payload.len() < 8 {
        return Err(Error::Corrupted("truncated open request"));
    }
    let fourcc = FourCc(payload.get_u32_le());
    let version = payload.get_u16_le();
    let version_min = payload.get_u16_le();
    Ok((fourcc, version, version_min))
}

/// OPENACK payload: the version the remote settled on.
pub fn encode_open_ack(version: u16) -> [u8; 4] {
    let mut out = [0u8; 4];
    out[0..2].copy_from_slice(&version.to_le_bytes());
    out
}

fn decode_open_ack(mut payload: Bytes) -> u16 {
    if payload.len() >= 2 {
        payload.get_u16_le()
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> ServiceCallback {
        Arc::new(|_| Ok(()))
    }

    #[test]
    fn open_binds_remote_port() {
        let table = ServiceTable::new();
        let (port, ack) = table.begin_open(FourCc::new(b"mmal"), noop()).unwrap();
        assert_eq!(port, 1);
        table
            .complete_open(port, 90, Bytes::copy_from_slice(&encode_open_ack(14)))
            .unwrap();
        assert_eq!(ack.try_recv().unwrap(), (90, 14));
    }

    #[test]
    fn table_exhaustion_is_reported() {
        let table = ServiceTable::new();
        for _ in 0..MAX_SERVICES {
            table.begin_open(FourCc::new(b"test"), noop()).unwrap();
        }
        assert!(matches!(
            table.begin_open(FourCc::new(b"test"), noop()),
            Err(Error::Exhausted(_))
        ));
    }

    #[test]
    fn dispatch_reaches_the_callback() {
        let table = ServiceTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let cb: ServiceCallback = {
            let hits = Arc::clone(&hits);
            Arc::new(move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        };
        let (port, _ack) = table.begin_open(FourCc::new(b"mmal"), cb).unwrap();
        table
            .complete_open(port, 90, Bytes::from_static(&[14, 0, 0, 0]))
            .unwrap();
        table.dispatch(port, 90, Bytes::from_static(b"x")).unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unknown_port_is_fatal() {
        let table = ServiceTable::new();
        assert!(matches!(
            table.dispatch(3, 90, Bytes::new()),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn wrong_source_port_is_fatal() {
        let table = ServiceTable::new();
        let (port, _ack) = table.begin_open(FourCc::new(b"mmal"), noop()).unwrap();
        table.complete_open(port, 90, Bytes::new()).unwrap();
        assert!(matches!(
            table.dispatch(port, 91, Bytes::new()),
            Err(Error::Corrupted(_))
        ));
    }
}
