//! Error taxonomy for the link and the media pipeline

use thiserror::Error;

use crate::mmal::MmalStatus;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the transport, RPC layer and pipeline driver.
///
/// `Corrupted` is sticky: once the shared ring state can no longer be
/// trusted the owning transport is poisoned and every later operation fails
/// with the same kind. Everything else fails only the operation at hand.
#[derive(Debug, Error)]
pub enum Error {
    /// The shared-memory contract with the remote endpoint was violated.
    /// There is no way to resynchronize; the transport shuts down.
    #[error("shared ring corrupted: {0}")]
    Corrupted(&'static str),

    /// The remote processed the request and said no. The embedded status
    /// code is the remote's own error code, passed through verbatim.
    #[error("remote rejected request: {0}")]
    Rejected(MmalStatus),

    /// A fixed-size pool (service table, call contexts, buffers, slots) has
    /// no free entry.
    #[error("no free {0}")]
    Exhausted(&'static str),

    /// A blocking wait exceeded its configured bound. The remote may be
    /// hung, rebooting, or simply not there.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The target port is not enabled; nothing was queued.
    #[error("port is not enabled")]
    NotReady,

    /// Inline payload would overflow the fixed wire capacity.
    #[error("payload of {got} bytes exceeds the {limit}-byte inline limit")]
    PayloadTooLarge { got: usize, limit: usize },

    /// Pipeline bring-up failure, annotated with the stage that failed.
    #[error("{stage} failed: {source}")]
    Setup {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap a bring-up error with the pipeline stage it happened in.
    pub fn at_stage(stage: &'static str) -> impl FnOnce(Error) -> Error {
        move |source| Error::Setup {
            stage,
            source: Box::new(source),
        }
    }

    /// True for errors that poison the owning transport.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corrupted(_))
    }
}
