//! Host-side VideoCore link: shared-memory ring transport, service
//! multiplexing, media-component RPC, buffer ownership tracking, and the
//! camera → encoder → storage/preview pipeline driver. A scripted remote
//! endpoint ([`sim`]) stands in for the co-processor in tests and demos.

pub mod buffers;
pub mod error;
pub mod mmal;
pub mod pipeline;
pub mod service;
pub mod sim;
pub mod storage;
pub mod transport;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use buffers::{BufferPool, ImportTable, MediaBuffer, Ownership};
pub use error::{Error, Result};
pub use mmal::{MmalStatus, RpcClient};
pub use pipeline::{PipelineDriver, PipelineStats, RunState};
pub use service::ServiceHandle;
pub use sim::{SimConfig, SimRemote};
pub use transport::{FourCc, Side, SlotArena, TransportContext};

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub transport: TransportConfig,
    pub pipeline: PipelineConfig,
}

/// Ring transport sizing and timeout bounds.
///
/// The timeout defaults were chosen against the simulated remote; real
/// firmware may need different bounds, which is exactly why they are
/// configuration and not constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub region_bytes: usize,
    pub connect_timeout_ms: u64,
    pub open_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub slot_wait_ms: u64,
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn slot_wait(&self) -> Duration {
        Duration::from_millis(self.slot_wait_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            region_bytes: 64 * 4096, // 1 header slot + 31 data slots per side
            connect_timeout_ms: 2_000,
            open_timeout_ms: 2_000,
            rpc_timeout_ms: 5_000,
            slot_wait_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub camera_num: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// H.264 profile identifiers as the encoder expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum H264Profile {
    Baseline = 66,
    Main = 77,
    High = 100,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub bitrate: u32,
    pub profile: H264Profile,
    pub level_idc: u32,
    pub intra_period: u32,
    pub quant_min: u32,
    pub quant_max: u32,
    pub inline_headers: bool,
    /// Output pool floor; the remote's recommendation wins when larger.
    pub output_buffer_count: u32,
    pub output_buffer_bytes: u32,
}

/// How the preview path balances latency against correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreviewMode {
    /// Hand buffers back to the remote before the display reads them.
    /// Lowest latency; a redraw racing a refill can tear.
    Shortcut,
    /// Hold each buffer until the display is done with it.
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    pub mode: PreviewMode,
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub use_resizer: bool,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub camera: CameraConfig,
    pub encoder: EncoderConfig,
    pub preview: PreviewConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                camera_num: 0,
                width: 1920,
                height: 1080,
                fps: 30,
            },
            encoder: EncoderConfig {
                bitrate: 17_000_000,
                profile: H264Profile::High,
                level_idc: 40,
                intra_period: 60,
                quant_min: 20,
                quant_max: 40,
                inline_headers: true,
                // Deep output pool so storage jitter never starves the
                // encoder; 128 x 256KB is comfortable headroom for 1080p30.
                output_buffer_count: 128,
                output_buffer_bytes: 256 * 1024,
            },
            preview: PreviewConfig {
                mode: PreviewMode::Shortcut,
                width: 640,
                height: 360,
                buffer_count: 4,
                use_resizer: false,
                queue_depth: 8,
            },
        }
    }
}
