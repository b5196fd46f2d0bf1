//! Client side of the media-component protocol
//!
//! Components, ports, parameters and buffers as the remote firmware models
//! them. `wire` is the fixed message layout, `rpc` the synchronous call
//! pattern over a data service, `component` the host's cache of remote-side
//! objects.

pub mod component;
pub mod rpc;
pub mod wire;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::transport::FourCc;

pub use component::{Component, ComponentId, ComponentStore, Port, PortRef};
pub use rpc::{BufferHandler, RpcClient};
pub use wire::{
    BufferFlags, BufferTransfer, ElementaryFormat, EsType, MmalMsgType, MmalReply, MmalRequest,
    MmalStatus, PortActionKind, PortKind, PortSettings,
};

/// Parameter identifiers, encoded as group | index the way the firmware
/// partitions its parameter space.
pub mod params {
    const GROUP_COMMON: u32 = 0;
    const GROUP_CAMERA: u32 = 1 << 16;
    const GROUP_VIDEO: u32 = 2 << 16;

    pub const SUPPORTED_ENCODINGS: u32 = GROUP_COMMON | 3;
    pub const ZERO_COPY: u32 = GROUP_COMMON | 5;
    pub const CAMERA_INFO: u32 = GROUP_COMMON | 6;

    pub const CAPTURE: u32 = GROUP_CAMERA | 6;
    pub const CAMERA_NUM: u32 = GROUP_CAMERA | 7;

    pub const VIDEO_BIT_RATE: u32 = GROUP_VIDEO | 3;
    pub const VIDEO_PROFILE: u32 = GROUP_VIDEO | 7;
    pub const VIDEO_INTRAPERIOD: u32 = GROUP_VIDEO | 9;
    pub const VIDEO_ENCODE_MIN_QUANT: u32 = GROUP_VIDEO | 10;
    pub const VIDEO_ENCODE_MAX_QUANT: u32 = GROUP_VIDEO | 11;
    pub const VIDEO_ENCODE_INLINE_HEADER: u32 = GROUP_VIDEO | 12;
}

/// Stream encodings used across the pipeline.
pub mod encodings {
    use crate::transport::FourCc;

    /// Opaque remote-side frames; never touch host memory.
    pub const OPAQUE: FourCc = FourCc::new(b"OPQV");
    pub const I420: FourCc = FourCc::new(b"I420");
    pub const H264: FourCc = FourCc::new(b"H264");
    pub const MJPEG: FourCc = FourCc::new(b"MJPG");
}

/// What the remote reports about its attached camera modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub cameras: Vec<CameraModel>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraModel {
    pub max_width: u32,
    pub max_height: u32,
}

impl CameraInfo {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u32_le(self.cameras.len() as u32);
        for cam in &self.cameras {
            out.put_u32_le(cam.max_width);
            out.put_u32_le(cam.max_height);
        }
        out.freeze()
    }

    pub fn decode(mut b: Bytes) -> Result<Self> {
        if b.len() < 4 {
            return Err(Error::Corrupted("truncated camera info"));
        }
        let count = b.get_u32_le() as usize;
        if b.len() < count * 8 {
            return Err(Error::Corrupted("truncated camera info"));
        }
        let mut cameras = Vec::with_capacity(count);
        for _ in 0..count {
            cameras.push(CameraModel {
                max_width: b.get_u32_le(),
                max_height: b.get_u32_le(),
            });
        }
        Ok(CameraInfo { cameras })
    }
}

/// The four-character service name the media protocol runs over.
pub const SERVICE_NAME: FourCc = FourCc::new(b"mmal");
/// Protocol version range this client speaks.
pub const SERVICE_VERSION: u16 = 15;
pub const SERVICE_VERSION_MIN: u16 = 10;
