//! Fixed-layout media-protocol messages
//!
//! Every message is a 24-byte header followed by a payload selected by the
//! message type, little-endian throughout, capped at 512 bytes total. The
//! layout is dictated by the remote firmware and is not negotiable; both
//! the host RPC layer and the simulated remote speak exactly this format.

use std::fmt;
use std::ops::BitOr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::transport::FourCc;

/// Magic leading every media message.
pub const MESSAGE_MAGIC: u32 = FourCc::new(b"mmal").0;
/// Hard cap on a full message (header + payload).
pub const MAX_MESSAGE: usize = 512;
/// Header bytes: magic, type, control service, context, status, padding.
pub const HEADER_BYTES: usize = 24;
/// Largest inline parameter blob a set/get can carry.
pub const MAX_INLINE_PARAM: usize = 384;
/// Fixed width of the component name field.
pub const COMPONENT_NAME_BYTES: usize = 128;

/// Status code returned by the remote, passed through verbatim.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MmalStatus(pub u32);

impl MmalStatus {
    pub const SUCCESS: MmalStatus = MmalStatus(0);
    pub const ENOMEM: MmalStatus = MmalStatus(1);
    pub const ENOSPC: MmalStatus = MmalStatus(2);
    pub const EINVAL: MmalStatus = MmalStatus(3);
    pub const ENOSYS: MmalStatus = MmalStatus(4);
    pub const ENOENT: MmalStatus = MmalStatus(5);
    pub const EIO: MmalStatus = MmalStatus(7);
    pub const ECORRUPT: MmalStatus = MmalStatus(9);
    pub const ENOTREADY: MmalStatus = MmalStatus(10);
    pub const EAGAIN: MmalStatus = MmalStatus(14);

    pub fn is_ok(self) -> bool {
        self == MmalStatus::SUCCESS
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            MmalStatus::SUCCESS => "success",
            MmalStatus::ENOMEM => "out of memory",
            MmalStatus::ENOSPC => "out of resources",
            MmalStatus::EINVAL => "invalid argument",
            MmalStatus::ENOSYS => "not implemented",
            MmalStatus::ENOENT => "no such entity",
            MmalStatus::EIO => "i/o error",
            MmalStatus::ECORRUPT => "corrupt data",
            MmalStatus::ENOTREADY => "not ready",
            MmalStatus::EAGAIN => "resource temporarily unavailable",
            _ => return None,
        })
    }
}

impl fmt::Display for MmalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "status {}", self.0),
        }
    }
}

impl fmt::Debug for MmalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Message types understood by both ends. Log names derive from the
/// variant, so there is no parallel string table to drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MmalMsgType {
    GetVersion = 3,
    ComponentCreate = 4,
    ComponentDestroy = 5,
    ComponentEnable = 6,
    ComponentDisable = 7,
    PortInfoGet = 8,
    PortInfoSet = 9,
    PortAction = 10,
    BufferFromHost = 11,
    BufferToHost = 12,
    PortParameterSet = 14,
    PortParameterGet = 15,
}

impl MmalMsgType {
    pub fn from_u32(raw: u32) -> Result<Self> {
        Ok(match raw {
            3 => MmalMsgType::GetVersion,
            4 => MmalMsgType::ComponentCreate,
            5 => MmalMsgType::ComponentDestroy,
            6 => MmalMsgType::ComponentEnable,
            7 => MmalMsgType::ComponentDisable,
            8 => MmalMsgType::PortInfoGet,
            9 => MmalMsgType::PortInfoSet,
            10 => MmalMsgType::PortAction,
            11 => MmalMsgType::BufferFromHost,
            12 => MmalMsgType::BufferToHost,
            14 => MmalMsgType::PortParameterSet,
            15 => MmalMsgType::PortParameterGet,
            _ => return Err(Error::Corrupted("unknown media message type")),
        })
    }
}

/// Where a port sits on its component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PortKind {
    Control = 1,
    Input = 2,
    Output = 3,
    Clock = 4,
}

impl PortKind {
    pub fn from_u32(raw: u32) -> Result<Self> {
        Ok(match raw {
            1 => PortKind::Control,
            2 => PortKind::Input,
            3 => PortKind::Output,
            4 => PortKind::Clock,
            _ => return Err(Error::Corrupted("unknown port kind")),
        })
    }
}

/// Verb carried by a port-action request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PortActionKind {
    Enable = 1,
    Disable = 2,
    Flush = 3,
    Connect = 4,
    Disconnect = 5,
}

impl PortActionKind {
    pub fn from_u32(raw: u32) -> Result<Self> {
        Ok(match raw {
            1 => PortActionKind::Enable,
            2 => PortActionKind::Disable,
            3 => PortActionKind::Flush,
            4 => PortActionKind::Connect,
            5 => PortActionKind::Disconnect,
            _ => return Err(Error::Corrupted("unknown port action")),
        })
    }
}

/// Buffer flag bits, matching the firmware's bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferFlags(pub u32);

impl BufferFlags {
    pub const EOS: BufferFlags = BufferFlags(0x1);
    pub const FRAME_START: BufferFlags = BufferFlags(0x2);
    pub const FRAME_END: BufferFlags = BufferFlags(0x4);
    pub const FRAME: BufferFlags = BufferFlags(0x6);
    pub const KEYFRAME: BufferFlags = BufferFlags(0x8);
    pub const DISCONTINUITY: BufferFlags = BufferFlags(0x10);
    pub const CONFIG: BufferFlags = BufferFlags(0x20);
    pub const ENCRYPTED: BufferFlags = BufferFlags(0x40);
    pub const CODEC_SIDE_INFO: BufferFlags = BufferFlags(0x80);
    pub const SNAPSHOT: BufferFlags = BufferFlags(0x100);
    pub const CORRUPTED: BufferFlags = BufferFlags(0x200);
    pub const TRANSMISSION_FAILED: BufferFlags = BufferFlags(0x400);

    pub fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for BufferFlags {
    type Output = BufferFlags;
    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for BufferFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferFlags({:#x})", self.0)
    }
}

/// Port state and buffer requirements as the remote reports them. This is
/// the host's authoritative cache of the remote-side port object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortSettings {
    pub port_handle: u32,
    pub enabled: bool,
    pub buffer_num_min: u32,
    pub buffer_num_recommended: u32,
    pub buffer_num: u32,
    pub buffer_size_min: u32,
    pub buffer_size_recommended: u32,
    pub buffer_size: u32,
    pub buffer_alignment_min: u32,
}

impl PortSettings {
    pub const WIRE_BYTES: usize = 36;

    fn encode(&self, out: &mut BytesMut) {
        out.put_u32_le(self.port_handle);
        out.put_u32_le(self.enabled as u32);
        out.put_u32_le(self.buffer_num_min);
        out.put_u32_le(self.buffer_num_recommended);
        out.put_u32_le(self.buffer_num);
        out.put_u32_le(self.buffer_size_min);
        out.put_u32_le(self.buffer_size_recommended);
        out.put_u32_le(self.buffer_size);
        out.put_u32_le(self.buffer_alignment_min);
    }

    fn decode(b: &mut Bytes) -> Result<Self> {
        check_len(b, Self::WIRE_BYTES)?;
        Ok(PortSettings {
            port_handle: b.get_u32_le(),
            enabled: b.get_u32_le() != 0,
            buffer_num_min: b.get_u32_le(),
            buffer_num_recommended: b.get_u32_le(),
            buffer_num: b.get_u32_le(),
            buffer_size_min: b.get_u32_le(),
            buffer_size_recommended: b.get_u32_le(),
            buffer_size: b.get_u32_le(),
            buffer_alignment_min: b.get_u32_le(),
        })
    }
}

/// Elementary-stream format carried in port info messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementaryFormat {
    pub es_type: EsType,
    pub encoding: FourCc,
    pub encoding_variant: FourCc,
    pub width: u32,
    pub height: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub bitrate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EsType {
    Unknown = 0,
    Control = 1,
    Audio = 2,
    Video = 3,
}

impl EsType {
    fn from_u32(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => EsType::Unknown,
            1 => EsType::Control,
            2 => EsType::Audio,
            3 => EsType::Video,
            _ => return Err(Error::Corrupted("unknown stream type")),
        })
    }
}

impl Default for ElementaryFormat {
    fn default() -> Self {
        ElementaryFormat {
            es_type: EsType::Unknown,
            encoding: FourCc(0),
            encoding_variant: FourCc(0),
            width: 0,
            height: 0,
            frame_rate_num: 0,
            frame_rate_den: 1,
            bitrate: 0,
        }
    }
}

impl ElementaryFormat {
    pub const WIRE_BYTES: usize = 32;

    fn encode(&self, out: &mut BytesMut) {
        out.put_u32_le(self.es_type as u32);
        out.put_u32_le(self.encoding.0);
        out.put_u32_le(self.encoding_variant.0);
        out.put_u32_le(self.width);
        out.put_u32_le(self.height);
        out.put_u32_le(self.frame_rate_num);
        out.put_u32_le(self.frame_rate_den);
        out.put_u32_le(self.bitrate);
    }

    fn decode(b: &mut Bytes) -> Result<Self> {
        check_len(b, Self::WIRE_BYTES)?;
        Ok(ElementaryFormat {
            es_type: EsType::from_u32(b.get_u32_le())?,
            encoding: FourCc(b.get_u32_le()),
            encoding_variant: FourCc(b.get_u32_le()),
            width: b.get_u32_le(),
            height: b.get_u32_le(),
            frame_rate_num: b.get_u32_le(),
            frame_rate_den: b.get_u32_le(),
            bitrate: b.get_u32_le(),
        })
    }
}

/// One media buffer crossing the host/remote boundary, in either direction.
/// The payload itself never travels through the ring; `import_handle` names
/// memory both processors already share.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferTransfer {
    pub component: u32,
    pub port_handle: u32,
    pub client_context: u32,
    pub import_handle: u32,
    pub alloc_size: u32,
    pub length: u32,
    pub offset: u32,
    pub flags: BufferFlags,
    pub pts: i64,
    pub dts: i64,
}

impl BufferTransfer {
    pub const WIRE_BYTES: usize = 48;

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32_le(self.component);
        out.put_u32_le(self.port_handle);
        out.put_u32_le(self.client_context);
        out.put_u32_le(self.import_handle);
        out.put_u32_le(self.alloc_size);
        out.put_u32_le(self.length);
        out.put_u32_le(self.offset);
        out.put_u32_le(self.flags.0);
        out.put_i64_le(self.pts);
        out.put_i64_le(self.dts);
    }

    pub fn decode(b: &mut Bytes) -> Result<Self> {
        check_len(b, Self::WIRE_BYTES)?;
        Ok(BufferTransfer {
            component: b.get_u32_le(),
            port_handle: b.get_u32_le(),
            client_context: b.get_u32_le(),
            import_handle: b.get_u32_le(),
            alloc_size: b.get_u32_le(),
            length: b.get_u32_le(),
            offset: b.get_u32_le(),
            flags: BufferFlags(b.get_u32_le()),
            pts: b.get_i64_le(),
            dts: b.get_i64_le(),
        })
    }
}

/// Host-to-remote request bodies. Encoding is total; decoding exists so the
/// simulated remote can parse exactly what a real one would.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MmalRequest {
    ComponentCreate {
        client_component: u32,
        name: String,
    },
    ComponentDestroy {
        component: u32,
    },
    ComponentEnable {
        component: u32,
    },
    ComponentDisable {
        component: u32,
    },
    PortInfoGet {
        component: u32,
        kind: PortKind,
        index: u32,
    },
    PortInfoSet {
        component: u32,
        kind: PortKind,
        index: u32,
        port: PortSettings,
        format: ElementaryFormat,
    },
    PortAction {
        component: u32,
        port_handle: u32,
        action: PortActionKind,
        connect: Option<(u32, u32)>,
    },
    PortParameterSet {
        component: u32,
        port_handle: u32,
        id: u32,
        value: Bytes,
    },
    PortParameterGet {
        component: u32,
        port_handle: u32,
        id: u32,
    },
    BufferFromHost(BufferTransfer),
}

impl MmalRequest {
    pub fn msg_type(&self) -> MmalMsgType {
        match self {
            MmalRequest::ComponentCreate { .. } => MmalMsgType::ComponentCreate,
            MmalRequest::ComponentDestroy { .. } => MmalMsgType::ComponentDestroy,
            MmalRequest::ComponentEnable { .. } => MmalMsgType::ComponentEnable,
            MmalRequest::ComponentDisable { .. } => MmalMsgType::ComponentDisable,
            MmalRequest::PortInfoGet { .. } => MmalMsgType::PortInfoGet,
            MmalRequest::PortInfoSet { .. } => MmalMsgType::PortInfoSet,
            MmalRequest::PortAction { .. } => MmalMsgType::PortAction,
            MmalRequest::PortParameterSet { .. } => MmalMsgType::PortParameterSet,
            MmalRequest::PortParameterGet { .. } => MmalMsgType::PortParameterGet,
            MmalRequest::BufferFromHost(_) => MmalMsgType::BufferFromHost,
        }
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<()> {
        match self {
            MmalRequest::ComponentCreate {
                client_component,
                name,
            } => {
                if name.len() >= COMPONENT_NAME_BYTES {
                    return Err(Error::PayloadTooLarge {
                        got: name.len(),
                        limit: COMPONENT_NAME_BYTES - 1,
                    });
                }
                out.put_u32_le(*client_component);
                out.put_slice(name.as_bytes());
                out.put_bytes(0, COMPONENT_NAME_BYTES - name.len());
            }
            MmalRequest::ComponentDestroy { component }
            | MmalRequest::ComponentEnable { component }
            | MmalRequest::ComponentDisable { component } => {
                out.put_u32_le(*component);
            }
            MmalRequest::PortInfoGet {
                component,
                kind,
                index,
            } => {
                out.put_u32_le(*component);
                out.put_u32_le(*kind as u32);
                out.put_u32_le(*index);
            }
            MmalRequest::PortInfoSet {
                component,
                kind,
                index,
                port,
                format,
            } => {
                out.put_u32_le(*component);
                out.put_u32_le(*kind as u32);
                out.put_u32_le(*index);
                port.encode(out);
                format.encode(out);
            }
            MmalRequest::PortAction {
                component,
                port_handle,
                action,
                connect,
            } => {
                out.put_u32_le(*component);
                out.put_u32_le(*port_handle);
                out.put_u32_le(*action as u32);
                let (dst_component, dst_port) = connect.unwrap_or((0, 0));
                out.put_u32_le(dst_component);
                out.put_u32_le(dst_port);
            }
            MmalRequest::PortParameterSet {
                component,
                port_handle,
                id,
                value,
            } => {
                if value.len() > MAX_INLINE_PARAM {
                    return Err(Error::PayloadTooLarge {
                        got: value.len(),
                        limit: MAX_INLINE_PARAM,
                    });
                }
                out.put_u32_le(*component);
                out.put_u32_le(*port_handle);
                out.put_u32_le(*id);
                out.put_u32_le(value.len() as u32);
                out.put_slice(value);
            }
            MmalRequest::PortParameterGet {
                component,
                port_handle,
                id,
            } => {
                out.put_u32_le(*component);
                out.put_u32_le(*port_handle);
                out.put_u32_le(*id);
            }
            MmalRequest::BufferFromHost(transfer) => transfer.encode(out),
        }
        Ok(())
    }

    pub fn decode(msg_type: MmalMsgType, mut b: Bytes) -> Result<Self> {
        Ok(match msg_type {
            MmalMsgType::ComponentCreate => {
                check_len(&b, 4 + COMPONENT_NAME_BYTES)?;
                let client_component = b.get_u32_le();
                let raw = b.split_to(COMPONENT_NAME_BYTES);
                let end = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
                let name = String::from_utf8_lossy(&raw[..end]).into_owned();
                MmalRequest::ComponentCreate {
                    client_component,
                    name,
                }
            }
            MmalMsgType::ComponentDestroy => {
                check_len(&b, 4)?;
                MmalRequest::ComponentDestroy {
                    component: b.get_u32_le(),
                }
            }
            MmalMsgType::ComponentEnable => {
                check_len(&b, 4)?;
                MmalRequest::ComponentEnable {
                    component: b.get_u32_le(),
                }
            }
            MmalMsgType::ComponentDisable => {
                check_len(&b, 4)?;
                MmalRequest::ComponentDisable {
                    component: b.get_u32_le(),
                }
            }
            MmalMsgType::PortInfoGet => {
                check_len(&b, 12)?;
                MmalRequest::PortInfoGet {
                    component: b.get_u32_le(),
                    kind: PortKind::from_u32(b.get_u32_le())?,
                    index: b.get_u32_le(),
                }
            }
            MmalMsgType::PortInfoSet => {
                check_len(&b, 12)?;
                let component = b.get_u32_le();
                let kind = PortKind::from_u32(b.get_u32_le())?;
                let index = b.get_u32_le();
                let port = PortSettings::decode(&mut b)?;
                let format = ElementaryFormat::decode(&mut b)?;
                MmalRequest::PortInfoSet {
                    component,
                    kind,
                    index,
                    port,
                    format,
                }
            }
            MmalMsgType::PortAction => {
                check_len(&b, 20)?;
                let component = b.get_u32_le();
                let port_handle = b.get_u32_le();
                let action = PortActionKind::from_u32(b.get_u32_le())?;
                let dst_component = b.get_u32_le();
                let dst_port = b.get_u32_le();
                let connect = if action == PortActionKind::Connect {
                    Some((dst_component, dst_port))
                } else {
                    None
                };
                MmalRequest::PortAction {
                    component,
                    port_handle,
                    action,
                    connect,
                }
            }
            MmalMsgType::PortParameterSet => {
                check_len(&b, 16)?;
                let component = b.get_u32_le();
                let port_handle = b.get_u32_le();
                let id = b.get_u32_le();
                let len = b.get_u32_le() as usize;
                check_len(&b, len)?;
                MmalRequest::PortParameterSet {
                    component,
                    port_handle,
                    id,
                    value: b.split_to(len),
                }
            }
            MmalMsgType::PortParameterGet => {
                check_len(&b, 12)?;
                MmalRequest::PortParameterGet {
                    component: b.get_u32_le(),
                    port_handle: b.get_u32_le(),
                    id: b.get_u32_le(),
                }
            }
            MmalMsgType::BufferFromHost => MmalRequest::BufferFromHost(BufferTransfer::decode(&mut b)?),
            _ => return Err(Error::Corrupted("message type is not a request")),
        })
    }
}

/// Remote-to-host reply bodies, decoded against the expected request type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MmalReply {
    ComponentCreate {
        component: u32,
        input_count: u32,
        output_count: u32,
    },
    /// Status-only acknowledgment (enable/disable/destroy/action/param-set).
    Ack,
    PortInfo {
        port: PortSettings,
        format: ElementaryFormat,
    },
    ParameterValue {
        id: u32,
        value: Bytes,
    },
}

impl MmalReply {
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            MmalReply::ComponentCreate {
                component,
                input_count,
                output_count,
            } => {
                out.put_u32_le(*component);
                out.put_u32_le(*input_count);
                out.put_u32_le(*output_count);
            }
            MmalReply::Ack => {}
            MmalReply::PortInfo { port, format } => {
                port.encode(out);
                format.encode(out);
            }
            MmalReply::ParameterValue { id, value } => {
                out.put_u32_le(*id);
                out.put_u32_le(value.len() as u32);
                out.put_slice(value);
            }
        }
    }

    pub fn decode(msg_type: MmalMsgType, mut b: Bytes) -> Result<Self> {
        Ok(match msg_type {
            MmalMsgType::ComponentCreate => {
                check_len(&b, 12)?;
                MmalReply::ComponentCreate {
                    component: b.get_u32_le(),
                    input_count: b.get_u32_le(),
                    output_count: b.get_u32_le(),
                }
            }
            MmalMsgType::ComponentDestroy
            | MmalMsgType::ComponentEnable
            | MmalMsgType::ComponentDisable
            | MmalMsgType::PortAction
            | MmalMsgType::PortInfoSet
            | MmalMsgType::PortParameterSet => MmalReply::Ack,
            MmalMsgType::PortInfoGet => {
                let port = PortSettings::decode(&mut b)?;
                let format = ElementaryFormat::decode(&mut b)?;
                MmalReply::PortInfo { port, format }
            }
            MmalMsgType::PortParameterGet => {
                check_len(&b, 8)?;
                let id = b.get_u32_le();
                let len = b.get_u32_le() as usize;
                check_len(&b, len)?;
                MmalReply::ParameterValue {
                    id,
                    value: b.split_to(len),
                }
            }
            _ => return Err(Error::Corrupted("message type is not a reply")),
        })
    }
}

/// A full message as it crosses the ring: header fields plus raw payload.
#[derive(Debug, Clone)]
pub struct MmalFrame {
    pub msg_type: MmalMsgType,
    pub control_service: u32,
    pub context: u32,
    pub status: MmalStatus,
    pub payload: Bytes,
}

/// Serialize a frame, enforcing the total message cap.
pub fn encode_frame(
    msg_type: MmalMsgType,
    control_service: u32,
    context: u32,
    status: MmalStatus,
    payload: &[u8],
) -> Result<Bytes> {
    if HEADER_BYTES + payload.len() > MAX_MESSAGE {
        return Err(Error::PayloadTooLarge {
            got: HEADER_BYTES + payload.len(),
            limit: MAX_MESSAGE,
        });
    }
    let mut out = BytesMut::with_capacity(HEADER_BYTES + payload.len());
    out.put_u32_le(MESSAGE_MAGIC);
    out.put_u32_le(msg_type as u32);
    out.put_u32_le(control_service);
    out.put_u32_le(context);
    out.put_u32_le(status.0);
    out.put_u32_le(0);
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Parse a frame header, leaving the payload untouched in `payload`.
pub fn decode_frame(mut b: Bytes) -> Result<MmalFrame> {
    if b.len() < HEADER_BYTES || b.len() > MAX_MESSAGE {
        return Err(Error::Corrupted("media message size out of range"));
    }
    let magic = b.get_u32_le();
    if magic != MESSAGE_MAGIC {
        return Err(Error::Corrupted("bad media message magic"));
    }
    let msg_type = MmalMsgType::from_u32(b.get_u32_le())?;
    let control_service = b.get_u32_le();
    let context = b.get_u32_le();
    let status = MmalStatus(b.get_u32_le());
    let _padding = b.get_u32_le();
    Ok(MmalFrame {
        msg_type,
        control_service,
        context,
        status,
        payload: b,
    })
}

fn check_len(b: &Bytes, need: usize) -> Result<()> {
    if b.len() < need {
        return Err(Error::Corrupted("truncated media message"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_round_trip() {
        let frame = encode_frame(
            MmalMsgType::ComponentEnable,
            7,
            0x0002_0001,
            MmalStatus::SUCCESS,
            &[1, 2, 3, 4],
        )
        .unwrap();
        let decoded = decode_frame(frame).unwrap();
        assert_eq!(decoded.msg_type, MmalMsgType::ComponentEnable);
        assert_eq!(decoded.context, 0x0002_0001);
        assert!(decoded.status.is_ok());
        assert_eq!(&decoded.payload[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn frame_rejects_oversize() {
        let payload = vec![0u8; MAX_MESSAGE];
        assert!(matches!(
            encode_frame(
                MmalMsgType::PortParameterSet,
                0,
                0,
                MmalStatus::SUCCESS,
                &payload
            ),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn component_create_round_trip() {
        let req = MmalRequest::ComponentCreate {
            client_component: 1,
            name: "vc.ril.camera".into(),
        };
        let mut body = BytesMut::new();
        req.encode(&mut body).unwrap();
        assert_eq!(body.len(), 4 + COMPONENT_NAME_BYTES);
        let decoded = MmalRequest::decode(MmalMsgType::ComponentCreate, body.freeze()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn parameter_blob_is_bounded() {
        let req = MmalRequest::PortParameterSet {
            component: 1,
            port_handle: 2,
            id: 3,
            value: Bytes::from(vec![0u8; MAX_INLINE_PARAM + 1]),
        };
        let mut body = BytesMut::new();
        assert!(matches!(
            req.encode(&mut body),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn buffer_transfer_round_trip() {
        let transfer = BufferTransfer {
            component: 0x1001,
            port_handle: 0x301,
            client_context: 5,
            import_handle: 42,
            alloc_size: 262_144,
            length: 8_192,
            offset: 0,
            flags: BufferFlags::FRAME_END | BufferFlags::KEYFRAME,
            pts: 33_000,
            dts: 33_000,
        };
        let mut out = BytesMut::new();
        transfer.encode(&mut out);
        assert_eq!(out.len(), BufferTransfer::WIRE_BYTES);
        let decoded = BufferTransfer::decode(&mut out.freeze()).unwrap();
        assert_eq!(decoded, transfer);
    }

    #[test]
    fn port_info_reply_round_trip() {
        let reply = MmalReply::PortInfo {
            port: PortSettings {
                port_handle: 0x301,
                enabled: true,
                buffer_num_min: 1,
                buffer_num_recommended: 4,
                buffer_num: 4,
                buffer_size_min: 16_384,
                buffer_size_recommended: 81_920,
                buffer_size: 81_920,
                buffer_alignment_min: 16,
            },
            format: ElementaryFormat {
                es_type: EsType::Video,
                encoding: FourCc::new(b"H264"),
                encoding_variant: FourCc(0),
                width: 1920,
                height: 1080,
                frame_rate_num: 30,
                frame_rate_den: 1,
                bitrate: 17_000_000,
            },
        };
        let mut body = BytesMut::new();
        reply.encode(&mut body);
        let decoded = MmalReply::decode(MmalMsgType::PortInfoGet, body.freeze()).unwrap();
        assert_eq!(decoded, reply);
    }
}
