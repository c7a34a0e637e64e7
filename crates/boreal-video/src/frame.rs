use std::time::Duration;

use bytes::Bytes;

use crate::geometry::{Region, Size};

/// Opaque encoded H.264 packet handed over by the capture pipeline.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Bytes,
    /// IDR frame; standalone decodable, forces full-damage transmission.
    pub is_key_frame: bool,
}

/// Side-channel presentation metadata for one encoded packet.
///
/// Every field is independently optional; the signal is approximately FIFO
/// with packet delivery but not strongly ordered against it.
#[derive(Debug, Clone, Default)]
pub struct FrameMetadata {
    pub size: Option<Size>,
    pub damage: Option<Region>,
    pub pts: Option<Duration>,
}

/// An encoded packet joined with its damage metadata.
///
/// `damage` is never empty and always contained in `(0,0)-size`; it covers
/// the full frame when no metadata was applied or the packet is a key frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Bytes,
    pub is_key_frame: bool,
    pub size: Size,
    pub damage: Region,
    pub pts: Option<Duration>,
}
