use ironrdp_core::{encode_vec, EncodeResult};
use ironrdp_egfx::pdu::{Avc420BitmapStream, Avc444BitmapStream, Encoding, QuantQuality};
use ironrdp_pdu::geometry::InclusiveRectangle;

/// RDPGFX_RECT16 as carried in AVC bitmap-stream metadata.
///
/// `right` and `bottom` are exclusive bounds per the wire format, so a valid
/// rectangle always has `left < right` and `top < bottom`. The PDU layer
/// writes the four fields verbatim, which preserves the exclusive coordinates
/// on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect16 {
    pub left: u16,
    pub top: u16,
    pub right: u16,
    pub bottom: u16,
}

impl Rect16 {
    /// Rectangle covering a whole `width` x `height` frame.
    ///
    /// Degenerate dimensions are widened to one pixel so the wire invariant
    /// holds even for empty input.
    pub fn full(width: u16, height: u16) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width.max(1),
            bottom: height.max(1),
        }
    }

    pub fn width(&self) -> u16 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u16 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    pub fn is_valid(&self) -> bool {
        self.left < self.right && self.top < self.bottom
    }

    /// Bounding box of a non-empty rectangle list.
    pub fn bounding(rects: &[Rect16]) -> Option<Rect16> {
        let first = rects.first()?;
        let mut bounds = *first;
        for rect in &rects[1..] {
            bounds.left = bounds.left.min(rect.left);
            bounds.top = bounds.top.min(rect.top);
            bounds.right = bounds.right.max(rect.right);
            bounds.bottom = bounds.bottom.max(rect.bottom);
        }
        Some(bounds)
    }

    pub fn to_wire(self) -> InclusiveRectangle {
        InclusiveRectangle {
            left: self.left,
            top: self.top,
            right: self.right,
            bottom: self.bottom,
        }
    }
}

/// Per-region quantization parameter and quality value for an AVC stream.
///
/// `qp` stays within `[10, 40]` and `quality` within `[70, 100]`; the quality
/// policy in `boreal-video` clamps before constructing these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectQuality {
    pub qp: u8,
    pub quality: u8,
}

impl RectQuality {
    pub fn to_quant_quality(self) -> QuantQuality {
        QuantQuality {
            quantization_parameter: self.qp,
            progressive: false,
            quality: self.quality,
        }
    }
}

/// Serialize an `RDPGFX_AVC420_BITMAP_STREAM` from region metadata and an
/// already-encoded H.264 payload.
pub fn encode_avc420_stream(region: &[Rect16], qualities: &[RectQuality], data: &[u8]) -> EncodeResult<Vec<u8>> {
    let stream = Avc420BitmapStream {
        rectangles: region.iter().map(|r| r.to_wire()).collect(),
        quant_qual_vals: qualities.iter().map(|q| q.to_quant_quality()).collect(),
        data,
    };

    encode_vec(&stream)
}

/// Serialize an `RDPGFX_AVC444_BITMAP_STREAM` carrying a luma-only AVC420
/// stream.
///
/// The chroma stream is omitted (`LC = LUMA`); the payload stays AVC420-framed
/// even when an AVC444 codec was negotiated.
pub fn encode_avc444_luma_stream(region: &[Rect16], qualities: &[RectQuality], data: &[u8]) -> EncodeResult<Vec<u8>> {
    let stream1 = Avc420BitmapStream {
        rectangles: region.iter().map(|r| r.to_wire()).collect(),
        quant_qual_vals: qualities.iter().map(|q| q.to_quant_quality()).collect(),
        data,
    };

    let stream = Avc444BitmapStream {
        encoding: Encoding::LUMA,
        stream1,
        stream2: None,
    };

    encode_vec(&stream)
}
