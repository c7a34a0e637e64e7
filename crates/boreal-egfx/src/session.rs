use std::collections::HashSet;

use ironrdp_egfx::pdu::{FrameAcknowledgePdu, QueueDepth};
use tracing::{trace, warn};

/// Queue depth assumed while the client has suspended frame acknowledgements.
///
/// The value is latched until the next acknowledgement overwrites it.
pub(crate) const SUSPENDED_QUEUE_DEPTH: i32 = 16;

/// The client-side render target surface-commands apply to.
///
/// One surface exists per connection; IDs are allocated monotonically from 1
/// and never reused within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface {
    pub id: u16,
    pub width: u16,
    pub height: u16,
}

/// Decode-progress information extracted from one FRAME_ACKNOWLEDGE PDU.
#[derive(Debug, Clone, Copy)]
pub struct FrameAck {
    pub frame_id: u32,
    /// False when the acknowledged ID was not in the pending set.
    pub known: bool,
    /// `encoded - totalFramesDecoded`, an approximation of in-flight frames.
    pub lag: i32,
    pub decoder_queue_depth: i32,
}

/// Per-connection GFX session state: surface lifecycle, frame-ID allocation
/// and the set of submitted-but-unacknowledged frames.
#[derive(Debug)]
pub struct SessionState {
    channel_id: Option<u32>,
    next_surface_id: u16,
    surface: Option<Surface>,
    next_frame_id: u32,
    pending_frames: HashSet<u32>,
    encoded_frames: u32,
    lag: i32,
    decoder_queue_depth: i32,
    pending_reset: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            channel_id: None,
            next_surface_id: 1,
            surface: None,
            next_frame_id: 0,
            pending_frames: HashSet::new(),
            encoded_frames: 0,
            lag: 0,
            decoder_queue_depth: 0,
            // The first submitted frame always performs Reset/Create/Map.
            pending_reset: true,
        }
    }

    pub fn channel_id(&self) -> Option<u32> {
        self.channel_id
    }

    pub fn set_channel_id(&mut self, channel_id: u32) {
        self.channel_id = Some(channel_id);
    }

    pub fn surface(&self) -> Option<&Surface> {
        self.surface.as_ref()
    }

    /// Latch a reset; the next submitted frame re-issues Reset/Create/Map.
    pub fn request_reset(&mut self) {
        self.pending_reset = true;
    }

    pub fn take_pending_reset(&mut self) -> bool {
        std::mem::take(&mut self.pending_reset)
    }

    /// Allocate the next surface and make it current.
    pub fn create_surface(&mut self, width: u16, height: u16) -> Surface {
        let surface = Surface {
            id: self.next_surface_id,
            width,
            height,
        };
        self.next_surface_id = self.next_surface_id.wrapping_add(1);
        self.surface = Some(surface);
        surface
    }

    /// Allocate a strictly monotonic frame ID and track it as pending.
    pub fn begin_frame(&mut self) -> u32 {
        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        self.encoded_frames = self.encoded_frames.wrapping_add(1);
        self.pending_frames.insert(frame_id);
        frame_id
    }

    pub fn pending_frame_count(&self) -> usize {
        self.pending_frames.len()
    }

    pub fn encoded_frames(&self) -> u32 {
        self.encoded_frames
    }

    pub fn lag(&self) -> i32 {
        self.lag
    }

    pub fn decoder_queue_depth(&self) -> i32 {
        self.decoder_queue_depth
    }

    /// Apply a FRAME_ACKNOWLEDGE PDU.
    ///
    /// An acknowledgement for an ID outside the pending set is logged and
    /// still applied; the client may re-acknowledge after a reset.
    pub fn acknowledge(&mut self, pdu: &FrameAcknowledgePdu) -> FrameAck {
        let known = self.pending_frames.remove(&pdu.frame_id);
        if !known {
            warn!(frame_id = pdu.frame_id, "frame acknowledge for an unknown frame");
        }

        match pdu.queue_depth {
            QueueDepth::Suspend => {
                trace!("client suspended frame acknowledgements");
                self.decoder_queue_depth = SUSPENDED_QUEUE_DEPTH;
            }
            // Depth not reported; keep the last observation.
            QueueDepth::Unavailable => {}
            QueueDepth::AvailableBytes(depth) => {
                self.decoder_queue_depth = i32::try_from(depth).unwrap_or(i32::MAX);
            }
        }

        self.lag = i32::try_from(i64::from(self.encoded_frames) - i64::from(pdu.total_frames_decoded))
            .unwrap_or(i32::MAX);

        FrameAck {
            frame_id: pdu.frame_id,
            known,
            lag: self.lag,
            decoder_queue_depth: self.decoder_queue_depth,
        }
    }
}
