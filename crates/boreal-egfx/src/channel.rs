use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use ironrdp_core::{decode, impl_as_any, EncodeResult};
use ironrdp_dvc::{DvcMessage, DvcProcessor, DvcServerProcessor};
use ironrdp_egfx::pdu::{
    CacheImportReplyPdu, CapabilitiesConfirmPdu, CapabilitySet, CreateSurfacePdu, EndFramePdu, FrameAcknowledgePdu,
    GfxPdu, MapSurfaceToOutputPdu, PixelFormat, QoeFrameAcknowledgePdu, ResetGraphicsPdu, StartFramePdu, Timestamp,
    WireToSurface1Pdu,
};
use ironrdp_egfx::CHANNEL_NAME;
use ironrdp_pdu::gcc::{Monitor, MonitorFlags};
use ironrdp_pdu::{decode_err, PduResult};
use tracing::{debug, trace, warn};

use crate::avc::{encode_avc420_stream, encode_avc444_luma_stream, Rect16, RectQuality};
use crate::caps::{negotiate, AvcCodec, CodecSelection};
use crate::error::VideoInitError;
use crate::session::{FrameAck, SessionState};

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Callbacks fired by [`GfxVideoChannel`] as client messages arrive.
///
/// All callbacks run on the thread driving the DVC channel; implementations
/// must not block on the submission path.
pub trait GfxVideoHandler: Send + Sync {
    /// The DVC layer assigned a channel ID; the channel can now emit PDUs.
    fn channel_started(&mut self, _channel_id: u32) {}

    /// Capability negotiation completed; submission is unlocked.
    fn codec_selected(&mut self, _selection: &CodecSelection) {}

    /// Negotiation failed; the connection should close with a video-init
    /// failure.
    fn negotiation_failed(&mut self, _error: VideoInitError) {}

    /// The client acknowledged a frame.
    fn frame_acknowledged(&mut self, _ack: FrameAck) {}

    /// QoE metrics received (V10+ clients). Protocol-wise this is a no-op.
    fn qoe_report(&mut self, _pdu: &QoeFrameAcknowledgePdu) {}

    /// The channel closed.
    fn closed(&mut self) {}
}

/// One encoded frame ready for submission, paired with its region metadata.
#[derive(Debug, Clone, Copy)]
pub struct Avc420Frame<'a> {
    /// H.264 payload in AVC framing.
    pub data: &'a [u8],
    pub width: u16,
    pub height: u16,
    /// Damage region; never empty for a submittable frame.
    pub region: &'a [Rect16],
    /// Per-rectangle quantization, same length as `region`.
    pub qualities: &'a [RectQuality],
}

/// Server side of the Graphics Pipeline Virtual Channel.
///
/// Owns capability negotiation, the session surface, frame-ID allocation and
/// raw PDU assembly. Client messages arrive through [`DvcProcessor`] (via
/// [`GfxChannelBridge`]); the submission thread calls [`submit_frame`] and
/// ships the drained output itself.
///
/// [`submit_frame`]: Self::submit_frame
pub struct GfxVideoChannel {
    handler: Box<dyn GfxVideoHandler>,
    preferred_codec: AvcCodec,
    avc444_available: bool,
    selection: Option<CodecSelection>,
    caps_confirmed: bool,
    session: SessionState,
    output: VecDeque<GfxPdu>,
}

impl GfxVideoChannel {
    pub fn new(preferred_codec: AvcCodec, avc444_available: bool, handler: Box<dyn GfxVideoHandler>) -> Self {
        Self {
            handler,
            preferred_codec,
            avc444_available,
            selection: None,
            caps_confirmed: false,
            session: SessionState::new(),
            output: VecDeque::new(),
        }
    }

    /// True once caps are confirmed and a channel ID is assigned.
    pub fn is_ready(&self) -> bool {
        self.caps_confirmed && self.session.channel_id().is_some()
    }

    pub fn selection(&self) -> Option<&CodecSelection> {
        self.selection.as_ref()
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Latch a graphics reset; the next submitted frame re-issues
    /// RESET_GRAPHICS / CREATE_SURFACE / MAP_SURFACE_TO_OUTPUT.
    pub fn request_reset(&mut self) {
        self.session.request_reset();
    }

    /// Assemble and queue one GFX frame: START_FRAME, a surface command
    /// carrying the AVC bitmap stream, then END_FRAME.
    ///
    /// Returns the allocated frame ID, or `None` when the channel is not
    /// ready or the frame carries no payload. The caller drains the queued
    /// PDUs with [`drain_output`](Self::drain_output).
    pub fn submit_frame(&mut self, frame: &Avc420Frame<'_>) -> EncodeResult<Option<u32>> {
        if !self.is_ready() {
            trace!("GFX channel not ready, dropping frame");
            return Ok(None);
        }

        if frame.data.is_empty() || frame.region.is_empty() {
            return Ok(None);
        }

        let codec = match &self.selection {
            Some(selection) => selection.codec,
            None => return Ok(None),
        };

        if self.session.take_pending_reset() {
            self.emit_reset(frame.width, frame.height);
        }

        let surface = match self.session.surface() {
            Some(surface) => *surface,
            None => {
                warn!("no surface to submit to, dropping frame");
                return Ok(None);
            }
        };

        let bitmap_data = match codec {
            AvcCodec::Avc420 => encode_avc420_stream(frame.region, frame.qualities, frame.data)?,
            // AVC444 variants stay AVC420-framed: luma-only stream, no chroma.
            AvcCodec::Avc444 | AvcCodec::Avc444v2 => {
                encode_avc444_luma_stream(frame.region, frame.qualities, frame.data)?
            }
        };

        let bounds = match Rect16::bounding(frame.region) {
            Some(bounds) => bounds,
            None => return Ok(None),
        };

        let frame_id = self.session.begin_frame();
        let timestamp = current_timestamp();

        self.output
            .push_back(GfxPdu::StartFrame(StartFramePdu { timestamp, frame_id }));
        self.output.push_back(GfxPdu::WireToSurface1(WireToSurface1Pdu {
            surface_id: surface.id,
            codec_id: codec.codec1_type(),
            pixel_format: PixelFormat::XRgb,
            destination_rectangle: bounds.to_wire(),
            bitmap_data,
        }));
        self.output.push_back(GfxPdu::EndFrame(EndFramePdu { frame_id }));

        trace!(frame_id, surface_id = surface.id, rects = frame.region.len(), "queued frame");
        Ok(Some(frame_id))
    }

    /// Take the queued server-to-client PDUs.
    pub fn drain_output(&mut self) -> Vec<GfxPdu> {
        self.output.drain(..).collect()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    fn drain_messages(&mut self) -> Vec<DvcMessage> {
        self.output.drain(..).map(|pdu| Box::new(pdu) as DvcMessage).collect()
    }

    fn emit_reset(&mut self, width: u16, height: u16) {
        debug!(width, height, "performing graphics reset");

        self.output.push_back(GfxPdu::ResetGraphics(ResetGraphicsPdu {
            width: u32::from(width),
            height: u32::from(height),
            monitors: vec![Monitor {
                left: 0,
                top: 0,
                right: i32::from(width),
                bottom: i32::from(height),
                flags: MonitorFlags::PRIMARY,
            }],
        }));

        let surface = self.session.create_surface(width, height);

        self.output.push_back(GfxPdu::CreateSurface(CreateSurfacePdu {
            surface_id: surface.id,
            width,
            height,
            pixel_format: PixelFormat::XRgb,
        }));

        self.output.push_back(GfxPdu::MapSurfaceToOutput(MapSurfaceToOutputPdu {
            surface_id: surface.id,
            output_origin_x: 0,
            output_origin_y: 0,
        }));
    }

    fn handle_caps_advertise(&mut self, cap_sets: &[CapabilitySet]) {
        match negotiate(cap_sets, self.preferred_codec, self.avc444_available) {
            Ok(selection) => {
                self.output
                    .push_back(GfxPdu::CapabilitiesConfirm(CapabilitiesConfirmPdu(
                        selection.cap_set.clone(),
                    )));
                self.caps_confirmed = true;
                self.selection = Some(selection.clone());
                self.handler.codec_selected(&selection);
                debug!(codec = ?selection.codec, "caps confirmed");
            }
            Err(error) => {
                warn!(%error, "capability negotiation failed");
                self.handler.negotiation_failed(error);
            }
        }
    }

    fn handle_frame_acknowledge(&mut self, pdu: &FrameAcknowledgePdu) {
        trace!(frame_id = pdu.frame_id, "frame acknowledge");
        let ack = self.session.acknowledge(pdu);
        self.handler.frame_acknowledged(ack);
    }
}

impl_as_any!(GfxVideoChannel);

impl DvcProcessor for GfxVideoChannel {
    fn channel_name(&self) -> &str {
        CHANNEL_NAME
    }

    fn start(&mut self, channel_id: u32) -> PduResult<Vec<DvcMessage>> {
        debug!(channel_id, "GFX channel started");
        self.session.set_channel_id(channel_id);
        self.handler.channel_started(channel_id);
        // The server waits for the client's CAPS_ADVERTISE.
        Ok(Vec::new())
    }

    fn process(&mut self, _channel_id: u32, payload: &[u8]) -> PduResult<Vec<DvcMessage>> {
        let pdu = decode(payload).map_err(|e| decode_err!(e))?;

        match pdu {
            GfxPdu::CapabilitiesAdvertise(pdu) => self.handle_caps_advertise(&pdu.0),
            GfxPdu::FrameAcknowledge(pdu) => self.handle_frame_acknowledge(&pdu),
            GfxPdu::QoeFrameAcknowledge(pdu) => {
                trace!(frame_id = pdu.frame_id, "QoE frame acknowledge");
                self.handler.qoe_report(&pdu);
            }
            GfxPdu::CacheImportOffer(pdu) => {
                // Tile caching is not implemented; reject every offered slot
                // so the client proceeds without imports.
                debug!(entries = pdu.cache_entries.len(), "rejecting cache import offer");
                self.output
                    .push_back(GfxPdu::CacheImportReply(CacheImportReplyPdu { cache_slots: vec![] }));
            }
            other => {
                warn!(?other, "unhandled client GFX PDU");
            }
        }

        Ok(self.drain_messages())
    }

    fn close(&mut self, _channel_id: u32) {
        debug!("GFX channel closed");
        // Submission stays locked until a new negotiation completes.
        self.caps_confirmed = false;
        self.handler.closed();
    }
}

impl DvcServerProcessor for GfxVideoChannel {}

/// Shared handle to a [`GfxVideoChannel`].
///
/// A `std::sync::Mutex` is required here: the [`DvcProcessor`] methods are
/// synchronous, and the submission thread takes the same lock.
pub type GfxChannelHandle = Arc<Mutex<GfxVideoChannel>>;

/// [`DvcProcessor`] adapter over a shared [`GfxVideoChannel`].
///
/// Register the bridge with the DVC server; keep the handle for the
/// submission thread.
pub struct GfxChannelBridge {
    inner: GfxChannelHandle,
}

impl GfxChannelBridge {
    pub fn new(inner: GfxChannelHandle) -> Self {
        Self { inner }
    }

    pub fn handle(&self) -> &GfxChannelHandle {
        &self.inner
    }
}

impl_as_any!(GfxChannelBridge);

impl DvcProcessor for GfxChannelBridge {
    fn channel_name(&self) -> &str {
        CHANNEL_NAME
    }

    fn start(&mut self, channel_id: u32) -> PduResult<Vec<DvcMessage>> {
        self.inner
            .lock()
            .expect("GfxVideoChannel mutex poisoned")
            .start(channel_id)
    }

    fn process(&mut self, channel_id: u32, payload: &[u8]) -> PduResult<Vec<DvcMessage>> {
        self.inner
            .lock()
            .expect("GfxVideoChannel mutex poisoned")
            .process(channel_id, payload)
    }

    fn close(&mut self, channel_id: u32) {
        self.inner
            .lock()
            .expect("GfxVideoChannel mutex poisoned")
            .close(channel_id)
    }
}

impl DvcServerProcessor for GfxChannelBridge {}

/// START_FRAME timestamp from the UTC wall clock, packed as
/// `hour << 22 | minute << 16 | second << 10 | millisecond`.
fn current_timestamp() -> Timestamp {
    let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let millis_of_day = u64::try_from(since_epoch.as_millis()).unwrap_or_default() % MILLIS_PER_DAY;
    timestamp_from_millis_of_day(millis_of_day)
}

fn timestamp_from_millis_of_day(millis_of_day: u64) -> Timestamp {
    Timestamp {
        milliseconds: (millis_of_day % 1000) as u16,
        seconds: ((millis_of_day / 1000) % 60) as u8,
        minutes: ((millis_of_day / 60_000) % 60) as u8,
        hours: ((millis_of_day / 3_600_000) % 24) as u16,
    }
}
