use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use boreal_egfx::{
    Avc420Frame, AvcCodec, CodecSelection, FrameAck, GfxChannelBridge, GfxChannelHandle, GfxVideoChannel,
    GfxVideoHandler, Rect16, RectQuality, VideoInitError,
};
use ironrdp_egfx::pdu::GfxPdu;
use tracing::{debug, trace, warn};

use crate::activity::ActivityGrid;
use crate::congestion::{CongestionController, CongestionSample};
use crate::damage::damage_rects;
use crate::frame::{EncodedPacket, FrameMetadata, VideoFrame};
use crate::geometry::Size;
use crate::pairer::PacketPairer;
use crate::quality::{rect_quality, QualityContext};

/// Bound on the submission queue; the freshest frame wins.
pub const MAX_QUEUED_FRAMES: usize = 8;

/// Damage coverage at or above this forces a full-frame region.
const FULL_DAMAGE_COVERAGE: f64 = 0.15;

/// Coverage at or below this counts as a stable (settled) frame.
const STABLE_COVERAGE: f64 = 0.03;

/// More rectangles than this force a full-frame region.
const MAX_PARTIAL_RECTS: usize = 8;

/// A full-frame region is forced at least every this many frames.
const FULL_DAMAGE_FRAME_BUDGET: u32 = 8;

/// Minimum spacing between two refinement frames.
const REFINEMENT_COOLDOWN: Duration = Duration::from_millis(600);

/// Stable frames required before a refinement frame is sent.
const STABLE_FRAMES_FOR_REFINEMENT: u32 = 3;

const DROP_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Outbound seam towards the embedding RDP server.
///
/// `send_gfx` receives fully assembled GFX PDUs for the given DVC channel;
/// the embedder encodes them onto the wire. The bandwidth-measure bracket and
/// the failure callback mirror what the session orchestrator needs to know.
pub trait StreamSink: Send {
    fn send_gfx(&mut self, channel_id: u32, pdus: Vec<GfxPdu>);

    /// Called right before a frame is put on the wire.
    fn start_bandwidth_measure(&mut self) {}

    /// Called right after a frame is put on the wire.
    fn stop_bandwidth_measure(&mut self) {}

    /// Capability negotiation failed; close the connection.
    fn video_init_failed(&mut self, _error: VideoInitError) {}

    /// The GFX channel closed.
    fn channel_closed(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct VideoStreamConfig {
    /// Most-preferred codec; demoted to AVC420 when `avc444_available` is
    /// false.
    pub preferred_codec: AvcCodec,
    /// Whether the local encoder can produce AVC444 payloads end-to-end.
    pub avc444_available: bool,
    pub maximum_frame_rate: u32,
    pub initial_frame_rate: u32,
    /// Whether the capture pipeline exposes a damage-metadata signal.
    pub metadata_channel_available: bool,
}

impl Default for VideoStreamConfig {
    fn default() -> Self {
        Self {
            preferred_codec: AvcCodec::Avc444v2,
            avc444_available: false,
            maximum_frame_rate: 120,
            initial_frame_rate: 60,
            metadata_channel_available: true,
        }
    }
}

#[derive(Default)]
struct FrameQueue {
    frames: VecDeque<VideoFrame>,
    dropped: u64,
}

/// Push with drop-oldest semantics; the queue never exceeds
/// [`MAX_QUEUED_FRAMES`].
fn push_bounded(queue: &mut FrameQueue, frame: VideoFrame) {
    queue.frames.push_back(frame);
    while queue.frames.len() > MAX_QUEUED_FRAMES {
        queue.frames.pop_front();
        queue.dropped += 1;
    }
}

struct SharedState {
    queue: Mutex<FrameQueue>,
    queue_cond: Condvar,
    stop: AtomicBool,
    enabled: AtomicBool,
    requested_frame_rate: AtomicU32,
    qp_bias: AtomicI32,
    lag: AtomicI32,
    decoder_queue_depth: AtomicI32,
}

type SharedSink = Arc<Mutex<Box<dyn StreamSink>>>;

/// Feeds ACK-derived congestion inputs from the channel callbacks into the
/// shared scalars the submitter and controller read.
struct AckForwarder {
    shared: Arc<SharedState>,
    sink: SharedSink,
}

impl GfxVideoHandler for AckForwarder {
    fn frame_acknowledged(&mut self, ack: FrameAck) {
        self.shared.lag.store(ack.lag, Ordering::Relaxed);
        self.shared
            .decoder_queue_depth
            .store(ack.decoder_queue_depth, Ordering::Relaxed);
    }

    fn codec_selected(&mut self, selection: &CodecSelection) {
        debug!(codec = ?selection.codec, "video codec selected");
        // A frame may already be waiting in the queue.
        self.shared.queue_cond.notify_all();
    }

    fn negotiation_failed(&mut self, error: VideoInitError) {
        self.sink
            .lock()
            .expect("stream sink mutex poisoned")
            .video_init_failed(error);
    }

    fn closed(&mut self) {
        self.sink
            .lock()
            .expect("stream sink mutex poisoned")
            .channel_closed();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefinementState {
    Idle,
    MotionDetected,
    Settling,
}

/// Tracks motion settling and schedules progressive-refinement frames.
///
/// `Idle -> MotionDetected -> Settling -> (refine) -> Idle`. A refinement
/// fires once at least [`STABLE_FRAMES_FOR_REFINEMENT`] stable frames passed
/// with no lag, the frame is not a key frame, and the cooldown elapsed.
#[derive(Debug)]
struct RefinementTracker {
    state: RefinementState,
    stable_frames: u32,
    last_refinement: Option<Instant>,
}

impl RefinementTracker {
    fn new() -> Self {
        Self {
            state: RefinementState::Idle,
            stable_frames: 0,
            last_refinement: None,
        }
    }

    /// Decide whether the frame being planned becomes the refinement frame.
    fn poll(&mut self, now: Instant, lag: i32, is_key_frame: bool) -> bool {
        if self.state != RefinementState::Settling
            || self.stable_frames < STABLE_FRAMES_FOR_REFINEMENT
            || lag != 0
            || is_key_frame
        {
            return false;
        }

        let cooled = self
            .last_refinement
            .map_or(true, |at| now.duration_since(at) >= REFINEMENT_COOLDOWN);
        if !cooled {
            return false;
        }

        self.last_refinement = Some(now);
        self.state = RefinementState::Idle;
        self.stable_frames = 0;
        true
    }

    /// Feed one ordinary (non-refinement) frame's stats into the machine.
    fn observe(&mut self, coverage: f64, rect_count: usize, lag: i32) {
        let motion = coverage >= FULL_DAMAGE_COVERAGE || rect_count > MAX_PARTIAL_RECTS || lag >= 1;

        if motion {
            self.state = RefinementState::MotionDetected;
            self.stable_frames = 0;
        } else if self.state != RefinementState::Idle {
            if coverage <= STABLE_COVERAGE && lag == 0 {
                self.state = RefinementState::Settling;
                self.stable_frames += 1;
            } else {
                self.state = RefinementState::MotionDetected;
                self.stable_frames = 0;
            }
        }
    }
}

/// Everything the submitter computes for one frame before touching the wire.
struct FramePlan {
    width: u16,
    height: u16,
    /// Effective region, possibly overridden to full damage.
    region: Vec<Rect16>,
    /// Pre-override damage, used to mark the activity grid so forced
    /// full-damage frames do not poison it.
    original: Vec<Rect16>,
    qualities: Vec<RectQuality>,
    is_refinement: bool,
}

/// Per-frame damage, activity, quality and refinement machinery.
///
/// Kept apart from the worker loop so the submission policy can be driven
/// deterministically in tests.
struct SubmitPipeline {
    activity: ActivityGrid,
    refinement: RefinementTracker,
    frames_since_full_damage: u32,
}

impl SubmitPipeline {
    fn new() -> Self {
        Self {
            activity: ActivityGrid::new(),
            refinement: RefinementTracker::new(),
            frames_since_full_damage: 0,
        }
    }

    fn plan_frame(&mut self, frame: &VideoFrame, lag: i32, qp_bias: i32, now: Instant) -> Option<FramePlan> {
        let original = damage_rects(frame);
        if original.is_empty() {
            return None;
        }

        self.activity.resize(frame.size);
        self.activity.decay();

        let frame_area = u64::from(frame.size.width) * u64::from(frame.size.height);
        let damage_area: u64 = original.iter().map(Rect16::area).sum();
        let coverage = damage_area as f64 / frame_area as f64;

        let is_refinement = self.refinement.poll(now, lag, frame.is_key_frame);
        if !is_refinement {
            self.refinement.observe(coverage, original.len(), lag);
        }

        let force_full = frame.is_key_frame
            || is_refinement
            || coverage >= FULL_DAMAGE_COVERAGE
            || lag >= 1
            || original.len() > MAX_PARTIAL_RECTS
            || self.frames_since_full_damage >= FULL_DAMAGE_FRAME_BUDGET;

        let width = frame.size.width.min(u32::from(u16::MAX)) as u16;
        let height = frame.size.height.min(u32::from(u16::MAX)) as u16;

        let region = if force_full {
            self.frames_since_full_damage = 0;
            vec![Rect16::full(width, height)]
        } else {
            self.frames_since_full_damage += 1;
            original.clone()
        };

        let ctx = QualityContext {
            frame: frame.size,
            is_key_frame: frame.is_key_frame,
            is_refinement,
            qp_bias,
        };
        let qualities = region
            .iter()
            .map(|rect| rect_quality(&ctx, rect, self.activity.activity_for_rect(rect)))
            .collect();

        Some(FramePlan {
            width,
            height,
            region,
            original,
            qualities,
            is_refinement,
        })
    }

    fn finish_frame(&mut self, plan: &FramePlan) {
        self.activity.mark_damage(&plan.original);
    }
}

/// The dedicated submission worker: wakes on queued frames (or the frame
/// interval), drains the queue freshest-first and puts one frame on the wire.
struct Submitter {
    shared: Arc<SharedState>,
    channel: GfxChannelHandle,
    sink: SharedSink,
    pipeline: SubmitPipeline,
    reported_drops: u64,
    last_drop_log: Option<Instant>,
}

impl Submitter {
    fn run(mut self) {
        loop {
            let next = self.wait_for_frame();
            if self.shared.stop.load(Ordering::Relaxed) {
                break;
            }
            if let Some(frame) = next {
                self.send_frame(&frame, Instant::now());
            }
        }
    }

    fn wait_for_frame(&mut self) -> Option<VideoFrame> {
        let queue = self.shared.queue.lock().expect("frame queue mutex poisoned");
        let frame_rate = self.shared.requested_frame_rate.load(Ordering::Relaxed).max(1);
        let interval = Duration::from_millis(1000 / u64::from(frame_rate));

        let (mut queue, _timeout) = self
            .shared
            .queue_cond
            .wait_timeout_while(queue, interval, |queue| {
                !self.shared.stop.load(Ordering::Relaxed) && queue.frames.is_empty()
            })
            .expect("frame queue mutex poisoned");

        // Freshest-first: once a frame is taken, everything older is stale.
        let frame = queue.frames.pop_back()?;
        queue.dropped += queue.frames.len() as u64;
        queue.frames.clear();
        let dropped = queue.dropped;
        drop(queue);

        self.log_drops(dropped);
        Some(frame)
    }

    fn log_drops(&mut self, dropped: u64) {
        if dropped == self.reported_drops {
            return;
        }
        let now = Instant::now();
        let due = self
            .last_drop_log
            .map_or(true, |last| now.duration_since(last) >= DROP_LOG_INTERVAL);
        if due {
            debug!(
                dropped = dropped - self.reported_drops,
                total = dropped,
                "dropped stale video frames"
            );
            self.reported_drops = dropped;
            self.last_drop_log = Some(now);
        }
    }

    fn send_frame(&mut self, frame: &VideoFrame, now: Instant) {
        if frame.data.is_empty() {
            return;
        }

        {
            let channel = self.channel.lock().expect("GfxVideoChannel mutex poisoned");
            if !channel.is_ready() {
                trace!("GFX channel not ready, skipping frame");
                return;
            }
        }

        let lag = self.shared.lag.load(Ordering::Relaxed);
        let qp_bias = self.shared.qp_bias.load(Ordering::Relaxed);

        let Some(plan) = self.pipeline.plan_frame(frame, lag, qp_bias, now) else {
            return;
        };

        if plan.is_refinement {
            trace!("sending refinement frame");
        }

        self.with_sink(|sink| sink.start_bandwidth_measure());

        let submitted = {
            let mut channel = self.channel.lock().expect("GfxVideoChannel mutex poisoned");
            let outcome = channel.submit_frame(&Avc420Frame {
                data: &frame.data,
                width: plan.width,
                height: plan.height,
                region: &plan.region,
                qualities: &plan.qualities,
            });
            match outcome {
                Ok(Some(frame_id)) => {
                    let channel_id = channel.session().channel_id();
                    let pdus = channel.drain_output();
                    channel_id.map(|channel_id| (frame_id, channel_id, pdus))
                }
                Ok(None) => None,
                Err(error) => {
                    warn!(%error, "failed to assemble frame PDUs");
                    None
                }
            }
        };

        if let Some((frame_id, channel_id, pdus)) = submitted {
            trace!(frame_id, rects = plan.region.len(), "submitting frame");
            self.with_sink(|sink| sink.send_gfx(channel_id, pdus));
        }

        self.with_sink(|sink| sink.stop_bandwidth_measure());

        self.pipeline.finish_frame(&plan);
    }

    fn with_sink(&self, f: impl FnOnce(&mut dyn StreamSink)) {
        let mut sink = self.sink.lock().expect("stream sink mutex poisoned");
        f(sink.as_mut());
    }
}

/// The video transport core: owns the packet/metadata pairer, the bounded
/// frame queue, the submission thread and the congestion controller.
///
/// Wiring: register [`VideoStream::channel_bridge`] with the DVC server,
/// deliver encoded packets via [`on_packet`], metadata via [`on_metadata`]
/// and RTT observations via [`on_rtt_update`]; enable streaming once the
/// session reaches its streaming state.
///
/// [`on_packet`]: Self::on_packet
/// [`on_metadata`]: Self::on_metadata
/// [`on_rtt_update`]: Self::on_rtt_update
pub struct VideoStream {
    shared: Arc<SharedState>,
    channel: GfxChannelHandle,
    pairer: Mutex<PacketPairer>,
    congestion: Mutex<CongestionController>,
    sink: SharedSink,
    worker: Option<JoinHandle<()>>,
}

impl VideoStream {
    /// Spawn the submission worker and set up the GFX channel.
    ///
    /// Fails with [`VideoInitError::ContextOpenFailed`] when the worker
    /// thread cannot be created.
    pub fn new(config: VideoStreamConfig, sink: Box<dyn StreamSink>) -> Result<Self, VideoInitError> {
        let max_rate = config.maximum_frame_rate.max(1);
        let initial_rate = config.initial_frame_rate.clamp(1, max_rate);

        let shared = Arc::new(SharedState {
            queue: Mutex::new(FrameQueue::default()),
            queue_cond: Condvar::new(),
            stop: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            requested_frame_rate: AtomicU32::new(initial_rate),
            qp_bias: AtomicI32::new(0),
            lag: AtomicI32::new(0),
            decoder_queue_depth: AtomicI32::new(0),
        });

        let sink: SharedSink = Arc::new(Mutex::new(sink));

        let handler = AckForwarder {
            shared: Arc::clone(&shared),
            sink: Arc::clone(&sink),
        };
        let channel: GfxChannelHandle = Arc::new(Mutex::new(GfxVideoChannel::new(
            config.preferred_codec,
            config.avc444_available,
            Box::new(handler),
        )));

        let submitter = Submitter {
            shared: Arc::clone(&shared),
            channel: Arc::clone(&channel),
            sink: Arc::clone(&sink),
            pipeline: SubmitPipeline::new(),
            reported_drops: 0,
            last_drop_log: None,
        };

        let worker = std::thread::Builder::new()
            .name("boreal-video-submit".into())
            .spawn(move || submitter.run())
            .map_err(|error| {
                warn!(%error, "could not spawn the frame submission thread");
                VideoInitError::ContextOpenFailed
            })?;

        debug!("video stream initialized");

        Ok(Self {
            shared,
            channel,
            pairer: Mutex::new(PacketPairer::new(config.metadata_channel_available)),
            congestion: Mutex::new(CongestionController::new(initial_rate, max_rate)),
            sink,
            worker: Some(worker),
        })
    }

    /// DVC processor to register with the server's dynamic-channel layer.
    pub fn channel_bridge(&self) -> GfxChannelBridge {
        GfxChannelBridge::new(Arc::clone(&self.channel))
    }

    /// Shared handle to the underlying GFX channel.
    pub fn channel_handle(&self) -> &GfxChannelHandle {
        &self.channel
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }

    /// Gate frame intake; disabling clears the queue.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            let mut queue = self.shared.queue.lock().expect("frame queue mutex poisoned");
            queue.frames.clear();
        }
    }

    /// Current congestion-controlled target frame rate, for the capture
    /// pipeline to re-clock its encoder.
    pub fn requested_frame_rate(&self) -> u32 {
        self.shared.requested_frame_rate.load(Ordering::Relaxed)
    }

    pub fn queued_frames(&self) -> usize {
        self.shared
            .queue
            .lock()
            .expect("frame queue mutex poisoned")
            .frames
            .len()
    }

    /// Frame size assumed for packets whose metadata carries no size.
    pub fn set_session_size(&self, size: Size) {
        self.pairer
            .lock()
            .expect("packet pairer mutex poisoned")
            .set_session_size(size);
    }

    /// Latch a graphics reset; the next submitted frame re-issues
    /// Reset/Create/Map at that frame's size.
    pub fn reset(&self) {
        self.channel
            .lock()
            .expect("GfxVideoChannel mutex poisoned")
            .request_reset();
    }

    /// Deliver an encoded packet from the capture pipeline.
    pub fn on_packet(&self, packet: EncodedPacket) {
        let frames = self
            .pairer
            .lock()
            .expect("packet pairer mutex poisoned")
            .enqueue_packet(packet, Instant::now());
        for frame in frames {
            self.queue_frame(frame);
        }
    }

    /// Deliver a frame-metadata record from the capture pipeline.
    pub fn on_metadata(&self, metadata: FrameMetadata) {
        let frames = self
            .pairer
            .lock()
            .expect("packet pairer mutex poisoned")
            .enqueue_metadata(metadata, Instant::now());
        for frame in frames {
            self.queue_frame(frame);
        }
    }

    /// Queue a paired frame for submission.
    pub fn queue_frame(&self, frame: VideoFrame) {
        if !self.is_enabled() || self.shared.stop.load(Ordering::Relaxed) {
            return;
        }

        {
            let mut queue = self.shared.queue.lock().expect("frame queue mutex poisoned");
            push_bounded(&mut queue, frame);
        }
        self.shared.queue_cond.notify_one();
    }

    /// Feed an RTT observation into the congestion controller.
    pub fn on_rtt_update(&self, rtt: Duration) {
        let sample = CongestionSample {
            rtt,
            lag: self.shared.lag.load(Ordering::Relaxed),
            decoder_queue_depth: self.shared.decoder_queue_depth.load(Ordering::Relaxed),
        };

        let decision = self
            .congestion
            .lock()
            .expect("congestion controller mutex poisoned")
            .on_rtt_sample(sample, Instant::now());

        self.shared
            .requested_frame_rate
            .store(decision.frame_rate, Ordering::Relaxed);
        self.shared.qp_bias.store(decision.qp_bias, Ordering::Relaxed);
    }

    /// Stop the submission thread, join it, and notify the sink. In-flight
    /// unacknowledged frames are abandoned.
    pub fn close(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.queue_cond.notify_all();
        if let Some(worker) = self.worker.take() {
            if let Err(error) = worker.join() {
                warn!(?error, "submission thread panicked");
            } else {
                debug!("video stream closed");
            }
            self.sink
                .lock()
                .expect("stream sink mutex poisoned")
                .channel_closed();
        }
    }
}

impl Drop for VideoStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::geometry::{Rect, Region};

    fn frame_with_damage(size: Size, damage: Region, is_key_frame: bool) -> VideoFrame {
        VideoFrame {
            data: Bytes::from_static(&[1, 2, 3]),
            is_key_frame,
            size,
            damage,
            pts: None,
        }
    }

    fn tiny_frame() -> VideoFrame {
        frame_with_damage(
            Size::new(1920, 1080),
            Region::from_rect(Rect::new(0, 0, 32, 32)),
            false,
        )
    }

    fn large_frame() -> VideoFrame {
        frame_with_damage(
            Size::new(1920, 1080),
            Region::from_rect(Rect::new(0, 0, 1920, 400)),
            false,
        )
    }

    #[test]
    fn queue_is_bounded_and_drops_oldest() {
        let mut queue = FrameQueue::default();
        for _ in 0..(MAX_QUEUED_FRAMES + 5) {
            push_bounded(&mut queue, tiny_frame());
        }
        assert_eq!(queue.frames.len(), MAX_QUEUED_FRAMES);
        assert_eq!(queue.dropped, 5);
    }

    #[test]
    fn small_damage_keeps_partial_region() {
        let mut pipeline = SubmitPipeline::new();
        let now = Instant::now();

        let plan = pipeline.plan_frame(&tiny_frame(), 0, 0, now).unwrap();
        assert_eq!(plan.region.len(), 1);
        assert_eq!(
            plan.region[0],
            Rect16 {
                left: 0,
                top: 0,
                right: 32,
                bottom: 32,
            }
        );
        assert!(!plan.is_refinement);
        // Small, fresh, static: lowest QP tier at full quality.
        assert_eq!(plan.qualities[0], RectQuality { qp: 18, quality: 100 });
    }

    #[test]
    fn key_frames_force_full_damage() {
        let mut pipeline = SubmitPipeline::new();
        let now = Instant::now();

        let frame = frame_with_damage(
            Size::new(1920, 1080),
            Region::from_rect(Rect::new(0, 0, 16, 16)),
            true,
        );
        let plan = pipeline.plan_frame(&frame, 0, 0, now).unwrap();
        assert_eq!(plan.region, vec![Rect16::full(1920, 1080)]);
        assert_eq!(plan.qualities[0], RectQuality { qp: 22, quality: 100 });
    }

    #[test]
    fn high_coverage_forces_full_damage() {
        let mut pipeline = SubmitPipeline::new();
        let plan = pipeline.plan_frame(&large_frame(), 0, 0, Instant::now()).unwrap();
        assert_eq!(plan.region, vec![Rect16::full(1920, 1080)]);
        // The pre-override damage is preserved for activity marking.
        assert_eq!(plan.original.len(), 1);
        assert_eq!(plan.original[0].bottom, 400);
    }

    #[test]
    fn lag_forces_full_damage() {
        let mut pipeline = SubmitPipeline::new();
        let plan = pipeline.plan_frame(&tiny_frame(), 1, 0, Instant::now()).unwrap();
        assert_eq!(plan.region, vec![Rect16::full(1920, 1080)]);
    }

    #[test]
    fn full_damage_is_forced_periodically() {
        let mut pipeline = SubmitPipeline::new();
        let now = Instant::now();

        // Partial frames run down the budget...
        for i in 0..FULL_DAMAGE_FRAME_BUDGET {
            let plan = pipeline.plan_frame(&tiny_frame(), 0, 0, now).unwrap();
            assert_eq!(plan.region.len(), 1, "frame {i} should stay partial");
            assert_ne!(plan.region[0], Rect16::full(1920, 1080));
            pipeline.finish_frame(&plan);
        }

        // ...then the ninth goes full-frame and resets the counter.
        let plan = pipeline.plan_frame(&tiny_frame(), 0, 0, now).unwrap();
        assert_eq!(plan.region, vec![Rect16::full(1920, 1080)]);
        pipeline.finish_frame(&plan);

        let plan = pipeline.plan_frame(&tiny_frame(), 0, 0, now).unwrap();
        assert_ne!(plan.region[0], Rect16::full(1920, 1080));
    }

    #[test]
    fn refinement_fires_after_motion_settles() {
        let mut pipeline = SubmitPipeline::new();
        let mut now = Instant::now();
        let step = Duration::from_millis(16);

        // Sustained motion.
        for _ in 0..20 {
            let plan = pipeline.plan_frame(&large_frame(), 0, 0, now).unwrap();
            assert!(!plan.is_refinement);
            pipeline.finish_frame(&plan);
            now += step;
        }

        // Motion settles: stable frames accumulate.
        for _ in 0..STABLE_FRAMES_FOR_REFINEMENT {
            let plan = pipeline.plan_frame(&tiny_frame(), 0, 0, now).unwrap();
            assert!(!plan.is_refinement);
            pipeline.finish_frame(&plan);
            now += step;
        }

        // The next frame upgrades the whole surface at low QP.
        let plan = pipeline.plan_frame(&tiny_frame(), 0, 0, now).unwrap();
        assert!(plan.is_refinement);
        assert_eq!(plan.region, vec![Rect16::full(1920, 1080)]);
        assert_eq!(plan.qualities[0], RectQuality { qp: 16, quality: 100 });
        pipeline.finish_frame(&plan);
        now += step;

        // Follow-up frames revert to ordinary partial updates.
        let plan = pipeline.plan_frame(&tiny_frame(), 0, 0, now).unwrap();
        assert!(!plan.is_refinement);
        assert_ne!(plan.qualities[0], RectQuality { qp: 16, quality: 100 });
    }

    #[test]
    fn refinement_respects_cooldown_and_stability() {
        let mut pipeline = SubmitPipeline::new();
        let mut now = Instant::now();
        let step = Duration::from_millis(16);

        let mut refine = |pipeline: &mut SubmitPipeline, now: &mut Instant| {
            // Motion, then settle until a refinement frame appears; returns
            // how many stable frames passed in between.
            for _ in 0..4 {
                let plan = pipeline.plan_frame(&large_frame(), 0, 0, *now).unwrap();
                pipeline.finish_frame(&plan);
                *now += step;
            }
            let mut stable = 0;
            loop {
                let plan = pipeline.plan_frame(&tiny_frame(), 0, 0, *now).unwrap();
                pipeline.finish_frame(&plan);
                *now += step;
                if plan.is_refinement {
                    return stable;
                }
                stable += 1;
                assert!(stable < 100, "refinement never fired");
            }
        };

        let stable = refine(&mut pipeline, &mut now);
        let first_at = now;
        assert!(stable >= STABLE_FRAMES_FOR_REFINEMENT);

        // The second refinement needs both fresh stability and the cooldown.
        let stable = refine(&mut pipeline, &mut now);
        assert!(stable >= STABLE_FRAMES_FOR_REFINEMENT);
        assert!(now.duration_since(first_at) >= REFINEMENT_COOLDOWN - step);
    }

    #[test]
    fn lag_prevents_refinement() {
        let mut pipeline = SubmitPipeline::new();
        let mut now = Instant::now();
        let step = Duration::from_millis(16);

        for _ in 0..4 {
            let plan = pipeline.plan_frame(&large_frame(), 0, 0, now).unwrap();
            pipeline.finish_frame(&plan);
            now += step;
        }
        for _ in 0..8 {
            // Stable coverage but the client is behind; no refinement, and
            // lag >= 1 forces full frames anyway.
            let plan = pipeline.plan_frame(&tiny_frame(), 1, 0, now).unwrap();
            assert!(!plan.is_refinement);
            assert_eq!(plan.region, vec![Rect16::full(1920, 1080)]);
            pipeline.finish_frame(&plan);
            now += step;
        }
    }

    #[test]
    fn empty_frame_size_is_skipped() {
        let mut pipeline = SubmitPipeline::new();
        let frame = frame_with_damage(Size::default(), Region::new(), false);
        assert!(pipeline.plan_frame(&frame, 0, 0, Instant::now()).is_none());
    }

    #[test]
    fn transient_tiles_cost_quality() {
        let mut pipeline = SubmitPipeline::new();
        let now = Instant::now();

        // Hammer the same tile; activity climbs past the transient threshold.
        let mut last_plan = None;
        for _ in 0..6 {
            let plan = pipeline.plan_frame(&tiny_frame(), 0, 0, now).unwrap();
            pipeline.finish_frame(&plan);
            last_plan = Some(plan);
        }

        let plan = last_plan.unwrap();
        if plan.region[0] == Rect16::full(1920, 1080) {
            return; // periodic full-damage override landed here
        }
        let q = plan.qualities[0];
        assert!(q.qp > 18, "repeated damage should raise QP, got {}", q.qp);
    }
}
