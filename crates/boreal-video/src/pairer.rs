use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::frame::{EncodedPacket, FrameMetadata, VideoFrame};
use crate::geometry::{Rect, Region, Size};

/// Oldest metadata records are discarded beyond this depth.
pub const MAX_PENDING_METADATA: usize = 128;

/// Packets queued deeper than this stop waiting for metadata.
pub const MAX_PENDING_PACKETS_WITHOUT_METADATA: usize = 8;

/// How long a packet may wait for its metadata record.
pub const METADATA_WAIT_BUDGET: Duration = Duration::from_millis(12);

const MISS_LOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct PendingPacket {
    packet: EncodedPacket,
    queued_at: Instant,
}

/// Joins encoded packets with side-channel frame metadata.
///
/// Packets and metadata arrive on separate callbacks in approximately FIFO
/// order; there is no shared ID, so pairing is positional. A packet waits at
/// most [`METADATA_WAIT_BUDGET`] for its record, after which it is released
/// with full-frame damage. Frames are always emitted in packet-arrival order
/// and every packet is released exactly once.
#[derive(Debug)]
pub struct PacketPairer {
    metadata: VecDeque<FrameMetadata>,
    packets: VecDeque<PendingPacket>,
    metadata_channel_available: bool,
    seen_metadata: bool,
    session_size: Size,
    last_miss_log: Option<Instant>,
}

impl PacketPairer {
    /// `metadata_channel_available` reflects whether the capture pipeline
    /// exposes a metadata signal at all; without one, packets are released
    /// immediately with full-frame damage.
    pub fn new(metadata_channel_available: bool) -> Self {
        Self {
            metadata: VecDeque::new(),
            packets: VecDeque::new(),
            metadata_channel_available,
            seen_metadata: false,
            session_size: Size::default(),
            last_miss_log: None,
        }
    }

    /// Frame size used when metadata carries no size of its own.
    pub fn set_session_size(&mut self, size: Size) {
        self.session_size = size;
    }

    pub fn pending_packets(&self) -> usize {
        self.packets.len()
    }

    pub fn pending_metadata(&self) -> usize {
        self.metadata.len()
    }

    /// Queue an encoded packet and return every frame that became ready.
    ///
    /// Zero-length packets are dropped silently.
    pub fn enqueue_packet(&mut self, packet: EncodedPacket, now: Instant) -> Vec<VideoFrame> {
        if packet.data.is_empty() {
            trace!("dropping empty encoded packet");
            return Vec::new();
        }

        self.packets.push_back(PendingPacket { packet, queued_at: now });
        self.drain(now)
    }

    /// Queue a metadata record and return every frame that became ready.
    pub fn enqueue_metadata(&mut self, metadata: FrameMetadata, now: Instant) -> Vec<VideoFrame> {
        self.metadata.push_back(metadata);
        while self.metadata.len() > MAX_PENDING_METADATA {
            self.metadata.pop_front();
        }
        self.seen_metadata = true;
        self.drain(now)
    }

    /// Re-evaluate wait budgets without new input, e.g. from a timer tick.
    pub fn poll(&mut self, now: Instant) -> Vec<VideoFrame> {
        self.drain(now)
    }

    fn drain(&mut self, now: Instant) -> Vec<VideoFrame> {
        let mut frames = Vec::new();

        loop {
            let (head_is_key_frame, head_queued_at) = match self.packets.front() {
                Some(pending) => (pending.packet.is_key_frame, pending.queued_at),
                None => break,
            };

            if !self.metadata.is_empty() {
                let metadata = self.metadata.pop_front();
                let Some(pending) = self.packets.pop_front() else { break };
                frames.push(self.emit(pending.packet, metadata));
                continue;
            }

            // Key frames are full-damage anyway; holding them back buys
            // nothing. The same goes when no metadata can ever arrive.
            let bypass_wait = !self.metadata_channel_available || !self.seen_metadata || head_is_key_frame;
            let waited_too_long = now.duration_since(head_queued_at) >= METADATA_WAIT_BUDGET;
            let queue_too_deep = self.packets.len() > MAX_PENDING_PACKETS_WITHOUT_METADATA;

            if bypass_wait || waited_too_long || queue_too_deep {
                if !bypass_wait {
                    self.log_metadata_miss(now);
                }
                let Some(pending) = self.packets.pop_front() else { break };
                frames.push(self.emit(pending.packet, None));
                continue;
            }

            // Leave the packet queued briefly so late metadata can still pair.
            break;
        }

        frames
    }

    fn emit(&self, packet: EncodedPacket, metadata: Option<FrameMetadata>) -> VideoFrame {
        let metadata_applied = metadata.is_some();

        let mut size = self.session_size;
        let mut pts = None;
        let mut damage: Option<Region> = None;

        if let Some(metadata) = metadata {
            if let Some(meta_size) = metadata.size {
                if !meta_size.is_empty() {
                    size = meta_size;
                }
            }
            pts = metadata.pts;
            if let Some(region) = metadata.damage {
                damage = Some(region.intersected(Rect::from_size(size)));
            }
        }

        let damage = match damage {
            Some(clipped) if metadata_applied && !packet.is_key_frame && !clipped.is_empty() => clipped,
            _ => Region::from_rect(Rect::from_size(size)),
        };

        VideoFrame {
            data: packet.data,
            is_key_frame: packet.is_key_frame,
            size,
            damage,
            pts,
        }
    }

    fn log_metadata_miss(&mut self, now: Instant) {
        let due = self
            .last_miss_log
            .map_or(true, |last| now.duration_since(last) >= MISS_LOG_INTERVAL);
        if due {
            debug!("no matching damage metadata for encoded packet, sending full-frame update");
            self.last_miss_log = Some(now);
        }
    }
}
