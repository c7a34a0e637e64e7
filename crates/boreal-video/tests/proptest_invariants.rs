//! Property tests for the pipeline invariants: emitted rectangles stay
//! inside the frame and wire-valid, pairing preserves packet order, and the
//! quality/congestion outputs stay within their clamps.

use std::time::{Duration, Instant};

use boreal_video::egfx::Rect16;
use boreal_video::{
    damage_rects, rect_quality, CongestionController, CongestionSample, EncodedPacket, FrameMetadata, PacketPairer,
    QualityContext, Rect, Region, Size, VideoFrame, MAX_DAMAGE_RECT_COUNT,
};
use bytes::Bytes;
use proptest::prelude::*;

fn arb_rect() -> impl Strategy<Value = Rect> {
    (-200..5000i32, -200..5000i32, -200..600i32, -200..600i32).prop_map(|(x, y, width, height)| Rect {
        x,
        y,
        width,
        height,
    })
}

proptest! {
    #[test]
    fn damage_rects_stay_inside_the_frame(
        width in 1u32..4096,
        height in 1u32..4096,
        rects in prop::collection::vec(arb_rect(), 0..160),
        is_key_frame in any::<bool>(),
    ) {
        let frame = VideoFrame {
            data: Bytes::from_static(&[0]),
            is_key_frame,
            size: Size::new(width, height),
            damage: Region::from_rects(rects),
            pts: None,
        };

        let out = damage_rects(&frame);

        prop_assert!(!out.is_empty());
        prop_assert!(out.len() <= MAX_DAMAGE_RECT_COUNT);
        if is_key_frame {
            prop_assert_eq!(out.len(), 1);
        }
        for rect in &out {
            prop_assert!(rect.left < rect.right);
            prop_assert!(rect.top < rect.bottom);
            prop_assert!(u32::from(rect.right) <= width);
            prop_assert!(u32::from(rect.bottom) <= height);
        }
    }

    #[test]
    fn pairer_preserves_packet_order(ops in prop::collection::vec(any::<bool>(), 1..64)) {
        let mut pairer = PacketPairer::new(true);
        pairer.set_session_size(Size::new(640, 480));
        let now = Instant::now();

        let mut emitted = Vec::new();
        let mut tag = 0u8;
        for is_packet in ops {
            if is_packet {
                let packet = EncodedPacket { data: Bytes::from(vec![tag]), is_key_frame: false };
                emitted.extend(pairer.enqueue_packet(packet, now));
                tag += 1;
            } else {
                emitted.extend(pairer.enqueue_metadata(FrameMetadata::default(), now));
            }
        }
        // Flush anything still waiting out its metadata budget.
        emitted.extend(pairer.poll(now + Duration::from_millis(50)));

        let tags: Vec<u8> = emitted.iter().map(|frame| frame.data[0]).collect();
        let expected: Vec<u8> = (0..tag).collect();
        prop_assert_eq!(tags, expected);
        prop_assert_eq!(pairer.pending_packets(), 0);
    }

    #[test]
    fn frame_damage_is_always_inside_its_size(
        width in 1u32..4096,
        height in 1u32..4096,
        meta_rects in prop::collection::vec(arb_rect(), 0..16),
        has_meta_size in any::<bool>(),
        is_key_frame in any::<bool>(),
    ) {
        let mut pairer = PacketPairer::new(true);
        pairer.set_session_size(Size::new(1920, 1080));
        let now = Instant::now();

        pairer.enqueue_metadata(FrameMetadata {
            size: has_meta_size.then_some(Size::new(width, height)),
            damage: Some(Region::from_rects(meta_rects)),
            pts: None,
        }, now);
        let frames = pairer.enqueue_packet(
            EncodedPacket { data: Bytes::from_static(&[1]), is_key_frame },
            now,
        );

        prop_assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        prop_assert!(!frame.damage.is_empty());
        if frame.is_key_frame {
            prop_assert_eq!(frame.damage.rects(), &[Rect::from_size(frame.size)]);
        }
        let bounds = Rect::from_size(frame.size);
        for rect in frame.damage.rects() {
            prop_assert_eq!(&rect.intersected(&bounds), rect);
        }
    }

    #[test]
    fn quality_outputs_stay_clamped(
        left in 0u16..2000,
        top in 0u16..2000,
        width in 1u16..4000,
        height in 1u16..4000,
        activity in 0u32..=255,
        qp_bias in 0i32..=8,
        is_key_frame in any::<bool>(),
        is_refinement in any::<bool>(),
    ) {
        let rect = Rect16 {
            left,
            top,
            right: left + width,
            bottom: top + height,
        };
        let ctx = QualityContext {
            frame: Size::new(1920, 1080),
            is_key_frame,
            is_refinement,
            qp_bias,
        };

        let q = rect_quality(&ctx, &rect, activity);
        prop_assert!((10..=40).contains(&q.qp));
        prop_assert!((70..=100).contains(&q.quality));
    }

    #[test]
    fn congestion_outputs_stay_clamped(
        samples in prop::collection::vec((0u64..500, -4i32..40, -4i32..40), 1..40),
    ) {
        let mut ctrl = CongestionController::new(60, 120);
        let start = Instant::now();

        for (i, (rtt_ms, lag, queue_depth)) in samples.into_iter().enumerate() {
            let decision = ctrl.on_rtt_sample(
                CongestionSample {
                    rtt: Duration::from_millis(rtt_ms),
                    lag,
                    decoder_queue_depth: queue_depth,
                },
                start + Duration::from_millis(137 * i as u64),
            );
            prop_assert!((5..=120).contains(&decision.frame_rate));
            prop_assert!((0..=8).contains(&decision.qp_bias));
        }
    }
}
