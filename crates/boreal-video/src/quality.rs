use boreal_egfx::{Rect16, RectQuality};

use crate::activity::{STATIC_ACTIVITY_MAX, TRANSIENT_ACTIVITY_MIN, VERY_TRANSIENT_ACTIVITY_MIN};
use crate::geometry::Size;

pub const MIN_QP: i32 = 10;
pub const MAX_QP: i32 = 40;
pub const MIN_QUALITY: i32 = 70;
pub const MAX_QUALITY: i32 = 100;

/// Coverage at or below this counts as a tiny update (cursor blinks, carets).
const TINY_COVERAGE: f64 = 0.03;

/// Coverage at or below this counts as a localized update.
const LOW_COVERAGE: f64 = 0.20;

/// Frame-level inputs shared by every rectangle of one submission.
#[derive(Debug, Clone, Copy)]
pub struct QualityContext {
    pub frame: Size,
    pub is_key_frame: bool,
    pub is_refinement: bool,
    /// Congestion controller output; halved for tiny rectangles.
    pub qp_bias: i32,
}

/// Map one region rectangle to its quantization parameter and quality value.
///
/// Smaller coverage earns lower QP (the bytes are cheap and the content is
/// usually text or UI chrome); static tiles get a further bump, transient
/// tiles give quality back. The congestion bias shifts everything towards
/// cheaper encodes under pressure. Results stay in `qp in [10, 40]`,
/// `quality in [70, 100]`.
pub fn rect_quality(ctx: &QualityContext, rect: &Rect16, activity: u32) -> RectQuality {
    if ctx.is_key_frame || ctx.frame.is_empty() {
        return RectQuality { qp: 22, quality: 100 };
    }

    if ctx.is_refinement {
        return RectQuality { qp: 16, quality: 100 };
    }

    let frame_area = u64::from(ctx.frame.width) * u64::from(ctx.frame.height);
    let coverage = rect.area() as f64 / frame_area as f64;

    let (mut qp, mut quality): (i32, i32) = if coverage <= TINY_COVERAGE {
        (18, 100)
    } else if coverage <= LOW_COVERAGE {
        (21, 92)
    } else {
        (22, 90)
    };

    if activity <= STATIC_ACTIVITY_MAX && coverage > TINY_COVERAGE && coverage <= LOW_COVERAGE {
        qp -= 3;
        quality += 8;
    }
    if activity >= TRANSIENT_ACTIVITY_MIN {
        qp += 3;
        quality -= 8;
        if activity >= VERY_TRANSIENT_ACTIVITY_MIN {
            qp += 2;
            quality -= 6;
        }
    }

    let effective_bias = if coverage <= TINY_COVERAGE {
        ctx.qp_bias / 2
    } else {
        ctx.qp_bias
    };
    qp += effective_bias;
    quality -= 2 * effective_bias;

    RectQuality {
        qp: qp.clamp(MIN_QP, MAX_QP) as u8,
        quality: quality.clamp(MIN_QUALITY, MAX_QUALITY) as u8,
    }
}
