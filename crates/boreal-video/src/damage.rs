use boreal_egfx::Rect16;

use crate::frame::VideoFrame;
use crate::geometry::Rect;

/// Above this many raw damage rectangles the frame degrades to full damage.
pub const MAX_DAMAGE_RECT_COUNT: usize = 128;

/// Coalescing target; merging stops once the list fits.
pub const MAX_COALESCED_DAMAGE_RECTS: usize = 64;

const MAX_RDP_COORDINATE: i32 = u16::MAX as i32;

/// Translate a frame's damage into RDP region rectangles.
///
/// Key frames and frames without usable damage map to a single full-frame
/// rectangle; oversized rectangle lists are coalesced and, failing that,
/// collapsed to full damage. An empty frame size yields an empty list and the
/// frame is not submitted.
pub fn damage_rects(frame: &VideoFrame) -> Vec<Rect16> {
    if frame.size.is_empty() {
        return Vec::new();
    }

    let bounds = Rect::from_size(frame.size);
    let full = to_rdp_rect(&bounds);

    if frame.is_key_frame || frame.damage.is_empty() {
        return vec![full];
    }

    let clipped = frame.damage.intersected(bounds);
    let mut rects: Vec<Rect> = clipped.rects().to_vec();
    if rects.is_empty() || rects.len() > MAX_DAMAGE_RECT_COUNT {
        return vec![full];
    }

    coalesce(&mut rects);
    if rects.len() > MAX_DAMAGE_RECT_COUNT {
        return vec![full];
    }

    let mut out = Vec::with_capacity(rects.len());
    for rect in &rects {
        let bounded = rect.intersected(&bounds);
        if bounded.is_empty() {
            continue;
        }
        out.push(to_rdp_rect(&bounded));
    }

    if out.is_empty() {
        return vec![full];
    }
    out
}

/// Greedy pairwise union: merge two rectangles whenever the merged area does
/// not exceed 1.5x the sum of their areas, restarting the scan after each
/// merge. The factor bounds over-send while collapsing noisy UI updates.
fn coalesce(rects: &mut Vec<Rect>) {
    let mut merged = true;
    while merged && rects.len() > MAX_COALESCED_DAMAGE_RECTS {
        merged = false;
        'scan: for i in 0..rects.len() - 1 {
            for j in i + 1..rects.len() {
                let joined = rects[i].united(&rects[j]);
                if joined.area() * 2 <= (rects[i].area() + rects[j].area()) * 3 {
                    rects[i] = joined;
                    rects.remove(j);
                    merged = true;
                    break 'scan;
                }
            }
        }
    }
}

/// Clamp a rectangle into the 16-bit RDP coordinate space.
///
/// Degenerate spans are widened by one pixel, nudging away from the
/// coordinate ceiling when needed, so the emitted rectangle always satisfies
/// `left < right` and `top < bottom`.
pub fn to_rdp_rect(rect: &Rect) -> Rect16 {
    let mut left = rect.x.clamp(0, MAX_RDP_COORDINATE) as u16;
    let mut top = rect.y.clamp(0, MAX_RDP_COORDINATE) as u16;
    let mut right = rect.right().clamp(0, MAX_RDP_COORDINATE) as u16;
    let mut bottom = rect.bottom().clamp(0, MAX_RDP_COORDINATE) as u16;

    if right <= left {
        if left == u16::MAX {
            left -= 1;
        }
        right = left + 1;
    }
    if bottom <= top {
        if top == u16::MAX {
            top -= 1;
        }
        bottom = top + 1;
    }

    Rect16 {
        left,
        top,
        right,
        bottom,
    }
}
