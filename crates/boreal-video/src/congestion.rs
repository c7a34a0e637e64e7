use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::trace;

pub const MIN_FRAME_RATE: u32 = 5;
pub const MAX_FRAME_RATE: u32 = 120;
pub const MAX_QP_BIAS: i32 = 8;

/// Sliding window over which frame-rate estimates are averaged.
const ESTIMATE_WINDOW: Duration = Duration::from_secs(1);

/// Uncongested slow-down is limited to this many fps per tick.
const RATE_STEP_DOWN: u32 = 5;

/// Recovery is limited to this many fps per tick.
const RATE_STEP_UP: u32 = 2;

#[derive(Debug, Clone, Copy)]
struct RateEstimate {
    at: Instant,
    estimate: f64,
}

/// One observation, taken on each RTT-change callback.
#[derive(Debug, Clone, Copy)]
pub struct CongestionSample {
    pub rtt: Duration,
    /// `encoded - totalFramesDecoded` from the last frame ack.
    pub lag: i32,
    /// Client decoder queue depth from the last frame ack.
    pub decoder_queue_depth: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionDecision {
    pub frame_rate: u32,
    pub qp_bias: i32,
}

/// Closed-loop frame-rate and QP-bias governor.
///
/// Each RTT sample is turned into an instantaneous frame-rate estimate,
/// penalized by ACK-derived lag, decoder queue depth and RTT rise. The
/// averaged estimate, further capped under acute congestion, becomes the
/// target: the rate snaps down on congestion signals but recovers slowly,
/// and the QP bias rises immediately while decaying one step per tick.
#[derive(Debug)]
pub struct CongestionController {
    estimates: VecDeque<RateEstimate>,
    prev_rtt_ms: Option<u64>,
    frame_rate: u32,
    qp_bias: i32,
    max_frame_rate: u32,
}

impl CongestionController {
    pub fn new(initial_frame_rate: u32, max_frame_rate: u32) -> Self {
        let max_frame_rate = max_frame_rate.clamp(MIN_FRAME_RATE, MAX_FRAME_RATE);
        Self {
            estimates: VecDeque::new(),
            prev_rtt_ms: None,
            frame_rate: initial_frame_rate.clamp(MIN_FRAME_RATE, max_frame_rate),
            qp_bias: 0,
            max_frame_rate,
        }
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn qp_bias(&self) -> i32 {
        self.qp_bias
    }

    pub fn on_rtt_sample(&mut self, sample: CongestionSample, now: Instant) -> CongestionDecision {
        let rtt_ms = u64::try_from(sample.rtt.as_millis()).unwrap_or(u64::MAX).max(1);
        let lag = sample.lag.max(0);
        let queue_depth = sample.decoder_queue_depth.max(0);
        let rtt_rise = self.prev_rtt_ms.map_or(0, |prev| rtt_ms.saturating_sub(prev));
        self.prev_rtt_ms = Some(rtt_ms);

        let baseline = 1000.0 / rtt_ms as f64;
        let delay_penalty = 1.0 + 0.75 * f64::from(lag);
        let queue_penalty = 1.0 + 0.25 * f64::from(queue_depth.min(12));
        let rtt_trend_penalty = 1.0 + rtt_rise.min(20) as f64 / 20.0;
        let estimate = (baseline / (delay_penalty * queue_penalty * rtt_trend_penalty))
            .clamp(f64::from(MIN_FRAME_RATE), f64::from(MAX_FRAME_RATE));

        self.estimates.push_back(RateEstimate { at: now, estimate });
        while let Some(front) = self.estimates.front() {
            if now.duration_since(front.at) > ESTIMATE_WINDOW {
                self.estimates.pop_front();
            } else {
                break;
            }
        }

        let mean = self.estimates.iter().map(|e| e.estimate).sum::<f64>() / self.estimates.len() as f64;
        let mut target = (0.8 * mean).clamp(f64::from(MIN_FRAME_RATE), f64::from(MAX_FRAME_RATE)) as u32;
        target = target
            .min(Self::hard_cap(lag, queue_depth, rtt_rise))
            .clamp(MIN_FRAME_RATE, self.max_frame_rate);

        let acute = lag >= 2 || queue_depth >= 3 || rtt_rise >= 8;
        if target < self.frame_rate {
            self.frame_rate = if acute {
                target
            } else {
                self.frame_rate.saturating_sub(RATE_STEP_DOWN).max(target)
            };
        } else if target > self.frame_rate {
            self.frame_rate = (self.frame_rate + RATE_STEP_UP).min(target);
        }

        let bias_target = if lag >= 6 || queue_depth >= 8 || rtt_rise >= 12 {
            8
        } else if lag >= 3 || queue_depth >= 5 || rtt_rise >= 8 {
            5
        } else if lag >= 1 || queue_depth >= 2 || rtt_rise >= 4 {
            2
        } else {
            0
        };
        // Bias rises immediately, falls one step per tick.
        let next_bias = if bias_target > self.qp_bias {
            bias_target
        } else {
            (self.qp_bias - 1).max(bias_target)
        };
        self.qp_bias = next_bias.clamp(0, MAX_QP_BIAS);

        trace!(
            rtt_ms,
            lag,
            queue_depth,
            rtt_rise,
            frame_rate = self.frame_rate,
            qp_bias = self.qp_bias,
            "congestion update"
        );

        CongestionDecision {
            frame_rate: self.frame_rate,
            qp_bias: self.qp_bias,
        }
    }

    fn hard_cap(lag: i32, queue_depth: i32, rtt_rise: u64) -> u32 {
        let mut cap = MAX_FRAME_RATE;
        if lag >= 8 || queue_depth >= 10 {
            cap = cap.min(10);
        } else if lag >= 4 || queue_depth >= 6 {
            cap = cap.min(20);
        } else if lag >= 2 || queue_depth >= 3 {
            cap = cap.min(30);
        }
        if rtt_rise >= 12 {
            cap = cap.min(24);
        } else if rtt_rise >= 6 {
            cap = cap.min(36);
        }
        cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet(rtt_ms: u64) -> CongestionSample {
        CongestionSample {
            rtt: Duration::from_millis(rtt_ms),
            lag: 0,
            decoder_queue_depth: 0,
        }
    }

    #[test]
    fn fast_network_ramps_up_slowly() {
        let mut ctrl = CongestionController::new(30, 120);
        let start = Instant::now();

        let mut previous = 30;
        for i in 0..20u64 {
            let decision = ctrl.on_rtt_sample(quiet(5), start + Duration::from_millis(100 * i));
            assert!(decision.frame_rate >= previous);
            assert!(decision.frame_rate - previous <= 2);
            previous = decision.frame_rate;
        }
        assert!(previous > 30);
        assert_eq!(ctrl.qp_bias(), 0);
    }

    #[test]
    fn congestion_snaps_rate_down_and_bias_up() {
        let mut ctrl = CongestionController::new(60, 120);
        let start = Instant::now();

        // Benign sample establishes the RTT baseline.
        ctrl.on_rtt_sample(quiet(30), start);

        // RTT jumps 30 -> 80 ms with heavy lag and a deep decoder queue.
        let decision = ctrl.on_rtt_sample(
            CongestionSample {
                rtt: Duration::from_millis(80),
                lag: 5,
                decoder_queue_depth: 7,
            },
            start + Duration::from_millis(1100),
        );

        // lag >= 4 caps at 20; the snap takes effect within one tick.
        assert!(decision.frame_rate <= 20);
        assert_eq!(decision.qp_bias, 8);

        // Recovery tick: bias decays by one, the rate climbs by at most two.
        let recovered = ctrl.on_rtt_sample(quiet(80), start + Duration::from_millis(2200));
        assert_eq!(recovered.qp_bias, 7);
        assert!(recovered.frame_rate >= decision.frame_rate);
        assert!(recovered.frame_rate - decision.frame_rate <= 2);
    }

    #[test]
    fn rtt_rise_alone_caps_the_rate() {
        let mut ctrl = CongestionController::new(60, 120);
        let start = Instant::now();

        ctrl.on_rtt_sample(quiet(10), start);
        let decision = ctrl.on_rtt_sample(quiet(25), start + Duration::from_millis(1100));

        // rise = 15 >= 12 caps at 24 and counts as an acute signal.
        assert!(decision.frame_rate <= 24);
        assert_eq!(decision.qp_bias, 8);
    }

    #[test]
    fn moderate_rise_uses_the_soft_cap() {
        let mut ctrl = CongestionController::new(60, 120);
        let start = Instant::now();

        ctrl.on_rtt_sample(quiet(10), start);
        let decision = ctrl.on_rtt_sample(quiet(17), start + Duration::from_millis(1100));

        // rise = 7 caps at 36; not acute, so the rate steps down by <= 5.
        assert!(decision.frame_rate <= 60);
        assert!(decision.frame_rate >= 55 - 5);
        assert_eq!(decision.qp_bias, 2);
    }

    #[test]
    fn severe_lag_hits_the_floor_cap() {
        let mut ctrl = CongestionController::new(60, 120);
        let start = Instant::now();

        let decision = ctrl.on_rtt_sample(
            CongestionSample {
                rtt: Duration::from_millis(40),
                lag: 9,
                decoder_queue_depth: 0,
            },
            start,
        );
        assert!(decision.frame_rate <= 10);
        assert_eq!(decision.qp_bias, 8);
    }

    #[test]
    fn outputs_stay_clamped() {
        let mut ctrl = CongestionController::new(60, 120);
        let start = Instant::now();

        let extremes = [
            CongestionSample {
                rtt: Duration::from_millis(0),
                lag: -5,
                decoder_queue_depth: -3,
            },
            CongestionSample {
                rtt: Duration::from_secs(10),
                lag: 1000,
                decoder_queue_depth: 1000,
            },
            quiet(1),
        ];

        for (i, sample) in extremes.iter().cycle().take(30).enumerate() {
            let decision = ctrl.on_rtt_sample(*sample, start + Duration::from_millis(200 * i as u64));
            assert!((MIN_FRAME_RATE..=MAX_FRAME_RATE).contains(&decision.frame_rate));
            assert!((0..=MAX_QP_BIAS).contains(&decision.qp_bias));
        }
    }

    #[test]
    fn maximum_frame_rate_is_honored() {
        let mut ctrl = CongestionController::new(30, 48);
        let start = Instant::now();

        for i in 0..60u64 {
            let decision = ctrl.on_rtt_sample(quiet(5), start + Duration::from_millis(100 * i));
            assert!(decision.frame_rate <= 48);
        }
        assert_eq!(ctrl.frame_rate(), 48);
    }

    #[test]
    fn bias_decays_one_step_per_tick() {
        let mut ctrl = CongestionController::new(60, 120);
        let start = Instant::now();

        ctrl.on_rtt_sample(
            CongestionSample {
                rtt: Duration::from_millis(30),
                lag: 7,
                decoder_queue_depth: 9,
            },
            start,
        );
        assert_eq!(ctrl.qp_bias(), 8);

        for i in 1..=8u64 {
            let decision = ctrl.on_rtt_sample(quiet(30), start + Duration::from_millis(100 * i));
            assert_eq!(decision.qp_bias, 8 - i as i32);
        }
        assert_eq!(ctrl.qp_bias(), 0);
    }
}
