//! Small signal-conditioning blocks shared by the plant entities: exponential
//! moving averages for sensor smoothing, a clamped threshold integrator for
//! the boiler protections, a windowed derivative and the rate-of-rise limiter.

use super::{DeltaK, Temp, Ticks};
use std::collections::VecDeque;

/// `last + (new - last) * dt / (tau + dt)`, all integer millikelvin.
///
/// `tau` is the filter time constant in seconds, `dt` the time since the last
/// sample. Sentinels must be validated out before filtering.
pub fn ema(last: Temp, new: Temp, dt: u64, tau: u64) -> Temp {
    if dt == 0 {
        return last;
    }
    let delta = (new - last).as_mk() as i64;
    let filtered = last.as_mk() as i64 + delta * dt as i64 / (tau + dt) as i64;
    Temp::from_mk(filtered as i32)
}

/// Weighted form for repeated-sample decimation: the new sample counts as one
/// part in `weight`.
pub fn ema_weight(last: Temp, new: Temp, weight: u32) -> Temp {
    if weight <= 1 {
        return new;
    }
    let delta = (new - last).as_mk() as i64;
    Temp::from_mk((last.as_mk() as i64 + delta / weight as i64) as i32)
}

/// Integrates `(current - threshold) * dt` in mK·s, clamped between fixed
/// caps. With a negative lower cap and a zero upper cap this only remembers
/// time spent *below* the threshold, which is the boiler cold-start shape.
#[derive(Debug, Clone)]
pub struct ThresholdIntegral {
    integral: i64,
    last_time: Option<Ticks>,
    lower: i64,
    upper: i64,
}

impl ThresholdIntegral {
    pub fn new(lower_mks: i64, upper_mks: i64) -> Self {
        assert!(lower_mks <= upper_mks);
        ThresholdIntegral {
            integral: 0,
            last_time: None,
            lower: lower_mks,
            upper: upper_mks,
        }
    }

    pub fn update(&mut self, threshold: Temp, current: Temp, now: Ticks) -> i64 {
        if let Some(last) = self.last_time {
            let dt = now.since(last) as i64;
            let err = (current - threshold).as_mk() as i64;
            self.integral = (self.integral + err * dt).clamp(self.lower, self.upper);
        }
        self.last_time = Some(now);
        self.integral
    }

    pub fn value(&self) -> i64 {
        self.integral
    }

    pub fn reset(&mut self) {
        self.integral = 0;
        self.last_time = None;
    }
}

/// Two-point derivative over a sliding window. Samples older than the window
/// are discarded; the estimate spans the oldest retained sample to the newest.
#[derive(Debug, Clone)]
pub struct Derivative {
    window: u64,
    samples: VecDeque<(Ticks, Temp)>,
}

impl Derivative {
    pub fn new(window_secs: u64) -> Self {
        Derivative {
            window: window_secs.max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn update(&mut self, value: Temp, now: Ticks) {
        while let Some(&(t, _)) = self.samples.front() {
            if now.since(t) > self.window && self.samples.len() > 1 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back((now, value));
    }

    /// dT/dt expressed as ΔK per hour; `None` until the window spans time.
    pub fn per_hour(&self) -> Option<DeltaK> {
        let (t0, v0) = *self.samples.front()?;
        let (t1, v1) = *self.samples.back()?;
        let span = t1.since(t0);
        if span == 0 {
            return None;
        }
        let mk_per_hour = (v1 - v0).as_mk() as i64 * 3600 / span as i64;
        Some(DeltaK::from_mk(mk_per_hour as i32))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Limits the rate at which a rising target may climb, in ΔK per hour.
///
/// Downward moves always pass through immediately. Before the first limited
/// step the state follows the lowest observed value, so a plant starting with
/// cooling-down water settles before the ramp is armed. Once armed, a drop in
/// the observed value only re-bases the ramp when `rebase_on_drop` is set.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_per_hour: DeltaK,
    sample_period: u64,
    pub rebase_on_drop: bool,
    state: Option<RlState>,
}

#[derive(Debug, Clone)]
struct RlState {
    target: Temp,
    last_step: Ticks,
    armed: bool,
}

impl RateLimiter {
    pub fn new(max_per_hour: DeltaK, sample_period_secs: u64) -> Self {
        RateLimiter {
            max_per_hour,
            sample_period: sample_period_secs.max(1),
            rebase_on_drop: false,
            state: None,
        }
    }

    pub fn update(&mut self, requested: Temp, current: Temp, now: Ticks) -> Temp {
        let st = self.state.get_or_insert(RlState {
            target: current,
            last_step: now,
            armed: false,
        });

        if requested <= st.target {
            st.target = requested;
            st.last_step = now;
            return requested;
        }

        if current < st.target && (!st.armed || self.rebase_on_drop) {
            st.target = current;
        }

        let elapsed = now.since(st.last_step);
        if elapsed >= self.sample_period {
            let inc = self.max_per_hour.as_mk() as i64 * elapsed as i64 / 3600;
            let stepped = Temp::from_mk((st.target.as_mk() as i64 + inc) as i32);
            st.target = stepped.min(requested);
            st.last_step = now;
            st.armed = true;
        }
        st.target
    }

    pub fn reset(&mut self) {
        self.state = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn c(celsius: f64) -> Temp {
        Temp::from_celsius(celsius)
    }

    #[test]
    fn test_ema_converges() {
        let target = c(20.0);
        let mut filtered = c(0.0);
        // tau of 60s sampled every 10s: within ~10 tau we are essentially there.
        for _ in 0..60 {
            filtered = ema(filtered, target, 10, 60);
        }
        assert!((filtered.to_celsius() - 20.0).abs() < 0.5, "got {}", filtered);
    }

    #[test]
    fn test_ema_single_step() {
        // dt == tau moves halfway.
        let out = ema(c(10.0), c(20.0), 60, 60);
        assert_eq!(out, c(15.0));
        // dt == 0 holds.
        assert_eq!(ema(c(10.0), c(20.0), 0, 60), c(10.0));
    }

    #[test]
    fn test_ema_weight() {
        let out = ema_weight(c(10.0), c(20.0), 4);
        assert_eq!(out, c(12.5));
        assert_eq!(ema_weight(c(10.0), c(20.0), 1), c(20.0));
    }

    #[test]
    fn test_threshold_integral_clamps() {
        // Cold-start shape: only accumulate below threshold, never above zero.
        let mut intg = ThresholdIntegral::new(-100_000, 0);
        let thr = c(50.0);
        let t0 = Ticks::from_secs(0);
        intg.update(thr, c(40.0), t0);
        // 10K below threshold for 5s = -50000 mK·s.
        assert_eq!(intg.update(thr, c(40.0), t0.advanced(5)), -50_000);
        // Another 10s pins to the lower cap.
        assert_eq!(intg.update(thr, c(40.0), t0.advanced(15)), -100_000);
        // Recovery above threshold climbs back but stops at the upper cap.
        assert_eq!(intg.update(thr, c(70.0), t0.advanced(25)), 0);
        intg.reset();
        assert_eq!(intg.value(), 0);
    }

    #[test]
    fn test_derivative() {
        let mut d = Derivative::new(600);
        d.update(c(40.0), Ticks::from_secs(0));
        assert_eq!(d.per_hour(), None);
        d.update(c(41.0), Ticks::from_secs(600));
        // 1K over 10 minutes = 6K/h.
        assert_eq!(d.per_hour(), Some(DeltaK::from_kelvin(6.0)));
    }

    #[test]
    fn test_rate_limiter_caps_rise() {
        let mut rl = RateLimiter::new(DeltaK::from_kelvin(6.0), 60);
        let mut now = Ticks::ZERO;
        let current = c(30.0);
        let mut target = rl.update(c(60.0), current, now);
        // First tick: settle on current.
        assert_eq!(target, current);
        // One hour of 60s steps may rise at most 6K (one lsb of slack).
        for _ in 0..60 {
            now = now.advanced(60);
            target = rl.update(c(60.0), current, now);
        }
        assert!(
            (target.to_celsius() - 36.0).abs() < 0.01,
            "one hour at 6K/h from 30 should be ~36, got {}",
            target
        );
    }

    #[test]
    fn test_rate_limiter_passes_drops() {
        let mut rl = RateLimiter::new(DeltaK::from_kelvin(6.0), 60);
        let now = Ticks::ZERO;
        rl.update(c(60.0), c(50.0), now);
        // A lower request passes through unlimited.
        assert_eq!(rl.update(c(40.0), c(50.0), now.advanced(60)), c(40.0));
    }

    #[test]
    fn test_rate_limiter_settles_before_arming() {
        let mut rl = RateLimiter::new(DeltaK::from_kelvin(6.0), 60);
        let mut now = Ticks::ZERO;
        rl.update(c(60.0), c(45.0), now);
        // Water still cooling down: ramp base follows it.
        now = now.advanced(30);
        let t = rl.update(c(60.0), c(42.0), now);
        assert!(t <= c(42.0), "ramp should follow falling water, got {}", t);
    }

    #[test]
    fn test_rate_limiter_rebase_hook() {
        let mut rl = RateLimiter::new(DeltaK::from_kelvin(6.0), 60);
        let mut now = Ticks::ZERO;
        rl.update(c(60.0), c(40.0), now);
        for _ in 0..10 {
            now = now.advanced(60);
            rl.update(c(60.0), c(40.0), now);
        }
        let armed_target = rl.update(c(60.0), c(40.0), now);
        assert!(armed_target > c(40.0));

        // Default: a drop in observed water does not pull the ramp down.
        now = now.advanced(60);
        let held = rl.update(c(60.0), c(35.0), now);
        assert!(held >= armed_target);

        // With the hook enabled the ramp re-bases.
        rl.rebase_on_drop = true;
        now = now.advanced(60);
        let rebased = rl.update(c(60.0), c(30.0), now);
        assert!(rebased < armed_target);
    }
}
