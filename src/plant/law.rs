//! Water temperature law: maps the mixed outdoor temperature to the feed
//! water temperature a circuit should run at.
//!
//! The bilinear law takes the straight line through the two design points and
//! bends it at an inflexion placed 30% of the way from the 20°C-water outdoor
//! temperature back toward the cold design point. The non-linearity
//! coefficient nH100 raises the water temperature at that inflexion, which
//! matches the emission curve of radiators better than a straight line.

use crate::measure::Temp;

/// Segment endpoints are precomputed at construction (float math at the
/// config boundary); the per-tick evaluation is pure integer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BilinearLaw {
    tout1: Temp,
    twater1: Temp,
    tout2: Temp,
    twater2: Temp,
    toutinfl: Temp,
    twaterinfl: Temp,
}

impl BilinearLaw {
    /// `(tout1, twater1)` is the cold design point (outdoor low, water high),
    /// `(tout2, twater2)` the warm one. `nh100` in [100, 150].
    pub fn new(tout1: Temp, twater1: Temp, tout2: Temp, twater2: Temp, nh100: i32) -> BilinearLaw {
        let nh100 = nh100.clamp(100, 150);

        let (x1, y1) = (tout1.to_celsius(), twater1.to_celsius());
        let (x2, y2) = (tout2.to_celsius(), twater2.to_celsius());
        let slope = (y2 - y1) / (x2 - x1);
        let offset = y2 - x2 * slope;

        // Outdoor temperature at which the linear law outputs 20°C water.
        let toutw20c = (20.0 - offset) / slope;
        let toutinfl = toutw20c - (toutw20c - x1) * 0.30;
        let tlin = toutinfl * slope + offset;
        let twaterinfl = tlin + (tlin - 20.0) * (nh100 - 100) as f64 / 100.0;

        BilinearLaw {
            tout1,
            twater1,
            tout2,
            twater2,
            toutinfl: Temp::from_celsius(toutinfl),
            twaterinfl: Temp::from_celsius(twaterinfl),
        }
    }

    /// Evaluate for the given mixed outdoor temperature and ambient setpoint.
    pub fn compute(&self, t_out_mix: Temp, target_ambient: Temp) -> Temp {
        // Pick the segment the outdoor temperature falls in.
        let (diffnum, diffden) = if t_out_mix < self.toutinfl {
            (
                (self.twaterinfl - self.twater1).as_mk() as i64,
                (self.toutinfl - self.tout1).as_mk() as i64,
            )
        } else {
            (
                (self.twater2 - self.twaterinfl).as_mk() as i64,
                (self.tout2 - self.toutinfl).as_mk() as i64,
            )
        };

        let out_mk = (t_out_mix - self.toutinfl).as_mk() as i64 * diffnum / diffden
            + self.twaterinfl.as_mk() as i64;

        // Ambient setpoints other than 20°C shift the output by
        // (target - 20°C) * (1 - slope), with the overall (negative) slope.
        let slopenum = (self.twater2 - self.twater1).as_mk() as i64;
        let slopeden = (self.tout2 - self.tout1).as_mk() as i64;
        let ambient_mk = (target_ambient - Temp::from_celsius(20.0)).as_mk() as i64;
        let shift_mk = ambient_mk * (slopeden - slopenum) / slopeden;

        Temp::from_mk((out_mk + shift_mk) as i32)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn c(celsius: f64) -> Temp {
        Temp::from_celsius(celsius)
    }

    fn assert_close(value: Temp, expected: f64, tolerance: f64) {
        let got = value.to_celsius();
        assert_sane_float(got);
        assert!(
            (got - expected).abs() <= tolerance,
            "expected ~{}, got {}",
            expected,
            got
        );
    }

    fn assert_sane_float<T>(value: T)
    where
        T: num_traits::Float + std::fmt::Display,
    {
        if !value.is_zero() && !value.is_normal() {
            panic!("Abnormal number {}", value);
        }
    }

    fn reference_law() -> BilinearLaw {
        BilinearLaw::new(c(-10.0), c(65.0), c(15.0), c(25.0), 110)
    }

    #[test]
    fn test_design_points_hit() {
        let law = reference_law();
        assert_close(law.compute(c(-10.0), c(20.0)), 65.0, 0.05);
        assert_close(law.compute(c(15.0), c(20.0)), 25.0, 0.05);
    }

    #[test]
    fn test_nh100_raises_above_linear() {
        let linear = BilinearLaw::new(c(-10.0), c(65.0), c(15.0), c(25.0), 100);
        let bent = reference_law();
        // Linear law at -5: 65 - 1.6 * 5 = 57.
        assert_close(linear.compute(c(-5.0), c(20.0)), 57.0, 0.05);
        let raised = bent.compute(c(-5.0), c(20.0));
        assert!(raised > linear.compute(c(-5.0), c(20.0)));
        // Inflexion raise for these points puts -5°C outdoor at ~57.3.
        assert_close(raised, 57.34, 0.1);
    }

    #[test]
    fn test_monotonically_falls_with_outdoor() {
        let law = reference_law();
        let mut previous = law.compute(c(-15.0), c(20.0));
        for step in 1..30 {
            let t_out = -15.0 + step as f64;
            let water = law.compute(c(t_out), c(20.0));
            assert!(
                water <= previous,
                "water must not rise with outdoor temp ({} at {})",
                water,
                t_out
            );
            previous = water;
        }
    }

    #[test]
    fn test_ambient_setpoint_shifts_output() {
        let law = reference_law();
        let at20 = law.compute(c(0.0), c(20.0));
        let at22 = law.compute(c(0.0), c(22.0));
        let at18 = law.compute(c(0.0), c(18.0));
        // Slope is -1.6, so each ambient kelvin moves water by 2.6K.
        assert_close(at22, at20.to_celsius() + 5.2, 0.05);
        assert_close(at18, at20.to_celsius() - 5.2, 0.05);
    }

    #[test]
    fn test_nh100_clamped_to_range() {
        let over = BilinearLaw::new(c(-10.0), c(65.0), c(15.0), c(25.0), 400);
        let max = BilinearLaw::new(c(-10.0), c(65.0), c(15.0), c(25.0), 150);
        assert_eq!(over, max);
    }
}
