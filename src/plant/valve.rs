//! Motorized 3-way mixing valve. Two coils (open, close) with a known full
//! travel time; position is only ever estimated by integrating commanded
//! motion, so the estimate is pinned whenever a commanded stop outlasts the
//! full travel.
//!
//! The control law picks a motion *duration* proportional to the temperature
//! error at the mixed outlet, trimmed by the mean error over the last few
//! samples to squeeze out steady-state bias.

use crate::error::ControlError;
use crate::hw::{Hardware, InputId, OutputId};
use crate::measure::{DeltaK, Temp, Ticks};
use crate::plant::{EntityState, TickCtx};
use log::{debug, info, trace, warn};
use std::collections::VecDeque;

/// Index into the plant's valve arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValveId(pub usize);

/// Position is tracked in thousandths of full open.
const FULL_OPEN: i32 = 1000;
/// Pause between energizing opposite coils.
const REVERSE_DEAD_TIME: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValveParams {
    /// Seconds from one end stop to the other.
    pub travel_time: u64,
    /// Motion course in thousandths of travel per kelvin of error.
    pub kp_permille_per_k: i32,
    /// Gain applied to the mean error of the sample window.
    pub ki_permille_per_k: i32,
    /// Number of samples in the bias window.
    pub integral_samples: usize,
    pub deadzone: DeltaK,
    /// Longest single adjustment, in thousandths of travel.
    pub max_step_permille: i32,
}

impl Default for ValveParams {
    fn default() -> Self {
        ValveParams {
            travel_time: 120,
            kp_permille_per_k: 100,
            ki_permille_per_k: 20,
            integral_samples: 10,
            deadzone: DeltaK::from_kelvin(0.5),
            max_step_permille: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Motion {
    Stopped,
    Opening { until: Ticks },
    Closing { until: Ticks },
}

#[derive(Debug)]
pub struct Valve {
    name: String,
    sensor: InputId,
    open_relay: OutputId,
    close_relay: OutputId,
    params: ValveParams,
    state: EntityState,

    target: Option<Temp>,
    position: i32,
    motion: Motion,
    /// Continuous drive time in the current direction, for recalibration.
    same_dir_secs: u64,
    dead_until: Option<Ticks>,
    last_run: Option<Ticks>,
    /// Forced full-travel motion (shutdown, failsafe): skip the control law.
    forced: bool,
    /// A full-travel close ran to completion; further close requests are
    /// satisfied with the coils released.
    closed_confirmed: bool,
    errors: VecDeque<DeltaK>,
}

impl Valve {
    pub fn new(
        name: String,
        sensor: InputId,
        open_relay: OutputId,
        close_relay: OutputId,
        params: ValveParams,
    ) -> Valve {
        Valve {
            name,
            sensor,
            open_relay,
            close_relay,
            params,
            state: EntityState::Configured,
            target: None,
            position: 0,
            motion: Motion::Stopped,
            same_dir_secs: 0,
            dead_until: None,
            last_run: None,
            forced: false,
            closed_confirmed: false,
            errors: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_online(&self) -> bool {
        self.state == EntityState::Online
    }

    pub fn online(&mut self, hw: &mut Hardware) -> Result<(), ControlError> {
        hw.reserve_output(self.open_relay, &self.name)?;
        hw.reserve_output(self.close_relay, &self.name)?;
        self.state = EntityState::Online;
        info!(target: "valve", "\"{}\" online, travel {}s", self.name, self.params.travel_time);
        Ok(())
    }

    /// Commanded mixed-outlet temperature for the next control passes.
    pub fn set_target(&mut self, target: Temp) {
        self.target = Some(target);
    }

    pub fn clear_target(&mut self) {
        self.target = None;
    }

    pub fn target(&self) -> Option<Temp> {
        self.target
    }

    /// Estimated position in thousandths of full open.
    pub fn position(&self) -> i32 {
        self.position
    }

    pub fn is_moving(&self) -> bool {
        !matches!(self.motion, Motion::Stopped)
    }

    /// Immediately de-energize both coils.
    pub fn reqstop(&mut self, hw: &Hardware) -> Result<(), ControlError> {
        self.motion = Motion::Stopped;
        self.forced = false;
        self.same_dir_secs = 0;
        self.apply_motion(hw)
    }

    /// Drive to the closed stop regardless of the position estimate. Runs a
    /// little past full travel so the stop is guaranteed.
    pub fn reqclose_full(&mut self, hw: &Hardware, now: Ticks) -> Result<(), ControlError> {
        // Already sitting on a confirmed closed stop: release the coils
        // instead of grinding the motor into the end again.
        if self.closed_confirmed && !self.is_moving() {
            self.forced = false;
            self.target = None;
            return self.apply_motion(hw);
        }
        if self.forced {
            // Already closing (or waiting out the dead time to start).
            return self.apply_motion(hw);
        }
        self.forced = true;
        self.target = None;
        debug!(target: "valve", "\"{}\" closing to the stop", self.name);
        if let Motion::Opening { .. } = self.motion {
            // Stop first; the closing leg starts after the dead time.
            self.motion = Motion::Stopped;
            self.same_dir_secs = 0;
            self.dead_until = Some(now.advanced(REVERSE_DEAD_TIME));
            return self.apply_motion(hw);
        }
        let overshoot = self.params.travel_time / 10;
        self.motion = Motion::Closing {
            until: now.advanced(self.params.travel_time + overshoot),
        };
        self.same_dir_secs = 0;
        self.apply_motion(hw)
    }

    /// Shutdown drives the valve closed: the safe state for a mixing valve
    /// is no hot feed into the circuit.
    pub fn shutdown(&mut self, hw: &Hardware, now: Ticks) -> Result<(), ControlError> {
        self.reqclose_full(hw, now)
    }

    pub fn offline(&mut self, hw: &mut Hardware) {
        if self.state == EntityState::Offline {
            return;
        }
        self.motion = Motion::Stopped;
        self.forced = false;
        let _ = self.apply_motion(hw);
        hw.release_output(self.open_relay);
        hw.release_output(self.close_relay);
        self.state = EntityState::Offline;
    }

    fn apply_motion(&self, hw: &Hardware) -> Result<(), ControlError> {
        // The enum makes energizing both coils unrepresentable.
        let (open, close) = match self.motion {
            Motion::Stopped => (false, false),
            Motion::Opening { .. } => (true, false),
            Motion::Closing { .. } => (false, true),
        };
        hw.output_request(self.open_relay, open)?;
        hw.output_request(self.close_relay, close)
    }

    /// Integrates the elapsed commanded motion into the position estimate and
    /// retires finished motions.
    fn advance_position(&mut self, now: Ticks) {
        let last = match self.last_run {
            Some(last) => last,
            None => return,
        };
        let full = self.params.travel_time.max(1);
        match self.motion {
            Motion::Stopped => {}
            Motion::Opening { until } => {
                let end = until.min(now);
                let driven = end.since(last);
                self.position += (driven as i64 * FULL_OPEN as i64 / full as i64) as i32;
                self.same_dir_secs += driven;
                if self.same_dir_secs >= full {
                    self.position = FULL_OPEN;
                }
                if now >= until {
                    self.motion = Motion::Stopped;
                }
            }
            Motion::Closing { until } => {
                let end = until.min(now);
                let driven = end.since(last);
                self.position -= (driven as i64 * FULL_OPEN as i64 / full as i64) as i32;
                self.same_dir_secs += driven;
                if self.same_dir_secs >= full {
                    self.position = 0;
                }
                if now >= until {
                    if self.same_dir_secs >= full {
                        self.closed_confirmed = true;
                    }
                    self.motion = Motion::Stopped;
                    self.forced = false;
                }
            }
        }
        self.position = self.position.clamp(0, FULL_OPEN);
    }

    /// One control pass. Returns the success-like `Deadzone` error when the
    /// mixed temperature is close enough to the target that the motor is
    /// left alone; callers must not treat that as a fault.
    pub fn run(&mut self, ctx: &TickCtx) -> Result<(), ControlError> {
        if self.state != EntityState::Online {
            return Err(ControlError::Offline);
        }

        self.advance_position(ctx.now);
        let finished_motion = self.motion;
        self.last_run = Some(ctx.now);

        // A forced travel (shutdown, failsafe) runs to completion blind.
        if self.forced {
            if matches!(self.motion, Motion::Stopped) {
                // The stop before reversing is over: start the closing leg.
                let waiting = self.dead_until.map_or(false, |d| ctx.now < d);
                if !waiting {
                    self.dead_until = None;
                    let overshoot = self.params.travel_time / 10;
                    self.motion = Motion::Closing {
                        until: ctx.now.advanced(self.params.travel_time + overshoot),
                    };
                    self.same_dir_secs = 0;
                }
            }
            self.apply_motion(ctx.hw)?;
            return Ok(());
        }

        let measured = match ctx.hw.input_value(self.sensor, ctx.now) {
            Ok(measured) => measured,
            Err(err) => {
                warn!(
                    target: "valve",
                    "\"{}\" mixed-outlet sensor unusable ({}), failing safe closed",
                    self.name, err
                );
                ctx.alarms
                    .raise(&self.name, format!("mixed-outlet sensor: {}", err));
                self.reqclose_full(ctx.hw, ctx.now)?;
                return Err(err);
            }
        };

        let target = match self.target {
            Some(target) => target,
            None => {
                // Nothing commanded: hold whatever motion is left.
                self.apply_motion(ctx.hw)?;
                return Ok(());
            }
        };

        let error = target - measured;

        if error.abs() <= self.params.deadzone {
            // Leave the bias window untouched inside the deadzone.
            if self.is_moving() {
                self.motion = Motion::Stopped;
                self.same_dir_secs = 0;
            }
            self.apply_motion(ctx.hw)?;
            trace!(target: "valve", "\"{}\" in deadzone ({} vs {})", self.name, measured, target);
            return Err(ControlError::Deadzone);
        }

        self.errors.push_back(error);
        while self.errors.len() > self.params.integral_samples {
            self.errors.pop_front();
        }

        // Let a motion in the right direction finish before re-planning.
        if match finished_motion {
            Motion::Stopped => false,
            Motion::Opening { .. } => error.as_mk() > 0,
            Motion::Closing { .. } => error.as_mk() < 0,
        } {
            self.apply_motion(ctx.hw)?;
            return Ok(());
        }

        // Reversal: stop now, wait out the dead time before the other coil.
        if self.is_moving() {
            self.motion = Motion::Stopped;
            self.same_dir_secs = 0;
            self.dead_until = Some(ctx.now.advanced(REVERSE_DEAD_TIME));
            self.apply_motion(ctx.hw)?;
            return Ok(());
        }

        if let Some(dead_until) = self.dead_until {
            if ctx.now < dead_until {
                self.apply_motion(ctx.hw)?;
                return Ok(());
            }
            self.dead_until = None;
        }

        let bias_mk = if self.errors.is_empty() {
            0
        } else {
            self.errors.iter().map(|e| e.as_mk() as i64).sum::<i64>() / self.errors.len() as i64
        };

        let course_permille = (error.as_mk() as i64 * self.params.kp_permille_per_k as i64
            + bias_mk * self.params.ki_permille_per_k as i64)
            / 1000;
        let course_permille = course_permille
            .clamp(
                -(self.params.max_step_permille as i64),
                self.params.max_step_permille as i64,
            ) as i32;

        // Clamp the course to the end stops so the motor is never driven past
        // them by the control law.
        let course_permille = course_permille.clamp(-self.position, FULL_OPEN - self.position);

        let duration = (course_permille.unsigned_abs() as u64 * self.params.travel_time)
            / FULL_OPEN as u64;
        if duration == 0 {
            self.apply_motion(ctx.hw)?;
            return Ok(());
        }

        let until = ctx.now.advanced(duration);
        self.motion = if course_permille > 0 {
            self.closed_confirmed = false;
            Motion::Opening { until }
        } else {
            Motion::Closing { until }
        };
        self.same_dir_secs = 0;
        debug!(
            target: "valve",
            "\"{}\" error {} -> {} for {}s (pos {})",
            self.name,
            error,
            if course_permille > 0 { "open" } else { "close" },
            duration,
            self.position
        );
        self.apply_motion(ctx.hw)?;
        Ok(())
    }
}
