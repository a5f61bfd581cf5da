//! Boiler heatsource: burner hysteresis control toward the aggregated heat
//! request, wrapped in the protections that keep a real boiler alive —
//! antifreeze, hard-max trip, burner anti-short-cycling, cold-start shift
//! and return temperature protection.

use crate::error::ControlError;
use crate::hw::{Hardware, InputId, OutputId};
use crate::measure::filter::{Derivative, ThresholdIntegral};
use crate::measure::{DeltaK, Temp, Ticks};
use crate::plant::pump::{Pump, PumpHandle};
use crate::plant::valve::{Valve, ValveId};
use crate::plant::{EntityState, PlantShared, TickCtx};
use crate::runtime::RunMode;
use log::{debug, info, warn};

/// Index into the plant's heatsource arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoilerId(pub usize);

/// What the boiler does when no consumer requests heat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleMode {
    /// Always keep the boiler at its minimum temperature.
    Never,
    /// Allowed to go fully cold whenever the plant permits.
    Always,
    /// Only allowed to go cold in frost-free mode.
    Frostonly,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoilerParams {
    /// Full hysteresis band around the target.
    pub hysteresis: DeltaK,
    pub limit_tmin: Temp,
    pub limit_tmax: Temp,
    /// Beyond this the boiler is in failsafe the same tick.
    pub limit_thardmax: Temp,
    pub limit_treturnmin: Option<Temp>,
    pub t_freeze: Temp,
    /// Minimum seconds between burner transitions, both ways.
    pub burner_min_time: u64,
    pub idle_mode: IdleMode,
    /// Seconds consumers keep flowing after the burner stops.
    pub consumer_sdelay: u64,
}

/// Caps of the cold-start integral, in mK·s. The lower cap corresponds to a
/// full -100% consumer shift.
const COLD_INTG_LOWER: i64 = -50_000;
/// Window of the boiler temperature derivative estimate.
const DERIV_WINDOW: u64 = 120;

#[derive(Debug)]
pub struct Boiler {
    name: String,
    sensor_out: InputId,
    sensor_return: Option<InputId>,
    burner1: OutputId,
    burner2: Option<OutputId>,
    loadpump: Option<PumpHandle>,
    retvalve: Option<ValveId>,
    params: BoilerParams,
    state: EntityState,

    run_mode: RunMode,
    heat_request: Option<Temp>,
    target_temp: Option<Temp>,
    actual_temp: Temp,
    antifreeze: bool,
    overtemp: bool,
    burner1_on: bool,
    burner1_since: Option<Ticks>,
    cold_intg: ThresholdIntegral,
    ret_intg: ThresholdIntegral,
    deriv: Derivative,
    cshift_crit: i32,
    cshift_noncrit: i32,
    sdelay_left: u64,
    last_run: Option<Ticks>,
}

impl Boiler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        sensor_out: InputId,
        sensor_return: Option<InputId>,
        burner1: OutputId,
        burner2: Option<OutputId>,
        loadpump: Option<PumpHandle>,
        retvalve: Option<ValveId>,
        params: BoilerParams,
    ) -> Boiler {
        Boiler {
            name,
            sensor_out,
            sensor_return,
            burner1,
            burner2,
            loadpump,
            retvalve,
            params,
            state: EntityState::Configured,
            run_mode: RunMode::Off,
            heat_request: None,
            target_temp: None,
            actual_temp: Temp::UNSET,
            antifreeze: false,
            overtemp: false,
            burner1_on: false,
            burner1_since: None,
            cold_intg: ThresholdIntegral::new(COLD_INTG_LOWER, 0),
            ret_intg: ThresholdIntegral::new(COLD_INTG_LOWER, 0),
            deriv: Derivative::new(DERIV_WINDOW),
            cshift_crit: 0,
            cshift_noncrit: 0,
            sdelay_left: 0,
            last_run: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn online(&mut self, hw: &mut Hardware) -> Result<(), ControlError> {
        hw.input_time(self.sensor_out)?;
        if self.params.limit_tmax >= self.params.limit_thardmax {
            warn!(target: "boiler", "\"{}\" tmax must stay below thardmax", self.name);
            return Err(ControlError::Misconfigured);
        }
        hw.reserve_output(self.burner1, &self.name)?;
        if let Some(burner2) = self.burner2 {
            hw.reserve_output(burner2, &self.name)?;
        }
        self.state = EntityState::Online;
        info!(target: "boiler", "\"{}\" online", self.name);
        Ok(())
    }

    pub fn set_run_mode(&mut self, mode: RunMode) {
        if mode != self.run_mode {
            info!(target: "boiler", "\"{}\" run mode {} -> {}", self.name, self.run_mode, mode);
        }
        self.run_mode = mode;
    }

    /// Aggregated consumer demand, set by the orchestrator before `run`.
    pub fn set_heat_request(&mut self, request: Option<Temp>) {
        self.heat_request = request;
    }

    pub fn target_temp(&self) -> Option<Temp> {
        self.target_temp
    }

    pub fn actual_temp(&self) -> Temp {
        self.actual_temp
    }

    pub fn antifreeze(&self) -> bool {
        self.antifreeze
    }

    pub fn overtemp(&self) -> bool {
        self.overtemp
    }

    pub fn burner_on(&self) -> bool {
        self.burner1_on
    }

    pub fn cshift_crit(&self) -> i32 {
        self.cshift_crit
    }

    pub fn cshift_noncrit(&self) -> i32 {
        self.cshift_noncrit
    }

    pub fn sdelay_left(&self) -> u64 {
        self.sdelay_left
    }

    fn set_pump(&self, pumps: &mut [Pump], on: bool) -> Result<(), ControlError> {
        if let Some(handle) = self.loadpump {
            pumps[handle.pump.0].set_state(handle, on, false)?;
        }
        Ok(())
    }

    /// Both burner stages off immediately (the anti-short-cycle guard does
    /// not apply to safety shutdowns), load pump on to evacuate heat.
    fn failsafe(&mut self, hw: &Hardware, now: Ticks, pumps: &mut [Pump]) -> Result<(), ControlError> {
        hw.output_request(self.burner1, false)?;
        if let Some(burner2) = self.burner2 {
            hw.output_request(burner2, false)?;
        }
        if self.burner1_on {
            self.burner1_on = false;
            self.burner1_since = Some(now);
        }
        self.set_pump(pumps, true)?;
        Ok(())
    }

    fn shutdown(&mut self, hw: &Hardware, pumps: &mut [Pump]) -> Result<(), ControlError> {
        hw.output_request(self.burner1, false)?;
        if let Some(burner2) = self.burner2 {
            hw.output_request(burner2, false)?;
        }
        self.burner1_on = false;
        self.target_temp = None;
        self.set_pump(pumps, false)?;
        Ok(())
    }

    pub fn offline(&mut self, hw: &mut Hardware, pumps: &mut [Pump]) {
        if self.state == EntityState::Offline {
            return;
        }
        let _ = self.shutdown(hw, pumps);
        hw.release_output(self.burner1);
        if let Some(burner2) = self.burner2 {
            hw.release_output(burner2);
        }
        self.state = EntityState::Offline;
    }

    fn checklist(&mut self, ctx: &TickCtx) -> Result<Temp, ControlError> {
        ctx.hw.input_value(self.sensor_out, ctx.now)
    }

    /// Logic phase: settle the target temperature for this tick.
    pub fn logic(
        &mut self,
        ctx: &TickCtx,
        shared: &PlantShared,
        pumps: &mut [Pump],
    ) -> Result<(), ControlError> {
        if self.state != EntityState::Online {
            return Err(ControlError::Offline);
        }

        let boiler_temp = match self.checklist(ctx) {
            Ok(temp) => temp,
            Err(err) => {
                ctx.alarms
                    .raise(&self.name, format!("boiler sensor: {}", err));
                self.failsafe(ctx.hw, ctx.now, pumps)?;
                return Err(err);
            }
        };
        self.actual_temp = boiler_temp;
        self.deriv.update(boiler_temp, ctx.now);

        // Antifreeze trips on the boiler body itself and overrides OFF.
        if boiler_temp <= self.params.t_freeze && !self.antifreeze {
            warn!(target: "boiler", "\"{}\" antifreeze tripped at {}", self.name, boiler_temp);
            ctx.alarms.raise(&self.name, "antifreeze protection active");
            self.antifreeze = true;
        } else if self.antifreeze
            && boiler_temp > self.params.limit_tmin + self.params.hysteresis.half()
        {
            info!(target: "boiler", "\"{}\" antifreeze released at {}", self.name, boiler_temp);
            self.antifreeze = false;
        }

        let mut target = match self.run_mode {
            RunMode::Off => None,
            RunMode::Test => Some(self.params.limit_tmax),
            RunMode::Comfort | RunMode::Eco | RunMode::Dhwonly | RunMode::Frostfree => {
                self.heat_request
            }
            RunMode::Auto | RunMode::Unknown => return Err(ControlError::InvalidMode),
        };

        if self.antifreeze {
            target = Some(match target {
                Some(t) => t.max(self.params.limit_tmin),
                None => self.params.limit_tmin,
            });
        }

        if target.is_none() {
            let keep_warm = match self.params.idle_mode {
                IdleMode::Never => true,
                IdleMode::Frostonly => self.run_mode != RunMode::Frostfree,
                IdleMode::Always => false,
            };
            if keep_warm {
                target = Some(self.params.limit_tmin);
            } else if !shared.could_sleep {
                // Consumers may come back any moment: stay warm.
                target = Some(self.params.limit_tmin);
            }
        }

        self.target_temp =
            target.map(|t| t.clamp(self.params.limit_tmin, self.params.limit_tmax));
        Ok(())
    }

    /// Run phase: safety first, then drive the burner toward the target.
    pub fn run(
        &mut self,
        ctx: &TickCtx,
        pumps: &mut [Pump],
        valves: &mut [Valve],
    ) -> Result<(), ControlError> {
        if self.state != EntityState::Online {
            return Err(ControlError::Offline);
        }

        let boiler_temp = match self.checklist(ctx) {
            Ok(temp) => temp,
            Err(err) => {
                ctx.alarms
                    .raise(&self.name, format!("boiler sensor: {}", err));
                self.failsafe(ctx.hw, ctx.now, pumps)?;
                return Err(err);
            }
        };

        let elapsed = self.last_run.map(|t| ctx.now.since(t)).unwrap_or(0);
        self.last_run = Some(ctx.now);

        // Hard limit: everything else is irrelevant. Consumers are told to
        // dump the excess (+100% shift) while the burner stays dead.
        if boiler_temp > self.params.limit_thardmax {
            if !self.overtemp {
                warn!(
                    target: "boiler",
                    "\"{}\" over hard limit: {} > {}",
                    self.name, boiler_temp, self.params.limit_thardmax
                );
            }
            ctx.alarms.raise(
                &self.name,
                format!("hard temperature limit exceeded ({})", boiler_temp),
            );
            self.overtemp = true;
            self.cshift_crit = 100;
            self.failsafe(ctx.hw, ctx.now, pumps)?;
            return Err(ControlError::Safety);
        }
        if self.overtemp && boiler_temp < self.params.limit_tmax {
            info!(target: "boiler", "\"{}\" back below tmax at {}", self.name, boiler_temp);
            self.overtemp = false;
        }

        // Cold-start protection: time spent below tmin shifts consumers
        // negative so the boiler can climb out of condensation range.
        let intgrl = self
            .cold_intg
            .update(self.params.limit_tmin, boiler_temp, ctx.now);
        if intgrl < 0 {
            self.cshift_crit = (2 * intgrl / 1000) as i32;
        } else {
            self.cold_intg.reset();
            if !self.overtemp {
                self.cshift_crit = 0;
            }
        }

        self.set_pump(pumps, true)?;

        // Burner hysteresis around the target.
        let wanted = match self.target_temp {
            None => Some(false),
            Some(target) => {
                let trip = (target - self.params.hysteresis.half()).max(self.params.limit_tmin);
                let untrip = (target + self.params.hysteresis.half()).min(self.params.limit_tmax);
                if boiler_temp < trip {
                    Some(true)
                } else if boiler_temp > untrip {
                    Some(false)
                } else {
                    None
                }
            }
        };

        let was_on = self.burner1_on;
        if let Some(on) = wanted {
            if on != self.burner1_on {
                // Anti-short-cycle: both transitions honor the minimum time.
                let allowed = match self.burner1_since {
                    None => true,
                    Some(since) => ctx.now.since(since) >= self.params.burner_min_time,
                };
                if allowed {
                    debug!(
                        target: "boiler",
                        "\"{}\" burner {} at {} (target {:?})",
                        self.name,
                        if on { "on" } else { "off" },
                        boiler_temp,
                        self.target_temp
                    );
                    self.burner1_on = on;
                    self.burner1_since = Some(ctx.now);
                }
            }
        }
        ctx.hw.output_request(self.burner1, self.burner1_on)?;
        // Stage 2 is configured but never cascaded.
        if let Some(burner2) = self.burner2 {
            ctx.hw.output_request(burner2, false)?;
        }

        // While firing, keep the consumer shutdown delay armed so consumers
        // drain the residual heat when the burner eventually stops. The tick
        // that switches off does not count against the window.
        if self.burner1_on {
            self.sdelay_left = self.params.consumer_sdelay;
        } else if !was_on {
            self.sdelay_left = self.sdelay_left.saturating_sub(elapsed);
        }

        self.return_protection(ctx, valves)?;

        Ok(())
    }

    /// Keeps the return temperature above its minimum: integrate the deficit
    /// into an advisory consumer shift and steer the return-mix valve.
    fn return_protection(
        &mut self,
        ctx: &TickCtx,
        valves: &mut [Valve],
    ) -> Result<(), ControlError> {
        let (treturnmin, sensor) = match (self.params.limit_treturnmin, self.sensor_return) {
            (Some(treturnmin), Some(sensor)) => (treturnmin, sensor),
            _ => return Ok(()),
        };
        let ret = match ctx.hw.input_value(sensor, ctx.now) {
            Ok(ret) => ret,
            // The return sensor is optional comfort, not safety.
            Err(_) => return Ok(()),
        };
        let intgrl = self.ret_intg.update(treturnmin, ret, ctx.now);
        if intgrl < 0 {
            self.cshift_noncrit = (2 * intgrl / 1000) as i32;
        } else {
            self.ret_intg.reset();
            self.cshift_noncrit = 0;
        }
        if let Some(retvalve) = self.retvalve {
            valves[retvalve.0].set_target(treturnmin);
        }
        Ok(())
    }
}
