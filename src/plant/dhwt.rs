//! Domestic hot water tank. Charges from the heatsources through a feed pump
//! (or from its own electric heater when the plant is otherwise asleep),
//! with hysteresis trips, a charge time limit against a source that cannot
//! keep up, and the periodic legionella boost.

use crate::error::ControlError;
use crate::hw::{Hardware, InputId, OutputId};
use crate::measure::{DeltaK, Temp, Ticks};
use crate::plant::pump::{Pump, PumpHandle};
use crate::plant::{EntityState, PlantShared, TickCtx};
use crate::runtime::RunMode;
use log::{debug, info, warn};

/// Index into the plant's tank arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DhwtId(pub usize);

/// How a charging tank weighs on the heating circuits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DhwPriority {
    /// Circuits run undisturbed.
    Parallel,
    /// Circuits are asked to back off while the tank charges.
    Sliding,
    /// Circuits are cut off while the tank charges.
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DhwtParams {
    pub t_comfort: Temp,
    pub t_eco: Temp,
    pub t_frostfree: Temp,
    pub t_legionella: Temp,
    pub hysteresis: DeltaK,
    pub temp_inoffset: DeltaK,
    pub limit_tmin: Temp,
    pub limit_tmax: Temp,
    /// Cap on the heat request while charging from a heatsource.
    pub limit_wintmax: Temp,
    /// Longest single charge, seconds. Zero disables the limit.
    pub limit_chargetime: u64,
    /// Use the self-heater when both tank sensors are dead.
    pub electric_failover: bool,
}

/// Margin replacing the hysteresis when a charge was explicitly requested.
const FORCE_TRIP_MARGIN: DeltaK = DeltaK::from_mk(1000);
/// Feed pump hysteresis on the water-in vs tank comparison.
const FEED_PUMP_MARGIN: DeltaK = DeltaK::from_mk(1000);

#[derive(Debug)]
pub struct Dhwt {
    name: String,
    sensor_bottom: Option<InputId>,
    sensor_top: Option<InputId>,
    sensor_win: Option<InputId>,
    selfheater: Option<OutputId>,
    feedpump: Option<PumpHandle>,
    recyclepump: Option<PumpHandle>,
    priority: DhwPriority,
    params: DhwtParams,
    state: EntityState,

    run_mode: RunMode,
    charge_on: bool,
    mode_since: Ticks,
    electric_mode: bool,
    legionella_on: bool,
    force_on: bool,
    external_recycle: bool,
    charge_overtime: bool,
    target_temp: Option<Temp>,
    heat_request: Option<Temp>,
}

impl Dhwt {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        sensor_bottom: Option<InputId>,
        sensor_top: Option<InputId>,
        sensor_win: Option<InputId>,
        selfheater: Option<OutputId>,
        feedpump: Option<PumpHandle>,
        recyclepump: Option<PumpHandle>,
        priority: DhwPriority,
        params: DhwtParams,
    ) -> Dhwt {
        Dhwt {
            name,
            sensor_bottom,
            sensor_top,
            sensor_win,
            selfheater,
            feedpump,
            recyclepump,
            priority,
            params,
            state: EntityState::Configured,
            run_mode: RunMode::Off,
            charge_on: false,
            mode_since: Ticks::ZERO,
            electric_mode: false,
            legionella_on: false,
            force_on: false,
            external_recycle: false,
            charge_overtime: false,
            target_temp: None,
            heat_request: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn online(&mut self, hw: &mut Hardware) -> Result<(), ControlError> {
        if self.sensor_bottom.is_none() && self.sensor_top.is_none() {
            warn!(target: "dhwt", "\"{}\" has no tank sensor at all", self.name);
            return Err(ControlError::Misconfigured);
        }
        if let Some(heater) = self.selfheater {
            hw.reserve_output(heater, &self.name)?;
        }
        self.state = EntityState::Online;
        info!(target: "dhwt", "\"{}\" online", self.name);
        Ok(())
    }

    pub fn set_run_mode(&mut self, mode: RunMode) {
        if mode != self.run_mode {
            info!(target: "dhwt", "\"{}\" run mode {} -> {}", self.name, self.run_mode, mode);
        }
        self.run_mode = mode;
    }

    pub fn heat_request(&self) -> Option<Temp> {
        self.heat_request
    }

    pub fn is_charging(&self) -> bool {
        self.charge_on
    }

    pub fn charge_overtime(&self) -> bool {
        self.charge_overtime
    }

    pub fn electric_mode(&self) -> bool {
        self.electric_mode
    }

    pub fn target_temp(&self) -> Option<Temp> {
        self.target_temp
    }

    pub fn priority(&self) -> DhwPriority {
        self.priority
    }

    /// Scheduler-driven sanitary boost: a forced charge to the legionella
    /// target, exempt from the charge time limit.
    pub fn request_legionella(&mut self) {
        info!(target: "dhwt", "\"{}\" legionella charge requested", self.name);
        self.legionella_on = true;
        self.force_on = true;
    }

    /// Forced charge at the normal target (e.g. before a scheduled draw).
    pub fn request_force_charge(&mut self) {
        self.force_on = true;
    }

    pub fn set_recycle(&mut self, on: bool) {
        self.external_recycle = on;
    }

    fn mode_target(&self, mode: RunMode) -> Temp {
        let base = match mode {
            RunMode::Comfort | RunMode::Dhwonly => self.params.t_comfort,
            RunMode::Eco => self.params.t_eco,
            _ => self.params.t_frostfree,
        };
        let base = if self.legionella_on {
            self.params.t_legionella
        } else {
            base
        };
        base.clamp(self.params.limit_tmin, self.params.limit_tmax)
    }

    fn set_heater(&self, hw: &Hardware, on: bool) -> Result<(), ControlError> {
        if let Some(heater) = self.selfheater {
            hw.output_request(heater, on)?;
        }
        Ok(())
    }

    fn set_feedpump(
        &self,
        pumps: &mut [Pump],
        on: bool,
        force_off: bool,
    ) -> Result<(), ControlError> {
        if let Some(handle) = self.feedpump {
            pumps[handle.pump.0].set_state(handle, on, force_off)?;
        }
        Ok(())
    }

    fn set_recyclepump(&self, pumps: &mut [Pump], on: bool) -> Result<(), ControlError> {
        if let Some(handle) = self.recyclepump {
            pumps[handle.pump.0].set_state(handle, on, false)?;
        }
        Ok(())
    }

    /// Both tank sensors unusable: no charging decision can be made. Park
    /// the pumps; the self-heater with its own thermostat may carry on.
    fn failsafe(&mut self, hw: &Hardware, pumps: &mut [Pump]) -> Result<(), ControlError> {
        self.heat_request = None;
        self.charge_on = false;
        self.electric_mode = false;
        self.set_feedpump(pumps, false, true)?;
        self.set_recyclepump(pumps, false)?;
        self.set_heater(hw, self.params.electric_failover)?;
        Ok(())
    }

    fn shutdown(&mut self, hw: &Hardware, now: Ticks, pumps: &mut [Pump]) -> Result<(), ControlError> {
        if self.charge_on {
            self.mode_since = now;
        }
        self.charge_on = false;
        self.electric_mode = false;
        self.legionella_on = false;
        self.force_on = false;
        self.charge_overtime = false;
        self.heat_request = None;
        self.target_temp = None;
        self.set_heater(hw, false)?;
        self.set_feedpump(pumps, false, false)?;
        self.set_recyclepump(pumps, false)?;
        Ok(())
    }

    pub fn offline(&mut self, hw: &mut Hardware, now: Ticks, pumps: &mut [Pump]) {
        if self.state == EntityState::Offline {
            return;
        }
        let _ = self.shutdown(hw, now, pumps);
        if let Some(heater) = self.selfheater {
            hw.release_output(heater);
        }
        self.state = EntityState::Offline;
    }

    pub fn run(
        &mut self,
        ctx: &TickCtx,
        shared: &PlantShared,
        pumps: &mut [Pump],
    ) -> Result<(), ControlError> {
        if self.state != EntityState::Online {
            return Err(ControlError::Offline);
        }

        match self.run_mode {
            RunMode::Off => return self.shutdown(ctx.hw, ctx.now, pumps),
            RunMode::Test => {
                self.set_heater(ctx.hw, true)?;
                self.set_feedpump(pumps, true, false)?;
                self.set_recyclepump(pumps, true)?;
                return Ok(());
            }
            _ => {}
        }

        let bottom = self
            .sensor_bottom
            .map(|id| ctx.hw.input_value(id, ctx.now));
        let top = self.sensor_top.map(|id| ctx.hw.input_value(id, ctx.now));
        let bottom_ok = bottom.and_then(|r| r.ok());
        let top_ok = top.and_then(|r| r.ok());

        // Trips read the coldest available point, untrips the warmest: a
        // satisfied top means usable water even if the bottom is still cold.
        let (cold_point, warm_point) = match (bottom_ok.or(top_ok), top_ok.or(bottom_ok)) {
            (Some(cold), Some(warm)) => (cold, warm),
            _ => {
                let err = bottom
                    .or(top)
                    .and_then(|r| r.err())
                    .unwrap_or(ControlError::SensorInval);
                ctx.alarms.raise(
                    &self.name,
                    format!(
                        "no usable tank sensor ({}){}",
                        err,
                        if self.params.electric_failover {
                            ", electric failover"
                        } else {
                            ""
                        }
                    ),
                );
                self.failsafe(ctx.hw, pumps)?;
                return Err(err);
            }
        };

        let target = self.mode_target(self.run_mode);
        self.target_temp = Some(target);

        if !self.charge_on {
            let current = cold_point;
            let margin = if self.force_on {
                FORCE_TRIP_MARGIN
            } else {
                self.params.hysteresis
            };
            let trip_temp = target - margin;

            // After an overtime abort, hold off re-tripping for a full charge
            // period so a weak source does not cycle the plant endlessly.
            let pumping_guard = self.charge_overtime
                && self.params.limit_chargetime > 0
                && ctx.now.since(self.mode_since) < self.params.limit_chargetime;
            if pumping_guard {
                debug!(target: "dhwt", "\"{}\" cooling down after charge overtime", self.name);
            } else if self.charge_overtime {
                self.charge_overtime = false;
            }

            if current < trip_temp && !pumping_guard {
                if shared.could_sleep && self.selfheater.is_some() {
                    // Nobody else needs the heatsources: charge electrically
                    // instead of firing a boiler for one tank.
                    info!(target: "dhwt", "\"{}\" charging electrically", self.name);
                    self.electric_mode = true;
                    self.heat_request = None;
                    self.set_heater(ctx.hw, true)?;
                } else {
                    self.electric_mode = false;
                    self.heat_request =
                        Some((target + self.params.temp_inoffset).min(self.params.limit_wintmax));
                }
                info!(
                    target: "dhwt",
                    "\"{}\" charge tripped at {} (target {})",
                    self.name, current, target
                );
                self.charge_on = true;
                self.mode_since = ctx.now;
            }
        } else {
            let current = warm_point;
            let mut untrip = false;
            if current >= target {
                info!(target: "dhwt", "\"{}\" charge done at {}", self.name, current);
                untrip = true;
            } else if !self.electric_mode
                && !self.legionella_on
                && self.params.limit_chargetime > 0
                && ctx.now.since(self.mode_since) > self.params.limit_chargetime
            {
                warn!(
                    target: "dhwt",
                    "\"{}\" charge aborted after {}s, still at {}",
                    self.name,
                    ctx.now.since(self.mode_since),
                    current
                );
                ctx.alarms
                    .raise(&self.name, "charge time limit exceeded");
                self.charge_overtime = true;
                untrip = true;
            }

            if untrip {
                self.set_heater(ctx.hw, false)?;
                self.heat_request = None;
                self.force_on = false;
                self.legionella_on = false;
                self.electric_mode = false;
                self.charge_on = false;
                self.mode_since = ctx.now;
            } else if self.electric_mode {
                self.set_heater(ctx.hw, true)?;
                self.heat_request = None;
            } else {
                // Legionella may have raised the target mid-charge.
                self.heat_request =
                    Some((target + self.params.temp_inoffset).min(self.params.limit_wintmax));
            }
        }

        self.manage_feedpump(ctx, pumps, cold_point)?;

        let recycle = self.external_recycle || self.legionella_on;
        self.set_recyclepump(pumps, recycle)?;

        Ok(())
    }

    /// Feed pump policy: only move water that actually heats the tank. While
    /// charging, a feed line colder than the tank would discharge it, so the
    /// pump is vetoed off; after the charge, cooldown may keep moving the
    /// residual heat as long as the line stays warmer than the tank.
    fn manage_feedpump(
        &mut self,
        ctx: &TickCtx,
        pumps: &mut [Pump],
        current: Temp,
    ) -> Result<(), ControlError> {
        if self.feedpump.is_none() {
            return Ok(());
        }
        let win = self
            .sensor_win
            .and_then(|id| ctx.hw.input_value(id, ctx.now).ok());

        if self.charge_on && !self.electric_mode {
            match win {
                Some(win) if win < current => self.set_feedpump(pumps, false, true)?,
                Some(win) if win > current + FEED_PUMP_MARGIN => {
                    self.set_feedpump(pumps, true, false)?
                }
                // Inside the margin: leave the pump as it is.
                Some(_) => {}
                None => self.set_feedpump(pumps, true, false)?,
            }
        } else {
            match win {
                Some(win) if win > current => self.set_feedpump(pumps, false, false)?,
                Some(_) => self.set_feedpump(pumps, false, true)?,
                None => self.set_feedpump(pumps, false, false)?,
            }
        }
        Ok(())
    }
}
