//! On/off circulator. A pump owns one relay and may be shared: each virtual
//! owner carries its own request and veto, and the relay runs iff at least
//! one owner wants it on and nobody insists it stays off.

use crate::error::ControlError;
use crate::hw::{Hardware, OutputId};
use crate::measure::Ticks;
use crate::plant::{EntityState, TickCtx};
use log::{debug, info, trace};

/// Index into the plant's pump arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PumpId(pub usize);

/// A claim on one owner slot of a pump. Handed to circuits and tanks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpHandle {
    pub pump: PumpId,
    pub owner: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct OwnerSlot {
    req_on: bool,
    force_off: bool,
}

#[derive(Debug)]
pub struct Pump {
    name: String,
    relay: OutputId,
    shared: bool,
    /// Seconds an on→off transition is held back, unless vetoed off.
    cooldown: u64,
    state: EntityState,
    owners: Vec<OwnerSlot>,
    /// Pending off transition start, for the cooldown clock.
    off_pending_since: Option<Ticks>,
    commanded_on: bool,
}

impl Pump {
    pub fn new(name: String, relay: OutputId, shared: bool, cooldown: u64) -> Pump {
        Pump {
            name,
            relay,
            shared,
            cooldown,
            state: EntityState::Configured,
            owners: Vec::new(),
            off_pending_since: None,
            commanded_on: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_online(&self) -> bool {
        self.state == EntityState::Online
    }

    /// Claims the primary owner slot. Fails on a second grab of an unshared
    /// pump; a shared pump hands out further slots through [`Pump::virtual_new`].
    pub fn grab(&mut self, id: PumpId) -> Result<PumpHandle, ControlError> {
        if !self.owners.is_empty() && !self.shared {
            return Err(ControlError::Exists);
        }
        self.owners.push(OwnerSlot::default());
        Ok(PumpHandle {
            pump: id,
            owner: self.owners.len() - 1,
        })
    }

    /// First caller grabs the pump, later callers become virtual owners of a
    /// shared pump. This is what configuration assembly goes through.
    pub fn acquire(&mut self, id: PumpId) -> Result<PumpHandle, ControlError> {
        if self.owners.is_empty() {
            self.grab(id)
        } else {
            self.virtual_new(id)
        }
    }

    /// Additional virtual owner on a shared pump.
    pub fn virtual_new(&mut self, id: PumpId) -> Result<PumpHandle, ControlError> {
        if !self.shared {
            return Err(ControlError::Invalid);
        }
        if self.owners.is_empty() {
            return Err(ControlError::NotConfigured);
        }
        self.owners.push(OwnerSlot::default());
        Ok(PumpHandle {
            pump: id,
            owner: self.owners.len() - 1,
        })
    }

    /// Reserves the relay. Requires at least one owner to have grabbed it.
    pub fn online(&mut self, hw: &mut Hardware) -> Result<(), ControlError> {
        if self.owners.is_empty() {
            return Err(ControlError::NotConfigured);
        }
        hw.reserve_output(self.relay, &self.name)?;
        self.state = EntityState::Online;
        info!(target: "pump", "\"{}\" online ({} owner(s))", self.name, self.owners.len());
        Ok(())
    }

    /// Buffered request from one owner; the relay moves in the next `run`.
    pub fn set_state(
        &mut self,
        handle: PumpHandle,
        req_on: bool,
        force_off: bool,
    ) -> Result<(), ControlError> {
        let slot = self
            .owners
            .get_mut(handle.owner)
            .ok_or(ControlError::Invalid)?;
        slot.req_on = req_on;
        slot.force_off = force_off;
        Ok(())
    }

    /// Commanded (not necessarily flushed) relay state.
    pub fn get_state(&self) -> bool {
        self.commanded_on
    }

    fn effective_request(&self) -> bool {
        let any_on = self.owners.iter().any(|o| o.req_on);
        let any_veto = self.owners.iter().any(|o| o.force_off);
        any_on && !any_veto
    }

    pub fn run(&mut self, ctx: &TickCtx) -> Result<(), ControlError> {
        if self.state != EntityState::Online {
            return Err(ControlError::Offline);
        }

        // A failed flush from the previous output phase means the relay state
        // is unknown; treat it as an actuator failure.
        if ctx.hw.output_failed(self.relay) {
            ctx.alarms
                .raise(&self.name, "relay write failed, shutting pump down");
            self.shutdown(ctx.hw)?;
            return Err(ControlError::Hardware);
        }

        let vetoed = self.owners.iter().any(|o| o.force_off);
        let wanted = self.effective_request();

        let command = if wanted {
            self.off_pending_since = None;
            true
        } else if vetoed || self.cooldown == 0 || !self.commanded_on {
            self.off_pending_since = None;
            false
        } else {
            // Cooldown: hold the pump on for a while after the last request.
            let since = *self.off_pending_since.get_or_insert(ctx.now);
            if ctx.now.since(since) >= self.cooldown {
                false
            } else {
                trace!(target: "pump", "\"{}\" in cooldown", self.name);
                true
            }
        };

        if command != self.commanded_on {
            debug!(target: "pump", "\"{}\" -> {}", self.name, if command { "on" } else { "off" });
        }
        self.commanded_on = command;
        ctx.hw.output_request(self.relay, command)?;
        Ok(())
    }

    /// Immediate stop: clears all owner requests and writes OFF.
    pub fn shutdown(&mut self, hw: &Hardware) -> Result<(), ControlError> {
        for owner in &mut self.owners {
            owner.req_on = false;
            owner.force_off = false;
        }
        self.off_pending_since = None;
        self.commanded_on = false;
        hw.output_request(self.relay, false)
    }

    /// Idempotent; writes OFF and releases the relay reservation.
    pub fn offline(&mut self, hw: &mut Hardware) {
        if self.state == EntityState::Offline {
            return;
        }
        let _ = self.shutdown(hw);
        hw.release_output(self.relay);
        self.state = EntityState::Offline;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alarm;
    use crate::hw::dummy::DummyBackend;
    use crate::measure::Ticks;

    fn pump_fixture(shared: bool, cooldown: u64) -> (Hardware, Pump, PumpHandle) {
        let mut hw = Hardware::new();
        let (backend, _handle) = DummyBackend::new(0, 1);
        let b = hw.add_backend(Box::new(backend));
        let relay = hw.declare_output("pump", b, 0).unwrap();
        let mut pump = Pump::new("pump".to_owned(), relay, shared, cooldown);
        let handle = pump.grab(PumpId(0)).unwrap();
        pump.online(&mut hw).unwrap();
        (hw, pump, handle)
    }

    fn ctx<'a>(hw: &'a Hardware, alarms: &'a alarm::AlarmSender, now: u64) -> TickCtx<'a> {
        TickCtx {
            hw,
            alarms,
            now: Ticks::from_secs(now),
        }
    }

    #[test]
    fn test_single_owner_on_off() {
        let (hw, mut pump, handle) = pump_fixture(false, 0);
        let (alarms, _rx) = alarm::channel();

        pump.set_state(handle, true, false).unwrap();
        pump.run(&ctx(&hw, &alarms, 0)).unwrap();
        assert!(pump.get_state());
        assert!(hw.output_state(hw.output_ibn("pump").unwrap()).unwrap());

        pump.set_state(handle, false, false).unwrap();
        pump.run(&ctx(&hw, &alarms, 1)).unwrap();
        assert!(!pump.get_state());
    }

    #[test]
    fn test_shared_pump_any_on_wins() {
        let (hw, mut pump, a) = pump_fixture(true, 0);
        let (alarms, _rx) = alarm::channel();
        let b = pump.virtual_new(PumpId(0)).unwrap();

        pump.set_state(a, true, false).unwrap();
        pump.set_state(b, false, false).unwrap();
        pump.run(&ctx(&hw, &alarms, 0)).unwrap();
        assert!(pump.get_state(), "one requesting owner should start it");
    }

    #[test]
    fn test_shared_pump_force_off_vetoes() {
        // Owner A requests ON, owner B forces OFF: relay must stay off.
        let (hw, mut pump, a) = pump_fixture(true, 0);
        let (alarms, _rx) = alarm::channel();
        let b = pump.virtual_new(PumpId(0)).unwrap();

        pump.set_state(a, true, false).unwrap();
        pump.set_state(b, false, true).unwrap();
        pump.run(&ctx(&hw, &alarms, 0)).unwrap();
        assert!(!pump.get_state());

        // B releases its veto: relay comes on.
        pump.set_state(b, false, false).unwrap();
        pump.run(&ctx(&hw, &alarms, 1)).unwrap();
        assert!(pump.get_state());
    }

    #[test]
    fn test_cooldown_delays_stop() {
        let (hw, mut pump, handle) = pump_fixture(false, 120);
        let (alarms, _rx) = alarm::channel();

        pump.set_state(handle, true, false).unwrap();
        pump.run(&ctx(&hw, &alarms, 0)).unwrap();
        assert!(pump.get_state());

        pump.set_state(handle, false, false).unwrap();
        pump.run(&ctx(&hw, &alarms, 10)).unwrap();
        assert!(pump.get_state(), "cooldown holds the pump on");

        pump.run(&ctx(&hw, &alarms, 131)).unwrap();
        assert!(!pump.get_state(), "cooldown expired");
    }

    #[test]
    fn test_force_off_bypasses_cooldown() {
        let (hw, mut pump, handle) = pump_fixture(false, 120);
        let (alarms, _rx) = alarm::channel();

        pump.set_state(handle, true, false).unwrap();
        pump.run(&ctx(&hw, &alarms, 0)).unwrap();

        pump.set_state(handle, false, true).unwrap();
        pump.run(&ctx(&hw, &alarms, 1)).unwrap();
        assert!(!pump.get_state());
    }

    #[test]
    fn test_unshared_refuses_second_owner() {
        let (_hw, mut pump, _handle) = pump_fixture(false, 0);
        assert_eq!(pump.grab(PumpId(0)), Err(ControlError::Exists));
        assert_eq!(pump.virtual_new(PumpId(0)), Err(ControlError::Invalid));
    }

    #[test]
    fn test_offline_releases_relay() {
        let (mut hw, mut pump, handle) = pump_fixture(false, 0);
        let (alarms, _rx) = alarm::channel();
        pump.set_state(handle, true, false).unwrap();
        pump.run(&ctx(&hw, &alarms, 0)).unwrap();

        pump.offline(&mut hw);
        let relay = hw.output_ibn("pump").unwrap();
        assert!(!hw.output_state(relay).unwrap());
        // Relay is free for someone else now.
        hw.reserve_output(relay, "other").unwrap();
        // Offline is idempotent.
        pump.offline(&mut hw);
    }

    #[test]
    fn test_run_offline_rejected() {
        let (mut hw, mut pump, _handle) = pump_fixture(false, 0);
        let (alarms, _rx) = alarm::channel();
        pump.offline(&mut hw);
        assert_eq!(
            pump.run(&ctx(&hw, &alarms, 0)),
            Err(ControlError::Offline)
        );
    }
}
