//! Hardware abstraction: named temperature inputs and relay outputs, bound to
//! pluggable backends. The control core never talks to a backend directly; it
//! reads sensor cells and buffers relay requests, and the input/output phases
//! of the tick move data between the cells and the backends.

use crate::error::ControlError;
use crate::measure::{Temp, Ticks};
use async_trait::async_trait;
use log::{error, warn};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use thiserror::Error;

pub mod dummy;
pub mod file;
#[cfg(unix)]
pub mod gpio;

/// A sensor whose last fetch is older than this reads as stale.
pub const SENSOR_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HwError {
    #[error("backend offline")]
    Offline,
    #[error("channel not configured")]
    NotConfigured,
    #[error("invalid channel")]
    Invalid,
    #[error("hardware fault")]
    Hardware,
    #[error("not implemented by backend")]
    NotImplemented,
    #[error("sensor invalid")]
    SensorInval,
    #[error("sensor shorted")]
    SensorShort,
    #[error("sensor disconnected")]
    SensorDiscon,
}

impl From<HwError> for ControlError {
    fn from(err: HwError) -> ControlError {
        match err {
            HwError::Offline => ControlError::Offline,
            HwError::NotConfigured => ControlError::NotConfigured,
            HwError::Invalid => ControlError::Invalid,
            HwError::Hardware => ControlError::Hardware,
            HwError::NotImplemented => ControlError::NotImplemented,
            HwError::SensorInval => ControlError::SensorInval,
            HwError::SensorShort => ControlError::SensorShort,
            HwError::SensorDiscon => ControlError::SensorDiscon,
        }
    }
}

/// Index into the sensor registry. Opaque to the entities holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputId(pub(crate) u32);

/// Index into the relay registry. Opaque to the entities holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputId(pub(crate) u32);

/// One writer (the backend during the input phase), many readers (entities
/// during logic). Value and fetch time are published with release stores and
/// read back with acquire loads so a reader never sees a fresh time with a
/// stale value.
pub struct SensorCell {
    value: AtomicI32,
    time: AtomicU64,
}

impl SensorCell {
    fn new() -> Self {
        SensorCell {
            value: AtomicI32::new(Temp::UNSET.as_mk()),
            time: AtomicU64::new(0),
        }
    }

    pub fn store(&self, value: Temp, now: Ticks) {
        self.value.store(value.as_mk(), Ordering::Release);
        self.time.store(now.as_secs(), Ordering::Release);
    }

    pub fn load(&self) -> (Temp, Ticks) {
        let time = Ticks::from_secs(self.time.load(Ordering::Acquire));
        let value = Temp::from_mk(self.value.load(Ordering::Acquire));
        (value, time)
    }
}

/// Buffered relay state plus wear counters. The core writes the request, the
/// output phase flushes it to the backend and maintains the counters.
pub struct RelayCell {
    requested: AtomicBool,
    actual: AtomicBool,
    failed: AtomicBool,
    cycles: AtomicU32,
    on_secs: AtomicU64,
    last_flush: AtomicU64,
}

impl RelayCell {
    fn new() -> Self {
        RelayCell {
            requested: AtomicBool::new(false),
            actual: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            cycles: AtomicU32::new(0),
            on_secs: AtomicU64::new(0),
            last_flush: AtomicU64::new(0),
        }
    }

    pub fn request(&self, on: bool) {
        self.requested.store(on, Ordering::Release);
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn actual(&self) -> bool {
        self.actual.load(Ordering::Acquire)
    }

    /// Set when the last flush could not reach the hardware. Cleared by the
    /// next successful flush.
    pub fn write_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn cycles(&self) -> u32 {
        self.cycles.load(Ordering::Acquire)
    }

    pub fn on_secs(&self) -> u64 {
        self.on_secs.load(Ordering::Acquire)
    }

    fn restore_counters(&self, cycles: u32, on_secs: u64) {
        self.cycles.store(cycles, Ordering::Release);
        self.on_secs.store(on_secs, Ordering::Release);
    }

    fn note_flushed(&self, on: bool, now: Ticks) {
        let was = self.actual.swap(on, Ordering::AcqRel);
        let last = self.last_flush.swap(now.as_secs(), Ordering::AcqRel);
        if was {
            self.on_secs
                .fetch_add(now.as_secs().saturating_sub(last), Ordering::AcqRel);
        }
        if was != on && on {
            self.cycles.fetch_add(1, Ordering::AcqRel);
        }
        self.failed.store(false, Ordering::Release);
    }

    fn note_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }
}

/// What a backend must provide. `input` refreshes the backend's snapshot in
/// bulk; per-channel getters then read from that snapshot without touching
/// the transport. Symmetrically, `output_state_set` only stages a channel and
/// `output` pushes the whole set out.
#[async_trait]
pub trait HwBackend: Send {
    fn name(&self) -> &str;

    async fn online(&mut self) -> Result<(), HwError>;

    async fn input(&mut self) -> Result<(), HwError>;

    fn input_value(&self, channel: usize) -> Result<Temp, HwError>;

    fn output_state_set(&mut self, channel: usize, on: bool) -> Result<(), HwError>;

    fn output_state_get(&self, channel: usize) -> Result<bool, HwError>;

    async fn output(&mut self) -> Result<(), HwError>;

    async fn offline(&mut self) -> Result<(), HwError>;
}

struct SensorSlot {
    name: String,
    backend: usize,
    channel: usize,
    cell: SensorCell,
}

struct RelaySlot {
    name: String,
    backend: usize,
    channel: usize,
    cell: RelayCell,
    reserved_by: Option<String>,
}

/// The registry the whole plant shares: every named input and output, which
/// backend serves it, and the cells the core reads and writes.
pub struct Hardware {
    backends: Vec<Box<dyn HwBackend>>,
    sensors: Vec<SensorSlot>,
    relays: Vec<RelaySlot>,
}

impl Hardware {
    pub fn new() -> Self {
        Hardware {
            backends: Vec::new(),
            sensors: Vec::new(),
            relays: Vec::new(),
        }
    }

    /// Registers a backend and returns its index for channel declarations.
    pub fn add_backend(&mut self, backend: Box<dyn HwBackend>) -> usize {
        self.backends.push(backend);
        self.backends.len() - 1
    }

    pub fn declare_input(
        &mut self,
        name: &str,
        backend: usize,
        channel: usize,
    ) -> Result<InputId, ControlError> {
        if backend >= self.backends.len() {
            return Err(ControlError::Misconfigured);
        }
        if self.sensors.iter().any(|s| s.name == name) {
            return Err(ControlError::Exists);
        }
        self.sensors.push(SensorSlot {
            name: name.to_owned(),
            backend,
            channel,
            cell: SensorCell::new(),
        });
        Ok(InputId((self.sensors.len() - 1) as u32))
    }

    pub fn declare_output(
        &mut self,
        name: &str,
        backend: usize,
        channel: usize,
    ) -> Result<OutputId, ControlError> {
        if backend >= self.backends.len() {
            return Err(ControlError::Misconfigured);
        }
        if self.relays.iter().any(|r| r.name == name) {
            return Err(ControlError::Exists);
        }
        self.relays.push(RelaySlot {
            name: name.to_owned(),
            backend,
            channel,
            cell: RelayCell::new(),
            reserved_by: None,
        });
        Ok(OutputId((self.relays.len() - 1) as u32))
    }

    /// Input lookup by name.
    pub fn input_ibn(&self, name: &str) -> Result<InputId, ControlError> {
        self.sensors
            .iter()
            .position(|s| s.name == name)
            .map(|i| InputId(i as u32))
            .ok_or(ControlError::NotFound)
    }

    /// Output lookup by name.
    pub fn output_ibn(&self, name: &str) -> Result<OutputId, ControlError> {
        self.relays
            .iter()
            .position(|r| r.name == name)
            .map(|i| OutputId(i as u32))
            .ok_or(ControlError::NotFound)
    }

    pub fn input_name(&self, id: InputId) -> Option<&str> {
        self.sensors.get(id.0 as usize).map(|s| s.name.as_str())
    }

    pub fn output_name(&self, id: OutputId) -> Option<&str> {
        self.relays.get(id.0 as usize).map(|r| r.name.as_str())
    }

    /// Validated, staleness-checked read of a sensor cell.
    pub fn input_value(&self, id: InputId, now: Ticks) -> Result<Temp, ControlError> {
        let slot = self
            .sensors
            .get(id.0 as usize)
            .ok_or(ControlError::Invalid)?;
        let (value, time) = slot.cell.load();
        let value = value.checked()?;
        if now.since(time) > SENSOR_TIMEOUT_SECS {
            return Err(ControlError::Stale);
        }
        Ok(value)
    }

    pub fn input_time(&self, id: InputId) -> Result<Ticks, ControlError> {
        let slot = self
            .sensors
            .get(id.0 as usize)
            .ok_or(ControlError::Invalid)?;
        Ok(slot.cell.load().1)
    }

    /// Exclusive claim on a relay. Exactly one entity may hold each output.
    pub fn reserve_output(&mut self, id: OutputId, owner: &str) -> Result<(), ControlError> {
        let slot = self
            .relays
            .get_mut(id.0 as usize)
            .ok_or(ControlError::Invalid)?;
        match &slot.reserved_by {
            Some(existing) if existing != owner => {
                error!(
                    target: "hw",
                    "relay \"{}\" already reserved by \"{}\", refused for \"{}\"",
                    slot.name, existing, owner
                );
                Err(ControlError::Exists)
            }
            _ => {
                slot.reserved_by = Some(owner.to_owned());
                Ok(())
            }
        }
    }

    pub fn release_output(&mut self, id: OutputId) {
        if let Some(slot) = self.relays.get_mut(id.0 as usize) {
            slot.reserved_by = None;
        }
    }

    /// Buffered write; the backend sees it at the next output phase.
    pub fn output_request(&self, id: OutputId, on: bool) -> Result<(), ControlError> {
        let slot = self
            .relays
            .get(id.0 as usize)
            .ok_or(ControlError::Invalid)?;
        slot.cell.request(on);
        Ok(())
    }

    pub fn output_state(&self, id: OutputId) -> Result<bool, ControlError> {
        let slot = self
            .relays
            .get(id.0 as usize)
            .ok_or(ControlError::Invalid)?;
        Ok(slot.cell.requested())
    }

    /// Whether the last flush failed to reach the hardware for this relay.
    pub fn output_failed(&self, id: OutputId) -> bool {
        self.relays
            .get(id.0 as usize)
            .map(|r| r.cell.write_failed())
            .unwrap_or(true)
    }

    pub fn relay_counters(&self, id: OutputId) -> Option<(u32, u64)> {
        self.relays
            .get(id.0 as usize)
            .map(|r| (r.cell.cycles(), r.cell.on_secs()))
    }

    pub fn restore_relay_counters(&self, name: &str, cycles: u32, on_secs: u64) {
        if let Some(slot) = self.relays.iter().find(|r| r.name == name) {
            slot.cell.restore_counters(cycles, on_secs);
        } else {
            warn!(target: "hw", "counters for unknown relay \"{}\" discarded", name);
        }
    }

    pub fn relay_names(&self) -> impl Iterator<Item = &str> {
        self.relays.iter().map(|r| r.name.as_str())
    }

    pub async fn online(&mut self) -> Result<(), HwError> {
        for backend in &mut self.backends {
            backend.online().await?;
        }
        Ok(())
    }

    /// Input phase: bulk-refresh every backend, then publish each configured
    /// sensor into its cell. A backend failure marks its sensors invalid
    /// rather than leaving yesterday's values look fresh.
    pub async fn input(&mut self, now: Ticks) {
        for (index, backend) in self.backends.iter_mut().enumerate() {
            let refreshed = backend.input().await;
            for slot in self.sensors.iter().filter(|s| s.backend == index) {
                let value = match &refreshed {
                    Ok(()) => match backend.input_value(slot.channel) {
                        Ok(value) => value,
                        Err(HwError::SensorShort) => Temp::SHORT,
                        Err(HwError::SensorDiscon) => Temp::DISCON,
                        Err(err) => {
                            warn!(
                                target: "hw",
                                "backend \"{}\" sensor \"{}\": {}",
                                backend.name(), slot.name, err
                            );
                            Temp::INVALID
                        }
                    },
                    Err(err) => {
                        warn!(
                            target: "hw",
                            "backend \"{}\" input cycle failed: {}",
                            backend.name(), err
                        );
                        Temp::INVALID
                    }
                };
                slot.cell.store(value, now);
            }
        }
    }

    /// Output phase: stage every relay request on its backend, flush, and
    /// account the transitions. Failures are flagged on the affected cells so
    /// the owning entity can react on its next run.
    pub async fn output(&mut self, now: Ticks) {
        for (index, backend) in self.backends.iter_mut().enumerate() {
            let mut staged_any = false;
            for slot in self.relays.iter().filter(|r| r.backend == index) {
                match backend.output_state_set(slot.channel, slot.cell.requested()) {
                    Ok(()) => staged_any = true,
                    Err(err) => {
                        error!(
                            target: "hw",
                            "backend \"{}\" relay \"{}\" stage failed: {}",
                            backend.name(), slot.name, err
                        );
                        slot.cell.note_failed();
                    }
                }
            }
            if !staged_any {
                continue;
            }
            match backend.output().await {
                Ok(()) => {
                    for slot in self.relays.iter().filter(|r| r.backend == index) {
                        if !slot.cell.write_failed() {
                            slot.cell.note_flushed(slot.cell.requested(), now);
                        }
                    }
                }
                Err(err) => {
                    error!(
                        target: "hw",
                        "backend \"{}\" output cycle failed: {}",
                        backend.name(), err
                    );
                    for slot in self.relays.iter().filter(|r| r.backend == index) {
                        slot.cell.note_failed();
                    }
                }
            }
        }
    }

    /// Drives every relay request off and flushes. Used on shutdown and from
    /// the panic hook, where a best effort beats an early return.
    pub async fn all_off(&mut self, now: Ticks) {
        for slot in &self.relays {
            slot.cell.request(false);
        }
        self.output(now).await;
    }

    pub async fn offline(&mut self) {
        for backend in &mut self.backends {
            if let Err(err) = backend.offline().await {
                error!(target: "hw", "backend \"{}\" offline failed: {}", backend.name(), err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::dummy::DummyBackend;
    use super::*;

    #[tokio::test]
    async fn test_registry_lookup_and_reservation() {
        let mut hw = Hardware::new();
        let (backend, _handle) = DummyBackend::new(2, 2);
        let b = hw.add_backend(Box::new(backend));
        let outdoor = hw.declare_input("outdoor", b, 0).unwrap();
        hw.declare_input("boiler", b, 1).unwrap();
        let burner = hw.declare_output("burner", b, 0).unwrap();

        assert_eq!(hw.input_ibn("outdoor").unwrap(), outdoor);
        assert_eq!(hw.output_ibn("burner").unwrap(), burner);
        assert_eq!(hw.input_ibn("nonexistent"), Err(ControlError::NotFound));
        assert_eq!(
            hw.declare_input("outdoor", b, 0),
            Err(ControlError::Exists)
        );

        hw.reserve_output(burner, "boiler 1").unwrap();
        // Re-reserving under the same owner is idempotent.
        hw.reserve_output(burner, "boiler 1").unwrap();
        assert_eq!(
            hw.reserve_output(burner, "boiler 2"),
            Err(ControlError::Exists)
        );
        hw.release_output(burner);
        hw.reserve_output(burner, "boiler 2").unwrap();
    }

    #[tokio::test]
    async fn test_input_phase_publishes_values() {
        let mut hw = Hardware::new();
        let (backend, handle) = DummyBackend::new(1, 0);
        let b = hw.add_backend(Box::new(backend));
        let id = hw.declare_input("outdoor", b, 0).unwrap();

        let now = Ticks::from_secs(100);
        handle.set_temp_c(0, -5.0);
        hw.input(now).await;
        assert_eq!(hw.input_value(id, now).unwrap(), Temp::from_celsius(-5.0));
        assert_eq!(hw.input_time(id).unwrap(), now);
    }

    #[tokio::test]
    async fn test_stale_sensor_rejected() {
        let mut hw = Hardware::new();
        let (backend, handle) = DummyBackend::new(1, 0);
        let b = hw.add_backend(Box::new(backend));
        let id = hw.declare_input("outdoor", b, 0).unwrap();

        handle.set_temp_c(0, 12.0);
        hw.input(Ticks::from_secs(10)).await;
        // Within the timeout the value is usable.
        assert!(hw.input_value(id, Ticks::from_secs(30)).is_ok());
        // Past it the read must fail stale.
        assert_eq!(
            hw.input_value(id, Ticks::from_secs(41)),
            Err(ControlError::Stale)
        );
    }

    #[tokio::test]
    async fn test_sentinels_map_to_errors() {
        let mut hw = Hardware::new();
        let (backend, handle) = DummyBackend::new(1, 0);
        let b = hw.add_backend(Box::new(backend));
        let id = hw.declare_input("outdoor", b, 0).unwrap();

        let now = Ticks::from_secs(5);
        handle.set_temp(0, Temp::SHORT);
        hw.input(now).await;
        assert_eq!(hw.input_value(id, now), Err(ControlError::SensorShort));

        handle.set_temp(0, Temp::DISCON);
        hw.input(now).await;
        assert_eq!(hw.input_value(id, now), Err(ControlError::SensorDiscon));
    }

    #[tokio::test]
    async fn test_output_phase_flush_and_counters() {
        let mut hw = Hardware::new();
        let (backend, handle) = DummyBackend::new(0, 1);
        let b = hw.add_backend(Box::new(backend));
        let id = hw.declare_output("pump", b, 0).unwrap();

        hw.output_request(id, true).unwrap();
        hw.output(Ticks::from_secs(10)).await;
        assert!(handle.relay_state(0));

        hw.output_request(id, false).unwrap();
        hw.output(Ticks::from_secs(25)).await;
        assert!(!handle.relay_state(0));

        let (cycles, on_secs) = hw.relay_counters(id).unwrap();
        assert_eq!(cycles, 1);
        assert_eq!(on_secs, 15);
    }

    #[tokio::test]
    async fn test_relay_write_failure_flagged() {
        let mut hw = Hardware::new();
        let (backend, handle) = DummyBackend::new(0, 1);
        let b = hw.add_backend(Box::new(backend));
        let id = hw.declare_output("pump", b, 0).unwrap();

        handle.fail_relays(true);
        hw.output_request(id, true).unwrap();
        hw.output(Ticks::from_secs(10)).await;
        assert!(hw.output_failed(id));

        handle.fail_relays(false);
        hw.output(Ticks::from_secs(11)).await;
        assert!(!hw.output_failed(id));
    }
}
