use crate::error::ControlError;
use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign, Neg, Sub};
use std::time::Duration;

pub mod filter;

/// Absolute temperature in millikelvin. The plant core works exclusively in
/// this fixed-point representation; floats only appear at the config and
/// backend boundaries.
///
/// The bottom of the i32 range encodes sensor sentinels, so a `Temp` must be
/// passed through [`Temp::checked`] before being used as a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Temp(i32);

const CELSIUS_OFFSET_MK: i64 = 273_150;

impl Temp {
    /// Never written by a backend.
    pub const UNSET: Temp = Temp(i32::MIN);
    /// Sensor reads as a short circuit.
    pub const SHORT: Temp = Temp(i32::MIN + 1);
    /// Sensor reads as an open circuit.
    pub const DISCON: Temp = Temp(i32::MIN + 2);
    /// Backend flagged the value unusable for any other reason.
    pub const INVALID: Temp = Temp(i32::MIN + 3);

    pub const ZERO_CELSIUS: Temp = Temp(CELSIUS_OFFSET_MK as i32);

    pub const fn from_mk(mk: i32) -> Temp {
        Temp(mk)
    }

    pub const fn as_mk(self) -> i32 {
        self.0
    }

    /// Rounds half to even so that repeated config/backend conversions do not
    /// drift in one direction.
    pub fn from_celsius(celsius: f64) -> Temp {
        let mk = (celsius * 1000.0 + CELSIUS_OFFSET_MK as f64).round_ties_even();
        Temp(mk as i32)
    }

    pub fn to_celsius(self) -> f64 {
        (self.0 as i64 - CELSIUS_OFFSET_MK) as f64 / 1000.0
    }

    /// Maps the sentinel range to the matching error, passing real values
    /// through untouched.
    pub fn checked(self) -> Result<Temp, ControlError> {
        match self {
            Temp::UNSET => Err(ControlError::SensorUnset),
            Temp::SHORT => Err(ControlError::SensorShort),
            Temp::DISCON => Err(ControlError::SensorDiscon),
            Temp::INVALID => Err(ControlError::SensorInval),
            t if t.0 < 0 => Err(ControlError::SensorInval),
            t => Ok(t),
        }
    }

    pub fn is_sentinel(self) -> bool {
        self.checked().is_err()
    }

    pub fn min(self, other: Temp) -> Temp {
        if self.0 <= other.0 { self } else { other }
    }

    pub fn max(self, other: Temp) -> Temp {
        if self.0 >= other.0 { self } else { other }
    }

    pub fn clamp(self, lo: Temp, hi: Temp) -> Temp {
        self.max(lo).min(hi)
    }
}

impl Display for Temp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Temp::UNSET => write!(f, "<unset>"),
            Temp::SHORT => write!(f, "<short>"),
            Temp::DISCON => write!(f, "<disconnected>"),
            Temp::INVALID => write!(f, "<invalid>"),
            t => write!(f, "{:.1}°C", t.to_celsius()),
        }
    }
}

impl Add<DeltaK> for Temp {
    type Output = Temp;

    fn add(self, rhs: DeltaK) -> Temp {
        Temp(self.0.saturating_add(rhs.0))
    }
}

impl Sub<DeltaK> for Temp {
    type Output = Temp;

    fn sub(self, rhs: DeltaK) -> Temp {
        Temp(self.0.saturating_sub(rhs.0))
    }
}

impl Sub for Temp {
    type Output = DeltaK;

    fn sub(self, rhs: Temp) -> DeltaK {
        DeltaK(self.0.saturating_sub(rhs.0))
    }
}

/// Temperature difference in millikelvin, same scale as [`Temp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeltaK(i32);

impl DeltaK {
    pub const ZERO: DeltaK = DeltaK(0);

    pub const fn from_mk(mk: i32) -> DeltaK {
        DeltaK(mk)
    }

    pub const fn as_mk(self) -> i32 {
        self.0
    }

    pub fn from_kelvin(kelvin: f64) -> DeltaK {
        DeltaK((kelvin * 1000.0).round_ties_even() as i32)
    }

    pub fn to_kelvin(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn abs(self) -> DeltaK {
        DeltaK(self.0.abs())
    }

    /// `self * percent / 100` with 64-bit intermediate.
    pub fn percent(self, percent: i32) -> DeltaK {
        DeltaK((self.0 as i64 * percent as i64 / 100) as i32)
    }

    /// Halve, used for the symmetric hysteresis bands.
    pub fn half(self) -> DeltaK {
        DeltaK(self.0 / 2)
    }
}

impl Display for DeltaK {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.1}K", self.to_kelvin())
    }
}

impl Add for DeltaK {
    type Output = DeltaK;

    fn add(self, rhs: DeltaK) -> DeltaK {
        DeltaK(self.0.saturating_add(rhs.0))
    }
}

impl Sub for DeltaK {
    type Output = DeltaK;

    fn sub(self, rhs: DeltaK) -> DeltaK {
        DeltaK(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for DeltaK {
    type Output = DeltaK;

    fn neg(self) -> DeltaK {
        DeltaK(-self.0)
    }
}

impl AddAssign for DeltaK {
    fn add_assign(&mut self, rhs: DeltaK) {
        *self = *self + rhs;
    }
}

/// Monotonic plant time in whole seconds since daemon start. One tick of the
/// control loop nominally advances this by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Ticks(u64);

impl Ticks {
    pub const ZERO: Ticks = Ticks(0);

    pub const fn from_secs(secs: u64) -> Ticks {
        Ticks(secs)
    }

    pub const fn as_secs(self) -> u64 {
        self.0
    }

    /// Seconds elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(self, earlier: Ticks) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn advanced(self, secs: u64) -> Ticks {
        Ticks(self.0.saturating_add(secs))
    }
}

impl From<Duration> for Ticks {
    fn from(d: Duration) -> Ticks {
        Ticks(d.as_secs())
    }
}

impl Display for Ticks {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}s", self.0)
    }
}
