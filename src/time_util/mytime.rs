use crate::measure::Ticks;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use std::time::Instant;

/// Wall-clock time feeds the scheduler; the monotonic count feeds everything
/// in the plant, so tests can step time without touching the system clock.
pub trait TimeProvider {
    fn get_utc_time(&self) -> DateTime<Utc>;

    fn get_local_time(&self) -> DateTime<Local>;

    /// Naive local time the schedule calendar is evaluated against.
    fn schedule_time(&self) -> NaiveDateTime {
        self.get_local_time().naive_local()
    }

    /// Seconds since daemon start.
    fn monotonic(&self) -> Ticks;
}

pub struct RealTimeProvider {
    started: Instant,
}

impl Default for RealTimeProvider {
    fn default() -> Self {
        RealTimeProvider {
            started: Instant::now(),
        }
    }
}

impl TimeProvider for RealTimeProvider {
    fn get_utc_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn get_local_time(&self) -> DateTime<Local> {
        Local::now()
    }

    fn monotonic(&self) -> Ticks {
        Ticks::from(self.started.elapsed())
    }
}

#[derive(Debug)]
pub struct DummyTimeProvider {
    utc_time: DateTime<Utc>,
    monotonic: Ticks,
}

impl DummyTimeProvider {
    pub fn new(utc_time: DateTime<Utc>) -> Self {
        Self {
            utc_time,
            monotonic: Ticks::ZERO,
        }
    }

    /// Change the wall time without touching the monotonic count.
    pub fn set(&mut self, utc_time: DateTime<Utc>) {
        self.utc_time = utc_time;
    }

    /// Move both clocks forward.
    pub fn advance(&mut self, secs: u64) {
        self.utc_time += chrono::Duration::seconds(secs as i64);
        self.monotonic = self.monotonic.advanced(secs);
    }
}

impl Default for DummyTimeProvider {
    fn default() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap())
    }
}

impl TimeProvider for DummyTimeProvider {
    fn get_utc_time(&self) -> DateTime<Utc> {
        self.utc_time
    }

    fn get_local_time(&self) -> DateTime<Local> {
        Local.from_utc_datetime(&self.utc_time.naive_utc())
    }

    /// Tests run against the stored time as-is, independent of the host
    /// timezone.
    fn schedule_time(&self) -> NaiveDateTime {
        self.utc_time.naive_utc()
    }

    fn monotonic(&self) -> Ticks {
        self.monotonic
    }
}
