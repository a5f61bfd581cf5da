use backtrace::Backtrace;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Everything the plant core can report. Sensor variants are recoverable
/// (the entity enters its failsafe and keeps being ticked), `Safety` is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("generic failure")]
    Generic,
    #[error("invalid argument")]
    Invalid,
    #[error("misconfigured")]
    Misconfigured,
    #[error("not configured")]
    NotConfigured,
    #[error("offline")]
    Offline,
    #[error("already exists")]
    Exists,
    #[error("not found")]
    NotFound,
    #[error("not implemented")]
    NotImplemented,
    #[error("initialization failed")]
    Init,
    #[error("hardware error")]
    Hardware,
    #[error("storage error")]
    Store,
    #[error("version mismatch")]
    Mismatch,
    #[error("safety limit exceeded")]
    Safety,
    #[error("within deadzone")]
    Deadzone,
    #[error("invalid mode")]
    InvalidMode,
    #[error("sensor value invalid")]
    SensorInval,
    #[error("sensor shorted")]
    SensorShort,
    #[error("sensor disconnected")]
    SensorDiscon,
    #[error("sensor never set")]
    SensorUnset,
    #[error("sensor value stale")]
    Stale,
    #[error("empty")]
    Empty,
    #[error("truncated")]
    Trunc,
}

impl ControlError {
    /// Sensor-sourced errors are recovered locally by entering failsafe;
    /// everything else propagates.
    pub fn is_sensor(&self) -> bool {
        matches!(
            self,
            ControlError::SensorInval
                | ControlError::SensorShort
                | ControlError::SensorDiscon
                | ControlError::SensorUnset
                | ControlError::Stale
        )
    }
}

/// A fault after which the plant state can no longer be trusted, e.g. a relay
/// that could not be driven to its safe state. Carries a backtrace since by
/// the time this surfaces in main the interesting context is long gone.
#[derive(Debug)]
pub struct CriticalFailure {
    description: String,
    trace: Backtrace,
}

impl CriticalFailure {
    pub fn new(description: impl Into<String>) -> Self {
        CriticalFailure {
            description: description.into(),
            trace: Backtrace::new(),
        }
    }
}

impl Display for CriticalFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{:?}", self.description, self.trace)
    }
}

impl From<ControlError> for CriticalFailure {
    fn from(err: ControlError) -> Self {
        CriticalFailure::new(format!("unrecoverable control error: {}", err))
    }
}

#[macro_export]
macro_rules! critical {
    ($($arg:tt)*) => {
        $crate::error::CriticalFailure::new(format!($($arg)*))
    };
}
