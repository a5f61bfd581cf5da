//! Stateless alarm path. Entities raise an alarm every tick the condition
//! holds; nothing here remembers past conditions. The printer drains the
//! queue at a bounded rate so a wedged sensor cannot flood the log.

use itertools::Itertools;
use log::{error, info};
use std::time::Duration;
use tokio::sync::mpsc;

const PRINT_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Alarm {
    pub origin: String,
    pub message: String,
}

/// Cheap to clone; every entity holds one.
#[derive(Clone)]
pub struct AlarmSender {
    tx: mpsc::UnboundedSender<Alarm>,
}

impl AlarmSender {
    pub fn raise(&self, origin: &str, message: impl Into<String>) {
        let alarm = Alarm {
            origin: origin.to_owned(),
            message: message.into(),
        };
        // A dropped receiver only happens during shutdown; nothing to do.
        let _ = self.tx.send(alarm);
    }
}

pub struct AlarmReceiver {
    rx: mpsc::UnboundedReceiver<Alarm>,
}

impl AlarmReceiver {
    /// Drains everything currently queued.
    pub fn drain(&mut self) -> Vec<Alarm> {
        let mut alarms = Vec::new();
        while let Ok(alarm) = self.rx.try_recv() {
            alarms.push(alarm);
        }
        alarms
    }
}

pub fn channel() -> (AlarmSender, AlarmReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AlarmSender { tx }, AlarmReceiver { rx })
}

/// Runs until the sender side is gone. Each period the queue is drained,
/// identical alarms are collapsed with a repeat count, and the batch printed.
pub async fn run_printer(mut receiver: AlarmReceiver) {
    let mut interval = tokio::time::interval(PRINT_PERIOD);
    loop {
        interval.tick().await;
        let alarms = receiver.drain();
        if alarms.is_empty() {
            continue;
        }
        let counted = alarms.iter().counts();
        for (alarm, count) in counted {
            if count > 1 {
                error!(target: "alarm", "[{}] {} (x{})", alarm.origin, alarm.message, count);
            } else {
                error!(target: "alarm", "[{}] {}", alarm.origin, alarm.message);
            }
        }
        info!(target: "alarm", "{} alarm(s) this period", alarms.len());
    }
}
