use crate::alarm::AlarmSender;
use crate::config::Config;
use crate::error::CriticalFailure;
use crate::hw::Hardware;
use crate::measure::Ticks;
use crate::plant::Plant;
use crate::runtime::Runtime;
use crate::time_util::mytime::{RealTimeProvider, TimeProvider};
use log::{debug, error, info};
use logging::LoggingHandle;
use std::time::Duration;
use std::{fs, panic};
use tokio::runtime::Builder;
use tokio::runtime::Runtime as TokioRuntime;
#[cfg(target_family = "unix")]
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc::{Receiver, Sender};
use tracing::Subscriber;
use tracing_log::LogTracer;
use tracing_subscriber::EnvFilter;

mod alarm;
mod config;
mod error;
mod hw;
mod logging;
mod measure;
mod plant;
mod runtime;
mod scheduler;
mod storage;
mod time_util;

const CONFIG_FILE: &str = "hearthd.toml";

/// Target control loop cadence.
const TICK_PERIOD: Duration = Duration::from_secs(1);
/// How often the relay wear counters are persisted.
const STORE_DUMP_PERIOD: u64 = 15 * 60;

fn check_config() {
    let config =
        fs::read_to_string(CONFIG_FILE).expect("Unable to read config file. Is it missing?");
    let config = Config::from_str(&config).expect("Error reading config file");
    let hw = config.build_hardware().expect("Failed to set up hardware");
    config.build_plant(&hw).expect("Failed to assemble plant");
    config.build_runtime().expect("Failed to resolve runtime");
}

fn main() {
    // Make tokio convert log::info! etc. into tracing "events"
    LogTracer::init().expect("Should be able to make tokio subscribers listen to the log crate!");

    let logging_handle = init_logging_or_die();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        if args[0] == "check-config" {
            check_config();
            info!("Config OK!");
        } else {
            error!(
                "Unrecognized argument: {}, run with no args to run normally.",
                args[0]
            );
        }
        return;
    }

    info!("Preparing...");

    let config_str =
        fs::read_to_string(CONFIG_FILE).expect("Unable to read config file. Is it missing?");
    let config = Config::from_str(&config_str).expect("Error reading config file");

    // If anything panics mid-tick the relays are in an unknown state; drive
    // everything off through a fresh hardware handle before unwinding.
    let panic_config = config.clone();
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        error!("PANICKED: {:?}: driving all relays off", panic_info);
        emergency_all_off(&panic_config);
        default_hook(panic_info);
    }));

    let rt = Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .enable_io()
        .build()
        .expect("Expected to be able to make runtime");

    let mut hw = config.build_hardware().expect("Failed to set up hardware");
    let mut plant = config.build_plant(&hw).expect("Failed to assemble plant");
    let mut runtime = config.build_runtime().expect("Failed to resolve runtime");
    let store = config.open_store().expect("Failed to open storage");

    rt.block_on(hw.online()).expect("Hardware failed to come up");
    plant.online(&mut hw).expect("Plant failed to come online");
    storage::load_relay_counters(&store, &hw);

    let (alarms, alarm_rx) = alarm::channel();
    rt.spawn(alarm::run_printer(alarm_rx));

    let result = main_loop(
        &rt,
        &mut hw,
        &mut plant,
        &mut runtime,
        &store,
        alarms,
        logging_handle,
    );

    let now = RealTimeProvider::default().monotonic();
    plant.offline(&mut hw, now);
    rt.block_on(hw.output(now));
    rt.block_on(hw.offline());
    if let Err(e) = storage::save_relay_counters(&store, &hw) {
        error!("Failed to persist relay counters on shutdown: {}", e);
    }
    rt.shutdown_timeout(Duration::from_millis(500));

    match result {
        Ok(()) => info!("Stopped safely."),
        Err(failure) => error!("Stopped after critical failure: {}", failure),
    }
}

fn init_logging_or_die() -> LoggingHandle<EnvFilter, impl Subscriber> {
    logging::init_logging().expect("Failed to initialize logger")
}

/// Best effort: build a throwaway hardware handle and slam every relay off.
fn emergency_all_off(config: &Config) {
    let rt = match Builder::new_current_thread().enable_time().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("No runtime for emergency shutdown: {}", e);
            return;
        }
    };
    match config.build_hardware() {
        Ok(mut hw) => rt.block_on(async {
            if let Err(e) = hw.online().await {
                error!("Emergency hardware bring-up failed: {}", e);
                return;
            }
            hw.all_off(Ticks::ZERO).await;
            hw.offline().await;
        }),
        Err(e) => error!(
            "Failed to get access to hardware, anything could be on/off: {}",
            e
        ),
    }
}

fn main_loop(
    rt: &TokioRuntime,
    hw: &mut Hardware,
    plant: &mut Plant,
    runtime: &mut Runtime,
    store: &storage::Store,
    alarms: AlarmSender,
    logging_handle: LoggingHandle<EnvFilter, impl Subscriber>,
) -> Result<(), CriticalFailure> {
    let (signal_send, mut signal_recv) = tokio::sync::mpsc::channel(5);

    #[cfg(target_family = "unix")]
    {
        debug!("Subscribing to signals.");
        subscribe_signal(rt, SignalKind::interrupt(), signal_send.clone(), Signal::Stop);
        subscribe_signal(rt, SignalKind::terminate(), signal_send.clone(), Signal::Stop);
        subscribe_signal(
            rt,
            SignalKind::user_defined1(),
            signal_send.clone(),
            Signal::Reload,
        );
    }
    #[cfg(not(target_family = "unix"))]
    {
        let signal_send = signal_send.clone();
        ctrlc::set_handler(move || {
            info!("Received termination signal.");
            signal_send.blocking_send(Signal::Stop).unwrap();
        })
        .expect("Failed to attach kill handler.");
    }

    let time_provider = RealTimeProvider::default();
    let mut last_dump = Ticks::ZERO;
    let mut tick_count: u64 = 0;
    let mut hw_fail_ticks: u32 = 0;

    info!("Beginning main loop.");
    loop {
        tick_count += 1;
        if tick_count % 600 == 0 {
            info!(
                "Still alive, tick {}, system mode {}",
                tick_count,
                runtime.system_mode()
            );
        }

        let now = time_provider.monotonic();

        rt.block_on(hw.input(now));
        let modes = runtime.resolve(&time_provider);
        let errors = plant.tick(hw, &alarms, &modes, now);
        rt.block_on(hw.output(now));

        // Persisting sensor failures already raised alarms; a hardware-level
        // error here means relays may not be answering at all. One minute of
        // that and the plant state can no longer be trusted.
        if errors
            .iter()
            .any(|e| e.error == crate::error::ControlError::Hardware)
        {
            hw_fail_ticks += 1;
            error!("Actuator failure; continuing with affected entities failsafed");
            if hw_fail_ticks >= 60 {
                return Err(critical!(
                    "actuators unreachable for {} consecutive ticks",
                    hw_fail_ticks
                ));
            }
        } else {
            hw_fail_ticks = 0;
        }

        if now.since(last_dump) >= STORE_DUMP_PERIOD {
            if let Err(e) = storage::save_relay_counters(store, hw) {
                error!("Failed to persist relay counters: {}", e);
            }
            last_dump = now;
        }

        if let Some(signal) = rt.block_on(wait_or_get_signal(&mut signal_recv)) {
            info!("Received signal to {:?}", signal);
            match signal {
                Signal::Stop => {
                    info!("Stopping safely...");
                    return Ok(());
                }
                Signal::Reload => {
                    debug!("Reloading logging filter");
                    match logging::reload_log_level(&logging_handle) {
                        Ok(new_filter) => info!("Applied new logging filter: {}", new_filter),
                        Err(logging::ReloadLogLevelError::ReloadFailed(e)) => {
                            error!("Failed to apply new logging filter: {}", e)
                        }
                        Err(logging::ReloadLogLevelError::InvalidFilter(e)) => {
                            error!(
                                "Failed to parse new filter: {}, keeping the previous filter",
                                e
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(target_family = "unix")]
fn subscribe_signal(rt: &TokioRuntime, kind: SignalKind, sender: Sender<Signal>, signal: Signal) {
    rt.spawn(async move {
        let mut recv = tokio::signal::unix::signal(kind).expect("Failed to get signal handler");
        while let Some(()) = recv.recv().await {
            sender.send(signal.clone()).await.unwrap();
        }
    });
}

#[derive(Debug, Clone)]
enum Signal {
    Stop,
    Reload,
}

async fn wait_or_get_signal(recv: &mut Receiver<Signal>) -> Option<Signal> {
    let result = tokio::time::timeout(TICK_PERIOD, recv.recv()).await;
    match result {
        Ok(None) => None, // Channel closed
        Ok(Some(signal)) => Some(signal),
        Err(_) => None, // Timed out.
    }
}
