//! Telewatch - Demo Entry Point
//!
//! Runs the telemetry core against an emulated device: a few variables are
//! watched by one local client while the "firmware" keeps changing them, and
//! every streamed update is logged.
//!
//! Usage: `telewatch [config.json]`

use anyhow::Context;
use serde_json::json;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use telewatch_rs::{
    api::TelemetryApi,
    config::{AppConfig, LoggingConfig},
    datastore::{self, Datastore},
    device::{DatastoreUpdater, DeviceHandler},
    dispatcher::RequestDispatcher,
    link::emulated::{lock_image, EmulatedDeviceLink, SharedMemoryImage},
    memory::SparseMemoryImage,
    streamer::ValueStreamer,
    types::{Endianness, VariableDescription, VariableType},
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const RAM_BASE: u64 = 0x2000_0000;
const COUNTER_ADDR: u64 = RAM_BASE;
const TEMPERATURE_ADDR: u64 = RAM_BASE + 4;
const ENABLED_ADDR: u64 = RAM_BASE + 8;

const DEMO_DURATION: Duration = Duration::from_secs(3);
const TICK: Duration = Duration::from_millis(50);

fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => AppConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AppConfig::load_or_default(None),
    };

    let _guard = init_logging(&config.logging)?;
    tracing::info!("Starting telewatch demo");

    // Emulated device memory
    let mut image = SparseMemoryImage::new();
    image.add_region(RAM_BASE, 64)?;
    image.write(TEMPERATURE_ADDR, &21.5f32.to_le_bytes())?;
    let link = EmulatedDeviceLink::new(image);
    let memory = link.memory();

    // Watchables
    let mut ds = Datastore::from_config(&config.datastore);
    let counter = ds.add_variable("/demo/counter", VariableDescription::new(COUNTER_ADDR, VariableType::U32))?;
    let temperature = ds.add_variable(
        "/demo/temperature",
        VariableDescription::new(TEMPERATURE_ADDR, VariableType::F32),
    )?;
    let enabled = ds.add_variable("/demo/enabled", VariableDescription::new(ENABLED_ADDR, VariableType::Bool))?;
    let counter_alias = ds.add_alias("/alias/counter", counter)?;
    let datastore = ds.into_shared();

    // Device side
    let dispatcher = RequestDispatcher::new(config.device.max_pending_requests);
    let updater = DatastoreUpdater::new(
        datastore.clone(),
        Endianness::Little,
        config.device.max_pending_requests / 2,
    );
    let handle = DeviceHandler::new(Box::new(link), dispatcher, &config.device)
        .with_updater(updater)
        .spawn()
        .context("starting device handler")?;

    // Client side
    let streamer = ValueStreamer::new().into_shared();
    let mut api = TelemetryApi::new(datastore.clone(), streamer, config.api.clone(), &config.throttling)?;
    let conn = api.open_connection();

    let requests = [
        json!({ "cmd": "get_watchable_count", "reqid": 1 }),
        json!({ "cmd": "get_watchable_list", "reqid": 2 }),
        json!({ "cmd": "subscribe_watchable", "reqid": 3, "watchables": [counter_alias, temperature, enabled] }),
        json!({ "cmd": "write_value", "reqid": 4, "updates": [{ "watchable": enabled, "value": true }] }),
    ];
    for request in requests {
        for reply in api.handle_request(conn, request) {
            tracing::info!("<- {}", reply);
        }
    }

    let started = Instant::now();
    let mut ticks: u32 = 0;
    while started.elapsed() < DEMO_DURATION {
        ticks += 1;
        run_firmware(&memory, ticks)?;

        for (conn, message) in api.process() {
            tracing::info!("-> client {}: {}", conn, message);
        }
        std::thread::sleep(TICK);
    }

    api.close_connection(conn);

    let stats = handle.stats();
    tracing::info!(
        "Device stats: {} requests, {} ok, {} failed, {} timeouts ({:.1}% success)",
        stats.requests_sent,
        stats.responses_ok,
        stats.responses_failed,
        stats.timeouts,
        stats.success_rate()
    );
    tracing::info!(
        "Throttler estimate: {:.0} bit/s, {} entries in store",
        api.throttler().estimated_bitrate(),
        datastore::lock(&datastore).len()
    );

    handle.stop();
    tracing::info!("Telewatch demo finished");
    Ok(())
}

/// One step of the emulated firmware: bump the counter, drift the temperature
fn run_firmware(memory: &SharedMemoryImage, tick: u32) -> anyhow::Result<()> {
    let mut image = lock_image(memory);
    image.write(COUNTER_ADDR, &tick.to_le_bytes())?;
    let temperature = 21.5 + (tick as f32 / 10.0).sin();
    image.write(TEMPERATURE_ADDR, &temperature.to_le_bytes())?;
    Ok(())
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("log file {} has no file name", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}
