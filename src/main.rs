use log::LevelFilter;
use std::sync::Arc;
use tokio::sync::mpsc;

// --------------------------------------------------------------------------------------------------------------

mod configuration;
use configuration::config::SettingsStore;

mod models;

mod handlers;
use handlers::bridge::bus::{pump_events, HttpBus};
use handlers::bridge::monitor::HttpMonitor;
use handlers::bridge::telemetry::HttpTelemetry;
use handlers::ems::controller::EmsController;

// --------------------------------------------------------------------------------------------------------------

const SETTINGS_FILE: &str = "settings.json";

// --------------------------------------------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let store = match SettingsStore::load(SETTINGS_FILE) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to load {}: {}", SETTINGS_FILE, e);
            panic!("Cannot start without settings");
        }
    };

    // Initialise logger. The backend filter stays wide open and the global
    // max level does the gating, so the debug-logs switch can be flipped at
    // runtime without rebuilding the logger.
    let level = if store.settings.write_debug_logs {
        LevelFilter::Debug
    } else {
        store.settings.log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info)
    };
    if let Err(e) = env_logger::Builder::new().filter_level(LevelFilter::Debug).try_init() {
        eprintln!("Failed to initialise logger: {}", e);
        panic!("Cannot start without logging");
    }
    log::set_max_level(level);

    log::info!("=== S2 Energy Management System starting ===");
    log::info!("Bridge URL:    {}", store.settings.bridge_url);
    log::info!("Mode:          {:?}", store.settings.ems_mode());
    log::info!("Loop interval: {}s", store.settings.control_loop_interval_s);
    log::info!("Reservation:   \"{}\"", store.settings.battery_reservation_equation);

    let client = reqwest::Client::new();
    let base_url = store.settings.bridge_url.clone();

    let bus = Arc::new(HttpBus::new(client.clone(), &base_url));
    let monitor = Arc::new(HttpMonitor::new(client.clone(), &base_url));
    let telemetry = Box::new(HttpTelemetry::spawn(client.clone(), base_url.clone()));

    // ----------------------------------------------------------------------------------------------------------
    // The controller owns every session and runs all periodic work from one
    // cooperative loop; the event pump feeds it bus signals and device events.
    let (event_tx, event_rx) = mpsc::channel(64);
    tokio::spawn(pump_events(client, base_url, event_tx));

    EmsController::new(bus, monitor, telemetry, store).run(event_rx).await;

    log::info!("=== S2 Energy Management System stopped ===");
}
