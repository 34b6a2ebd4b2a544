use anyhow::{Context, Result};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::prelude::*;
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};
use esp_idf_sys as _; // Binstart
use std::sync::Arc;

use log::{info, warn};

use ota_core::orchestrator::{FailedFn, Notify, ProgressFn};
use ota_core::shell::Shell;
use ota_core::{TaskQuiescence, TrustAnchor, UpdateHooks, Updater};

// Generate ESP-IDF app descriptor
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

mod config;
mod logging;
mod network;
mod ota;
mod platform;
mod system;
mod version;

use crate::network::WifiManager;
use crate::ota::{EspFlashUpdater, EspTlsTransport, FreeRtosScheduler};
use crate::platform::EspPlatform;
use crate::system::{ButtonEvent, UpdateButton};

type DeviceUpdater = Updater<EspTlsTransport, EspFlashUpdater, EspPlatform>;

// esp_http_client takes the PEM NUL-terminated
const ROOT_CA_PEM: &str = concat!(include_str!("../certs/root_ca.pem"), "\0");

// Service tasks the download itself runs on; never suspended
const RESERVED_TASKS: &[&str] = &["wifi", "tiT", "sys_evt", "ipc", "esp_timer"];

// A TLS session needs roughly this much heap
const MIN_FREE_HEAP: u32 = 48 * 1024;

const BUTTON_POLL_MS: u32 = 20;

fn main() -> Result<()> {
    esp_idf_svc::sys::link_patches();

    logging::init_logger(false).context("installing logger")?;
    info!("ESP32 Firmware Updater - {}", version::version_info());
    info!(
        "Boot reason: {}, running from partition {}",
        system::reset::get_reset_reason(),
        system::reset::running_partition()
    );

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let settings = config::load_or_default(&nvs);
    logging::set_debug(settings.debug);
    if !settings.log_level.is_empty() && !logging::set_max_level_from_str(&settings.log_level) {
        warn!("Ignoring unknown log level '{}'", settings.log_level);
    }

    let mut wifi = WifiManager::new(
        peripherals.modem,
        sys_loop,
        nvs.clone(),
        &settings.wifi_ssid,
        &settings.wifi_password,
    )?;
    if let Err(e) = wifi.connect() {
        // The boot check keeps waiting for the network
        warn!("WiFi connection failed: {:?}", e);
    }

    // Reaching the network is the health check for a freshly updated image
    system::reset::confirm_running_image();

    let trust_anchor = TrustAnchor::from_pem(ROOT_CA_PEM)?;
    let updater_config = settings
        .to_orchestrator_config(version::FIRMWARE_VERSION, trust_anchor)
        .context("update service configuration")?;
    info!("Manifest endpoint: {}", updater_config.manifest_url.as_str());

    let scheduler = FreeRtosScheduler::new();
    let quiescence = RESERVED_TASKS
        .iter()
        .fold(TaskQuiescence::new(scheduler), |q, prefix| q.reserve(prefix));

    let updater: Arc<DeviceUpdater> = Arc::new(
        Updater::new(
            updater_config,
            EspTlsTransport::new(),
            EspFlashUpdater::new()?,
            EspPlatform,
            || unsafe { esp_idf_sys::esp_get_free_heap_size() >= MIN_FREE_HEAP },
        )
        .with_auto_quiescence(quiescence)
        .with_hooks(status_hooks()),
    );

    let shell = Shell::new(scheduler);
    shell.spawn_boot_check(updater.clone())?;
    if updater.config().check_interval.is_some() {
        shell.spawn_periodic_check(updater.clone())?;
    }

    let mut button = UpdateButton::new(peripherals.pins.gpio0)?;
    info!("Press BOOT to check for updates, hold it to toggle debug logging");

    loop {
        match button.poll() {
            Some(ButtonEvent::Click) => match updater.check_now() {
                Ok(outcome) => info!("Manual update check: {:?}", outcome),
                Err(e) => warn!("Manual update check did not run: {}", e),
            },
            Some(ButtonEvent::LongPress) => {
                let debug = !updater.config().debug;
                updater.set_debug(debug);
                info!("Debug logging {}", if debug { "enabled" } else { "disabled" });
            }
            None => {}
        }
        FreeRtos::delay_ms(BUTTON_POLL_MS);
    }
}

/// Status notifications go to the serial log
fn status_hooks() -> UpdateHooks {
    let on_start: Notify = Arc::new(|| info!("Firmware update started"));
    let on_progress: ProgressFn = Arc::new(|percent: u8| info!("Firmware download {}%", percent));
    let on_succeeded: Notify = Arc::new(|| info!("Firmware update complete, restarting"));
    let on_failed: FailedFn = Arc::new(|reason: &str| warn!("Firmware update failed: {}", reason));
    let on_up_to_date: Notify =
        Arc::new(|| info!("Firmware {} is up to date", version::FIRMWARE_VERSION));

    UpdateHooks {
        on_start: Some(on_start),
        on_progress: Some(on_progress),
        on_succeeded: Some(on_succeeded),
        on_failed: Some(on_failed),
        on_up_to_date: Some(on_up_to_date),
        ..Default::default()
    }
}
