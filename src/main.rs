use anyhow::Result;
use log::info;

mod logging;
mod version;

#[cfg(target_os = "espidf")]
mod config;
#[cfg(target_os = "espidf")]
mod network;
#[cfg(target_os = "espidf")]
mod platform;

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

#[cfg(target_os = "espidf")]
const LOOP_PERIOD_MS: u32 = 100;

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    use esp_idf_hal::{delay::FreeRtos, prelude::Peripherals};
    use esp_idf_svc::{
        eventloop::EspSystemEventLoop,
        nvs::EspDefaultNvsPartition,
        sntp::{EspSntp, SyncStatus},
    };
    use log::warn;
    use sentinel_core::{UpdateOrchestrator, UpdateWatchdog};

    use crate::network::wifi::WifiLink;
    use crate::platform::system::{feed_task_watchdog, reset_reason, watch_current_task};
    use crate::platform::{
        Connectivity, EspClock, EspSystemControl, HttpImageInstaller, LinkEvent, MqttLink,
        NvsLedgerStore,
    };

    esp_idf_svc::sys::link_patches();
    logging::init_logger().map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    info!("ESP32 OTA Sentinel {}", version::full_version());
    info!("Boot reason: {}", reset_reason());

    // Boot accounting comes first: a crash anywhere below counts as a failed
    // attempt of this image.
    let nvs = EspDefaultNvsPartition::take()?;
    let store = NvsLedgerStore::open(&nvs)?;
    let mut watchdog = UpdateWatchdog::new(store, EspClock, EspSystemControl);
    watchdog.initialize();

    let config = config::load_or_default(&nvs)?;
    info!(
        "Device '{}', broker {}",
        config.sentinel.device_id, config.sentinel.broker_url
    );

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let mut wifi = WifiLink::new(
        peripherals.modem,
        sys_loop,
        nvs.clone(),
        &config.wifi_ssid,
        &config.wifi_password,
    )?;
    let sntp = EspSntp::new_default()?;

    let (link, events) = MqttLink::connect(&config.sentinel)?;
    let broker = link.connection_flag();
    let mut orchestrator = UpdateOrchestrator::new(
        HttpImageInstaller::new(&config.sentinel),
        link,
        config.sentinel.report_settle(),
    );

    watch_current_task();
    let mut needs_subscribe = false;

    info!("Entering control loop");
    loop {
        feed_task_watchdog();
        wifi.maintain();

        while let Ok(event) = events.try_recv() {
            match event {
                LinkEvent::Connected => {
                    info!("Broker connected");
                    needs_subscribe = true;
                }
                LinkEvent::Disconnected => warn!("Broker connection lost"),
                LinkEvent::Instruction(payload) => {
                    let outcome = orchestrator.handle_message(&mut watchdog, &payload);
                    info!("Update instruction handled: {:?}", outcome);
                }
            }
        }

        if needs_subscribe {
            match orchestrator.publisher_mut().subscribe_commands() {
                Ok(()) => needs_subscribe = false,
                Err(e) => warn!("Subscribe failed, retrying: {:?}", e),
            }
        }

        let links = Connectivity {
            wifi: &wifi,
            broker: &broker,
        };
        orchestrator.poll(&mut watchdog, &links);
        watchdog.observe_time_sync(sntp.get_sync_status() == SyncStatus::Completed);

        FreeRtos::delay_ms(LOOP_PERIOD_MS);
    }
}

/// Host build: the firmware only runs on the ESP32. The probation and update
/// logic lives in `sentinel-core` and is exercised by its test suite.
#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    logging::init_logger().map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;
    info!("ESP32 OTA Sentinel {}", version::full_version());
    info!("Build for target_os = \"espidf\" to get firmware; run `cargo test -p sentinel-core` for the logic");
    Ok(())
}
