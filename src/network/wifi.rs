use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    nvs::EspDefaultNvsPartition,
    wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi},
};

const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Station-mode Wi-Fi driven from the control loop without blocking it.
/// Probation has to keep ticking while the link comes up, so connection
/// attempts are fire-and-forget and progress is read back via `is_up`.
pub struct WifiLink {
    wifi: EspWifi<'static>,
    ssid: String,
    last_attempt: Option<Instant>,
    was_up: bool,
}

impl WifiLink {
    pub fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        ssid: &str,
        password: &str,
    ) -> Result<Self> {
        log::info!("Initializing WiFi for SSID: '{}'", ssid);

        if ssid.is_empty() {
            log::error!("WiFi SSID is empty! Check wifi_config.h");
            bail!("WiFi SSID cannot be empty");
        }

        let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs))?;

        let cfg = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid SSID format: {}", ssid))?,
            password: password
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid password format"))?,
            auth_method: if password.is_empty() {
                log::warn!("WiFi password is empty, using open network");
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });

        wifi.set_configuration(&cfg)?;
        wifi.start()?;

        // Power save drops the link under sustained traffic such as an image download
        unsafe {
            use esp_idf_sys::*;
            let result = esp_wifi_set_ps(wifi_ps_type_t_WIFI_PS_NONE);
            if result != ESP_OK {
                log::warn!("Failed to set WiFi power save mode: {:?}", result);
            }
        }

        Ok(Self {
            wifi,
            ssid: ssid.to_string(),
            last_attempt: None,
            was_up: false,
        })
    }

    /// Kick off a (re)connect when the link is down and the last attempt is
    /// old enough. Call once per loop iteration.
    pub fn maintain(&mut self) {
        let up = self.is_up();
        if up != self.was_up {
            if up {
                let ip = self
                    .wifi
                    .sta_netif()
                    .get_ip_info()
                    .map(|info| info.ip.to_string())
                    .unwrap_or_default();
                log::info!("WiFi connected to {} ({})", self.ssid, ip);
            } else {
                log::warn!("WiFi link to {} lost", self.ssid);
            }
            self.was_up = up;
        }
        if up || self.wifi.is_connected().unwrap_or(false) {
            return;
        }

        let due = self
            .last_attempt
            .map_or(true, |at| at.elapsed() >= RECONNECT_INTERVAL);
        if due {
            log::info!("Connecting to {}...", self.ssid);
            if let Err(e) = self.wifi.connect() {
                log::warn!("WiFi connect request failed: {:?}", e);
            }
            self.last_attempt = Some(Instant::now());
        }
    }

    /// Associated and holding an address.
    pub fn is_up(&self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }
}
