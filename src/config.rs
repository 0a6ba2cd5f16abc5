use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};
use sentinel_core::SentinelConfig;
use serde::{Deserialize, Serialize};

const CONFIG_NAMESPACE: &str = "sentinel";
const CONFIG_KEY: &str = "config";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // WiFi settings
    pub wifi_ssid: String,
    pub wifi_password: String,

    // Broker, topics and update transfer
    pub sentinel: SentinelConfig,
}

impl Default for Config {
    fn default() -> Self {
        // Values come from build.rs, which reads wifi_config.h (never committed)
        let wifi_ssid = env!("WIFI_SSID");
        let wifi_password = env!("WIFI_PASSWORD");

        log::info!("Config default: SSID='{}', Password={}",
            wifi_ssid,
            if wifi_password.is_empty() { "<empty>" } else { "<set>" }
        );

        let defaults = SentinelConfig::default();
        let broker_url = option_env!("SENTINEL_BROKER_URL")
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or(defaults.broker_url.clone());
        let device_id = option_env!("SENTINEL_DEVICE_ID")
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or(defaults.device_id.clone());

        Self {
            wifi_ssid: wifi_ssid.to_string(),
            wifi_password: wifi_password.to_string(),
            sentinel: SentinelConfig {
                broker_url,
                device_id,
                ..defaults
            },
        }
    }
}

impl Config {
    pub fn save(&self, partition: &EspDefaultNvsPartition) -> Result<()> {
        save_to_nvs(partition, self)?;
        log::info!("Configuration saved to NVS");
        Ok(())
    }
}

/// Load configuration from NVS, falling back to the compiled-in defaults.
pub fn load_or_default(partition: &EspDefaultNvsPartition) -> Result<Config> {
    match load_from_nvs(partition) {
        Ok(mut config) => {
            log::info!("Loaded configuration from NVS");

            // If NVS has empty WiFi credentials, use the compiled-in ones
            if config.wifi_ssid.is_empty() {
                let default_config = Config::default();
                log::warn!("NVS WiFi credentials empty, using compiled defaults: SSID='{}'", default_config.wifi_ssid);
                config.wifi_ssid = default_config.wifi_ssid;
                config.wifi_password = default_config.wifi_password;

                if let Err(e) = config.save(partition) {
                    log::warn!("Failed to save updated config with WiFi credentials: {:?}", e);
                }
            }

            Ok(config)
        }
        Err(e) => {
            log::warn!("Failed to load config from NVS: {:?}, using defaults", e);
            let config = Config::default();

            // Try to save default config to NVS for next time
            if let Err(save_err) = config.save(partition) {
                log::warn!("Failed to save default config to NVS: {:?}", save_err);
            }

            Ok(config)
        }
    }
}

fn load_from_nvs(partition: &EspDefaultNvsPartition) -> Result<Config> {
    let nvs = EspNvs::new(partition.clone(), CONFIG_NAMESPACE, true)?;

    let mut buf = vec![0u8; 2048]; // Max config size
    let data = nvs.get_blob(CONFIG_KEY, &mut buf)?
        .ok_or_else(|| anyhow::anyhow!("Config not found in NVS"))?;

    let config: Config = serde_json::from_slice(data)?;

    Ok(config)
}

fn save_to_nvs(partition: &EspDefaultNvsPartition, config: &Config) -> Result<()> {
    let mut nvs = EspNvs::new(partition.clone(), CONFIG_NAMESPACE, true)?;

    let json = serde_json::to_vec(config)?;
    nvs.set_blob(CONFIG_KEY, &json)?;

    Ok(())
}
