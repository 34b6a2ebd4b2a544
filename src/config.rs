use std::time::Duration;

use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use serde::{Deserialize, Serialize};

use ota_core::{OrchestratorConfig, SizePolicy, TrustAnchor};

const CONFIG_NAMESPACE: &str = "updater";
const CONFIG_KEY: &str = "config";
const MAX_CONFIG_SIZE: usize = 1024;

/// Device settings persisted in NVS as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // WiFi settings
    pub wifi_ssid: String,
    pub wifi_password: String,

    // Update service
    pub manifest_url: String,
    pub max_retries: u8,
    pub timeout_secs: u32,
    pub boot_check_delay_secs: u32,
    /// 0 disables the periodic check
    pub check_interval_hours: u32,
    pub auto_quiesce: bool,
    pub require_content_length: bool,

    // Diagnostics
    pub debug: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        // Compiled-in values come from device_config.h via build.rs
        let wifi_ssid = env!("WIFI_SSID");
        let wifi_password = env!("WIFI_PASSWORD");

        Self {
            wifi_ssid: wifi_ssid.to_string(),
            wifi_password: wifi_password.to_string(),
            manifest_url: env!("OTA_MANIFEST_URL").to_string(),
            max_retries: ota_core::config::DEFAULT_MAX_RETRIES,
            timeout_secs: ota_core::config::DEFAULT_TIMEOUT.as_secs() as u32,
            boot_check_delay_secs: ota_core::config::DEFAULT_BOOT_CHECK_DELAY.as_secs() as u32,
            check_interval_hours: 24,
            auto_quiesce: true,
            require_content_length: false,
            debug: false,
            log_level: String::new(),
        }
    }
}

impl Config {
    pub fn save(&self, nvs: &EspDefaultNvsPartition) -> Result<()> {
        let mut store = EspNvs::<NvsDefault>::new(nvs.clone(), CONFIG_NAMESPACE, true)?;
        let json = serde_json::to_vec(self)?;
        store.set_blob(CONFIG_KEY, &json)?;
        log::info!("Configuration saved to NVS");
        Ok(())
    }

    /// Build the update service settings from the stored values
    pub fn to_orchestrator_config(&self, current_version: &str, trust_anchor: TrustAnchor) -> Result<OrchestratorConfig> {
        let check_interval = match self.check_interval_hours {
            0 => None,
            hours => Some(Duration::from_secs(u64::from(hours) * 3600)),
        };
        let size_policy = if self.require_content_length {
            SizePolicy::RequireDeclared
        } else {
            SizePolicy::AllowUnknown
        };

        let config = OrchestratorConfig::new(&self.manifest_url, current_version, trust_anchor)?
            .with_max_retries(self.max_retries)?
            .with_timeout(Duration::from_secs(u64::from(self.timeout_secs)))
            .with_boot_check_delay(Duration::from_secs(u64::from(self.boot_check_delay_secs)))
            .with_check_interval(check_interval)
            .with_auto_quiesce(self.auto_quiesce)
            .with_size_policy(size_policy)
            .with_debug(self.debug);
        Ok(config)
    }
}

pub fn load_or_default(nvs: &EspDefaultNvsPartition) -> Config {
    match load_from_nvs(nvs) {
        Ok(mut config) => {
            log::info!("Loaded configuration from NVS");

            // Empty credentials in NVS fall back to the compiled-in ones
            if config.wifi_ssid.is_empty() {
                let defaults = Config::default();
                log::warn!("NVS WiFi credentials empty, using compiled defaults: SSID='{}'", defaults.wifi_ssid);
                config.wifi_ssid = defaults.wifi_ssid;
                config.wifi_password = defaults.wifi_password;
            }
            if config.manifest_url.is_empty() {
                config.manifest_url = Config::default().manifest_url;
            }
            config
        }
        Err(e) => {
            log::warn!("Failed to load config from NVS: {:?}, using defaults", e);
            let config = Config::default();
            if let Err(save_err) = config.save(nvs) {
                log::warn!("Failed to save default config to NVS: {:?}", save_err);
            }
            config
        }
    }
}

fn load_from_nvs(nvs: &EspDefaultNvsPartition) -> Result<Config> {
    let store = EspNvs::<NvsDefault>::new(nvs.clone(), CONFIG_NAMESPACE, true)?;

    let mut buf = vec![0u8; MAX_CONFIG_SIZE];
    let data = store
        .get_blob(CONFIG_KEY, &mut buf)?
        .ok_or_else(|| anyhow::anyhow!("Config not found in NVS"))?;

    Ok(serde_json::from_slice(data)?)
}
