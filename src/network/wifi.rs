use anyhow::{bail, Context, Result};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    nvs::EspDefaultNvsPartition,
    wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi},
};

const CONNECT_ATTEMPTS: u32 = 3;

pub struct WifiManager {
    wifi: BlockingWifi<EspWifi<'static>>,
    pub ssid: String,
}

impl WifiManager {
    pub fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        ssid: &str,
        password: &str,
    ) -> Result<Self> {
        log::info!("Initializing WiFi manager for SSID: '{}'", ssid);

        if ssid.is_empty() {
            log::error!("WiFi SSID is empty! Check device_config.h");
            bail!("WiFi SSID cannot be empty");
        }

        let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;

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
        esp_wifi.set_configuration(&cfg)?;

        let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

        log::info!("WiFi manager initialized");
        Ok(Self { wifi, ssid: ssid.to_string() })
    }

    /// Start the station and block until DHCP has assigned an address
    pub fn connect(&mut self) -> Result<()> {
        self.wifi.start().context("starting WiFi")?;

        let mut attempt = 1;
        loop {
            log::info!("Connecting to {} (attempt {}/{})...", self.ssid, attempt, CONNECT_ATTEMPTS);
            match self.wifi.connect() {
                Ok(()) => break,
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    log::warn!("WiFi connect failed: {:?}", e);
                    attempt += 1;
                }
                Err(e) => return Err(e).context("connecting to WiFi"),
            }
        }

        log::info!("Waiting for DHCP...");
        self.wifi.wait_netif_up().context("waiting for DHCP")?;

        // Power save drops connections during long transfers
        unsafe {
            use esp_idf_sys::*;
            let result = esp_wifi_set_ps(wifi_ps_type_t_WIFI_PS_NONE);
            if result != ESP_OK {
                log::warn!("Failed to set WiFi power save mode: {:?}", result);
            }
        }

        log::info!("WiFi connected, IP: {}", self.get_ip().unwrap_or_default());
        Ok(())
    }

    pub fn get_ip(&self) -> Option<String> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|ip_info| format!("{}", ip_info.ip))
    }
}
