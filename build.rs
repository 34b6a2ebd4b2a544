use std::fs;
use std::path::Path;

const DEVICE_CONFIG: &str = "device_config.h";
const DEFINES: &[&str] = &["WIFI_SSID", "WIFI_PASSWORD", "OTA_MANIFEST_URL"];

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF
    embuild::espidf::sysenv::output();

    println!("cargo:rerun-if-changed={}", DEVICE_CONFIG);
    println!("cargo:rerun-if-changed=certs/root_ca.pem");

    // Compiled-in defaults; NVS settings override them at runtime
    let contents = if Path::new(DEVICE_CONFIG).exists() {
        fs::read_to_string(DEVICE_CONFIG)?
    } else {
        println!("cargo:warning={} not found! Copy {}.example to {} and fill in your settings.", DEVICE_CONFIG, DEVICE_CONFIG, DEVICE_CONFIG);
        String::new()
    };

    for name in DEFINES {
        let directive = format!("#define {}", name);
        let value = contents
            .lines()
            .find(|line| line.trim_start().starts_with(&directive))
            .and_then(|line| line.split('"').nth(1))
            .unwrap_or("");
        println!("cargo:rustc-env={}={}", name, value);
    }

    Ok(())
}
