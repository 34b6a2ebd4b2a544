// Centralized version information

// Version reported to the update service; must match the manifest format
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

// Version info string for logging
pub fn version_info() -> String {
    format!("Firmware: {}, built for {}", FIRMWARE_VERSION, env!("CARGO_PKG_NAME"))
}
