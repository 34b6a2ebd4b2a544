use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ota_core::manifest::{is_secure_url, parse_manifest, Manifest};
use ota_core::orchestrator::is_update;
use ota_core::{ManifestClient, TrustAnchor, UrlString, VersionString};

mod transport;

use transport::{HostPlatform, RustlsTransport};

const HASH_CHUNK: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "ota")]
#[command(about = "ESP32 firmware update manifest tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Print the core's log records to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Print the manifest JSON for a firmware image
    Manifest {
        /// Firmware image to describe
        firmware: PathBuf,

        /// Version identifier the image reports
        #[arg(long)]
        version: String,

        /// HTTPS URL the device downloads the image from
        #[arg(long)]
        url: String,

        /// Write the manifest here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Fetch a live manifest the way the device does
    Check {
        /// Manifest endpoint
        url: String,

        /// PEM root certificate the server must chain to
        #[arg(long)]
        ca: PathBuf,

        /// Version to compare against
        #[arg(long)]
        current: Option<String>,

        /// Fetch attempts
        #[arg(long, default_value = "3")]
        retries: u8,

        /// Request timeout in seconds
        #[arg(long, default_value = "15")]
        timeout: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    if cli.verbose {
        install_stderr_logger();
    }

    let result = match cli.command {
        Command::Manifest { firmware, version, url, output } => {
            manifest_command(&firmware, &version, &url, output.as_deref())
        }
        Command::Check { url, ca, current, retries, timeout } => {
            check_command(&url, &ca, current.as_deref(), retries, Duration::from_secs(timeout))
        }
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "❌".red(), e);
        std::process::exit(1);
    }
}

fn manifest_command(firmware: &Path, version: &str, url: &str, output: Option<&Path>) -> Result<()> {
    let mut file = File::open(firmware).with_context(|| format!("opening {}", firmware.display()))?;
    let size = file.metadata()?.len();

    let pb = ProgressBar::new(size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Hashing [{bar:40.cyan/blue}] {bytes}/{total_bytes}")?
            .progress_chars("#>-"),
    );

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        pb.inc(n as u64);
    }
    pb.finish_and_clear();

    let digest: [u8; 32] = hasher.finalize().into();
    let json = render_manifest(version, url, &digest)?;

    match output {
        Some(path) => {
            fs::write(path, format!("{}\n", json)).with_context(|| format!("writing {}", path.display()))?;
            eprintln!("{} Manifest for {} bytes written to {}", "✅".green(), size, path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Manifest JSON the device accepts for this image
fn render_manifest(version: &str, url: &str, digest: &[u8; 32]) -> Result<String> {
    if !is_secure_url(url) {
        bail!("download URL must start with https://");
    }
    VersionString::new(version).context("version")?;
    UrlString::new(url).context("url")?;

    let json = serde_json::to_string_pretty(&serde_json::json!({
        "version": version,
        "url": url,
        "sha256": hex::encode(digest),
    }))?;

    // Same validation the device runs
    parse_manifest(json.as_bytes()).context("generated manifest rejected")?;
    Ok(json)
}

fn check_command(url: &str, ca: &Path, current: Option<&str>, retries: u8, timeout: Duration) -> Result<()> {
    let pem = fs::read_to_string(ca).with_context(|| format!("reading {}", ca.display()))?;
    let trust_anchor = TrustAnchor::from_pem(Box::leak(pem.into_boxed_str()))?;
    let endpoint = UrlString::new(url).context("manifest URL")?;
    if !is_secure_url(url) {
        bail!("manifest URL must start with https://");
    }

    let client = ManifestClient::new(endpoint, trust_anchor).with_retries(retries, Duration::from_secs(2));
    let mut transport = RustlsTransport::new(Some(timeout));
    let platform = HostPlatform::new();

    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("Fetching {}", url));
    spinner.enable_steady_tick(Duration::from_millis(100));
    let manifest = client.fetch(&mut transport, &platform);
    spinner.finish_and_clear();

    let manifest = manifest?;
    println!("{}", describe(&manifest, current));
    Ok(())
}

fn describe(manifest: &Manifest, current: Option<&str>) -> String {
    let mut lines = vec![
        format!("{} Manifest OK", "✅".green()),
        format!("   version: {}", manifest.version.as_str()),
        format!("   url:     {}", manifest.url.as_str()),
    ];
    if let Some(digest) = &manifest.sha256 {
        lines.push(format!("   sha256:  {}", hex::encode(digest)));
    }
    match current {
        Some(current) if is_update(current, manifest.version.as_str()) => {
            lines.push(format!("{} Update available: {} -> {}", "⬆".yellow(), current, manifest.version.as_str()));
        }
        Some(current) => lines.push(format!("{} {} is up to date", "✓".green(), current)),
        None => {}
    }
    lines.join("\n")
}

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        eprintln!("{} [{}] {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn install_stderr_logger() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Debug);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendered_manifest_is_accepted_by_device_parser() {
        let digest = [0xab; 32];
        let json = render_manifest("1.2.0", "https://bucket.s3.amazonaws.com/fw.bin", &digest).unwrap();
        let manifest = parse_manifest(json.as_bytes()).unwrap();
        assert_eq!(manifest.version.as_str(), "1.2.0");
        assert_eq!(manifest.sha256, Some(digest));
    }

    #[test]
    fn test_insecure_download_url_refused() {
        assert!(render_manifest("1.2.0", "http://bucket/fw.bin", &[0; 32]).is_err());
    }

    #[test]
    fn test_oversized_version_refused() {
        let version = "v".repeat(40);
        assert!(render_manifest(&version, "https://bucket/fw.bin", &[0; 32]).is_err());
    }

    #[test]
    fn test_describe_reports_update_decision() {
        let manifest = parse_manifest(br#"{"version":"2.0.0","url":"https://x/fw.bin"}"#).unwrap();
        let update = describe(&manifest, Some("1.0.0"));
        assert!(update.contains("Update available: 1.0.0 -> 2.0.0"));

        let current = describe(&manifest, Some("2.0.0"));
        assert!(current.contains("2.0.0 is up to date"));
        assert!(!describe(&manifest, None).contains("sha256"));
    }
}
