/// Orchestrator configuration that can be tested independently
use core::fmt;
use core::time::Duration;

use thiserror::Error;

use crate::bounded::{TextError, UrlString, VersionString};
use crate::manifest::SECURE_SCHEME;

pub const DEFAULT_MAX_RETRIES: u8 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_BOOT_CHECK_DELAY: Duration = Duration::from_secs(10);

const PEM_CERT_HEADER: &str = "-----BEGIN CERTIFICATE-----";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("manifest endpoint: {0}")]
    Endpoint(TextError),
    #[error("manifest endpoint must use {SECURE_SCHEME}")]
    InsecureEndpoint,
    #[error("current version: {0}")]
    Version(TextError),
    #[error("trust anchor is not a PEM certificate")]
    TrustAnchor,
    #[error("retry count must be at least 1")]
    Retries,
}

/// How the transfer engine treats a response without a usable Content-Length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizePolicy {
    /// Stream until the connection closes
    #[default]
    AllowUnknown,
    /// Refuse the transfer before touching flash
    RequireDeclared,
}

/// Root certificate used to verify the server, as PEM text
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TrustAnchor(&'static str);

impl TrustAnchor {
    pub fn from_pem(pem: &'static str) -> Result<Self, ConfigError> {
        if !pem.contains(PEM_CERT_HEADER) {
            return Err(ConfigError::TrustAnchor);
        }
        Ok(Self(pem))
    }

    /// PEM text without any trailing NUL terminator
    pub fn pem(&self) -> &'static str {
        self.0.trim_end_matches('\0')
    }

    /// Raw bytes including the terminator, if the PEM was stored NUL-terminated
    pub fn nul_terminated(&self) -> Option<&'static [u8]> {
        self.0.ends_with('\0').then_some(self.0.as_bytes())
    }
}

impl fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrustAnchor({} bytes)", self.pem().len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub manifest_url: UrlString,
    pub current_version: VersionString,
    pub trust_anchor: TrustAnchor,
    pub max_retries: u8,
    /// Longest tolerated gap between received firmware bytes
    pub timeout: Duration,
    pub retry_delay: Duration,
    /// Pause after quiescence so suspended units reach a safe point
    pub settle_delay: Duration,
    /// Pause between the success notification and the restart request
    pub restart_delay: Duration,
    pub boot_check_delay: Duration,
    pub check_interval: Option<Duration>,
    pub auto_quiesce: bool,
    pub debug: bool,
    pub size_policy: SizePolicy,
    pub resume_before_restart: bool,
}

impl OrchestratorConfig {
    pub fn new(
        manifest_url: &str,
        current_version: &str,
        trust_anchor: TrustAnchor,
    ) -> Result<Self, ConfigError> {
        let manifest_url = UrlString::new(manifest_url).map_err(ConfigError::Endpoint)?;
        if !manifest_url.starts_with(SECURE_SCHEME) {
            return Err(ConfigError::InsecureEndpoint);
        }
        let current_version = VersionString::new(current_version).map_err(ConfigError::Version)?;

        Ok(Self {
            manifest_url,
            current_version,
            trust_anchor,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            settle_delay: DEFAULT_SETTLE_DELAY,
            restart_delay: DEFAULT_RESTART_DELAY,
            boot_check_delay: DEFAULT_BOOT_CHECK_DELAY,
            check_interval: None,
            auto_quiesce: true,
            debug: true,
            size_policy: SizePolicy::AllowUnknown,
            resume_before_restart: false,
        })
    }

    /// Build the endpoint from an API base URL and a path on it
    pub fn from_endpoint(
        base_url: &str,
        path: &str,
        current_version: &str,
        trust_anchor: TrustAnchor,
    ) -> Result<Self, ConfigError> {
        let mut url = String::with_capacity(base_url.len() + path.len());
        url.push_str(base_url);
        url.push_str(path);
        Self::new(&url, current_version, trust_anchor)
    }

    pub fn with_max_retries(mut self, retries: u8) -> Result<Self, ConfigError> {
        if retries == 0 {
            return Err(ConfigError::Retries);
        }
        self.max_retries = retries;
        Ok(self)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    #[must_use]
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    #[must_use]
    pub fn with_boot_check_delay(mut self, delay: Duration) -> Self {
        self.boot_check_delay = delay;
        self
    }

    #[must_use]
    pub fn with_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.check_interval = interval;
        self
    }

    #[must_use]
    pub fn with_auto_quiesce(mut self, enabled: bool) -> Self {
        self.auto_quiesce = enabled;
        self
    }

    #[must_use]
    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    #[must_use]
    pub fn with_size_policy(mut self, policy: SizePolicy) -> Self {
        self.size_policy = policy;
        self
    }

    #[must_use]
    pub fn with_resume_before_restart(mut self, enabled: bool) -> Self {
        self.resume_before_restart = enabled;
        self
    }
}
