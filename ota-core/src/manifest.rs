/// Manifest Client
///
/// Fetches the remote version descriptor and validates it wholesale: a manifest
/// is either fully conforming or rejected, never partially accepted.
use core::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use thiserror::Error;

use crate::bounded::{TextError, UrlString, VersionString};
use crate::config::{OrchestratorConfig, TrustAnchor};
use crate::ports::{HttpsRequest, Platform, ResponseStream, SecureTransport, StreamRead, TransportError};

pub const SECURE_SCHEME: &str = "https://";
/// Largest manifest body accepted
pub const MAX_MANIFEST_BODY: usize = 4096;
pub const MANIFEST_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const MANIFEST_HEADERS: &[(&str, &str)] = &[
    ("Accept", "application/json"),
    ("Cache-Control", "no-cache"),
    ("Connection", "close"),
];

pub fn is_secure_url(url: &str) -> bool {
    url.starts_with(SECURE_SCHEME)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub version: VersionString,
    pub url: UrlString,
    /// Expected SHA-256 of the image, when the manifest carries one
    pub sha256: Option<[u8; 32]>,
}

/// Why one fetch attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("body exceeds {MAX_MANIFEST_BODY} bytes")]
    BodyTooLarge,
    #[error("no data for {0:?}")]
    Stalled(Duration),
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("body is not a JSON object")]
    NotAnObject,
    #[error("missing or empty field '{0}'")]
    MissingField(&'static str),
    #[error("download URL does not use {SECURE_SCHEME}")]
    InsecureUrl,
    #[error("field '{field}' rejected: {source}")]
    FieldBounds { field: &'static str, source: TextError },
    #[error("field 'sha256' is not 64 hex characters")]
    InvalidDigest,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("manifest fetch failed after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u8, last: AttemptError },
}

#[derive(Debug, Clone)]
pub struct ManifestClient {
    endpoint: UrlString,
    trust_anchor: TrustAnchor,
    max_retries: u8,
    retry_delay: Duration,
}

impl ManifestClient {
    pub fn new(endpoint: UrlString, trust_anchor: TrustAnchor) -> Self {
        Self {
            endpoint,
            trust_anchor,
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            retry_delay: crate::config::DEFAULT_RETRY_DELAY,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            endpoint: config.manifest_url.clone(),
            trust_anchor: config.trust_anchor,
            max_retries: config.max_retries.max(1),
            retry_delay: config.retry_delay,
        }
    }

    #[must_use]
    pub fn with_retries(mut self, max_retries: u8, retry_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Try up to `max_retries` times with a fixed delay between attempts,
    /// returning the first fully validated manifest.
    pub fn fetch<T, P>(&self, transport: &mut T, platform: &P) -> Result<Manifest, ManifestError>
    where
        T: SecureTransport,
        P: Platform + ?Sized,
    {
        let mut last = AttemptError::MissingField("version");

        for attempt in 1..=self.max_retries {
            if attempt > 1 {
                platform.delay(self.retry_delay);
            }
            debug!("Manifest attempt {}/{}: {}", attempt, self.max_retries, self.endpoint);

            match self.attempt(transport, platform) {
                Ok(manifest) => {
                    info!("Manifest: version {} at {}", manifest.version, manifest.url);
                    return Ok(manifest);
                }
                Err(e) => {
                    warn!("Manifest attempt {}/{} failed: {}", attempt, self.max_retries, e);
                    last = e;
                }
            }
        }

        Err(ManifestError::Exhausted { attempts: self.max_retries, last })
    }

    fn attempt<T, P>(&self, transport: &mut T, platform: &P) -> Result<Manifest, AttemptError>
    where
        T: SecureTransport,
        P: Platform + ?Sized,
    {
        let request = HttpsRequest {
            url: self.endpoint.as_str(),
            headers: MANIFEST_HEADERS,
            trust_anchor: &self.trust_anchor,
            timeout: MANIFEST_REQUEST_TIMEOUT,
        };
        let mut response = transport.get(&request)?;

        let status = response.status();
        if status != 200 {
            return Err(AttemptError::HttpStatus(status));
        }

        let body = read_body(&mut response, platform)?;
        debug!("Manifest body: {} bytes", body.len());
        parse_manifest(&body)
    }
}

/// Read until the peer closes, bounded by `MAX_MANIFEST_BODY`
fn read_body<S, P>(response: &mut S, platform: &P) -> Result<Vec<u8>, AttemptError>
where
    S: ResponseStream,
    P: Platform + ?Sized,
{
    let mut body = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    let mut last_activity = platform.uptime();

    loop {
        match response.read(&mut chunk)? {
            StreamRead::Data(n) => {
                if body.len() + n > MAX_MANIFEST_BODY {
                    return Err(AttemptError::BodyTooLarge);
                }
                body.extend_from_slice(&chunk[..n]);
                last_activity = platform.uptime();
            }
            StreamRead::Idle => {
                let idle = platform.uptime().saturating_sub(last_activity);
                if idle > MANIFEST_REQUEST_TIMEOUT {
                    return Err(AttemptError::Stalled(idle));
                }
                platform.yield_now();
            }
            StreamRead::Closed => return Ok(body),
        }
    }
}

/// Validate a manifest body. Any non-conforming field rejects the whole manifest.
pub fn parse_manifest(body: &[u8]) -> Result<Manifest, AttemptError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| AttemptError::Json(e.to_string()))?;
    let object = value.as_object().ok_or(AttemptError::NotAnObject)?;

    let text_field = |name: &'static str| -> Result<&str, AttemptError> {
        match object.get(name).and_then(Value::as_str) {
            Some(text) if !text.is_empty() => Ok(text),
            _ => Err(AttemptError::MissingField(name)),
        }
    };

    let version = text_field("version")?;
    let url = text_field("url")?;

    if !is_secure_url(url) {
        return Err(AttemptError::InsecureUrl);
    }

    let version = VersionString::new(version)
        .map_err(|source| AttemptError::FieldBounds { field: "version", source })?;
    let url =
        UrlString::new(url).map_err(|source| AttemptError::FieldBounds { field: "url", source })?;

    let sha256 = match object.get("sha256") {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(decode_digest(text).ok_or(AttemptError::InvalidDigest)?),
        Some(_) => return Err(AttemptError::InvalidDigest),
    };

    Ok(Manifest { version, url, sha256 })
}

fn decode_digest(text: &str) -> Option<[u8; 32]> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(text, &mut out).ok()?;
    Some(out)
}

/// Lowercase hex rendering of a digest, for logs and the manifest tool
pub fn digest_hex(digest: &[u8; 32]) -> String {
    hex::encode(digest)
}
