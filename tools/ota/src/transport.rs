// Host-side collaborators for the core manifest client: reqwest over rustls
// with only the given root trusted, and wall-clock time.

use std::io::{ErrorKind, Read};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client, Response};
use reqwest::redirect::Policy;
use reqwest::Certificate;

use ota_core::ports::{HttpsRequest, Platform, ResponseStream, SecureTransport, StreamRead, TransportError};

const MAX_REDIRECTS: usize = 5;

// reqwest does not surface OS error codes; these stand in for them
const CODE_CONNECT: i32 = -1;
const CODE_TIMEOUT: i32 = -2;
const CODE_OTHER: i32 = -3;

pub struct RustlsTransport {
    timeout_cap: Option<Duration>,
}

impl RustlsTransport {
    pub fn new(timeout_cap: Option<Duration>) -> Self {
        Self { timeout_cap }
    }

    fn client(&self, request: &HttpsRequest<'_>) -> Result<Client, TransportError> {
        let root = Certificate::from_pem(request.trust_anchor.pem().as_bytes())
            .map_err(|_| TransportError::Certificate)?;
        let timeout = match self.timeout_cap {
            Some(cap) => request.timeout.min(cap),
            None => request.timeout,
        };

        Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(root)
            .https_only(true)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .build()
            .map_err(|_| TransportError::Connect(CODE_OTHER))
    }
}

impl SecureTransport for RustlsTransport {
    type Stream = RustlsResponse;

    fn get(&mut self, request: &HttpsRequest<'_>) -> Result<RustlsResponse, TransportError> {
        let client = self.client(request)?;
        let mut builder = client.get(request.url);
        for (name, value) in request.headers {
            builder = builder.header(*name, *value);
        }

        let response = builder.send().map_err(classify)?;
        log::debug!("GET {} -> {}", request.url, response.status());
        Ok(RustlsResponse { response })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    // rustls reports verification failures deep in the source chain
    let mut source: Option<&dyn std::error::Error> = Some(&e);
    while let Some(err) = source {
        if err.to_string().to_ascii_lowercase().contains("certificate") {
            return TransportError::Certificate;
        }
        source = err.source();
    }

    if e.is_timeout() {
        TransportError::Connect(CODE_TIMEOUT)
    } else if e.is_connect() {
        TransportError::Connect(CODE_CONNECT)
    } else {
        TransportError::Request(CODE_OTHER)
    }
}

pub struct RustlsResponse {
    response: Response,
}

impl ResponseStream for RustlsResponse {
    fn status(&self) -> u16 {
        self.response.status().as_u16()
    }

    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<StreamRead, TransportError> {
        match self.response.read(buf) {
            Ok(0) => Ok(StreamRead::Closed),
            Ok(n) => Ok(StreamRead::Data(n)),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(StreamRead::Idle),
            Err(_) => Err(TransportError::Read(CODE_OTHER)),
        }
    }
}

/// The workstation is always online and never restarts
pub struct HostPlatform {
    started: Instant,
}

impl HostPlatform {
    pub fn new() -> Self {
        Self { started: Instant::now() }
    }
}

impl Platform for HostPlatform {
    fn is_connected(&self) -> bool {
        true
    }

    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn delay(&self, duration: Duration) {
        thread::sleep(duration);
    }

    fn restart(&self) {
        log::warn!("Restart requested on the host; ignoring");
    }
}
