// HTTPS transport - esp_http_client with the server pinned to the configured root CA

use embedded_svc::http::Method;
use esp_idf_svc::http::client::{Configuration as HttpConfig, EspHttpConnection, FollowRedirectsPolicy};
use esp_idf_svc::tls::X509;
use esp_idf_sys::{EspError, ESP_ERR_HTTP_CONNECT, ESP_ERR_HTTP_EAGAIN};
use log::debug;

use ota_core::ports::{HttpsRequest, ResponseStream, SecureTransport, StreamRead, TransportError};
use ota_core::TrustAnchor;

const RX_BUFFER_SIZE: usize = 4096;
const TX_BUFFER_SIZE: usize = 1024;

/// Opens one verified connection per request. No global CA store or
/// certificate bundle is attached, so only the pinned root is trusted.
#[derive(Default)]
pub struct EspTlsTransport {
    // esp_http_client wants the PEM NUL-terminated for the connection's lifetime
    pinned: Option<(TrustAnchor, &'static [u8])>,
}

impl EspTlsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn certificate(&mut self, anchor: &TrustAnchor) -> X509<'static> {
        if let Some(bytes) = anchor.nul_terminated() {
            return X509::pem_until_nul(bytes);
        }
        match self.pinned {
            Some((cached, bytes)) if cached == *anchor => X509::pem_until_nul(bytes),
            _ => {
                let mut owned = anchor.pem().as_bytes().to_vec();
                owned.push(0);
                let bytes: &'static [u8] = Box::leak(owned.into_boxed_slice());
                self.pinned = Some((*anchor, bytes));
                X509::pem_until_nul(bytes)
            }
        }
    }
}

impl SecureTransport for EspTlsTransport {
    type Stream = EspResponse;

    fn get(&mut self, request: &HttpsRequest<'_>) -> Result<EspResponse, TransportError> {
        let config = HttpConfig {
            buffer_size: Some(RX_BUFFER_SIZE),
            buffer_size_tx: Some(TX_BUFFER_SIZE),
            timeout: Some(request.timeout),
            follow_redirects_policy: FollowRedirectsPolicy::FollowGetHead,
            use_global_ca_store: false,
            crt_bundle_attach: None,
            server_certificate: Some(self.certificate(request.trust_anchor)),
            ..Default::default()
        };

        let mut conn = EspHttpConnection::new(&config).map_err(|e| TransportError::Connect(e.code()))?;

        // The TLS handshake runs while the request is opened
        conn.initiate_request(Method::Get, request.url, request.headers)
            .map_err(classify_open)?;
        conn.initiate_response()
            .map_err(|e| TransportError::Request(e.code()))?;

        let status = conn.status();
        let content_length = conn
            .header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok());
        debug!("GET {} -> {} (length {:?})", request.url, status, content_length);

        Ok(EspResponse { conn, status, content_length })
    }
}

fn classify_open(e: EspError) -> TransportError {
    if e.code() == ESP_ERR_HTTP_CONNECT as i32 {
        TransportError::Connect(e.code())
    } else {
        TransportError::Request(e.code())
    }
}

pub struct EspResponse {
    conn: EspHttpConnection,
    status: u16,
    content_length: Option<u64>,
}

impl ResponseStream for EspResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<StreamRead, TransportError> {
        match self.conn.read(buf) {
            Ok(0) => Ok(StreamRead::Closed),
            Ok(n) => Ok(StreamRead::Data(n)),
            Err(e) if e.code() == ESP_ERR_HTTP_EAGAIN as i32 => Ok(StreamRead::Idle),
            Err(e) => Err(TransportError::Read(e.code())),
        }
    }
}
