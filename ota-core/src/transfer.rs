/// Flash Transfer Engine
///
/// Streams a firmware image from an HTTPS URL into the flash update driver.
/// The flash session is held by a guard that aborts it on every exit path
/// except a verified commit.
use core::time::Duration;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{OrchestratorConfig, SizePolicy, TrustAnchor};
use crate::manifest::digest_hex;
use crate::ports::{
    FlashError, FlashUpdater, HttpsRequest, ImageSize, Platform, ResponseStream, SecureTransport,
    StreamRead, TransportError,
};

pub const CHUNK_SIZE: usize = 512;
/// Shortest download URL worth a connection attempt
pub const MIN_URL_LEN: usize = 10;
/// Bound for a single blocking read; the stall timeout spans many of these
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
const PROGRESS_STEP: u8 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("download URL is empty or implausibly short")]
    InvalidUrl,
    #[error("connection failed: {0}")]
    Connect(TransportError),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("server did not declare a content length")]
    UnknownSize,
    #[error("declared size {0} exceeds the update slot")]
    TooLarge(u64),
    #[error("flash begin failed: {0}")]
    Begin(FlashError),
    #[error("flash write accepted {accepted} of {requested} bytes after {written} (code {code})")]
    Write { written: u32, accepted: usize, requested: usize, code: i32 },
    #[error("read failed after {written} bytes: {source}")]
    Read { written: u32, source: TransportError },
    #[error("timed out: no data for {idle:?} after {written} bytes")]
    Timeout { written: u32, idle: Duration },
    #[error("incomplete image: {written} of {expected} bytes")]
    Incomplete { written: u32, expected: u32 },
    #[error("connection closed before any data")]
    EmptyImage,
    #[error("image digest mismatch")]
    DigestMismatch,
    #[error("flash finalize failed: {0}")]
    Finalize(FlashError),
    #[error("flash driver did not report the image as finished")]
    NotFinished,
}

impl TransferError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: u32,
    pub digest: [u8; 32],
}

/// Emits each 10-point progress bucket once, in increasing order
#[derive(Debug, Clone, Copy)]
pub struct ProgressTracker {
    expected: Option<u32>,
    last_bucket: u8,
}

impl ProgressTracker {
    pub fn new(expected: Option<u32>) -> Self {
        Self { expected: expected.filter(|&n| n > 0), last_bucket: 0 }
    }

    pub fn percent(&self, written: u32) -> Option<u8> {
        let total = self.expected?;
        Some((u64::from(written) * 100 / u64::from(total)).min(100) as u8)
    }

    /// Report every bucket crossed by reaching `written` bytes
    pub fn advance(&mut self, written: u32, mut emit: impl FnMut(u8)) {
        let Some(percent) = self.percent(written) else {
            return;
        };
        let bucket = percent / PROGRESS_STEP * PROGRESS_STEP;
        while self.last_bucket < bucket {
            self.last_bucket += PROGRESS_STEP;
            emit(self.last_bucket);
        }
    }
}

struct FlashSession<'f, F: FlashUpdater> {
    flash: &'f mut F,
    open: bool,
}

impl<'f, F: FlashUpdater> FlashSession<'f, F> {
    fn begin(flash: &'f mut F, size: ImageSize) -> Result<Self, FlashError> {
        flash.begin(size)?;
        Ok(Self { flash, open: true })
    }

    fn write(&mut self, data: &[u8]) -> usize {
        self.flash.write(data)
    }

    fn last_error(&self) -> i32 {
        self.flash.last_error()
    }

    fn commit(mut self, allow_partial: bool) -> Result<(), TransferError> {
        self.flash.end(allow_partial).map_err(TransferError::Finalize)?;
        if !self.flash.is_finished() {
            return Err(TransferError::NotFinished);
        }
        self.open = false;
        Ok(())
    }
}

impl<F: FlashUpdater> Drop for FlashSession<'_, F> {
    fn drop(&mut self) {
        if self.open {
            warn!("Aborting flash session");
            self.flash.abort();
        }
    }
}

pub struct TransferEngine<'a, T, F, P: ?Sized> {
    transport: &'a mut T,
    flash: &'a mut F,
    platform: &'a P,
    trust_anchor: TrustAnchor,
    timeout: Duration,
    size_policy: SizePolicy,
}

impl<'a, T, F, P> TransferEngine<'a, T, F, P>
where
    T: SecureTransport,
    F: FlashUpdater,
    P: Platform + ?Sized,
{
    pub fn new(
        transport: &'a mut T,
        flash: &'a mut F,
        platform: &'a P,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            transport,
            flash,
            platform,
            trust_anchor: config.trust_anchor,
            timeout: config.timeout,
            size_policy: config.size_policy,
        }
    }

    /// Download `url` into the update slot and commit it.
    ///
    /// `on_progress` receives bucket values 10..=100 when the size is known.
    pub fn transfer(
        &mut self,
        url: &str,
        expected_digest: Option<&[u8; 32]>,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<TransferReport, TransferError> {
        if url.len() < MIN_URL_LEN {
            warn!("Rejecting download URL '{}'", url);
            return Err(TransferError::InvalidUrl);
        }

        let request = HttpsRequest {
            url,
            headers: &[],
            trust_anchor: &self.trust_anchor,
            timeout: READ_TIMEOUT,
        };
        let mut stream = self.transport.get(&request).map_err(TransferError::Connect)?;

        let status = stream.status();
        if status != 200 {
            warn!("Firmware request returned HTTP {}", status);
            return Err(TransferError::HttpStatus(status));
        }

        let size = match (stream.content_length(), self.size_policy) {
            (Some(len), _) if len > u64::from(u32::MAX) => return Err(TransferError::TooLarge(len)),
            (Some(len), _) if len > 0 => ImageSize::Known(len as u32),
            (_, SizePolicy::RequireDeclared) => {
                warn!("Firmware response has no usable Content-Length");
                return Err(TransferError::UnknownSize);
            }
            (_, SizePolicy::AllowUnknown) => ImageSize::Unknown,
        };
        let expected = match size {
            ImageSize::Known(n) => Some(n),
            ImageSize::Unknown => None,
        };
        info!("Firmware size: {}", expected.map_or("unknown".to_string(), |n| format!("{} bytes", n)));

        let mut session = FlashSession::begin(&mut *self.flash, size).map_err(|e| {
            warn!("Flash begin failed: {}", e);
            TransferError::Begin(e)
        })?;

        let mut buf = [0u8; CHUNK_SIZE];
        let mut written: u32 = 0;
        let mut hasher = Sha256::new();
        let mut progress = ProgressTracker::new(expected);
        let mut last_activity = self.platform.uptime();

        loop {
            let want = match expected {
                Some(total) if written >= total => break,
                Some(total) => ((total - written) as usize).min(CHUNK_SIZE),
                None => CHUNK_SIZE,
            };

            match stream.read(&mut buf[..want]) {
                Ok(StreamRead::Data(n)) if n > 0 => {
                    let accepted = session.write(&buf[..n]);
                    if accepted != n {
                        let code = session.last_error();
                        warn!("Flash write short: {}/{} bytes (code {})", accepted, n, code);
                        return Err(TransferError::Write { written, accepted, requested: n, code });
                    }
                    hasher.update(&buf[..n]);
                    written += n as u32;
                    last_activity = self.platform.uptime();
                    progress.advance(written, &mut *on_progress);
                }
                Ok(StreamRead::Data(_)) | Ok(StreamRead::Idle) => {
                    let idle = self.platform.uptime().saturating_sub(last_activity);
                    if idle > self.timeout {
                        warn!("Download stalled for {:?} after {} bytes", idle, written);
                        return Err(TransferError::Timeout { written, idle });
                    }
                }
                Ok(StreamRead::Closed) => break,
                Err(e) => {
                    warn!("Download read failed after {} bytes: {}", written, e);
                    return Err(TransferError::Read { written, source: e });
                }
            }

            self.platform.yield_now();
        }

        match expected {
            Some(total) if written != total => {
                warn!("Download ended at {} of {} bytes", written, total);
                return Err(TransferError::Incomplete { written, expected: total });
            }
            None if written == 0 => return Err(TransferError::EmptyImage),
            _ => {}
        }

        let digest: [u8; 32] = hasher.finalize().into();
        info!("Downloaded {} bytes, sha256 {}", written, digest_hex(&digest));
        if let Some(expected_digest) = expected_digest {
            if expected_digest != &digest {
                warn!("Digest mismatch, manifest expects {}", digest_hex(expected_digest));
                return Err(TransferError::DigestMismatch);
            }
            debug!("Digest verified");
        }

        session.commit(expected.is_none()).map_err(|e| {
            warn!("{}", e);
            e
        })?;

        info!("Firmware image committed");
        Ok(TransferReport { bytes: written, digest })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{image, test_config, MockFlash, MockPlatform, MockRead, MockResponse, MockTransport};
    use proptest::prelude::*;

    const URL: &str = "https://x/fw.bin";

    struct Rig {
        platform: MockPlatform,
        transport: MockTransport,
        flash: MockFlash,
        config: OrchestratorConfig,
    }

    impl Rig {
        fn new() -> Self {
            let platform = MockPlatform::new();
            let transport = MockTransport::new(&platform);
            let flash = MockFlash::new(&platform);
            Self { platform, transport, flash, config: test_config("1.0.0") }
        }

        fn run(&mut self, digest: Option<&[u8; 32]>) -> (Result<TransferReport, TransferError>, Vec<u8>) {
            let mut seen = Vec::new();
            let mut engine =
                TransferEngine::new(&mut self.transport, &mut self.flash, &self.platform, &self.config);
            let result = engine.transfer(URL, digest, &mut |p| seen.push(p));
            (result, seen)
        }
    }

    #[test]
    fn test_known_size_transfer_commits() {
        let mut rig = Rig::new();
        let data = image(2048);
        rig.transport.push(MockResponse::firmware(&data, 512));

        let (result, progress) = rig.run(None);
        let report = result.unwrap();

        assert_eq!(report.bytes, 2048);
        assert_eq!(rig.flash.written(), data);
        assert_eq!(rig.flash.begins(), vec![ImageSize::Known(2048)]);
        assert_eq!(rig.flash.ends(), vec![false]);
        assert_eq!(rig.flash.aborts(), 0);
        // 512-byte chunks of 2048 land on 25/50/75/100%
        assert_eq!(progress, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    }

    #[test]
    fn test_rejects_short_url_before_network() {
        let mut rig = Rig::new();
        let mut engine = TransferEngine::new(&mut rig.transport, &mut rig.flash, &rig.platform, &rig.config);
        assert_eq!(engine.transfer("https://", None, &mut |_| {}), Err(TransferError::InvalidUrl));
        assert_eq!(engine.transfer("", None, &mut |_| {}), Err(TransferError::InvalidUrl));
        assert!(rig.transport.requests().is_empty());
    }

    #[test]
    fn test_http_error_never_opens_flash() {
        let mut rig = Rig::new();
        rig.transport.push(MockResponse::status(403));
        let (result, _) = rig.run(None);
        assert_eq!(result, Err(TransferError::HttpStatus(403)));
        assert!(rig.flash.begins().is_empty());
    }

    #[test]
    fn test_unknown_size_streams_until_close() {
        let mut rig = Rig::new();
        let data = image(1500);
        rig.transport
            .push(MockResponse::firmware(&data, 700).with_content_length(None));

        let (result, progress) = rig.run(None);
        assert_eq!(result.unwrap().bytes, 1500);
        assert!(progress.is_empty());
        assert_eq!(rig.flash.begins(), vec![ImageSize::Unknown]);
        assert_eq!(rig.flash.ends(), vec![true]);
    }

    #[test]
    fn test_require_declared_size_policy() {
        let mut rig = Rig::new();
        rig.config = rig.config.clone().with_size_policy(SizePolicy::RequireDeclared);
        rig.transport
            .push(MockResponse::firmware(&image(100), 100).with_content_length(Some(0)));

        let (result, _) = rig.run(None);
        assert_eq!(result, Err(TransferError::UnknownSize));
        assert!(rig.flash.begins().is_empty());
    }

    #[test]
    fn test_short_stream_aborts() {
        let mut rig = Rig::new();
        let data = image(2048);
        rig.transport
            .push(MockResponse::firmware(&data[..1000], 512).with_content_length(Some(2048)));

        let (result, _) = rig.run(None);
        assert_eq!(result, Err(TransferError::Incomplete { written: 1000, expected: 2048 }));
        assert_eq!(rig.flash.aborts(), 1);
        assert!(rig.flash.ends().is_empty());
    }

    #[test]
    fn test_extra_bytes_are_not_written() {
        let mut rig = Rig::new();
        let data = image(1100);
        rig.transport
            .push(MockResponse::firmware(&data, 512).with_content_length(Some(1000)));

        let (result, _) = rig.run(None);
        assert_eq!(result.unwrap().bytes, 1000);
        assert_eq!(rig.flash.written(), data[..1000].to_vec());
    }

    #[test]
    fn test_stall_times_out_and_aborts() {
        let mut rig = Rig::new();
        let data = image(2048);
        rig.transport
            .push(MockResponse::firmware(&data[..512], 512).with_content_length(Some(2048)).stall());

        let (result, progress) = rig.run(None);
        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(err, TransferError::Timeout { written: 512, .. }));
        assert_eq!(progress, vec![10, 20]);
        assert_eq!(rig.flash.aborts(), 1);
    }

    #[test]
    fn test_read_error_is_not_a_timeout() {
        let mut rig = Rig::new();
        let data = image(2048);
        rig.transport.push(
            MockResponse::firmware(&data[..512], 512)
                .with_content_length(Some(2048))
                .then(MockRead::Fail(TransportError::Read(-1))),
        );

        let (result, _) = rig.run(None);
        let err = result.unwrap_err();
        assert!(!err.is_timeout());
        assert_eq!(err, TransferError::Read { written: 512, source: TransportError::Read(-1) });
        assert_eq!(rig.flash.aborts(), 1);
    }

    #[test]
    fn test_short_flash_write_aborts() {
        let mut rig = Rig::new();
        rig.flash.accept_at_most(700);
        rig.transport.push(MockResponse::firmware(&image(2048), 512));

        let (result, _) = rig.run(None);
        assert!(matches!(result, Err(TransferError::Write { written: 512, accepted: 188, .. })));
        assert_eq!(rig.flash.aborts(), 1);
    }

    #[test]
    fn test_finalize_failures_abort() {
        let mut rig = Rig::new();
        rig.flash.fail_end(0x1503);
        rig.transport.push(MockResponse::firmware(&image(600), 512));
        let (result, _) = rig.run(None);
        assert_eq!(result, Err(TransferError::Finalize(FlashError { code: 0x1503 })));
        assert_eq!(rig.flash.aborts(), 1);

        let mut rig = Rig::new();
        rig.flash.never_finished();
        rig.transport.push(MockResponse::firmware(&image(600), 512));
        let (result, _) = rig.run(None);
        assert_eq!(result, Err(TransferError::NotFinished));
        assert_eq!(rig.flash.aborts(), 1);
    }

    #[test]
    fn test_flash_begin_failure_writes_nothing() {
        let mut rig = Rig::new();
        rig.flash.fail_begin(0x1501);
        rig.transport.push(MockResponse::firmware(&image(2048), 512));

        let (result, progress) = rig.run(None);
        assert_eq!(result, Err(TransferError::Begin(FlashError { code: 0x1501 })));
        assert!(rig.flash.written().is_empty());
        assert!(rig.flash.begins().is_empty());
        assert!(!rig.flash.is_open());
        assert_eq!(rig.flash.aborts(), 0);
        assert!(progress.is_empty());
    }

    #[test]
    fn test_chunks_are_paced_by_yielding_not_sleeping() {
        let mut rig = Rig::new();
        rig.transport.push(MockResponse::firmware(&image(8 * CHUNK_SIZE), CHUNK_SIZE));

        let (result, _) = rig.run(None);
        assert_eq!(result.map(|r| r.bytes), Ok(8 * CHUNK_SIZE as u32));
        assert!(rig.platform.delays().is_empty());
    }

    #[test]
    fn test_digest_verification() {
        let data = image(1024);
        let good: [u8; 32] = Sha256::digest(&data).into();

        let mut rig = Rig::new();
        rig.transport.push(MockResponse::firmware(&data, 512));
        let (result, _) = rig.run(Some(&good));
        assert_eq!(result.unwrap().digest, good);

        let mut rig = Rig::new();
        rig.transport.push(MockResponse::firmware(&data, 512));
        let (result, _) = rig.run(Some(&[0u8; 32]));
        assert_eq!(result, Err(TransferError::DigestMismatch));
        assert_eq!(rig.flash.aborts(), 1);
        assert!(rig.flash.ends().is_empty());
    }

    #[test]
    fn test_progress_tracker_emits_each_crossed_bucket() {
        let mut tracker = ProgressTracker::new(Some(1000));
        let mut seen = Vec::new();
        tracker.advance(99, |p| seen.push(p));
        assert!(seen.is_empty());
        tracker.advance(350, |p| seen.push(p));
        assert_eq!(seen, vec![10, 20, 30]);
        tracker.advance(350, |p| seen.push(p));
        tracker.advance(1000, |p| seen.push(p));
        assert_eq!(seen, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    }

    #[test]
    fn test_progress_tracker_silent_without_size() {
        let mut tracker = ProgressTracker::new(None);
        tracker.advance(5000, |_| panic!("no progress without a size"));
        assert_eq!(tracker.percent(10), None);
    }

    proptest! {
        #[test]
        fn prop_progress_is_increasing_bounded_and_unique(
            total in 1u32..100_000,
            steps in proptest::collection::vec(1u32..5000, 1..64),
        ) {
            let mut tracker = ProgressTracker::new(Some(total));
            let mut seen: Vec<u8> = Vec::new();
            let mut written = 0u32;
            for step in steps {
                written = (written + step).min(total);
                tracker.advance(written, |p| seen.push(p));
            }
            prop_assert!(seen.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(seen.iter().all(|p| *p <= 100 && p % 10 == 0 && *p > 0));
            let final_percent = (u64::from(written) * 100 / u64::from(total)) as u8;
            prop_assert_eq!(seen.last().copied().unwrap_or(0), final_percent / 10 * 10);
        }
    }
}
