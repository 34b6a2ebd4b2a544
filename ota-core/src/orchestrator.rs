/// Update Orchestrator
///
/// One `check_now` call is one run of the update state machine:
/// preconditions, quiescence, manifest fetch, version decision, transfer,
/// outcome notification, then resume or restart.
use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn, LevelFilter};
use thiserror::Error;

use crate::bounded::VersionString;
use crate::config::{ConfigError, OrchestratorConfig, SizePolicy};
use crate::manifest::{is_secure_url, ManifestClient};
use crate::ports::{FlashUpdater, Platform, SecureTransport};
use crate::quiesce::{HookFn, HookQuiescence, Quiesce, QuiescenceError};
use crate::transfer::{TransferEngine, MIN_URL_LEN};

pub type Notify = Arc<dyn Fn() + Send + Sync>;
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;
pub type FailedFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Application hooks. Quiescence hooks are required unless automatic
/// quiescence is configured; notifications are optional.
#[derive(Clone, Default)]
pub struct UpdateHooks {
    pub suspend_tasks: Option<HookFn>,
    pub resume_tasks: Option<HookFn>,
    pub on_start: Option<Notify>,
    pub on_progress: Option<ProgressFn>,
    pub on_succeeded: Option<Notify>,
    pub on_failed: Option<FailedFn>,
    pub on_up_to_date: Option<Notify>,
}

impl fmt::Debug for UpdateHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateHooks")
            .field("suspend_tasks", &self.suspend_tasks.is_some())
            .field("resume_tasks", &self.resume_tasks.is_some())
            .field("on_start", &self.on_start.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .field("on_succeeded", &self.on_succeeded.is_some())
            .field("on_failed", &self.on_failed.is_some())
            .field("on_up_to_date", &self.on_up_to_date.is_some())
            .finish()
    }
}

/// Reason passed to `on_failed`. `Display` is the text the application sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("Manifest fetch failed")]
    ManifestFetch,
    #[error("Invalid download URL in manifest")]
    InvalidDownloadUrl,
    #[error("Firmware download timed out")]
    TransferTimeout,
    #[error("Firmware download or flash failed")]
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate,
    Succeeded,
    Failed(FailureReason),
}

/// Exits that happen before any notification stage; logged only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("an update check is already in progress")]
    Busy,
    #[error("start denied by the application")]
    Denied,
    #[error("network is not connected")]
    NotConnected,
    #[error("quiescence failed: {0}")]
    Quiescence(QuiescenceError),
}

/// A newer build is any build whose identifier differs from the running one
pub fn is_update(current: &str, remote: &str) -> bool {
    current != remote
}

struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Devices<T, F> {
    transport: T,
    flash: F,
    auto_quiesce: Option<Box<dyn Quiesce>>,
}

pub struct Updater<T, F, P> {
    config: Mutex<OrchestratorConfig>,
    hooks: Mutex<UpdateHooks>,
    allow_start: Arc<dyn Fn() -> bool + Send + Sync>,
    in_progress: AtomicBool,
    platform: P,
    devices: Mutex<Devices<T, F>>,
}

fn lock<X>(mutex: &Mutex<X>) -> MutexGuard<'_, X> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T, F, P> Updater<T, F, P>
where
    T: SecureTransport + Send,
    F: FlashUpdater + Send,
    P: Platform,
{
    /// `allow_start` is consulted before every run; returning false refuses it.
    pub fn new(
        config: OrchestratorConfig,
        transport: T,
        flash: F,
        platform: P,
        allow_start: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            config: Mutex::new(config),
            hooks: Mutex::new(UpdateHooks::default()),
            allow_start: Arc::new(allow_start),
            in_progress: AtomicBool::new(false),
            platform,
            devices: Mutex::new(Devices { transport, flash, auto_quiesce: None }),
        }
    }

    #[must_use]
    pub fn with_hooks(self, hooks: UpdateHooks) -> Self {
        self.set_hooks(hooks);
        self
    }

    /// Install the coordinator used when automatic quiescence is enabled
    #[must_use]
    pub fn with_auto_quiescence(self, coordinator: impl Quiesce + 'static) -> Self {
        lock(&self.devices).auto_quiesce = Some(Box::new(coordinator));
        self
    }

    pub fn set_hooks(&self, hooks: UpdateHooks) {
        *lock(&self.hooks) = hooks;
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> OrchestratorConfig {
        lock(&self.config).clone()
    }

    pub fn set_max_retries(&self, retries: u8) -> Result<(), ConfigError> {
        let mut config = lock(&self.config);
        *config = config.clone().with_max_retries(retries)?;
        Ok(())
    }

    pub fn set_current_version(&self, version: &str) -> Result<(), ConfigError> {
        lock(&self.config).current_version =
            VersionString::new(version).map_err(ConfigError::Version)?;
        Ok(())
    }

    pub fn set_timeout(&self, timeout: Duration) {
        lock(&self.config).timeout = timeout;
    }

    pub fn set_boot_check_delay(&self, delay: Duration) {
        lock(&self.config).boot_check_delay = delay;
    }

    pub fn set_check_interval(&self, interval: Option<Duration>) {
        lock(&self.config).check_interval = interval;
    }

    pub fn set_auto_quiesce(&self, enabled: bool) {
        lock(&self.config).auto_quiesce = enabled;
    }

    pub fn set_size_policy(&self, policy: SizePolicy) {
        lock(&self.config).size_policy = policy;
    }

    pub fn set_resume_before_restart(&self, enabled: bool) {
        lock(&self.config).resume_before_restart = enabled;
    }

    pub fn set_debug(&self, enabled: bool) {
        lock(&self.config).debug = enabled;
        log::set_max_level(if enabled { LevelFilter::Debug } else { LevelFilter::Info });
    }

    /// Run one update check and return its outcome.
    ///
    /// On `Succeeded` the platform restart has already been requested when
    /// this returns (it never returns on hardware).
    pub fn check_now(&self) -> Result<UpdateOutcome, CheckError> {
        let _run = RunGuard::acquire(&self.in_progress).ok_or_else(|| {
            warn!("Update check already in progress");
            CheckError::Busy
        })?;

        // setters after this point only affect later runs
        let config = self.config();
        let hooks = lock(&self.hooks).clone();
        info!("Preparing for update check (v{})", config.current_version);

        if !(self.allow_start)() {
            info!("Update check denied by application");
            return Err(CheckError::Denied);
        }
        if !self.platform.is_connected() {
            warn!("Network not connected, skipping update check");
            return Err(CheckError::NotConnected);
        }

        let mut devices = lock(&self.devices);
        let Devices { transport, flash, auto_quiesce } = &mut *devices;

        let mut delegated;
        let quiesce: &mut dyn Quiesce = match auto_quiesce.as_deref_mut() {
            Some(coordinator) if config.auto_quiesce => coordinator,
            _ => {
                delegated = HookQuiescence::new(hooks.suspend_tasks.clone(), hooks.resume_tasks.clone());
                &mut delegated
            }
        };

        let suspended = quiesce.suspend_all().map_err(|e| {
            error!("Failed to quiesce system: {}", e);
            CheckError::Quiescence(e)
        })?;
        debug!("Quiesced ({} units)", suspended);

        if let Some(on_start) = &hooks.on_start {
            on_start();
        }

        self.platform.delay(config.settle_delay);
        if let Some(free) = self.platform.free_heap() {
            info!("Free heap: {} KB", free / 1024);
        }

        let outcome = self.run(&config, &hooks, transport, flash);

        match outcome {
            UpdateOutcome::Succeeded => {
                info!("Update succeeded, restarting");
                if let Some(on_succeeded) = &hooks.on_succeeded {
                    on_succeeded();
                }
                if config.resume_before_restart {
                    resume(quiesce);
                }
                self.platform.delay(config.restart_delay);
                self.platform.restart();
            }
            UpdateOutcome::Failed(reason) => {
                warn!("Update failed: {}", reason);
                if let Some(on_failed) = &hooks.on_failed {
                    on_failed(&reason.to_string());
                }
                resume(quiesce);
            }
            UpdateOutcome::UpToDate => {
                if let Some(on_up_to_date) = &hooks.on_up_to_date {
                    on_up_to_date();
                }
                resume(quiesce);
            }
        }

        Ok(outcome)
    }

    fn run(
        &self,
        config: &OrchestratorConfig,
        hooks: &UpdateHooks,
        transport: &mut T,
        flash: &mut F,
    ) -> UpdateOutcome {
        let manifest = match ManifestClient::from_config(config).fetch(transport, &self.platform) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("{}", e);
                return UpdateOutcome::Failed(FailureReason::ManifestFetch);
            }
        };

        if !is_update(config.current_version.as_str(), manifest.version.as_str()) {
            info!("Firmware is already up to date (v{})", config.current_version);
            return UpdateOutcome::UpToDate;
        }
        info!("Updating v{} -> v{}", config.current_version, manifest.version);

        let url = manifest.url.as_str();
        if url.len() < MIN_URL_LEN || !is_secure_url(url) {
            warn!("Refusing download URL '{}'", url);
            return UpdateOutcome::Failed(FailureReason::InvalidDownloadUrl);
        }

        let mut on_progress = |percent: u8| {
            info!("Download progress: {}%", percent);
            if let Some(hook) = &hooks.on_progress {
                hook(percent);
            }
        };

        let mut engine = TransferEngine::new(transport, flash, &self.platform, config);
        match engine.transfer(url, manifest.sha256.as_ref(), &mut on_progress) {
            Ok(report) => {
                info!("Flashed {} bytes", report.bytes);
                UpdateOutcome::Succeeded
            }
            Err(e) if e.is_timeout() => {
                warn!("Transfer timed out: {}", e);
                UpdateOutcome::Failed(FailureReason::TransferTimeout)
            }
            Err(e) => {
                warn!("Transfer failed: {}", e);
                UpdateOutcome::Failed(FailureReason::Transfer)
            }
        }
    }
}

fn resume(quiesce: &mut dyn Quiesce) {
    match quiesce.resume_all() {
        Ok(count) => debug!("Resumed ({} units)", count),
        Err(e) => error!("Failed to resume tasks, system may be unstable: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{
        image, manifest_body, test_config, Event, MockFlash, MockPlatform, MockResponse,
        MockScheduler, MockTransport, Recorder,
    };
    use crate::quiesce::TaskQuiescence;
    use quickcheck::quickcheck;

    type TestUpdater = Updater<MockTransport, MockFlash, MockPlatform>;

    fn updater(platform: &MockPlatform, transport: &MockTransport, recorder: &Recorder) -> TestUpdater {
        Updater::new(
            test_config("1.0.0").with_auto_quiesce(false),
            transport.clone(),
            MockFlash::new(platform),
            platform.clone(),
            || true,
        )
        .with_hooks(recorder.hooks())
    }

    #[test]
    fn test_denied_start_has_no_side_effects() {
        let platform = MockPlatform::new();
        let transport = MockTransport::new(&platform);
        let recorder = Recorder::new(&platform);
        let updater = Updater::new(
            test_config("1.0.0").with_auto_quiesce(false),
            transport.clone(),
            MockFlash::new(&platform),
            platform.clone(),
            || false,
        )
        .with_hooks(recorder.hooks());

        assert_eq!(updater.check_now(), Err(CheckError::Denied));
        assert!(platform.journal().events().is_empty());
        assert!(transport.requests().is_empty());
        assert!(!updater.is_in_progress());
    }

    #[test]
    fn test_disconnected_never_quiesces() {
        let platform = MockPlatform::new();
        platform.set_connected(false);
        let transport = MockTransport::new(&platform);
        let recorder = Recorder::new(&platform);
        let updater = updater(&platform, &transport, &recorder);

        assert_eq!(updater.check_now(), Err(CheckError::NotConnected));
        assert!(platform.journal().events().is_empty());
    }

    #[test]
    fn test_missing_suspend_hook_aborts_before_network() {
        let platform = MockPlatform::new();
        let transport = MockTransport::new(&platform);
        transport.push(MockResponse::ok(manifest_body("2.0.0", "https://x/fw.bin")));
        let updater = Updater::new(
            test_config("1.0.0").with_auto_quiesce(false),
            transport.clone(),
            MockFlash::new(&platform),
            platform.clone(),
            || true,
        );

        assert_eq!(
            updater.check_now(),
            Err(CheckError::Quiescence(QuiescenceError::MissingSuspendHook))
        );
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_refused_suspend_fires_no_notification() {
        let platform = MockPlatform::new();
        let transport = MockTransport::new(&platform);
        let recorder = Recorder::new(&platform).refuse_suspend();
        let updater = updater(&platform, &transport, &recorder);

        assert_eq!(
            updater.check_now(),
            Err(CheckError::Quiescence(QuiescenceError::SuspendRefused))
        );
        assert_eq!(platform.journal().events(), vec![Event::Suspend]);
    }

    #[test]
    fn test_insecure_download_url_fails_without_transfer() {
        let platform = MockPlatform::new();
        let transport = MockTransport::new(&platform);
        // passes manifest validation but is too short to be a real image URL
        transport.push(MockResponse::ok(manifest_body("2.0.0", "https://x")));
        let recorder = Recorder::new(&platform);
        let updater = updater(&platform, &transport, &recorder);

        assert_eq!(
            updater.check_now(),
            Ok(UpdateOutcome::Failed(FailureReason::InvalidDownloadUrl))
        );
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(recorder.failures(), vec!["Invalid download URL in manifest".to_string()]);
        assert_eq!(platform.journal().count(&Event::Resume), 1);
    }

    #[test]
    fn test_settle_delay_follows_start_notification() {
        let platform = MockPlatform::new();
        let transport = MockTransport::new(&platform);
        transport.push(MockResponse::ok(manifest_body("1.0.0", "https://x/fw.bin")));
        let recorder = Recorder::new(&platform);
        let updater = updater(&platform, &transport, &recorder);

        updater.check_now().unwrap();
        assert_eq!(platform.delays().first(), Some(&Duration::from_secs(1)));
        assert_eq!(
            platform.journal().events(),
            vec![Event::Suspend, Event::Start, Event::Request("https://api.example.com/firmware".into()), Event::UpToDate, Event::Resume]
        );
    }

    #[test]
    fn test_free_heap_is_reported_once_quiesced() {
        let platform = MockPlatform::new();
        platform.set_free_heap(Some(180 * 1024));
        let transport = MockTransport::new(&platform);
        transport.push(MockResponse::ok(manifest_body("1.0.0", "https://x/fw.bin")));
        transport.push(MockResponse::ok(manifest_body("1.0.0", "https://x/fw.bin")));
        let recorder = Recorder::new(&platform);
        let updater = updater(&platform, &transport, &recorder);

        assert_eq!(updater.check_now(), Ok(UpdateOutcome::UpToDate));
        // read after the settle delay, before the manifest request
        assert_eq!(platform.heap_reads(), vec![Duration::from_secs(1)]);

        // a platform without a heap figure runs the same way
        platform.set_free_heap(None);
        assert_eq!(updater.check_now(), Ok(UpdateOutcome::UpToDate));
        assert_eq!(platform.heap_reads().len(), 2);
        assert_eq!(transport.requests().len(), 2);
    }

    #[test]
    fn test_resume_before_restart_variant() {
        let platform = MockPlatform::new();
        let transport = MockTransport::new(&platform);
        transport.push(MockResponse::ok(manifest_body("2.0.0", "https://x/fw.bin")));
        transport.push(MockResponse::firmware(&image(1024), 512));
        let recorder = Recorder::new(&platform);
        let updater = updater(&platform, &transport, &recorder);
        updater.set_resume_before_restart(true);

        assert_eq!(updater.check_now(), Ok(UpdateOutcome::Succeeded));
        let events = platform.journal().events();
        let resume = events.iter().position(|e| *e == Event::Resume).unwrap();
        let restart = events.iter().position(|e| *e == Event::Restart).unwrap();
        assert!(resume < restart);
    }

    #[test]
    fn test_auto_quiescence_used_when_enabled() {
        let platform = MockPlatform::new();
        let transport = MockTransport::new(&platform);
        transport.push(MockResponse::ok(manifest_body("1.0.0", "https://x/fw.bin")));
        let scheduler = MockScheduler::new();
        scheduler.add_unit("main");
        scheduler.add_unit("sensors");
        scheduler.set_current("main");

        let updater = Updater::new(
            test_config("1.0.0"),
            transport.clone(),
            MockFlash::new(&platform),
            platform.clone(),
            || true,
        )
        .with_auto_quiescence(TaskQuiescence::new(scheduler.clone()));

        assert_eq!(updater.check_now(), Ok(UpdateOutcome::UpToDate));
        assert_eq!(scheduler.suspend_calls(), 1);
        assert_eq!(scheduler.resume_calls(), 1);
    }

    #[test]
    fn test_setters_apply_to_next_run() {
        let platform = MockPlatform::new();
        let transport = MockTransport::new(&platform);
        let recorder = Recorder::new(&platform);
        let updater = updater(&platform, &transport, &recorder);

        updater.set_current_version("2.0.0").unwrap();
        assert_eq!(updater.set_max_retries(0), Err(ConfigError::Retries));
        updater.set_max_retries(1).unwrap();
        updater.set_timeout(Duration::from_secs(30));
        updater.set_size_policy(SizePolicy::RequireDeclared);

        let config = updater.config();
        assert_eq!(config.current_version, "2.0.0");
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.size_policy, SizePolicy::RequireDeclared);
    }

    #[test]
    fn test_failure_reasons_are_distinct() {
        assert_eq!(FailureReason::ManifestFetch.to_string(), "Manifest fetch failed");
        assert_ne!(
            FailureReason::TransferTimeout.to_string(),
            FailureReason::Transfer.to_string()
        );
    }

    quickcheck! {
        fn prop_update_iff_bytes_differ(current: String, remote: String) -> bool {
            is_update(&current, &remote) == (current.as_bytes() != remote.as_bytes())
        }

        fn prop_same_version_never_updates(version: String) -> bool {
            !is_update(&version, &version)
        }
    }
}
