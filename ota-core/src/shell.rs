// Scheduling Shell - execution units that invoke the orchestrator
//
// Owns no update logic: the boot task waits for the network and runs one
// check, the periodic task runs a check every interval.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{error, info, warn};
use thiserror::Error;

use crate::orchestrator::{CheckError, UpdateOutcome, Updater};
use crate::ports::{FlashUpdater, Platform, SchedulerError, SecureTransport, TaskScheduler};

pub const BOOT_TASK_NAME: &str = "ota_boot";
pub const PERIODIC_TASK_NAME: &str = "ota_periodic";
pub const TASK_STACK_SIZE: usize = 8192;
pub const TASK_PRIORITY: u8 = 5;

const CONNECT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShellError {
    #[error("boot check task is already running")]
    BootTaskRunning,
    #[error("no check interval configured")]
    NoInterval,
    #[error(transparent)]
    Spawn(#[from] SchedulerError),
}

pub struct Shell<S: TaskScheduler> {
    scheduler: S,
    boot_task: Arc<Mutex<Option<S::Handle>>>,
}

impl<S: TaskScheduler> Shell<S> {
    pub fn new(scheduler: S) -> Self {
        Self { scheduler, boot_task: Arc::new(Mutex::new(None)) }
    }

    /// Handle of the boot check task while it is alive
    pub fn boot_task(&self) -> Option<S::Handle> {
        *self.boot_task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the one-shot boot check. Refused while a previous one is alive.
    pub fn spawn_boot_check<T, F, P>(&self, updater: Arc<Updater<T, F, P>>) -> Result<S::Handle, ShellError>
    where
        T: SecureTransport + Send + 'static,
        F: FlashUpdater + Send + 'static,
        P: Platform + 'static,
    {
        let mut slot = self.boot_task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            warn!("Boot check task already running");
            return Err(ShellError::BootTaskRunning);
        }

        let boot_task = self.boot_task.clone();
        let handle = self.scheduler.spawn(
            BOOT_TASK_NAME,
            TASK_STACK_SIZE,
            TASK_PRIORITY,
            Box::new(move || {
                boot_check(&updater);
                *boot_task.lock().unwrap_or_else(PoisonError::into_inner) = None;
            }),
        )?;

        info!("Started boot-time update check task");
        *slot = Some(handle);
        Ok(handle)
    }

    /// Start the periodic check. The task ends once the interval is cleared.
    pub fn spawn_periodic_check<T, F, P>(&self, updater: Arc<Updater<T, F, P>>) -> Result<S::Handle, ShellError>
    where
        T: SecureTransport + Send + 'static,
        F: FlashUpdater + Send + 'static,
        P: Platform + 'static,
    {
        let interval = updater.config().check_interval.ok_or(ShellError::NoInterval)?;
        info!("Started periodic update check every {}s", interval.as_secs());

        let handle = self.scheduler.spawn(
            PERIODIC_TASK_NAME,
            TASK_STACK_SIZE,
            TASK_PRIORITY,
            Box::new(move || {
                while let Some(interval) = updater.config().check_interval {
                    updater.platform().delay(interval);
                    periodic_cycle(&updater);
                }
                info!("Periodic update check stopped");
            }),
        )?;
        Ok(handle)
    }
}

fn boot_check<T, F, P>(updater: &Updater<T, F, P>)
where
    T: SecureTransport + Send,
    F: FlashUpdater + Send,
    P: Platform,
{
    let platform = updater.platform();
    while !platform.is_connected() {
        platform.delay(CONNECT_POLL);
    }

    let delay = updater.config().boot_check_delay;
    info!("Waiting {} ms before boot check", delay.as_millis());
    platform.delay(delay);

    report(updater.check_now());
}

/// One periodic tick: check if connected, never queue behind a running check
pub fn periodic_cycle<T, F, P>(updater: &Updater<T, F, P>) -> Option<UpdateOutcome>
where
    T: SecureTransport + Send,
    F: FlashUpdater + Send,
    P: Platform,
{
    if !updater.platform().is_connected() {
        info!("Periodic check skipped, network not connected");
        return None;
    }
    match updater.check_now() {
        Err(CheckError::Busy) => {
            info!("Periodic check skipped, another check is running");
            None
        }
        result => report(result),
    }
}

fn report(result: Result<UpdateOutcome, CheckError>) -> Option<UpdateOutcome> {
    match result {
        Ok(outcome) => {
            info!("Update check finished: {:?}", outcome);
            Some(outcome)
        }
        Err(e) => {
            error!("Update check did not run: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{manifest_body, test_config, MockFlash, MockPlatform, MockResponse, MockScheduler, MockTransport};

    type TestUpdater = Updater<MockTransport, MockFlash, MockPlatform>;

    fn updater(platform: &MockPlatform, transport: &MockTransport) -> Arc<TestUpdater> {
        let scheduler = MockScheduler::new();
        let updater = Updater::new(
            test_config("1.0.0"),
            transport.clone(),
            MockFlash::new(platform),
            platform.clone(),
            || true,
        )
        .with_auto_quiescence(crate::quiesce::TaskQuiescence::new(scheduler));
        Arc::new(updater)
    }

    #[test]
    fn test_boot_check_waits_for_network_then_delay() {
        let platform = MockPlatform::new();
        platform.set_connected(false);
        platform.connect_after(Duration::from_secs(3));
        let transport = MockTransport::new(&platform);
        transport.push(MockResponse::ok(manifest_body("1.0.0", "https://x/fw.bin")));

        let scheduler = MockScheduler::new();
        let shell = Shell::new(scheduler.clone());
        shell.spawn_boot_check(updater(&platform, &transport)).unwrap();
        scheduler.join_all();

        let delays = platform.delays();
        // three 1s polls, then the boot delay, then the settle delay
        assert_eq!(&delays[..3], &[CONNECT_POLL; 3]);
        assert_eq!(delays[3], Duration::from_secs(10));
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(shell.boot_task(), None);
        assert_eq!(scheduler.spawned_names(), vec![BOOT_TASK_NAME]);
    }

    #[test]
    fn test_second_boot_task_refused_while_alive() {
        let platform = MockPlatform::new();
        let transport = MockTransport::new(&platform);
        let scheduler = MockScheduler::new().deferred();
        let shell = Shell::new(scheduler.clone());
        let updater = updater(&platform, &transport);

        let handle = shell.spawn_boot_check(updater.clone()).unwrap();
        assert_eq!(shell.boot_task(), Some(handle));
        assert_eq!(shell.spawn_boot_check(updater.clone()), Err(ShellError::BootTaskRunning));

        scheduler.run_pending();
        assert_eq!(shell.boot_task(), None);
        assert!(shell.spawn_boot_check(updater).is_ok());
    }

    #[test]
    fn test_periodic_requires_interval() {
        let platform = MockPlatform::new();
        let transport = MockTransport::new(&platform);
        let shell = Shell::new(MockScheduler::new());
        assert_eq!(
            shell.spawn_periodic_check(updater(&platform, &transport)).err(),
            Some(ShellError::NoInterval)
        );
    }

    #[test]
    fn test_periodic_cycle_skips_when_offline() {
        let platform = MockPlatform::new();
        platform.set_connected(false);
        let transport = MockTransport::new(&platform);
        assert_eq!(periodic_cycle(&updater(&platform, &transport)), None);
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_periodic_task_runs_until_interval_cleared() {
        let platform = MockPlatform::new();
        let transport = MockTransport::new(&platform);
        transport.push(MockResponse::ok(manifest_body("1.0.0", "https://x/fw.bin")));
        transport.push(MockResponse::ok(manifest_body("1.0.0", "https://x/fw.bin")));
        let updater = updater(&platform, &transport);
        updater.set_check_interval(Some(Duration::from_secs(3600)));

        let scheduler = MockScheduler::new().deferred();
        let shell = Shell::new(scheduler.clone());
        shell.spawn_periodic_check(updater.clone()).unwrap();

        // stop after the second check
        let stopper = updater.clone();
        transport.on_request(2, move || stopper.set_check_interval(None));
        scheduler.run_pending();

        assert_eq!(transport.requests().len(), 2);
        assert_eq!(scheduler.spawned_names(), vec![PERIODIC_TASK_NAME]);
    }
}
