// Quiescence Coordinator - suspends the rest of the system around flash writes
//
// Two strategies: delegate to application hooks, or enumerate the scheduler's
// execution units and suspend everything that is not reserved.

use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::ports::TaskScheduler;

/// Name prefixes never suspended by automatic quiescence: the idle units,
/// units started by this library, and the software timer service.
pub const RESERVED_PREFIXES: &[&str] = &["IDLE", "ota_", "Tmr Svc"];

pub type HookFn = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QuiescenceError {
    #[error("no suspend hook configured")]
    MissingSuspendHook,
    #[error("suspend hook refused")]
    SuspendRefused,
    #[error("no resume hook configured")]
    MissingResumeHook,
    #[error("resume hook reported failure")]
    ResumeRefused,
    #[error("{0} units are still suspended from a previous run")]
    AlreadySuspended(usize),
}

pub trait Quiesce: Send {
    /// Suspend every other unit, returning how many were suspended
    fn suspend_all(&mut self) -> Result<usize, QuiescenceError>;
    /// Undo the last `suspend_all`, returning how many were resumed
    fn resume_all(&mut self) -> Result<usize, QuiescenceError>;
}

/// Delegates to application-supplied hooks and trusts their result.
///
/// Hooks cannot report how many units they touched, so counts are zero.
#[derive(Clone, Default)]
pub struct HookQuiescence {
    suspend: Option<HookFn>,
    resume: Option<HookFn>,
}

impl HookQuiescence {
    pub fn new(suspend: Option<HookFn>, resume: Option<HookFn>) -> Self {
        Self { suspend, resume }
    }
}

impl Quiesce for HookQuiescence {
    fn suspend_all(&mut self) -> Result<usize, QuiescenceError> {
        let hook = self.suspend.as_ref().ok_or(QuiescenceError::MissingSuspendHook)?;
        if !hook() {
            return Err(QuiescenceError::SuspendRefused);
        }
        Ok(0)
    }

    fn resume_all(&mut self) -> Result<usize, QuiescenceError> {
        let hook = self.resume.as_ref().ok_or(QuiescenceError::MissingResumeHook)?;
        if !hook() {
            return Err(QuiescenceError::ResumeRefused);
        }
        Ok(0)
    }
}

/// Suspends every unit the scheduler reports except the caller and reserved names
pub struct TaskQuiescence<S: TaskScheduler> {
    scheduler: S,
    reserved: Vec<String>,
    suspended: Vec<S::Handle>,
}

impl<S: TaskScheduler> TaskQuiescence<S> {
    pub fn new(scheduler: S) -> Self {
        Self {
            scheduler,
            reserved: RESERVED_PREFIXES.iter().map(|p| p.to_string()).collect(),
            suspended: Vec::new(),
        }
    }

    /// Also exclude units whose name starts with `prefix`
    #[must_use]
    pub fn reserve(mut self, prefix: &str) -> Self {
        self.reserved.push(prefix.to_string());
        self
    }

    pub fn suspended(&self) -> &[S::Handle] {
        &self.suspended
    }

    fn is_reserved(&self, name: &str) -> bool {
        self.reserved.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }
}

impl<S: TaskScheduler> Quiesce for TaskQuiescence<S> {
    fn suspend_all(&mut self) -> Result<usize, QuiescenceError> {
        if !self.suspended.is_empty() {
            return Err(QuiescenceError::AlreadySuspended(self.suspended.len()));
        }

        let me = self.scheduler.current();
        for (handle, name) in self.scheduler.units() {
            if handle == me || self.is_reserved(&name) || self.suspended.contains(&handle) {
                continue;
            }
            debug!("Suspending '{}'", name);
            self.scheduler.suspend(handle);
            self.suspended.push(handle);
        }

        info!("Suspended {} tasks", self.suspended.len());
        Ok(self.suspended.len())
    }

    fn resume_all(&mut self) -> Result<usize, QuiescenceError> {
        let count = self.suspended.len();
        for handle in self.suspended.drain(..) {
            self.scheduler.resume(handle);
        }
        info!("Resumed {} tasks", count);
        Ok(count)
    }
}

impl<S: TaskScheduler> Drop for TaskQuiescence<S> {
    fn drop(&mut self) {
        if !self.suspended.is_empty() {
            warn!("Resuming {} tasks left suspended", self.suspended.len());
            for handle in self.suspended.drain(..) {
                self.scheduler.resume(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler() -> MockScheduler {
        let scheduler = MockScheduler::new();
        scheduler.add_unit("main");
        scheduler.add_unit("IDLE0");
        scheduler.add_unit("IDLE1");
        scheduler.add_unit("Tmr Svc");
        scheduler.add_unit("ota_boot");
        scheduler.add_unit("sensors");
        scheduler.add_unit("display");
        scheduler.set_current("main");
        scheduler
    }

    #[test]
    fn test_auto_suspends_only_eligible_units() {
        let sched = scheduler();
        let mut quiesce = TaskQuiescence::new(sched.clone());

        assert_eq!(quiesce.suspend_all(), Ok(2));
        assert_eq!(sched.suspended_names(), vec!["sensors", "display"]);

        assert_eq!(quiesce.resume_all(), Ok(2));
        assert!(sched.suspended_names().is_empty());
        assert!(quiesce.suspended().is_empty());
    }

    #[test]
    fn test_auto_extra_reserved_prefix() {
        let sched = scheduler();
        let mut quiesce = TaskQuiescence::new(sched.clone()).reserve("disp");
        assert_eq!(quiesce.suspend_all(), Ok(1));
        assert_eq!(sched.suspended_names(), vec!["sensors"]);
        quiesce.resume_all().unwrap();
    }

    #[test]
    fn test_auto_no_eligible_units_is_ok() {
        let sched = MockScheduler::new();
        sched.add_unit("main");
        sched.add_unit("IDLE0");
        sched.set_current("main");
        let mut quiesce = TaskQuiescence::new(sched);
        assert_eq!(quiesce.suspend_all(), Ok(0));
        assert_eq!(quiesce.resume_all(), Ok(0));
    }

    #[test]
    fn test_auto_refuses_double_suspend() {
        let sched = scheduler();
        let mut quiesce = TaskQuiescence::new(sched.clone());
        quiesce.suspend_all().unwrap();
        assert_eq!(quiesce.suspend_all(), Err(QuiescenceError::AlreadySuspended(2)));
        // nothing recorded twice
        assert_eq!(sched.suspend_calls(), 2);
        quiesce.resume_all().unwrap();
        assert_eq!(sched.resume_calls(), 2);
        // resume with an empty record touches nothing
        assert_eq!(quiesce.resume_all(), Ok(0));
        assert_eq!(sched.resume_calls(), 2);
    }

    #[test]
    fn test_auto_leaves_units_suspended_by_their_owner_alone() {
        let sched = scheduler();
        let parked = sched.add_unit("logger");
        sched.suspend(parked);

        let mut quiesce = TaskQuiescence::new(sched.clone());
        assert_eq!(quiesce.suspend_all(), Ok(2));
        assert!(!quiesce.suspended().contains(&parked));

        assert_eq!(quiesce.resume_all(), Ok(2));
        assert_eq!(sched.suspended_names(), vec!["logger"]);
    }

    #[test]
    fn test_auto_resumes_on_drop() {
        let sched = scheduler();
        {
            let mut quiesce = TaskQuiescence::new(sched.clone());
            quiesce.suspend_all().unwrap();
        }
        assert!(sched.suspended_names().is_empty());
    }

    #[test]
    fn test_hooks_delegate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let c2 = calls.clone();
        let mut quiesce = HookQuiescence::new(
            Some(Arc::new(move || {
                c1.fetch_add(1, Ordering::SeqCst);
                true
            })),
            Some(Arc::new(move || {
                c2.fetch_add(10, Ordering::SeqCst);
                true
            })),
        );
        assert_eq!(quiesce.suspend_all(), Ok(0));
        assert_eq!(quiesce.resume_all(), Ok(0));
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_hooks_missing_or_refusing() {
        let mut quiesce = HookQuiescence::default();
        assert_eq!(quiesce.suspend_all(), Err(QuiescenceError::MissingSuspendHook));
        assert_eq!(quiesce.resume_all(), Err(QuiescenceError::MissingResumeHook));

        let mut quiesce = HookQuiescence::new(Some(Arc::new(|| false)), Some(Arc::new(|| false)));
        assert_eq!(quiesce.suspend_all(), Err(QuiescenceError::SuspendRefused));
        assert_eq!(quiesce.resume_all(), Err(QuiescenceError::ResumeRefused));
    }
}
