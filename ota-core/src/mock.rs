//! Scripted collaborator doubles for host testing.
//!
//! Every double shares the [`MockPlatform`] virtual clock and event
//! [`Journal`], so tests can assert on the ordering of quiescence, network
//! and flash activity without real time passing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{OrchestratorConfig, TrustAnchor};
use crate::orchestrator::{FailedFn, Notify, ProgressFn, UpdateHooks};
use crate::ports::{
    FlashError, FlashUpdater, HttpsRequest, ImageSize, Platform, ResponseStream, SchedulerError,
    SecureTransport, StreamRead, TaskEntry, TaskScheduler, TransportError,
};
use crate::quiesce::HookFn;

pub const TEST_ANCHOR: &str = "-----BEGIN CERTIFICATE-----\n\
MIIBszCCAVmgAwIBAgIUTestOnlyAnchorNotARealCertificate0wCgYIKoZIzj0E\n\
-----END CERTIFICATE-----\n";

pub const TEST_MANIFEST_URL: &str = "https://api.example.com/firmware";

/// Driver error code reported for short writes
pub const FLASH_WRITE_ERROR: i32 = 0x1504;
/// Driver error code reported when a known-size image is finalized short
pub const FLASH_VALIDATE_ERROR: i32 = 0x1503;

fn lock<X>(mutex: &Mutex<X>) -> MutexGuard<'_, X> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn test_config(current_version: &str) -> OrchestratorConfig {
    let anchor = TrustAnchor::from_pem(TEST_ANCHOR).expect("test anchor");
    OrchestratorConfig::new(TEST_MANIFEST_URL, current_version, anchor).expect("test config")
}

pub fn manifest_body(version: &str, url: &str) -> Vec<u8> {
    serde_json::json!({ "version": version, "url": url }).to_string().into_bytes()
}

pub fn manifest_body_with_digest(version: &str, url: &str, sha256: &str) -> Vec<u8> {
    serde_json::json!({ "version": version, "url": url, "sha256": sha256 })
        .to_string()
        .into_bytes()
}

/// Deterministic image contents
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Request(String),
    FlashBegin(ImageSize),
    FlashAbort,
    FlashEnd(bool),
    Suspend,
    Resume,
    Start,
    Progress(u8),
    Succeeded,
    Failed(String),
    UpToDate,
    Restart,
}

#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    pub fn push(&self, event: Event) {
        lock(&self.0).push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.0).clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        lock(&self.0).iter().filter(|e| *e == event).count()
    }

    pub fn position(&self, event: &Event) -> Option<usize> {
        lock(&self.0).iter().position(|e| e == event)
    }

    pub fn count_matching(&self, f: impl Fn(&Event) -> bool) -> usize {
        lock(&self.0).iter().filter(|e| f(e)).count()
    }
}

// ---- Platform ----

#[derive(Debug, Default)]
struct PlatformState {
    now: Duration,
    connected: bool,
    connect_at: Option<Duration>,
    delays: Vec<Duration>,
    restarts: usize,
    free_heap: Option<usize>,
    heap_reads: Vec<Duration>,
}

#[derive(Debug, Clone)]
pub struct MockPlatform {
    state: Arc<Mutex<PlatformState>>,
    journal: Journal,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PlatformState { connected: true, ..Default::default() })),
            journal: Journal::default(),
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn set_connected(&self, connected: bool) {
        let mut state = lock(&self.state);
        state.connected = connected;
        state.connect_at = None;
    }

    /// Become connected once the virtual clock has advanced by `after`
    pub fn connect_after(&self, after: Duration) {
        let mut state = lock(&self.state);
        state.connect_at = Some(state.now + after);
    }

    pub fn set_free_heap(&self, bytes: Option<usize>) {
        lock(&self.state).free_heap = bytes;
    }

    pub fn advance(&self, by: Duration) {
        lock(&self.state).now += by;
    }

    pub fn now(&self) -> Duration {
        lock(&self.state).now
    }

    /// Every explicit delay requested, in order (yields excluded)
    pub fn delays(&self) -> Vec<Duration> {
        lock(&self.state).delays.clone()
    }

    pub fn restarts(&self) -> usize {
        lock(&self.state).restarts
    }

    /// Virtual time of every free-heap query
    pub fn heap_reads(&self) -> Vec<Duration> {
        lock(&self.state).heap_reads.clone()
    }
}

impl Platform for MockPlatform {
    fn is_connected(&self) -> bool {
        let state = lock(&self.state);
        state.connected || state.connect_at.is_some_and(|at| state.now >= at)
    }

    fn uptime(&self) -> Duration {
        self.now()
    }

    fn delay(&self, duration: Duration) {
        {
            let mut state = lock(&self.state);
            state.delays.push(duration);
            state.now += duration;
        }
        thread::yield_now();
    }

    fn yield_now(&self) {
        self.advance(Duration::from_millis(1));
    }

    fn restart(&self) {
        lock(&self.state).restarts += 1;
        self.journal.push(Event::Restart);
    }

    fn free_heap(&self) -> Option<usize> {
        let mut state = lock(&self.state);
        let now = state.now;
        state.heap_reads.push(now);
        state.free_heap
    }
}

// ---- Transport ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRead {
    Data(Vec<u8>),
    Idle,
    Fail(TransportError),
    Closed,
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    status: u16,
    content_length: Option<u64>,
    reads: VecDeque<MockRead>,
    stall: bool,
}

impl MockResponse {
    /// 200 with `body` and no declared length
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, content_length: None, reads: VecDeque::from([MockRead::Data(body)]), stall: false }
    }

    pub fn status(status: u16) -> Self {
        Self { status, content_length: None, reads: VecDeque::new(), stall: false }
    }

    /// 200 with a declared length, delivered in `chunk`-sized pieces
    pub fn firmware(image: &[u8], chunk: usize) -> Self {
        let reads = image.chunks(chunk.max(1)).map(|c| MockRead::Data(c.to_vec())).collect();
        Self { status: 200, content_length: Some(image.len() as u64), reads, stall: false }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_content_length(mut self, length: Option<u64>) -> Self {
        self.content_length = length;
        self
    }

    pub fn then(mut self, read: MockRead) -> Self {
        self.reads.push_back(read);
        self
    }

    /// Once the scripted reads run out, report idle forever instead of closing
    pub fn stall(mut self) -> Self {
        self.stall = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

type RequestHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TransportState {
    responses: VecDeque<Result<MockResponse, TransportError>>,
    requests: Vec<RecordedRequest>,
    hooks: Vec<(usize, RequestHook)>,
}

#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
    platform: MockPlatform,
    idle_step: Duration,
}

impl MockTransport {
    pub fn new(platform: &MockPlatform) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState::default())),
            platform: platform.clone(),
            idle_step: Duration::from_secs(1),
        }
    }

    pub fn push(&self, response: MockResponse) {
        lock(&self.state).responses.push_back(Ok(response));
    }

    pub fn push_error(&self, error: TransportError) {
        lock(&self.state).responses.push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.state).requests.clone()
    }

    /// Run `hook` when the `nth` request (1-based) is made
    pub fn on_request(&self, nth: usize, hook: impl FnOnce() + Send + 'static) {
        lock(&self.state).hooks.push((nth, Box::new(hook)));
    }
}

impl SecureTransport for MockTransport {
    type Stream = MockStream;

    fn get(&mut self, request: &HttpsRequest<'_>) -> Result<MockStream, TransportError> {
        let (response, due) = {
            let mut state = lock(&self.state);
            state.requests.push(RecordedRequest {
                url: request.url.to_string(),
                headers: request.headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                timeout: request.timeout,
            });
            let count = state.requests.len();
            let (due, rest): (Vec<_>, Vec<_>) =
                std::mem::take(&mut state.hooks).into_iter().partition(|(nth, _)| *nth == count);
            state.hooks = rest;
            (state.responses.pop_front(), due)
        };
        self.platform.journal.push(Event::Request(request.url.to_string()));
        for (_, hook) in due {
            hook();
        }

        match response {
            Some(Ok(response)) => Ok(MockStream {
                response,
                platform: self.platform.clone(),
                idle_step: self.idle_step,
            }),
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Connect(-1)),
        }
    }
}

pub struct MockStream {
    response: MockResponse,
    platform: MockPlatform,
    idle_step: Duration,
}

impl ResponseStream for MockStream {
    fn status(&self) -> u16 {
        self.response.status
    }

    fn content_length(&self) -> Option<u64> {
        self.response.content_length
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<StreamRead, TransportError> {
        let reads = &mut self.response.reads;
        match reads.front_mut() {
            Some(MockRead::Data(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                bytes.drain(..n);
                if bytes.is_empty() {
                    reads.pop_front();
                }
                Ok(StreamRead::Data(n))
            }
            Some(MockRead::Idle) => {
                reads.pop_front();
                self.platform.advance(self.idle_step);
                Ok(StreamRead::Idle)
            }
            Some(MockRead::Fail(e)) => {
                let e = *e;
                reads.pop_front();
                Err(e)
            }
            Some(MockRead::Closed) => Ok(StreamRead::Closed),
            None if self.response.stall => {
                self.platform.advance(self.idle_step);
                Ok(StreamRead::Idle)
            }
            None => Ok(StreamRead::Closed),
        }
    }
}

// ---- Flash ----

#[derive(Debug, Default)]
struct FlashState {
    open: bool,
    size: Option<ImageSize>,
    data: Vec<u8>,
    begins: Vec<ImageSize>,
    ends: Vec<bool>,
    aborts: usize,
    finished: bool,
    last_error: i32,
    fail_begin: Option<i32>,
    accept_limit: Option<usize>,
    fail_end: Option<i32>,
    never_finished: bool,
}

#[derive(Debug, Clone)]
pub struct MockFlash {
    state: Arc<Mutex<FlashState>>,
    journal: Journal,
}

impl MockFlash {
    pub fn new(platform: &MockPlatform) -> Self {
        Self { state: Arc::new(Mutex::new(FlashState::default())), journal: platform.journal() }
    }

    pub fn fail_begin(&self, code: i32) {
        lock(&self.state).fail_begin = Some(code);
    }

    /// Accept at most `bytes` in total per session, then write short
    pub fn accept_at_most(&self, bytes: usize) {
        lock(&self.state).accept_limit = Some(bytes);
    }

    pub fn fail_end(&self, code: i32) {
        lock(&self.state).fail_end = Some(code);
    }

    pub fn never_finished(&self) {
        lock(&self.state).never_finished = true;
    }

    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).data.clone()
    }

    pub fn begins(&self) -> Vec<ImageSize> {
        lock(&self.state).begins.clone()
    }

    pub fn ends(&self) -> Vec<bool> {
        lock(&self.state).ends.clone()
    }

    pub fn aborts(&self) -> usize {
        lock(&self.state).aborts
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }
}

impl FlashUpdater for MockFlash {
    fn begin(&mut self, size: ImageSize) -> Result<(), FlashError> {
        let mut state = lock(&self.state);
        if let Some(code) = state.fail_begin {
            state.last_error = code;
            return Err(FlashError { code });
        }
        state.open = true;
        state.size = Some(size);
        state.data.clear();
        state.finished = false;
        state.begins.push(size);
        drop(state);
        self.journal.push(Event::FlashBegin(size));
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let mut state = lock(&self.state);
        if !state.open {
            return 0;
        }
        let room = state.accept_limit.map_or(data.len(), |limit| {
            limit.saturating_sub(state.data.len()).min(data.len())
        });
        state.data.extend_from_slice(&data[..room]);
        if room < data.len() {
            state.last_error = FLASH_WRITE_ERROR;
        }
        room
    }

    fn abort(&mut self) {
        {
            let mut state = lock(&self.state);
            state.aborts += 1;
            state.open = false;
        }
        self.journal.push(Event::FlashAbort);
    }

    fn end(&mut self, allow_partial: bool) -> Result<(), FlashError> {
        self.journal.push(Event::FlashEnd(allow_partial));
        let mut state = lock(&self.state);
        state.ends.push(allow_partial);
        if !state.open {
            return Err(FlashError { code: -1 });
        }
        state.open = false;
        if let Some(code) = state.fail_end {
            state.last_error = code;
            return Err(FlashError { code });
        }
        if let Some(ImageSize::Known(expected)) = state.size {
            if state.data.len() != expected as usize && !allow_partial {
                state.last_error = FLASH_VALIDATE_ERROR;
                return Err(FlashError { code: FLASH_VALIDATE_ERROR });
            }
        }
        state.finished = !state.never_finished;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        lock(&self.state).finished
    }

    fn last_error(&self) -> i32 {
        lock(&self.state).last_error
    }
}

// ---- Scheduler ----

#[derive(Default)]
struct SchedulerState {
    next: u32,
    units: Vec<(u32, String)>,
    current: u32,
    suspended: Vec<u32>,
    suspend_calls: usize,
    resume_calls: usize,
    spawned: Vec<String>,
    deferred: bool,
    pending: Vec<(u32, TaskEntry)>,
    threads: Vec<JoinHandle<()>>,
}

/// Units spawned through this scheduler run on OS threads, or, when
/// `deferred`, on the caller's thread inside `run_pending`.
#[derive(Clone, Default)]
pub struct MockScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deferred(self) -> Self {
        lock(&self.state).deferred = true;
        self
    }

    pub fn add_unit(&self, name: &str) -> u32 {
        let mut state = lock(&self.state);
        state.next += 1;
        let id = state.next;
        state.units.push((id, name.to_string()));
        id
    }

    pub fn set_current(&self, name: &str) {
        let mut state = lock(&self.state);
        if let Some(id) = state.units.iter().find(|(_, n)| n == name).map(|(id, _)| *id) {
            state.current = id;
        }
    }

    pub fn suspended_names(&self) -> Vec<String> {
        let state = lock(&self.state);
        state
            .suspended
            .iter()
            .filter_map(|h| state.units.iter().find(|(id, _)| id == h).map(|(_, n)| n.clone()))
            .collect()
    }

    pub fn suspend_calls(&self) -> usize {
        lock(&self.state).suspend_calls
    }

    pub fn resume_calls(&self) -> usize {
        lock(&self.state).resume_calls
    }

    pub fn spawned_names(&self) -> Vec<String> {
        lock(&self.state).spawned.clone()
    }

    /// Run deferred units to completion on this thread
    pub fn run_pending(&self) {
        loop {
            let pending = std::mem::take(&mut lock(&self.state).pending);
            if pending.is_empty() {
                break;
            }
            for (id, entry) in pending {
                entry();
                self.remove_unit(id);
            }
        }
    }

    /// Wait for every threaded unit to finish
    pub fn join_all(&self) {
        let threads = std::mem::take(&mut lock(&self.state).threads);
        for thread in threads {
            let _ = thread.join();
        }
    }

    fn remove_unit(&self, id: u32) {
        lock(&self.state).units.retain(|(unit, _)| *unit != id);
    }
}

impl TaskScheduler for MockScheduler {
    type Handle = u32;

    fn spawn(&self, name: &str, _stack_size: usize, _priority: u8, entry: TaskEntry) -> Result<u32, SchedulerError> {
        let id = self.add_unit(name);
        let mut state = lock(&self.state);
        state.spawned.push(name.to_string());
        if state.deferred {
            state.pending.push((id, entry));
        } else {
            let scheduler = self.clone();
            let thread = thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    entry();
                    scheduler.remove_unit(id);
                })
                .map_err(|_| SchedulerError(-1))?;
            state.threads.push(thread);
        }
        Ok(id)
    }

    fn current(&self) -> u32 {
        lock(&self.state).current
    }

    fn units(&self) -> Vec<(u32, String)> {
        let state = lock(&self.state);
        state
            .units
            .iter()
            .filter(|(id, _)| !state.suspended.contains(id))
            .cloned()
            .collect()
    }

    fn suspend(&self, handle: u32) {
        let mut state = lock(&self.state);
        state.suspend_calls += 1;
        if !state.suspended.contains(&handle) {
            state.suspended.push(handle);
        }
    }

    fn resume(&self, handle: u32) {
        let mut state = lock(&self.state);
        state.resume_calls += 1;
        state.suspended.retain(|h| *h != handle);
    }
}

// ---- Application hooks ----

/// Builds `UpdateHooks` that journal every callback
#[derive(Clone)]
pub struct Recorder {
    journal: Journal,
    progress: Arc<Mutex<Vec<u8>>>,
    failures: Arc<Mutex<Vec<String>>>,
    refuse_suspend: bool,
    refuse_resume: bool,
    resume_hook: bool,
}

impl Recorder {
    pub fn new(platform: &MockPlatform) -> Self {
        Self {
            journal: platform.journal(),
            progress: Arc::default(),
            failures: Arc::default(),
            refuse_suspend: false,
            refuse_resume: false,
            resume_hook: true,
        }
    }

    pub fn refuse_suspend(mut self) -> Self {
        self.refuse_suspend = true;
        self
    }

    pub fn refuse_resume(mut self) -> Self {
        self.refuse_resume = true;
        self
    }

    pub fn without_resume_hook(mut self) -> Self {
        self.resume_hook = false;
        self
    }

    pub fn progress(&self) -> Vec<u8> {
        lock(&self.progress).clone()
    }

    pub fn failures(&self) -> Vec<String> {
        lock(&self.failures).clone()
    }

    /// Number of terminal notifications fired
    pub fn outcomes(&self) -> usize {
        self.journal.count_matching(|e| {
            matches!(e, Event::Succeeded | Event::Failed(_) | Event::UpToDate)
        })
    }

    pub fn hooks(&self) -> UpdateHooks {
        let journal = self.journal.clone();
        let refuse = self.refuse_suspend;
        let suspend_tasks: HookFn = Arc::new(move || {
            journal.push(Event::Suspend);
            !refuse
        });

        let journal = self.journal.clone();
        let refuse = self.refuse_resume;
        let resume_tasks: HookFn = Arc::new(move || {
            journal.push(Event::Resume);
            !refuse
        });

        let journal = self.journal.clone();
        let on_start: Notify = Arc::new(move || journal.push(Event::Start));

        let journal = self.journal.clone();
        let progress = self.progress.clone();
        let on_progress: ProgressFn = Arc::new(move |percent: u8| {
            lock(&progress).push(percent);
            journal.push(Event::Progress(percent));
        });

        let journal = self.journal.clone();
        let on_succeeded: Notify = Arc::new(move || journal.push(Event::Succeeded));

        let journal = self.journal.clone();
        let failures = self.failures.clone();
        let on_failed: FailedFn = Arc::new(move |reason: &str| {
            lock(&failures).push(reason.to_string());
            journal.push(Event::Failed(reason.to_string()));
        });

        let journal = self.journal.clone();
        let on_up_to_date: Notify = Arc::new(move || journal.push(Event::UpToDate));

        UpdateHooks {
            suspend_tasks: Some(suspend_tasks),
            resume_tasks: if self.resume_hook { Some(resume_tasks) } else { None },
            on_start: Some(on_start),
            on_progress: Some(on_progress),
            on_succeeded: Some(on_succeeded),
            on_failed: Some(on_failed),
            on_up_to_date: Some(on_up_to_date),
        }
    }
}
