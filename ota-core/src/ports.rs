// Collaborator interfaces - everything the core needs from the platform
//
// The firmware implements these on top of ESP-IDF; tests implement them with
// scripted doubles (see `mock`).

use core::fmt;
use core::time::Duration;

use thiserror::Error;

use crate::config::TrustAnchor;

// ---- Network / TLS ----

/// A single GET request over a verified secure channel
#[derive(Debug, Clone, Copy)]
pub struct HttpsRequest<'a> {
    pub url: &'a str,
    pub headers: &'a [(&'a str, &'a str)],
    pub trust_anchor: &'a TrustAnchor,
    /// Upper bound for connect and for each blocking read
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed (code {0})")]
    Connect(i32),
    #[error("server certificate rejected")]
    Certificate,
    #[error("request failed (code {0})")]
    Request(i32),
    #[error("read failed (code {0})")]
    Read(i32),
}

/// Result of one read from a response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRead {
    /// `n` bytes were copied into the buffer
    Data(usize),
    /// Connection is open but no bytes arrived within the read window
    Idle,
    /// Peer finished the body
    Closed,
}

/// Response half of an open connection. Dropping it releases the connection.
pub trait ResponseStream {
    fn status(&self) -> u16;
    /// Declared body length, if the server sent one
    fn content_length(&self) -> Option<u64>;
    fn read(&mut self, buf: &mut [u8]) -> Result<StreamRead, TransportError>;
}

pub trait SecureTransport {
    type Stream: ResponseStream;

    /// Connect, verify the peer against `request.trust_anchor`, send the
    /// request and wait for the response head.
    fn get(&mut self, request: &HttpsRequest<'_>) -> Result<Self::Stream, TransportError>;
}

// ---- Flash update driver ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSize {
    Known(u32),
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("flash driver error {code}")]
pub struct FlashError {
    pub code: i32,
}

/// Transactional firmware image writer (begin/write/abort/end)
pub trait FlashUpdater {
    fn begin(&mut self, size: ImageSize) -> Result<(), FlashError>;
    /// Returns the number of bytes accepted; anything short of `data.len()`
    /// is a failed write.
    fn write(&mut self, data: &[u8]) -> usize;
    /// Discard the session. Safe to call when no session is open.
    fn abort(&mut self);
    /// Commit the image. `allow_partial` finalizes an unknown-size session
    /// that did not fill the target slot.
    fn end(&mut self, allow_partial: bool) -> Result<(), FlashError>;
    /// True once a committed image is fully written and selected for boot
    fn is_finished(&self) -> bool;
    fn last_error(&self) -> i32;
}

// ---- Cooperative scheduler ----

pub type TaskEntry = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to create execution unit (code {0})")]
pub struct SchedulerError(pub i32);

/// Execution-unit control. A spawned unit is deleted by the scheduler when
/// its entry closure returns.
pub trait TaskScheduler: Send {
    type Handle: Copy + Eq + fmt::Debug + Send + 'static;

    fn spawn(
        &self,
        name: &str,
        stack_size: usize,
        priority: u8,
        entry: TaskEntry,
    ) -> Result<Self::Handle, SchedulerError>;
    fn current(&self) -> Self::Handle;
    /// Every unit known to the scheduler that is not already suspended, with its name
    fn units(&self) -> Vec<(Self::Handle, String)>;
    fn suspend(&self, handle: Self::Handle);
    fn resume(&self, handle: Self::Handle);
}

// ---- Device services ----

pub trait Platform: Send + Sync {
    /// Station interface is up with an address
    fn is_connected(&self) -> bool;
    /// Monotonic time since boot
    fn uptime(&self) -> Duration;
    fn delay(&self, duration: Duration);
    /// Let other units of equal or lower priority run
    fn yield_now(&self) {
        self.delay(Duration::from_millis(1));
    }
    /// Reboot into the newly selected image. Does not return on hardware.
    fn restart(&self);
    fn free_heap(&self) -> Option<usize> {
        None
    }
}
