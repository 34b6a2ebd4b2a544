pub mod flash;
pub mod scheduler;
pub mod transport;

pub use flash::EspFlashUpdater;
pub use scheduler::FreeRtosScheduler;
pub use transport::EspTlsTransport;
