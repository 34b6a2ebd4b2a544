//! OTA Core - hardware-independent firmware self-update logic
//!
//! This crate contains the update orchestration state machine and everything
//! it drives: manifest retrieval, streamed download-to-flash, and task
//! quiescence. Platform services (TLS transport, flash driver, scheduler,
//! restart) are reached only through the traits in [`ports`], so the whole
//! crate can be tested on the host platform without ESP32 hardware.

pub mod bounded;
pub mod config;
pub mod manifest;
pub mod orchestrator;
pub mod ports;
pub mod quiesce;
pub mod shell;
pub mod transfer;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use bounded::{BoundedText, TextError, UrlString, VersionString};
pub use config::{ConfigError, OrchestratorConfig, SizePolicy, TrustAnchor};
pub use manifest::{Manifest, ManifestClient, ManifestError};
pub use orchestrator::{CheckError, FailureReason, UpdateHooks, UpdateOutcome, Updater};
pub use quiesce::{HookQuiescence, Quiesce, QuiescenceError, TaskQuiescence};
pub use transfer::{TransferEngine, TransferError, TransferReport};
