//! Sentinel Core - Hardware-independent OTA probation logic for the ESP32 update sentinel
//!
//! This crate holds everything that decides whether a freshly applied firmware image
//! is trusted, rolled back, or reported upstream. It talks to the device only through
//! the traits in [`platform`] and [`ledger`], so it builds and tests on the host.

pub mod clock;
pub mod config;
pub mod ledger;
pub mod messages;
pub mod orchestrator;
pub mod platform;
pub mod sim;
pub mod watchdog;

pub use clock::{ManualClock, Millis, MonotonicClock};
pub use config::SentinelConfig;
pub use ledger::{BootLedger, BootLedgerRecord, FailureReason, LedgerStore, MemoryStore};
pub use messages::{FailureReport, InstructionError, StatusReport, UpdateCommand, UpdateInstruction};
pub use orchestrator::{UpdateAttempt, UpdateOrchestrator, UpdateOutcome};
pub use platform::{
    ConnectivityProbe, ImageInstaller, InstallError, InstallHooks, InstallOutcome, LinkState,
    Publisher, SystemControl,
};
pub use watchdog::{ProbationConfig, ProbationVerdict, UpdateWatchdog, WatchdogState};
