//! Contracts for the device services the core calls into.
//!
//! The firmware implements these over ESP-IDF; host tests use the in-memory
//! versions in [`crate::sim`].

use anyhow::Result;
use std::time::Duration;
use thiserror::Error;

/// Connectivity as sampled once per control-loop iteration.
///
/// `primary` is the Wi-Fi station link, `secondary` the management (MQTT) session
/// that rides on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkState {
    pub primary: bool,
    pub secondary: bool,
}

impl LinkState {
    pub const DOWN: LinkState = LinkState {
        primary: false,
        secondary: false,
    };
    pub const UP: LinkState = LinkState {
        primary: true,
        secondary: true,
    };

    pub fn new(primary: bool, secondary: bool) -> Self {
        Self { primary, secondary }
    }
}

pub trait ConnectivityProbe {
    fn link_state(&self) -> LinkState;
}

/// Upstream channel for status and failure reports.
pub trait Publisher {
    /// Publish one payload to the status topic. `Ok` means the message was
    /// handed to the transport and will be sent.
    fn publish(&mut self, payload: &[u8]) -> Result<()>;

    /// Service the management connection while the caller is blocked elsewhere.
    fn keep_alive(&mut self) {}

    /// Give queued outbound traffic up to `within` to leave the device.
    fn flush(&mut self, _within: Duration) {}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstallError {
    #[error("not enough space for the new image")]
    NotEnoughSpace,
    #[error("downloaded image failed verification")]
    CorruptImage,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("server answered HTTP {0}")]
    Http(u16),
    #[error("flash write failed: {0}")]
    Write(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Image written and selected for next boot.
    Ok,
    Failed(InstallError),
    /// Server had nothing to send.
    NoUpdate,
}

/// Lifecycle callbacks fired from inside the blocking install.
pub trait InstallHooks {
    fn on_start(&mut self, _total: Option<usize>) {}
    fn on_progress(&mut self, _written: usize, _total: Option<usize>) {}
    fn on_end(&mut self) {}
    fn on_error(&mut self, _error: &InstallError) {}
}

/// Blocking fetch-and-install of a firmware image.
///
/// Implementations fetch over their own transport (not the management
/// connection), follow redirects, and must never restart the device: the caller
/// owns the restart moment.
pub trait ImageInstaller {
    fn install(&mut self, url: &str, hooks: &mut dyn InstallHooks) -> InstallOutcome;
}

/// Boot-slot and reset control.
///
/// On hardware `rollback_and_restart` and `restart` do not return.
pub trait SystemControl {
    fn has_previous_image(&self) -> bool;
    fn rollback_and_restart(&mut self);
    fn restart(&mut self);

    /// Tell the bootloader the running image is good.
    fn mark_running_image_valid(&mut self) {}
}
