//! In-memory collaborators for host simulation and tests.

use crate::platform::{
    ConnectivityProbe, ImageInstaller, InstallError, InstallHooks, InstallOutcome, LinkState,
    Publisher, SystemControl,
};
use anyhow::Result;
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// Records restarts instead of performing them.
#[derive(Debug, Clone)]
pub struct SimSystem {
    pub previous_image: bool,
    pub rollbacks: u32,
    pub restarts: u32,
    pub marked_valid: u32,
}

impl SimSystem {
    pub fn new() -> Self {
        Self {
            previous_image: true,
            rollbacks: 0,
            restarts: 0,
            marked_valid: 0,
        }
    }

    pub fn without_previous_image() -> Self {
        Self {
            previous_image: false,
            ..Self::new()
        }
    }

    /// Any kind of reset, rollback included.
    pub fn reset_count(&self) -> u32 {
        self.rollbacks + self.restarts
    }
}

impl Default for SimSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemControl for SimSystem {
    fn has_previous_image(&self) -> bool {
        self.previous_image
    }

    fn rollback_and_restart(&mut self) {
        self.rollbacks += 1;
    }

    fn restart(&mut self) {
        self.restarts += 1;
    }

    fn mark_running_image_valid(&mut self) {
        self.marked_valid += 1;
    }
}

/// Collects published payloads; can be told to refuse them.
#[derive(Debug, Clone, Default)]
pub struct SimPublisher {
    pub sent: Vec<String>,
    pub offline: bool,
    pub keep_alives: u32,
    pub flushed: Vec<Duration>,
}

impl SimPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&str> {
        self.sent.last().map(String::as_str)
    }
}

impl Publisher for SimPublisher {
    fn publish(&mut self, payload: &[u8]) -> Result<()> {
        if self.offline {
            anyhow::bail!("management link is down");
        }
        self.sent.push(String::from_utf8_lossy(payload).into_owned());
        Ok(())
    }

    fn keep_alive(&mut self) {
        self.keep_alives += 1;
    }

    fn flush(&mut self, within: Duration) {
        self.flushed.push(within);
    }
}

/// Installer that replays a queue of outcomes, firing hooks like a real
/// transfer of `image_size` bytes in 4 KiB chunks.
#[derive(Debug, Clone)]
pub struct ScriptedInstaller {
    outcomes: VecDeque<InstallOutcome>,
    pub image_size: usize,
    pub requested: Vec<String>,
}

impl ScriptedInstaller {
    pub fn new(outcomes: impl IntoIterator<Item = InstallOutcome>) -> Self {
        Self {
            outcomes: outcomes.into_iter().collect(),
            image_size: 16 * 1024,
            requested: Vec::new(),
        }
    }

    pub fn succeeding() -> Self {
        Self::new([InstallOutcome::Ok])
    }

    pub fn failing(error: InstallError) -> Self {
        Self::new([InstallOutcome::Failed(error)])
    }
}

impl ImageInstaller for ScriptedInstaller {
    fn install(&mut self, url: &str, hooks: &mut dyn InstallHooks) -> InstallOutcome {
        self.requested.push(url.to_string());
        let outcome = self
            .outcomes
            .pop_front()
            .unwrap_or(InstallOutcome::Failed(InstallError::Connection(
                "no scripted outcome".into(),
            )));

        if outcome == InstallOutcome::NoUpdate {
            return outcome;
        }

        let total = Some(self.image_size);
        hooks.on_start(total);
        let mut written = 0;
        while written < self.image_size {
            written = (written + 4096).min(self.image_size);
            hooks.on_progress(written, total);
        }
        match &outcome {
            InstallOutcome::Failed(e) => hooks.on_error(e),
            _ => hooks.on_end(),
        }
        outcome
    }
}

/// Link state the test flips between iterations. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimLinks {
    state: Rc<Cell<LinkState>>,
}

impl SimLinks {
    pub fn new(initial: LinkState) -> Self {
        Self {
            state: Rc::new(Cell::new(initial)),
        }
    }

    pub fn set(&self, state: LinkState) {
        self.state.set(state);
    }
}

impl ConnectivityProbe for SimLinks {
    fn link_state(&self) -> LinkState {
        self.state.get()
    }
}
