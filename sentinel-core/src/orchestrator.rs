//! Update orchestrator.
//!
//! Turns an update instruction into an attempt: record its id through the
//! watchdog, fetch and install the image, report the outcome, and restart on
//! success. It also delivers, once per boot, the report of a rollback that
//! happened on a previous boot.

use std::time::Duration;

use log::{debug, error, info, warn};

use crate::clock::MonotonicClock;
use crate::ledger::LedgerStore;
use crate::messages::{FailureReport, InstructionError, StatusReport, UpdateCommand, UpdateInstruction};
use crate::platform::{
    ConnectivityProbe, ImageInstaller, InstallError, InstallHooks, InstallOutcome, Publisher,
    SystemControl,
};
use crate::watchdog::{ProbationVerdict, UpdateWatchdog};

/// Progress of the current (or last) update attempt in this boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateAttempt {
    Idle,
    /// Id persisted, download not started yet.
    Pending(String),
    Applying(String),
    ReportedFailed(String),
    /// Restart into the new image requested.
    ReportedCompleted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Instruction was unusable; nothing changed.
    Discarded(InstructionError),
    Failed { id: String },
    Completed { id: String },
}

pub struct UpdateOrchestrator<I: ImageInstaller, P: Publisher> {
    installer: I,
    publisher: P,
    settle: Duration,
    attempt: UpdateAttempt,
    failure_report_done: bool,
}

impl<I: ImageInstaller, P: Publisher> UpdateOrchestrator<I, P> {
    pub fn new(installer: I, publisher: P, settle: Duration) -> Self {
        Self {
            installer,
            publisher,
            settle,
            attempt: UpdateAttempt::Idle,
            failure_report_done: false,
        }
    }

    /// One control-loop iteration: deliver any pending failure report once the
    /// management link is up, then feed the watchdog.
    pub fn poll<S, C, X>(
        &mut self,
        watchdog: &mut UpdateWatchdog<S, C, X>,
        probe: &impl ConnectivityProbe,
    ) -> ProbationVerdict
    where
        S: LedgerStore,
        C: MonotonicClock,
        X: SystemControl,
    {
        let links = probe.link_state();
        if links.secondary {
            self.report_pending_failure(watchdog);
        }
        watchdog.observe(links.primary, links.secondary)
    }

    /// Raw instruction bytes from the command topic.
    pub fn handle_message<S, C, X>(
        &mut self,
        watchdog: &mut UpdateWatchdog<S, C, X>,
        payload: &[u8],
    ) -> UpdateOutcome
    where
        S: LedgerStore,
        C: MonotonicClock,
        X: SystemControl,
    {
        match UpdateCommand::from_json(payload) {
            Ok(cmd) => self.receive(watchdog, cmd),
            Err(e) => {
                warn!("Dropping update instruction: {}", e);
                UpdateOutcome::Discarded(e)
            }
        }
    }

    /// Validate an instruction and, if usable, run the update.
    ///
    /// The id reaches flash before any network traffic for the download, so a
    /// power cut mid-transfer still leaves the right id for the next boot.
    pub fn receive<S, C, X>(
        &mut self,
        watchdog: &mut UpdateWatchdog<S, C, X>,
        cmd: UpdateCommand,
    ) -> UpdateOutcome
    where
        S: LedgerStore,
        C: MonotonicClock,
        X: SystemControl,
    {
        let instruction = match UpdateInstruction::try_from(cmd) {
            Ok(i) => i,
            Err(e) => {
                warn!("Dropping update instruction: {}", e);
                return UpdateOutcome::Discarded(e);
            }
        };

        info!(
            "Update {} requested (version {})",
            instruction.id,
            instruction.version.as_deref().unwrap_or("unspecified")
        );

        if let Err(e) = watchdog.set_pending_id(&instruction.id) {
            // Without the id on flash a rollback could not be attributed.
            error!("Cannot persist update id {}: {:?}", instruction.id, e);
            self.publish_status(&StatusReport::failed(&instruction.id));
            self.attempt = UpdateAttempt::ReportedFailed(instruction.id.clone());
            return UpdateOutcome::Failed { id: instruction.id };
        }
        self.attempt = UpdateAttempt::Pending(instruction.id.clone());

        self.apply(watchdog, &instruction)
    }

    /// Fetch and install, then report. On success this ends in a restart and
    /// the pending id is left in place for the next boot's probation.
    pub fn apply<S, C, X>(
        &mut self,
        watchdog: &mut UpdateWatchdog<S, C, X>,
        instruction: &UpdateInstruction,
    ) -> UpdateOutcome
    where
        S: LedgerStore,
        C: MonotonicClock,
        X: SystemControl,
    {
        let id = instruction.id.clone();
        self.attempt = UpdateAttempt::Applying(id.clone());
        info!("Fetching image from {}", instruction.source_url);

        let outcome = {
            let mut hooks = KeepAliveHooks::new(&mut self.publisher);
            self.installer.install(&instruction.source_url, &mut hooks)
        };

        match outcome {
            InstallOutcome::Ok => {
                info!("Update {} installed, restarting into new image", id);
                self.publish_status(&StatusReport::completed(&id));
                self.publisher.flush(self.settle);
                self.attempt = UpdateAttempt::ReportedCompleted(id.clone());
                watchdog.restart();
                UpdateOutcome::Completed { id }
            }
            InstallOutcome::Failed(e) => {
                warn!("Update {} failed: {}", id, e);
                self.fail_before_reboot(watchdog, id)
            }
            InstallOutcome::NoUpdate => {
                warn!("Update {}: server had no image to send", id);
                self.fail_before_reboot(watchdog, id)
            }
        }
    }

    /// Publish the reason a previous boot rolled back, if any. Runs until it
    /// has either delivered a report or found nothing to report, then stays
    /// quiet for the rest of the boot.
    pub fn report_pending_failure<S, C, X>(&mut self, watchdog: &mut UpdateWatchdog<S, C, X>) -> bool
    where
        S: LedgerStore,
        C: MonotonicClock,
        X: SystemControl,
    {
        if self.failure_report_done {
            return false;
        }

        let reason = watchdog.last_failure();
        if !reason.is_failure() {
            debug!("No rollback to report");
            self.failure_report_done = true;
            return false;
        }

        let id = watchdog.pending_id().unwrap_or_default();
        let report = FailureReport::new(reason, &id);
        match self.publisher.publish(&report.to_payload()) {
            Ok(()) => {
                info!("Reported rollback of update '{}' ({})", id, reason);
                watchdog.clear_failure();
                self.failure_report_done = true;
                true
            }
            Err(e) => {
                warn!("Rollback report not sent, will retry on next connection: {:?}", e);
                false
            }
        }
    }

    pub fn attempt(&self) -> &UpdateAttempt {
        &self.attempt
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn publisher_mut(&mut self) -> &mut P {
        &mut self.publisher
    }

    pub fn installer(&self) -> &I {
        &self.installer
    }

    // Nothing was flashed for the next boot, so there is nothing to validate.
    fn fail_before_reboot<S, C, X>(
        &mut self,
        watchdog: &mut UpdateWatchdog<S, C, X>,
        id: String,
    ) -> UpdateOutcome
    where
        S: LedgerStore,
        C: MonotonicClock,
        X: SystemControl,
    {
        self.publish_status(&StatusReport::failed(&id));
        watchdog.clear_pending_id();
        self.attempt = UpdateAttempt::ReportedFailed(id.clone());
        UpdateOutcome::Failed { id }
    }

    fn publish_status(&mut self, report: &StatusReport<'_>) {
        if let Err(e) = self.publisher.publish(&report.to_payload()) {
            warn!("Status report for update {} not sent: {:?}", report.ota_id, e);
        }
    }
}

/// Keeps the management link serviced while the installer blocks.
struct KeepAliveHooks<'a, P: Publisher> {
    publisher: &'a mut P,
    last_logged_pct: Option<usize>,
}

impl<'a, P: Publisher> KeepAliveHooks<'a, P> {
    fn new(publisher: &'a mut P) -> Self {
        Self {
            publisher,
            last_logged_pct: None,
        }
    }
}

impl<P: Publisher> InstallHooks for KeepAliveHooks<'_, P> {
    fn on_start(&mut self, total: Option<usize>) {
        match total {
            Some(bytes) => info!("Update transfer started, {} bytes", bytes),
            None => info!("Update transfer started, size unknown"),
        }
        self.publisher.keep_alive();
    }

    fn on_progress(&mut self, written: usize, total: Option<usize>) {
        self.publisher.keep_alive();
        if let Some(total) = total.filter(|t| *t > 0) {
            let pct = written.saturating_mul(100) / total;
            let step = pct / 10;
            if self.last_logged_pct != Some(step) {
                self.last_logged_pct = Some(step);
                info!("Update progress: {}% ({}/{})", pct, written, total);
            }
        } else {
            debug!("Update progress: {} bytes", written);
        }
    }

    fn on_end(&mut self) {
        info!("Update transfer finished");
        self.publisher.keep_alive();
    }

    fn on_error(&mut self, error: &InstallError) {
        error!("Update transfer error: {}", error);
    }
}
