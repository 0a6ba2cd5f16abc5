// Update watchdog - decides whether the running image is trusted or rolled back

use std::time::Duration;

use log::{debug, error, info, warn};

use crate::clock::{Millis, MonotonicClock};
use crate::ledger::{BootLedger, FailureReason, LedgerStore};
use crate::platform::SystemControl;

/// Continuous good connectivity required before the image is trusted.
pub const STABILITY_DURATION: Duration = Duration::from_secs(60);
/// Hard deadline from boot to validate or roll back.
pub const TOTAL_PROBATION_LIMIT: Duration = Duration::from_secs(300);
/// Boots without validation beyond this are treated as a crash loop.
pub const MAX_CRASH_ATTEMPTS: u32 = 3;
/// How long the clock may stay unsynchronised while on probation.
pub const TIME_SYNC_LIMIT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbationConfig {
    pub stability_duration: Duration,
    pub total_probation_limit: Duration,
    pub max_crash_attempts: u32,
    pub time_sync_limit: Duration,
}

impl ProbationConfig {
    pub const DEFAULT: ProbationConfig = ProbationConfig {
        stability_duration: STABILITY_DURATION,
        total_probation_limit: TOTAL_PROBATION_LIMIT,
        max_crash_attempts: MAX_CRASH_ATTEMPTS,
        time_sync_limit: TIME_SYNC_LIMIT,
    };
}

impl Default for ProbationConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Per-boot lifecycle. `Validated` and `RolledBack` are terminal until restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Booting,
    OnProbation,
    Validated,
    RolledBack(FailureReason),
}

/// Result of one probation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbationVerdict {
    Pending,
    Validated,
    RolledBack(FailureReason),
}

// In-memory timers, rebuilt every boot
#[derive(Debug, Clone, Copy)]
struct ProbationState {
    boot_time: Millis,
    stability_start: Option<Millis>,
    // First sample with Wi-Fi up; SNTP cannot make progress before it.
    primary_up_since: Option<Millis>,
    validated: bool,
}

/// Owns the probation timers for this boot and is the only writer of the boot
/// counter and failure reason in the ledger.
pub struct UpdateWatchdog<S: LedgerStore, C: MonotonicClock, X: SystemControl> {
    ledger: BootLedger<S>,
    clock: C,
    system: X,
    config: ProbationConfig,
    probation: ProbationState,
    state: WatchdogState,
    boot_attempt: u32,
}

impl<S: LedgerStore, C: MonotonicClock, X: SystemControl> UpdateWatchdog<S, C, X> {
    pub fn new(store: S, clock: C, system: X) -> Self {
        Self::with_config(store, clock, system, ProbationConfig::DEFAULT)
    }

    pub fn with_config(store: S, clock: C, system: X, config: ProbationConfig) -> Self {
        let boot_time = clock.now();
        Self {
            ledger: BootLedger::new(store),
            clock,
            system,
            config,
            probation: ProbationState {
                boot_time,
                stability_start: None,
                primary_up_since: None,
                validated: false,
            },
            state: WatchdogState::Booting,
            boot_attempt: 0,
        }
    }

    /// Count this boot and start probation.
    ///
    /// The incremented counter is flushed before anything else happens so a
    /// crash later in this boot is still counted. A counter above
    /// `max_crash_attempts` rolls back immediately with [`FailureReason::CrashLoop`].
    pub fn initialize(&mut self) -> WatchdogState {
        if self.state != WatchdogState::Booting {
            warn!("Watchdog already initialized ({:?})", self.state);
            return self.state;
        }

        self.probation = ProbationState {
            boot_time: self.clock.now(),
            stability_start: None,
            primary_up_since: None,
            validated: false,
        };

        let boots = self.ledger.boot_count().saturating_add(1);
        self.boot_attempt = boots;
        if let Err(e) = self
            .ledger
            .set_boot_count(boots)
            .and_then(|_| self.ledger.flush())
        {
            error!("Failed to persist boot count {}: {:?}", boots, e);
        }
        info!(
            "Boot attempt {} of {} before crash-loop rollback",
            boots, self.config.max_crash_attempts
        );

        self.state = WatchdogState::OnProbation;

        if boots > self.config.max_crash_attempts {
            error!("Crash loop detected: {} boots without validation", boots);
            self.trigger_rollback(FailureReason::CrashLoop);
        }

        self.state
    }

    /// Feed one connectivity sample. Cheap and non-blocking; a no-op once the
    /// boot has reached a terminal state.
    pub fn observe(&mut self, primary_up: bool, secondary_up: bool) -> ProbationVerdict {
        if self.state != WatchdogState::OnProbation {
            return self.verdict();
        }

        let now = self.clock.now();
        let on_probation = now.elapsed_since(self.probation.boot_time);

        if on_probation > self.config.total_probation_limit {
            warn!(
                "Probation limit of {}s passed without validation",
                self.config.total_probation_limit.as_secs()
            );
            let reason = if !primary_up {
                FailureReason::WifiTimeout
            } else if !secondary_up {
                FailureReason::TransportTimeout
            } else {
                FailureReason::Unstable
            };
            self.trigger_rollback(reason);
            return self.verdict();
        }

        if primary_up && self.probation.primary_up_since.is_none() {
            self.probation.primary_up_since = Some(now);
        }

        if primary_up && secondary_up {
            let start = match self.probation.stability_start {
                Some(start) => start,
                None => {
                    info!(
                        "Connectivity established, starting {}s stability check",
                        self.config.stability_duration.as_secs()
                    );
                    self.probation.stability_start = Some(now);
                    now
                }
            };

            if now.elapsed_since(start) >= self.config.stability_duration {
                self.validate();
            }
        } else if self.probation.stability_start.take().is_some() {
            warn!(
                "Connectivity lost during stability check (wifi={}, mqtt={}), timer reset",
                primary_up, secondary_up
            );
        }

        self.verdict()
    }

    /// Roll back with [`FailureReason::TimeSyncFailure`] if the clock is still
    /// unsynchronised `time_sync_limit` after Wi-Fi first came up. Until `observe`
    /// has seen the primary link up this never fires, so a Wi-Fi outage runs
    /// into the probation deadline and is reported as [`FailureReason::WifiTimeout`].
    pub fn observe_time_sync(&mut self, synced: bool) -> ProbationVerdict {
        if self.state != WatchdogState::OnProbation || synced {
            return self.verdict();
        }
        let Some(since) = self.probation.primary_up_since else {
            return self.verdict();
        };

        let waited = self.clock.now().elapsed_since(since);
        if waited > self.config.time_sync_limit {
            warn!("Time not synchronised after {}s", waited.as_secs());
            self.trigger_rollback(FailureReason::TimeSyncFailure);
        }
        self.verdict()
    }

    /// Trust the running image: clear the counter, the failure reason and the
    /// pending update id. Only the first call in a boot has any effect.
    pub fn validate(&mut self) {
        if self.probation.validated {
            return;
        }
        if let WatchdogState::RolledBack(reason) = self.state {
            warn!("Ignoring validation, rollback ({}) already under way", reason);
            return;
        }

        self.probation.validated = true;
        self.state = WatchdogState::Validated;

        let persisted = self
            .ledger
            .set_boot_count(0)
            .and_then(|_| self.ledger.set_last_failure(FailureReason::None))
            .and_then(|_| self.ledger.clear_pending_update_id())
            .and_then(|_| self.ledger.flush());
        if let Err(e) = persisted {
            error!("Failed to persist validation: {:?}", e);
        }

        self.system.mark_running_image_valid();
        info!("Firmware validated, runtime checks passed");
    }

    /// Abandon this image. Persists `reason`, resets the boot counter for the
    /// image we fall back to, then rolls back and restarts; restarts without
    /// rollback if there is no previous image. Only the first call in a boot has
    /// any effect.
    pub fn trigger_rollback(&mut self, reason: FailureReason) {
        if let WatchdogState::RolledBack(previous) = self.state {
            debug!("Rollback already triggered ({}), ignoring {}", previous, reason);
            return;
        }

        warn!("Rolling back, reason: {}", reason);
        self.state = WatchdogState::RolledBack(reason);

        let persisted = self
            .ledger
            .set_last_failure(reason)
            .and_then(|_| self.ledger.set_boot_count(0))
            .and_then(|_| self.ledger.flush());
        if let Err(e) = persisted {
            error!("Failed to persist rollback reason {}: {:?}", reason, e);
        }

        if self.system.has_previous_image() {
            self.system.rollback_and_restart();
        } else {
            error!("No previous image to roll back to, restarting anyway");
            self.system.restart();
        }
    }

    pub fn last_failure(&self) -> FailureReason {
        self.ledger.last_failure()
    }

    pub fn pending_id(&self) -> Option<String> {
        self.ledger.pending_update_id()
    }

    /// Record the update about to be attempted, durably.
    pub fn set_pending_id(&mut self, id: &str) -> anyhow::Result<()> {
        self.ledger.set_pending_update_id(id)?;
        self.ledger.flush()
    }

    pub fn clear_pending_id(&mut self) {
        let cleared = self
            .ledger
            .clear_pending_update_id()
            .and_then(|_| self.ledger.flush());
        if let Err(e) = cleared {
            error!("Failed to clear pending update id: {:?}", e);
        }
    }

    /// Forget a failure once it has been reported upstream.
    pub fn clear_failure(&mut self) {
        let cleared = self
            .ledger
            .set_last_failure(FailureReason::None)
            .and_then(|_| self.ledger.clear_pending_update_id())
            .and_then(|_| self.ledger.flush());
        if let Err(e) = cleared {
            error!("Failed to clear reported failure: {:?}", e);
        }
    }

    /// Restart into whatever image the bootloader selects, after making sure
    /// the ledger is on flash.
    pub fn restart(&mut self) {
        if let Err(e) = self.ledger.flush() {
            error!("Ledger flush before restart failed: {:?}", e);
        }
        self.system.restart();
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn is_validated(&self) -> bool {
        self.probation.validated
    }

    /// Boot counter value computed by `initialize`.
    pub fn boot_attempt(&self) -> u32 {
        self.boot_attempt
    }

    pub fn config(&self) -> &ProbationConfig {
        &self.config
    }

    pub fn ledger(&self) -> &BootLedger<S> {
        &self.ledger
    }

    pub fn system(&self) -> &X {
        &self.system
    }

    /// Hand back the store, as a reboot would leave it.
    pub fn into_store(self) -> S {
        self.ledger.into_store()
    }

    fn verdict(&self) -> ProbationVerdict {
        match self.state {
            WatchdogState::Validated => ProbationVerdict::Validated,
            WatchdogState::RolledBack(reason) => ProbationVerdict::RolledBack(reason),
            WatchdogState::Booting | WatchdogState::OnProbation => ProbationVerdict::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::{MemoryStore, KEY_BOOT_COUNT};
    use crate::sim::SimSystem;
    use proptest::prelude::*;

    type TestWatchdog = UpdateWatchdog<MemoryStore, ManualClock, SimSystem>;

    fn booted(store: MemoryStore, clock: &ManualClock) -> TestWatchdog {
        let mut wd = UpdateWatchdog::new(store, clock.clone(), SimSystem::new());
        wd.initialize();
        wd
    }

    /// Run `n` one-second iterations with the given links.
    fn run_secs(wd: &mut TestWatchdog, clock: &ManualClock, n: u64, wifi: bool, mqtt: bool) {
        for _ in 0..n {
            clock.advance_secs(1);
            wd.observe(wifi, mqtt);
        }
    }

    #[test]
    fn test_first_boot_counts_one() {
        let clock = ManualClock::new();
        let wd = booted(MemoryStore::new(), &clock);
        assert_eq!(wd.boot_attempt(), 1);
        assert_eq!(wd.ledger().boot_count(), 1);
        assert_eq!(wd.state(), WatchdogState::OnProbation);
        assert!(!wd.ledger().store().is_dirty());
    }

    #[test]
    fn test_fourth_unvalidated_boot_is_crash_loop() {
        let clock = ManualClock::new();
        let mut store = MemoryStore::new();
        for attempt in 1..=3 {
            let wd = booted(store, &clock);
            assert_eq!(wd.boot_attempt(), attempt);
            assert_eq!(wd.state(), WatchdogState::OnProbation);
            store = wd.into_store();
        }

        let wd = booted(store, &clock);
        assert_eq!(
            wd.state(),
            WatchdogState::RolledBack(FailureReason::CrashLoop)
        );
        assert_eq!(wd.system().rollbacks, 1);
        assert_eq!(wd.ledger().boot_count(), 0);
        assert_eq!(wd.last_failure(), FailureReason::CrashLoop);
    }

    #[test]
    fn test_saturated_counter_still_rolls_back() {
        let clock = ManualClock::new();
        let mut store = MemoryStore::new();
        store.set_u32(KEY_BOOT_COUNT, u32::MAX).unwrap();
        let wd = booted(store, &clock);
        assert_eq!(wd.boot_attempt(), u32::MAX);
        assert_eq!(
            wd.state(),
            WatchdogState::RolledBack(FailureReason::CrashLoop)
        );
    }

    #[test]
    fn test_validates_after_sixty_continuous_seconds() {
        let clock = ManualClock::new();
        let mut wd = booted(MemoryStore::new(), &clock);

        wd.observe(true, true);
        run_secs(&mut wd, &clock, 59, true, true);
        assert_eq!(wd.state(), WatchdogState::OnProbation);

        clock.advance_secs(1);
        assert_eq!(wd.observe(true, true), ProbationVerdict::Validated);
        assert_eq!(wd.ledger().boot_count(), 0);
        assert_eq!(wd.system().marked_valid, 1);
    }

    #[test]
    fn test_drop_restarts_stability_count() {
        let clock = ManualClock::new();
        let mut wd = booted(MemoryStore::new(), &clock);

        wd.observe(true, true);
        run_secs(&mut wd, &clock, 59, true, true);
        run_secs(&mut wd, &clock, 1, true, false);
        // Back up: the next sample starts a new window.
        run_secs(&mut wd, &clock, 60, true, true);
        assert_eq!(wd.state(), WatchdogState::OnProbation);

        run_secs(&mut wd, &clock, 1, true, true);
        assert_eq!(wd.state(), WatchdogState::Validated);
        assert_eq!(wd.boot_attempt(), 1);
    }

    #[test]
    fn test_timeout_reason_priority() {
        let cases = [
            (false, false, FailureReason::WifiTimeout),
            (false, true, FailureReason::WifiTimeout),
            (true, false, FailureReason::TransportTimeout),
            (true, true, FailureReason::Unstable),
        ];
        for (wifi, mqtt, expected) in cases {
            let clock = ManualClock::new();
            let mut wd = booted(MemoryStore::new(), &clock);
            clock.advance(TOTAL_PROBATION_LIMIT + Duration::from_millis(1));
            assert_eq!(wd.observe(wifi, mqtt), ProbationVerdict::RolledBack(expected));
            assert_eq!(wd.last_failure(), expected);
            assert_eq!(wd.ledger().boot_count(), 0);
        }
    }

    #[test]
    fn test_exact_limit_is_not_a_timeout() {
        let clock = ManualClock::new();
        let mut wd = booted(MemoryStore::new(), &clock);
        clock.advance(TOTAL_PROBATION_LIMIT);
        assert_eq!(wd.observe(false, false), ProbationVerdict::Pending);
    }

    #[test]
    fn test_flapping_link_ends_unstable() {
        let clock = ManualClock::new();
        let mut wd = booted(MemoryStore::new(), &clock);
        let mut up = true;
        while wd.state() == WatchdogState::OnProbation {
            run_secs(&mut wd, &clock, 30, up, up);
            up = !up;
            // Guard against a broken state machine looping forever
            assert!(clock.now().0 < 400_000);
        }
        // 30s phases starting at t=1: t=301 opens the eleventh phase, an up one.
        assert_eq!(wd.state(), WatchdogState::RolledBack(FailureReason::Unstable));
    }

    #[test]
    fn test_rollback_without_previous_image_restarts() {
        let clock = ManualClock::new();
        let mut wd = UpdateWatchdog::new(
            MemoryStore::new(),
            clock.clone(),
            SimSystem::without_previous_image(),
        );
        wd.initialize();
        wd.trigger_rollback(FailureReason::Unstable);
        assert_eq!(wd.system().rollbacks, 0);
        assert_eq!(wd.system().restarts, 1);
        assert_eq!(wd.last_failure(), FailureReason::Unstable);
    }

    #[test]
    fn test_rollback_and_validate_are_idempotent() {
        let clock = ManualClock::new();
        let mut wd = booted(MemoryStore::new(), &clock);
        wd.trigger_rollback(FailureReason::WifiTimeout);
        wd.trigger_rollback(FailureReason::Unstable);
        wd.validate();
        assert_eq!(wd.system().reset_count(), 1);
        assert_eq!(wd.last_failure(), FailureReason::WifiTimeout);

        let mut wd = booted(MemoryStore::new(), &clock);
        wd.validate();
        let flushes = wd.ledger().store().flush_count();
        wd.validate();
        assert_eq!(wd.ledger().store().flush_count(), flushes);
        assert_eq!(wd.system().marked_valid, 1);
    }

    #[test]
    fn test_observe_after_terminal_state_is_noop() {
        let clock = ManualClock::new();
        let mut wd = booted(MemoryStore::new(), &clock);
        wd.validate();
        clock.advance_secs(1_000);
        assert_eq!(wd.observe(false, false), ProbationVerdict::Validated);
        assert_eq!(wd.system().reset_count(), 0);
    }

    #[test]
    fn test_time_sync_deadline_counts_from_wifi_up() {
        let clock = ManualClock::new();
        let mut wd = booted(MemoryStore::new(), &clock);
        // Wi-Fi comes up 30s in, broker never does.
        run_secs(&mut wd, &clock, 30, false, false);
        wd.observe(true, false);
        clock.advance(TIME_SYNC_LIMIT);
        assert_eq!(wd.observe_time_sync(false), ProbationVerdict::Pending);
        clock.advance_secs(1);
        assert_eq!(wd.observe_time_sync(true), ProbationVerdict::Pending);
        assert_eq!(
            wd.observe_time_sync(false),
            ProbationVerdict::RolledBack(FailureReason::TimeSyncFailure)
        );
    }

    #[test]
    fn test_wifi_outage_is_not_a_time_sync_failure() {
        // Same order as the firmware control loop: links, then time sync.
        let clock = ManualClock::new();
        let mut wd = booted(MemoryStore::new(), &clock);
        let mut verdict = ProbationVerdict::Pending;
        let mut secs = 0;
        while verdict == ProbationVerdict::Pending && secs < 400 {
            clock.advance_secs(1);
            secs += 1;
            wd.observe(false, false);
            verdict = wd.observe_time_sync(false);
        }
        assert_eq!(verdict, ProbationVerdict::RolledBack(FailureReason::WifiTimeout));
        assert_eq!(secs, 301);
        assert_eq!(wd.last_failure(), FailureReason::WifiTimeout);
    }

    #[test]
    fn test_probation_survives_counter_wrap() {
        let clock = ManualClock::starting_at(u32::MAX - 10_000);
        let mut wd = booted(MemoryStore::new(), &clock);
        wd.observe(true, true);
        run_secs(&mut wd, &clock, 60, true, true);
        assert_eq!(wd.state(), WatchdogState::Validated);
    }

    #[test]
    fn test_validated_boot_resets_count_for_next_boot() {
        let clock = ManualClock::new();
        let mut store = MemoryStore::new();
        store.set_u32(KEY_BOOT_COUNT, 2).unwrap();
        let mut wd = booted(store, &clock);
        assert_eq!(wd.boot_attempt(), 3);
        wd.validate();

        let wd = booted(wd.into_store(), &clock);
        assert_eq!(wd.boot_attempt(), 1);
    }

    #[test]
    fn test_custom_probation_config() {
        let config = ProbationConfig {
            stability_duration: Duration::from_secs(5),
            max_crash_attempts: 1,
            ..ProbationConfig::DEFAULT
        };
        let clock = ManualClock::new();
        let mut wd =
            UpdateWatchdog::with_config(MemoryStore::new(), clock.clone(), SimSystem::new(), config);
        wd.initialize();
        // Stability starts at the first sample, one second in.
        run_secs(&mut wd, &clock, 6, true, true);
        assert_eq!(wd.state(), WatchdogState::Validated);

        // A single unvalidated boot is already one too many.
        let mut store = wd.into_store();
        store.set_u32(KEY_BOOT_COUNT, 1).unwrap();
        let mut wd = UpdateWatchdog::with_config(store, clock.clone(), SimSystem::new(), config);
        assert_eq!(
            wd.initialize(),
            WatchdogState::RolledBack(FailureReason::CrashLoop)
        );
    }

    // Reference model: validated iff some run of consecutive fully-up samples
    // spans at least the stability duration and ends inside the probation limit.
    fn model_validates(samples: &[(u32, bool)], config: &ProbationConfig) -> bool {
        let stability = config.stability_duration.as_millis() as u64;
        let limit = config.total_probation_limit.as_millis() as u64;
        let mut t = 0u64;
        let mut run_start: Option<u64> = None;
        for &(step, up) in samples {
            t += step as u64;
            if t > limit {
                return false;
            }
            if up {
                let start = *run_start.get_or_insert(t);
                if t - start >= stability {
                    return true;
                }
            } else {
                run_start = None;
            }
        }
        false
    }

    proptest! {
        #[test]
        fn prop_validation_iff_continuous_window(
            samples in prop::collection::vec((0u32..20_000, any::<bool>()), 1..80)
        ) {
            let clock = ManualClock::new();
            let mut wd = booted(MemoryStore::new(), &clock);
            for &(step, up) in &samples {
                clock.advance(Duration::from_millis(step as u64));
                wd.observe(up, up);
            }
            prop_assert_eq!(wd.is_validated(), model_validates(&samples, wd.config()));
        }

        #[test]
        fn prop_boot_count_increments_by_one(previous in 0u32..=MAX_CRASH_ATTEMPTS) {
            let clock = ManualClock::new();
            let mut store = MemoryStore::new();
            store.set_u32(KEY_BOOT_COUNT, previous).unwrap();
            let wd = booted(store, &clock);
            prop_assert_eq!(wd.boot_attempt(), previous + 1);
        }
    }
}
