//! Persistent boot ledger.
//!
//! Three keys in one storage namespace survive every reboot: how many times the
//! current image has booted without validating, why the last rollback happened,
//! and which update it is blamed on. The ledger only knows how to encode those
//! facts; deciding when to change them is the watchdog's and orchestrator's job.

use anyhow::Result;
use std::collections::HashMap;

/// Storage namespace shared by all three keys.
pub const NAMESPACE: &str = "ota_diag";

pub const KEY_BOOT_COUNT: &str = "boot_count";
pub const KEY_LAST_FAIL: &str = "last_fail";
pub const KEY_FAIL_OTA_ID: &str = "fail_ota_id";

/// Why the previous image was abandoned.
///
/// Persisted as an integer code under [`KEY_LAST_FAIL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FailureReason {
    #[default]
    None,
    CrashLoop,
    WifiTimeout,
    TransportTimeout,
    Unstable,
    TimeSyncFailure,
    /// A stored code this firmware does not recognise.
    Unknown,
}

impl FailureReason {
    pub fn code(self) -> u32 {
        match self {
            FailureReason::None => 0,
            FailureReason::CrashLoop => 1,
            FailureReason::WifiTimeout => 2,
            FailureReason::TransportTimeout => 3,
            FailureReason::Unstable => 4,
            FailureReason::TimeSyncFailure => 5,
            FailureReason::Unknown => 255,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => FailureReason::None,
            1 => FailureReason::CrashLoop,
            2 => FailureReason::WifiTimeout,
            3 => FailureReason::TransportTimeout,
            4 => FailureReason::Unstable,
            5 => FailureReason::TimeSyncFailure,
            _ => FailureReason::Unknown,
        }
    }

    /// String sent upstream in the failure report.
    pub fn report_str(self) -> &'static str {
        match self {
            FailureReason::CrashLoop => "runtime_error_crash",
            FailureReason::WifiTimeout => "wifi_timeout",
            FailureReason::TransportTimeout => "mqtt_timeout",
            FailureReason::Unstable => "connection_unstable",
            FailureReason::TimeSyncFailure => "ntp_time_sync_failed",
            FailureReason::None | FailureReason::Unknown => "unknown",
        }
    }

    pub fn is_failure(self) -> bool {
        self != FailureReason::None
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::None => write!(f, "none"),
            other => write!(f, "{}", other.report_str()),
        }
    }
}

/// Snapshot of everything the ledger holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootLedgerRecord {
    pub boot_count: u32,
    pub last_failure_reason: FailureReason,
    pub pending_update_id: Option<String>,
}

/// Narrow key/value interface the ledger is persisted through.
///
/// Writes may be buffered by the backend; [`LedgerStore::flush`] must make every
/// earlier write durable before it returns.
pub trait LedgerStore {
    fn get_u32(&self, key: &str) -> Result<Option<u32>>;
    fn set_u32(&mut self, key: &str, value: u32) -> Result<()>;
    fn get_str(&self, key: &str) -> Result<Option<String>>;
    fn set_str(&mut self, key: &str, value: &str) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoredValue {
    U32(u32),
    Str(String),
}

/// In-memory [`LedgerStore`] for host tests and simulation.
///
/// Tracks whether writes happened since the last flush so tests can assert that
/// nothing was left buffered when the device restarted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: HashMap<String, StoredValue>,
    dirty: bool,
    flushes: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn flush_count(&self) -> u32 {
        self.flushes
    }
}

impl LedgerStore for MemoryStore {
    fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.values.get(key) {
            Some(StoredValue::U32(v)) => Ok(Some(*v)),
            Some(StoredValue::Str(_)) => anyhow::bail!("key '{}' holds a string", key),
            None => Ok(None),
        }
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<()> {
        self.values.insert(key.to_string(), StoredValue::U32(value));
        self.dirty = true;
        Ok(())
    }

    fn get_str(&self, key: &str) -> Result<Option<String>> {
        match self.values.get(key) {
            Some(StoredValue::Str(s)) => Ok(Some(s.clone())),
            Some(StoredValue::U32(_)) => anyhow::bail!("key '{}' holds an integer", key),
            None => Ok(None),
        }
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), StoredValue::Str(value.to_string()));
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.dirty = false;
        self.flushes += 1;
        Ok(())
    }
}

/// Typed view over a [`LedgerStore`].
///
/// Reads never fail: a missing or unreadable key yields its default, because the
/// boot path must keep going even with a damaged namespace.
pub struct BootLedger<S: LedgerStore> {
    store: S,
}

impl<S: LedgerStore> BootLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn record(&self) -> BootLedgerRecord {
        BootLedgerRecord {
            boot_count: self.boot_count(),
            last_failure_reason: self.last_failure(),
            pending_update_id: self.pending_update_id(),
        }
    }

    pub fn boot_count(&self) -> u32 {
        match self.store.get_u32(KEY_BOOT_COUNT) {
            Ok(v) => v.unwrap_or(0),
            Err(e) => {
                log::warn!("Failed to read {}: {:?}, assuming 0", KEY_BOOT_COUNT, e);
                0
            }
        }
    }

    pub fn set_boot_count(&mut self, count: u32) -> Result<()> {
        self.store.set_u32(KEY_BOOT_COUNT, count)
    }

    pub fn last_failure(&self) -> FailureReason {
        match self.store.get_u32(KEY_LAST_FAIL) {
            Ok(v) => v.map(FailureReason::from_code).unwrap_or_default(),
            Err(e) => {
                log::warn!("Failed to read {}: {:?}", KEY_LAST_FAIL, e);
                FailureReason::None
            }
        }
    }

    pub fn set_last_failure(&mut self, reason: FailureReason) -> Result<()> {
        self.store.set_u32(KEY_LAST_FAIL, reason.code())
    }

    /// Pending update id; an empty stored string means none.
    pub fn pending_update_id(&self) -> Option<String> {
        match self.store.get_str(KEY_FAIL_OTA_ID) {
            Ok(v) => v.filter(|id| !id.is_empty()),
            Err(e) => {
                log::warn!("Failed to read {}: {:?}", KEY_FAIL_OTA_ID, e);
                None
            }
        }
    }

    pub fn set_pending_update_id(&mut self, id: &str) -> Result<()> {
        self.store.set_str(KEY_FAIL_OTA_ID, id)
    }

    pub fn clear_pending_update_id(&mut self) -> Result<()> {
        self.store.set_str(KEY_FAIL_OTA_ID, "")
    }

    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_store_reads_defaults() {
        let ledger = BootLedger::new(MemoryStore::new());
        assert_eq!(ledger.record(), BootLedgerRecord::default());
    }

    #[test]
    fn test_reason_codes_match_persisted_layout() {
        assert_eq!(FailureReason::None.code(), 0);
        assert_eq!(FailureReason::CrashLoop.code(), 1);
        assert_eq!(FailureReason::TimeSyncFailure.code(), 5);
        assert_eq!(FailureReason::from_code(4), FailureReason::Unstable);
    }

    #[test]
    fn test_unrecognised_code_reports_unknown() {
        let mut store = MemoryStore::new();
        store.set_u32(KEY_LAST_FAIL, 42).unwrap();
        let ledger = BootLedger::new(store);
        assert_eq!(ledger.last_failure(), FailureReason::Unknown);
        assert_eq!(ledger.last_failure().report_str(), "unknown");
        assert!(ledger.last_failure().is_failure());
    }

    #[test]
    fn test_report_strings() {
        assert_eq!(FailureReason::CrashLoop.report_str(), "runtime_error_crash");
        assert_eq!(FailureReason::WifiTimeout.report_str(), "wifi_timeout");
        assert_eq!(FailureReason::TransportTimeout.report_str(), "mqtt_timeout");
        assert_eq!(FailureReason::Unstable.report_str(), "connection_unstable");
        assert_eq!(FailureReason::TimeSyncFailure.report_str(), "ntp_time_sync_failed");
    }

    #[test]
    fn test_empty_pending_id_is_none() {
        let mut ledger = BootLedger::new(MemoryStore::new());
        ledger.set_pending_update_id("33").unwrap();
        assert_eq!(ledger.pending_update_id().as_deref(), Some("33"));

        ledger.clear_pending_update_id().unwrap();
        assert_eq!(ledger.pending_update_id(), None);
    }

    #[test]
    fn test_type_mismatch_falls_back_to_default() {
        let mut store = MemoryStore::new();
        store.set_str(KEY_BOOT_COUNT, "garbage").unwrap();
        let ledger = BootLedger::new(store);
        assert_eq!(ledger.boot_count(), 0);
    }

    #[test]
    fn test_flush_clears_dirty_flag() {
        let mut ledger = BootLedger::new(MemoryStore::new());
        ledger.set_boot_count(2).unwrap();
        assert!(ledger.store().is_dirty());
        ledger.flush().unwrap();
        assert!(!ledger.store().is_dirty());
        assert_eq!(ledger.store().flush_count(), 1);
    }
}
