use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use sentinel_core::ledger::{LedgerStore, NAMESPACE};

/// Boot ledger persisted in the `ota_diag` NVS namespace.
pub struct NvsLedgerStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsLedgerStore {
    pub fn open(partition: &EspDefaultNvsPartition) -> Result<Self> {
        let nvs = EspNvs::new(partition.clone(), NAMESPACE, true)?;
        log::info!("Boot ledger opened (namespace '{}')", NAMESPACE);
        Ok(Self { nvs })
    }
}

impl LedgerStore for NvsLedgerStore {
    fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        Ok(self.nvs.get_u32(key)?)
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<()> {
        self.nvs.set_u32(key, value)?;
        Ok(())
    }

    fn get_str(&self, key: &str) -> Result<Option<String>> {
        let len = match self.nvs.str_len(key)? {
            Some(len) => len,
            None => return Ok(None),
        };
        let mut buf = vec![0u8; len + 1];
        Ok(self.nvs.get_str(key, &mut buf)?.map(str::to_string))
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<()> {
        self.nvs.set_str(key, value)?;
        Ok(())
    }

    // EspNvs commits inside every set_*, so there is nothing left to push.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
