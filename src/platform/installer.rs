use std::time::Duration;

use embedded_svc::http::client::{Client, Method};
use embedded_svc::http::{Headers, Status};
use esp_idf_svc::http::client::{Configuration as HttpConfig, EspHttpConnection, FollowRedirectsPolicy};
use esp_idf_svc::io::Read;
use esp_idf_svc::ota::EspOta;
use esp_idf_sys::{esp_ota_get_next_update_partition, EspError, ESP_ERR_OTA_VALIDATE_FAILED};
use log::{info, warn};
use sentinel_core::{ImageInstaller, InstallError, InstallHooks, InstallOutcome, SentinelConfig};

const CHUNK_SIZE: usize = 4096;

/// Streams a firmware image over HTTP(S) into the inactive OTA slot and
/// selects it for the next boot. Never restarts the device itself.
pub struct HttpImageInstaller {
    timeout: Duration,
    buffer_size: usize,
}

impl HttpImageInstaller {
    pub fn new(config: &SentinelConfig) -> Self {
        Self {
            timeout: config.http_timeout(),
            buffer_size: config.http_buffer_size,
        }
    }

    fn fetch_and_write(&self, url: &str, hooks: &mut dyn InstallHooks) -> Result<InstallOutcome, InstallError> {
        let config = HttpConfig {
            buffer_size: Some(self.buffer_size),
            timeout: Some(self.timeout),
            follow_redirects_policy: FollowRedirectsPolicy::FollowAll,
            crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
            ..Default::default()
        };

        let mut client = Client::wrap(EspHttpConnection::new(&config).map_err(connection_error)?);
        let request = client.request(Method::Get, url, &[]).map_err(connection_error)?;
        let mut response = request.submit().map_err(connection_error)?;

        match response.status() {
            200 => {}
            204 | 304 => {
                info!("Image server has nothing newer ({})", response.status());
                return Ok(InstallOutcome::NoUpdate);
            }
            code => return Err(InstallError::Http(code)),
        }

        let total = response
            .header("Content-Length")
            .and_then(|len| len.trim().parse::<usize>().ok());
        if total == Some(0) {
            return Ok(InstallOutcome::NoUpdate);
        }

        let slot_size = inactive_slot_size().ok_or(InstallError::NotEnoughSpace)?;
        if total.is_some_and(|len| len > slot_size) {
            warn!("Image of {:?} bytes does not fit a {} byte slot", total, slot_size);
            return Err(InstallError::NotEnoughSpace);
        }

        let mut ota = EspOta::new().map_err(write_error)?;
        let mut update = ota.initiate_update().map_err(write_error)?;
        hooks.on_start(total);

        let mut written = 0usize;
        let mut buf = [0u8; CHUNK_SIZE];
        let transfer = loop {
            let n = match response.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(connection_error(e)),
            };
            if written + n > slot_size {
                break Err(InstallError::NotEnoughSpace);
            }
            if let Err(e) = update.write(&buf[..n]) {
                break Err(write_error(e));
            }
            written += n;
            hooks.on_progress(written, total);
        };

        let transfer = transfer.and_then(|_| match total {
            Some(expected) if written < expected => Err(InstallError::Connection(format!(
                "transfer ended at {} of {} bytes",
                written, expected
            ))),
            _ => Ok(()),
        });

        if let Err(e) = transfer {
            if let Err(abort_err) = update.abort() {
                warn!("Failed to abort OTA write: {:?}", abort_err);
            }
            return Err(e);
        }

        update.complete().map_err(|e| {
            if e.code() == ESP_ERR_OTA_VALIDATE_FAILED as i32 {
                InstallError::CorruptImage
            } else {
                write_error(e)
            }
        })?;

        hooks.on_end();
        info!("Image written ({} bytes), selected for next boot", written);
        Ok(InstallOutcome::Ok)
    }
}

impl ImageInstaller for HttpImageInstaller {
    fn install(&mut self, url: &str, hooks: &mut dyn InstallHooks) -> InstallOutcome {
        match self.fetch_and_write(url, hooks) {
            Ok(outcome) => outcome,
            Err(e) => {
                hooks.on_error(&e);
                InstallOutcome::Failed(e)
            }
        }
    }
}

fn inactive_slot_size() -> Option<usize> {
    let partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
    if partition.is_null() {
        return None;
    }
    Some(unsafe { (*partition).size } as usize)
}

fn connection_error(e: impl std::fmt::Debug) -> InstallError {
    InstallError::Connection(format!("{:?}", e))
}

fn write_error(e: EspError) -> InstallError {
    InstallError::Write(e.to_string())
}
