//! ESP-IDF implementations of the sentinel's hardware seams.

pub mod installer;
pub mod mqtt;
pub mod nvs_store;
pub mod system;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sentinel_core::{ConnectivityProbe, LinkState};

use crate::network::wifi::WifiLink;

pub use installer::HttpImageInstaller;
pub use mqtt::{LinkEvent, MqttLink};
pub use nvs_store::NvsLedgerStore;
pub use system::{EspClock, EspSystemControl};

/// Wi-Fi is the primary link, the broker session the secondary one.
pub struct Connectivity<'a> {
    pub wifi: &'a WifiLink,
    pub broker: &'a Arc<AtomicBool>,
}

impl ConnectivityProbe for Connectivity<'_> {
    fn link_state(&self) -> LinkState {
        LinkState::new(self.wifi.is_up(), self.broker.load(Ordering::Relaxed))
    }
}
