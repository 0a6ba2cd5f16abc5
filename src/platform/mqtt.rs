use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_svc::mqtt::client::{Details, EspMqttClient, EventPayload, MqttClientConfiguration, QoS};
use log::{debug, info, warn};
use sentinel_core::{Publisher, SentinelConfig};

use super::system::feed_task_watchdog;

/// What the broker client task hands over to the control loop.
#[derive(Debug)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Instruction(Vec<u8>),
}

/// Broker session used for update instructions and status reports.
pub struct MqttLink {
    client: EspMqttClient<'static>,
    command_topic: String,
    status_topic: String,
    connected: Arc<AtomicBool>,
}

impl MqttLink {
    /// Start the client. Connection and reconnection run in the client's own
    /// task; events arrive on the returned receiver.
    pub fn connect(config: &SentinelConfig) -> Result<(Self, Receiver<LinkEvent>)> {
        let connected = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel();

        let mqtt_config = MqttClientConfiguration {
            client_id: Some(config.device_id.as_str()),
            keep_alive_interval: Some(Duration::from_secs(30)),
            crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
            ..Default::default()
        };

        let flag = connected.clone();
        let command_topic = config.command_topic();
        let filter = command_topic.clone();
        let client = EspMqttClient::new_cb(&config.broker_url, &mqtt_config, move |event| {
            match event.payload() {
                EventPayload::Connected(_) => {
                    flag.store(true, Ordering::Relaxed);
                    let _ = tx.send(LinkEvent::Connected);
                }
                EventPayload::Disconnected => {
                    flag.store(false, Ordering::Relaxed);
                    let _ = tx.send(LinkEvent::Disconnected);
                }
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details: Details::Complete,
                    ..
                } if topic == filter => {
                    let _ = tx.send(LinkEvent::Instruction(data.to_vec()));
                }
                EventPayload::Received { details: Details::Complete, .. } => {}
                EventPayload::Received { .. } => {
                    warn!("Dropping fragmented broker message");
                }
                EventPayload::Error(e) => warn!("Broker client error: {:?}", e),
                other => debug!("Broker event: {:?}", other),
            }
        })?;

        info!("Broker client started for {}", config.broker_url);
        Ok((
            Self {
                client,
                command_topic,
                status_topic: config.status_topic(),
                connected,
            },
            rx,
        ))
    }

    /// Sessions are not persistent, so this has to be repeated after every
    /// reconnect.
    pub fn subscribe_commands(&mut self) -> Result<()> {
        self.client.subscribe(&self.command_topic, QoS::AtLeastOnce)?;
        info!("Listening for update instructions on {}", self.command_topic);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn connection_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }
}

impl Publisher for MqttLink {
    fn publish(&mut self, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            bail!("broker not connected");
        }
        self.client
            .publish(&self.status_topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }

    // The client task keeps the session alive on its own; the control loop
    // only has to stay off the task watchdog's radar while it downloads.
    fn keep_alive(&mut self) {
        feed_task_watchdog();
    }

    fn flush(&mut self, within: Duration) {
        FreeRtos::delay_ms(within.as_millis() as u32);
    }
}
