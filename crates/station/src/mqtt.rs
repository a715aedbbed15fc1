//! Fire-and-forget measurement publishing over MQTT.
//!
//! Publish failures are logged and dropped; they never hold up an update
//! cycle.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::station::{PlantId, PLANT_COUNT};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: String,
}

/// Topic layout: `<plant>/water`, `<plant>/weight`, `<ambient>/temperature`,
/// `<ambient>/humidity`.
#[derive(Debug, Clone)]
pub struct Topics {
    plants: [String; PLANT_COUNT],
    ambient: String,
}

impl Topics {
    pub fn new(config: &MqttConfig) -> Self {
        Self {
            plants: config.plant_topics.clone(),
            ambient: config.ambient_topic.clone(),
        }
    }

    /// Applied watering duration in ms. Delivered exactly once.
    pub fn water(&self, plant: PlantId, ms: i32) -> Message {
        Message {
            topic: format!("{}/water", self.plants[plant.index()]),
            qos: QoS::ExactlyOnce,
            retain: false,
            payload: ms.to_string(),
        }
    }

    pub fn weight(&self, plant: PlantId, weight: i32) -> Message {
        Message {
            topic: format!("{}/weight", self.plants[plant.index()]),
            qos: QoS::AtMostOnce,
            retain: true,
            payload: weight.to_string(),
        }
    }

    /// Temperature and humidity from hundredths, published as decimals.
    pub fn ambient(&self, temperature: i32, humidity: i32) -> [Message; 2] {
        [
            Message {
                topic: format!("{}/humidity", self.ambient),
                qos: QoS::AtMostOnce,
                retain: true,
                payload: format_centi(humidity),
            },
            Message {
                topic: format!("{}/temperature", self.ambient),
                qos: QoS::AtMostOnce,
                retain: true,
                payload: format_centi(temperature),
            },
        ]
    }
}

fn format_centi(value: i32) -> String {
    format!("{:.2}", f64::from(value) / 100.0)
}

// ---------------------------------------------------------------------------
// Publisher seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, msg: Message) -> Result<()>;
}

/// Publish and log, swallowing the error.
pub async fn publish_logged(publisher: &dyn Publisher, msg: Message) {
    let topic = msg.topic.clone();
    match publisher.publish(msg).await {
        Ok(()) => debug!(%topic, "published"),
        Err(e) => warn!(%topic, "publish failed: {e:#}"),
    }
}

/// Used when no broker is configured.
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    async fn publish(&self, _msg: Message) -> Result<()> {
        Ok(())
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    /// Create the client and keep its event loop polled on a background
    /// task, retrying after connection errors.
    pub fn connect(config: &MqttConfig, server: &str) -> Self {
        let mut options = MqttOptions::new(&config.client_id, server, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&config.user, &config.pass) {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 20);

        let server = server.to_string();
        let port = config.port;
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(%server, port, "mqtt connected");
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("mqtt disconnected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt error: {e}. reconnecting...");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self { client }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, msg: Message) -> Result<()> {
        // Never wait on a full request queue while the broker is away.
        self.client
            .try_publish(msg.topic, msg.qos, msg.retain, msg.payload)
            .context("mqtt request queue rejected publish")
    }
}

// ---------------------------------------------------------------------------
// Recording publisher for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) use recording::RecordingPublisher;

#[cfg(test)]
mod recording {
    use std::sync::{Arc, Mutex};

    use anyhow::{bail, Result};
    use async_trait::async_trait;

    use super::{Message, Publisher};

    #[derive(Clone, Default)]
    pub struct RecordingPublisher {
        sent: Arc<Mutex<Vec<Message>>>,
        failing: bool,
    }

    impl RecordingPublisher {
        pub fn failing() -> Self {
            Self {
                failing: true,
                ..Self::default()
            }
        }

        pub fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }

        pub fn topics(&self) -> Vec<String> {
            self.sent().into_iter().map(|m| m.topic).collect()
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, msg: Message) -> Result<()> {
            if self.failing {
                bail!("broker unreachable");
            }
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
