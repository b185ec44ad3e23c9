//! MQTT ingest of operator location updates

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};

use crate::{config::MqttConfig, errors::RelayError, models::OperatorUpdate};

/// MQTT client for receiving operator updates
pub struct MqttClientBuilder {
    client: AsyncClient,
    event_loop: EventLoop,
    tx: mpsc::Sender<OperatorUpdate>,
    rx: mpsc::Receiver<OperatorUpdate>,
}

pub struct MqttClient {
    _client: AsyncClient,
    rx: mpsc::Receiver<OperatorUpdate>,
    _handle: tokio::task::JoinHandle<Result<(), RelayError>>,
}

impl MqttClientBuilder {
    /// Create a new MQTT client
    ///
    /// `wss://` and `ws://` URIs connect over WebSocket, anything else is
    /// treated as a plain TCP host name.
    pub fn new(config: &MqttConfig) -> Result<Self, RelayError> {
        if config.uri.trim().is_empty() {
            return Err(RelayError::ConfigurationError {
                message: "MQTT uri cannot be empty".to_string(),
            });
        }

        let mut mqtt_options = if config.uri.starts_with("ws://") || config.uri.starts_with("wss://")
        {
            let mut options = MqttOptions::new(&config.client_id, &config.uri, config.port);
            if config.uri.starts_with("wss://") {
                options.set_transport(Transport::wss_with_default_config());
            } else {
                options.set_transport(Transport::Ws);
            }
            options
        } else {
            MqttOptions::new(&config.client_id, &config.uri, config.port)
        };
        mqtt_options.set_keep_alive(config.keep_alive);

        let (client, event_loop) = AsyncClient::new(mqtt_options, 100);

        // Create a channel for message passing
        let (tx, rx) = mpsc::channel(100);

        Ok(Self {
            client,
            event_loop,
            tx,
            rx,
        })
    }

    /// Start the event loop
    ///
    /// Note: Initial subscription needs not be done here, as it is done
    /// in the event loop.
    pub fn connect(self, topics: &[String]) -> MqttClient {
        let _handle = tokio::spawn(Self::process_events(
            self.tx,
            self.event_loop,
            self.client.clone(), // Clone client for event loop
            topics.to_vec(),
        ));

        MqttClient {
            _client: self.client,
            rx: self.rx,
            _handle,
        }
    }

    async fn subscribe(client: AsyncClient, topics: &[String]) -> Result<(), RelayError> {
        for topic in topics.iter() {
            info!("Subscribing to topic: {}", topic);
            client.subscribe(topic, QoS::AtMostOnce).await?;
        }
        Ok(())
    }

    /// Process MQTT events
    ///
    /// `rumqttc` reconnects on its own when the connection is lost, but topic
    /// subscriptions need to be re-established, so they are issued on every
    /// ConnAck.
    ///
    /// NOTE: If topic subscription fails, the loop will break and return an error.
    async fn process_events(
        tx: mpsc::Sender<OperatorUpdate>,
        mut event_loop: EventLoop,
        client: AsyncClient,
        topics: Vec<String>,
    ) -> Result<(), RelayError> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker, subscribing to topics");
                    if let Err(e) = Self::subscribe(client.clone(), &topics).await {
                        error!("Failed to subscribe: {}", e);
                        break Err(e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match parse_message(&publish.topic, &publish.payload) {
                        Ok(update) => {
                            if tx.send(update).await.is_err() {
                                info!("Update receiver closed, stopping MQTT ingest");
                                break Ok(());
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse message on {}: {}", publish.topic, e);
                        }
                    }
                }
                Err(e) => {
                    error!("MQTT Error: {}", e);
                    // Avoid a hot loop while the broker is unreachable
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
                _ => continue,
            }
        }
    }
}

/// Parse an update published on `<prefix>/<operator id>/location`
///
/// The operator id in the topic takes precedence over one in the payload.
pub fn parse_message(topic: &str, payload: &[u8]) -> Result<OperatorUpdate, RelayError> {
    let parts: Vec<&str> = topic.split('/').collect();

    let [.., id, kind] = parts.as_slice() else {
        return Err(RelayError::InvalidTopic(topic.to_string()));
    };
    if parts.len() < 3 || *kind != "location" {
        return Err(RelayError::InvalidTopic(topic.to_string()));
    }
    if id.trim().is_empty() {
        return Err(RelayError::InvalidOperatorId(id.to_string()));
    }

    let mut update: OperatorUpdate = serde_json::from_slice(payload)?;
    update.id = Some(id.to_string());
    Ok(update)
}

impl MqttClient {
    /// Receive next update, None once the event loop has stopped
    pub async fn recv(&mut self) -> Option<OperatorUpdate> {
        self.rx.recv().await
    }
}
