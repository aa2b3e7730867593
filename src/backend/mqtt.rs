use std::time::Duration;

use async_trait::async_trait;
use mqtt5::{ConnectOptions, ConnectionEvent, MqttClient, MqttError, SubscribeOptions};
use tracing::debug;

use super::transport::{
    Broker, InboundMessage, LinkEvent, LinkEventHandler, MessageHandler, QoS, TransportError,
};
use crate::config::BrokerConfig;

/// [`Broker`] backed by an MQTT 5 client with automatic reconnect
pub struct MqttBroker {
    client: MqttClient,
    server: String,
}

impl MqttBroker {
    /// Build a client for the configured server. Nothing is dialled until
    /// [`Broker::connect`].
    pub fn new(config: &BrokerConfig) -> Self {
        let mut options = ConnectOptions::new(config.client_id.as_str())
            .with_clean_start(true)
            .with_keep_alive(config.keep_alive)
            .with_automatic_reconnect(true)
            .with_reconnect_delay(Duration::from_secs(1), Duration::from_secs(30));
        if !config.username.is_empty() {
            options = options.with_credentials(config.username.as_str(), config.password.as_bytes());
        }

        Self {
            client: MqttClient::with_options(options),
            server: broker_url(&config.server),
        }
    }
}

/// The client only understands `mqtt://` and `mqtts://`; `tcp://` and
/// `ssl://` are accepted as aliases.
fn broker_url(server: &str) -> String {
    if let Some(rest) = server.strip_prefix("tcp://") {
        format!("mqtt://{rest}")
    } else if let Some(rest) = server.strip_prefix("ssl://") {
        format!("mqtts://{rest}")
    } else if server.contains("://") {
        server.to_string()
    } else {
        format!("mqtt://{server}")
    }
}

fn qos(qos: QoS) -> mqtt5::QoS {
    match qos {
        QoS::AtMostOnce => mqtt5::QoS::AtMostOnce,
        QoS::AtLeastOnce => mqtt5::QoS::AtLeastOnce,
        QoS::ExactlyOnce => mqtt5::QoS::ExactlyOnce,
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn connect(&self) -> Result<(), TransportError> {
        debug!(server = %self.server, "backend/mqtt: connecting");
        match self.client.connect(&self.server).await {
            Ok(_) => Ok(()),
            // A refused first dial starts the client's own reconnect task,
            // which may get there before the next attempt
            Err(MqttError::AlreadyConnected) => {
                debug!("backend/mqtt: client reconnected in the background");
                Ok(())
            }
            Err(e) => Err(TransportError::new(e)),
        }
    }

    async fn on_link_event(&self, handler: LinkEventHandler) -> Result<(), TransportError> {
        self.client
            .on_connection_event(move |event| {
                let event = match event {
                    ConnectionEvent::Connected { session_present } => {
                        LinkEvent::Connected { session_present }
                    }
                    ConnectionEvent::Disconnected { reason } => LinkEvent::Disconnected {
                        reason: format!("{reason:?}"),
                    },
                    ConnectionEvent::Reconnecting { attempt } => LinkEvent::Reconnecting {
                        attempt: attempt.try_into().unwrap_or(u32::MAX),
                    },
                    ConnectionEvent::ReconnectFailed { error } => LinkEvent::ReconnectFailed {
                        error: error.to_string(),
                    },
                };
                handler(event);
            })
            .await
            .map_err(TransportError::new)
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos_level: QoS,
        handler: MessageHandler,
    ) -> Result<(), TransportError> {
        let options = SubscribeOptions {
            qos: qos(qos_level),
            ..Default::default()
        };
        self.client
            .subscribe_with_options(topic, options, move |msg| {
                handler(InboundMessage {
                    topic: msg.topic.clone(),
                    payload: msg.payload.clone(),
                });
            })
            .await
            .map(|_| ())
            .map_err(TransportError::new)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(topic)
            .await
            .map(|_| ())
            .map_err(TransportError::new)
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError> {
        let payload = payload.as_slice();
        match qos {
            QoS::AtMostOnce => self.client.publish_qos0(topic, payload).await.map(|_| ()),
            QoS::AtLeastOnce => self.client.publish_qos1(topic, payload).await.map(|_| ()),
            QoS::ExactlyOnce => self.client.publish_qos2(topic, payload).await.map(|_| ()),
        }
        .map_err(TransportError::new)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.client
            .disconnect()
            .await
            .map(|_| ())
            .map_err(TransportError::new)
    }
}
