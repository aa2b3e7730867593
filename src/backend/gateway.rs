use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, error, info, instrument, warn};

use super::in_flight::InFlight;
use super::retry::RetryPolicy;
use super::transport::{Broker, InboundMessage, LinkEvent, MessageHandler, QoS};
use super::{uplink_topic, BackendError, Gateway, InboundQueue, DOWNLINK_TOPIC};
use crate::radio::{DownlinkEnvelope, DownlinkFrame, UplinkEnvelope, UplinkFrame};

/// Delay between connection attempts
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Delay between subscription attempts
pub const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Backend tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendOptions {
    /// Connection retry policy
    pub connect_retry: RetryPolicy,
    /// Subscription retry policy
    pub subscribe_retry: RetryPolicy,
    /// QoS of the downlink subscription
    pub downlink_qos: QoS,
    /// QoS of uplink publishes
    pub uplink_qos: QoS,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            connect_retry: RetryPolicy::fixed(CONNECT_RETRY_DELAY),
            subscribe_retry: RetryPolicy::fixed(SUBSCRIBE_RETRY_DELAY),
            downlink_qos: QoS::ExactlyOnce,
            uplink_qos: QoS::AtLeastOnce,
        }
    }
}

type QueueSender = Arc<Mutex<Option<mpsc::UnboundedSender<DownlinkFrame>>>>;

/// Gateway backend over a publish/subscribe broker
pub struct GatewayBackend<B: Broker> {
    broker: Arc<B>,
    options: BackendOptions,
    in_flight: Arc<InFlight>,
    sender: QueueSender,
    inbound: InboundQueue,
    closed: OnceCell<Result<(), BackendError>>,
}

impl<B: Broker> GatewayBackend<B> {
    /// Connect to the broker and subscribe to downlinks.
    ///
    /// Both steps are retried per `options`; with the default unbounded
    /// policies this only returns once the backend is up.
    #[instrument(skip_all)]
    pub async fn connect(broker: B, options: BackendOptions) -> Result<Self, BackendError> {
        let broker = Arc::new(broker);
        let (tx, rx) = mpsc::unbounded_channel();

        let backend = Self {
            broker,
            options,
            in_flight: InFlight::new(),
            sender: Arc::new(Mutex::new(Some(tx))),
            inbound: InboundQueue::new(rx),
            closed: OnceCell::new(),
        };

        backend
            .options
            .connect_retry
            .run("connect", || backend.broker.connect())
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        info!("backend/gateway: connected to mqtt server");

        let on_event = Arc::new(|event: LinkEvent| match event {
            LinkEvent::Connected { session_present } => {
                info!(session_present, "backend/gateway: connected to mqtt server");
            }
            LinkEvent::Disconnected { reason } => {
                warn!(reason = %reason, "backend/gateway: mqtt connection lost");
            }
            LinkEvent::Reconnecting { attempt } => {
                info!(attempt, "backend/gateway: reconnecting to mqtt server");
            }
            LinkEvent::ReconnectFailed { error } => {
                error!(error = %error, "backend/gateway: mqtt reconnect failed");
            }
        });
        if let Err(e) = backend.broker.on_link_event(on_event).await {
            warn!(error = %e, "backend/gateway: connection events unavailable");
        }

        backend.subscribe().await?;
        Ok(backend)
    }

    async fn subscribe(&self) -> Result<(), BackendError> {
        let handler = self.downlink_handler();
        info!(topic = DOWNLINK_TOPIC, "backend/gateway: subscribing to tx topic");
        self.options
            .subscribe_retry
            .run("subscribe", || {
                self.broker
                    .subscribe(DOWNLINK_TOPIC, self.options.downlink_qos, Arc::clone(&handler))
            })
            .await
            .map_err(|e| BackendError::Subscribe {
                topic: DOWNLINK_TOPIC.to_string(),
                reason: e.to_string(),
            })
    }

    /// Handler given to the broker. Every invocation is admitted through the
    /// in-flight barrier before anything else happens, then runs on its own
    /// task.
    fn downlink_handler(&self) -> MessageHandler {
        let in_flight = Arc::clone(&self.in_flight);
        let sender = Arc::clone(&self.sender);

        Arc::new(move |msg: InboundMessage| {
            let Some(guard) = in_flight.enter() else {
                debug!(topic = %msg.topic, "backend/gateway: backend closing, tx packet dropped");
                return;
            };
            let sender = Arc::clone(&sender);
            tokio::spawn(async move {
                let _guard = guard;
                deliver(msg, &sender);
            });
        })
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        let unsubscribed = self.broker.unsubscribe(DOWNLINK_TOPIC).await;

        self.in_flight.close();
        let pending = self.in_flight.active();
        if pending > 0 {
            debug!(pending, "backend/gateway: waiting for in-flight tx packets");
        }
        self.in_flight.wait_idle().await;
        self.sender.lock().take();
        info!("backend/gateway: inbound queue closed");

        if let Err(e) = self.broker.disconnect().await {
            warn!(error = %e, "backend/gateway: disconnect failed");
        }

        unsubscribed.map_err(|e| BackendError::Unsubscribe {
            topic: DOWNLINK_TOPIC.to_string(),
            reason: e.to_string(),
        })
    }

    /// Number of downlink deliveries currently in progress
    pub fn in_flight(&self) -> usize {
        self.in_flight.active()
    }
}

fn deliver(msg: InboundMessage, sender: &QueueSender) {
    debug!(topic = %msg.topic, "backend/gateway: tx packet received");

    let frame = match decode_downlink(&msg.payload) {
        Ok(frame) => frame,
        Err(e) => {
            error!(topic = %msg.topic, error = %e, "backend/gateway: tx packet dropped");
            return;
        }
    };

    match sender.lock().as_ref() {
        Some(tx) => {
            if tx.send(frame).is_err() {
                debug!("backend/gateway: inbound queue receiver gone, tx packet dropped");
            }
        }
        None => debug!("backend/gateway: inbound queue closed, tx packet dropped"),
    }
}

/// Decode a downlink wire envelope and its PHY payload
pub fn decode_downlink(payload: &[u8]) -> Result<DownlinkFrame, BackendError> {
    let envelope: DownlinkEnvelope = serde_json::from_slice(payload)
        .map_err(|e| BackendError::Decode(format!("unmarshal tx packet error: {e}")))?;
    envelope
        .into_frame()
        .map_err(|e| BackendError::Decode(format!("unmarshal phypayload error: {e}")))
}

/// Encode an uplink into its wire envelope
pub fn encode_uplink(frame: &UplinkFrame) -> Result<Vec<u8>, BackendError> {
    let envelope =
        UplinkEnvelope::from_frame(frame).map_err(|e| BackendError::Encode(e.to_string()))?;
    serde_json::to_vec(&envelope).map_err(|e| BackendError::Encode(e.to_string()))
}

#[async_trait]
impl<B: Broker> Gateway for GatewayBackend<B> {
    #[instrument(skip_all, fields(gateway = %frame.rx_info.mac))]
    async fn send_uplink(&self, frame: &UplinkFrame) -> Result<(), BackendError> {
        let bytes = encode_uplink(frame)?;
        let topic = uplink_topic(&frame.rx_info.mac);
        debug!(topic = %topic, size = bytes.len(), "backend/gateway: publishing rx packet");

        self.broker
            .publish(&topic, self.options.uplink_qos, bytes)
            .await
            .map_err(|e| BackendError::Publish(e.to_string()))
    }

    fn inbound(&self) -> InboundQueue {
        self.inbound.clone()
    }

    /// Only the first call shuts down; concurrent and later calls wait for
    /// it and get its outcome.
    #[instrument(skip_all)]
    async fn close(&self) -> Result<(), BackendError> {
        self.closed.get_or_init(|| self.shutdown()).await.clone()
    }
}
