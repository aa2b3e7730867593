#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use simdev::backend::{
    Broker, InboundMessage, LinkEvent, LinkEventHandler, MessageHandler, QoS, TransportError,
};
use simdev::config::{AESKey, AppNonce, DevAddr, NetID, EUI64};
use simdev::crypto;
use simdev::lorawan::{JoinAcceptPayload, MType, Payload, PhyPayload, FHDR};
use simdev::radio::{DownlinkEnvelope, DownlinkFrame, TxInfo, UplinkEnvelope, UplinkFrame};

/// Topic the mock broker reports downlinks on
pub const TX_TOPIC: &str = "gateway/0101010101010101/tx";

/// One publish call seen by the mock broker
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
    pub accepted: bool,
}

impl Published {
    /// Decode the uplink envelope
    pub fn uplink(&self) -> UplinkFrame {
        let envelope: UplinkEnvelope = serde_json::from_slice(&self.payload).unwrap();
        envelope.into_frame().unwrap()
    }
}

/// Reaction to a publish: downlink payloads to deliver back
pub type Responder = Arc<dyn Fn(&Published) -> Vec<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct State {
    connect_failures: AtomicU32,
    subscribe_failures: AtomicU32,
    unsubscribe_failures: AtomicU32,
    connect_attempts: AtomicU32,
    subscribe_attempts: AtomicU32,
    publish_calls: AtomicUsize,
    failing_publishes: Mutex<HashSet<usize>>,
    published: Mutex<Vec<Published>>,
    published_notify: Notify,
    subscription: Mutex<Option<(String, QoS)>>,
    handler: Mutex<Option<MessageHandler>>,
    link_handler: Mutex<Option<LinkEventHandler>>,
    unsubscribed: Mutex<Vec<String>>,
    disconnected: AtomicBool,
    responder: Mutex<Option<Responder>>,
}

/// In-memory broker
///
/// Cloning shares state, so a test keeps a handle after moving a clone into
/// the backend.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<State>,
}

impl MockBroker {
    /// Create new mock broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` connection attempts
    pub fn fail_connects(&self, n: u32) {
        self.state.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` subscription attempts
    pub fn fail_subscribes(&self, n: u32) {
        self.state.subscribe_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` unsubscribe calls
    pub fn fail_unsubscribes(&self, n: u32) {
        self.state.unsubscribe_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the publish call with the given zero-based index
    pub fn fail_publish(&self, index: usize) {
        self.state.failing_publishes.lock().insert(index);
    }

    /// Answer publishes with downlinks
    pub fn set_responder(&self, responder: Responder) {
        *self.state.responder.lock() = Some(responder);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn subscribe_attempts(&self) -> u32 {
        self.state.subscribe_attempts.load(Ordering::SeqCst)
    }

    pub fn subscription(&self) -> Option<(String, QoS)> {
        self.state.subscription.lock().clone()
    }

    /// Every unsubscribe call so far, failed or not
    pub fn unsubscribed(&self) -> Vec<String> {
        self.state.unsubscribed.lock().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.disconnected.load(Ordering::SeqCst)
    }

    /// Every publish call so far, accepted or not
    pub fn published(&self) -> Vec<Published> {
        self.state.published.lock().clone()
    }

    /// Wait until at least `n` publish calls were made
    pub async fn wait_published(&self, n: usize) -> Vec<Published> {
        loop {
            let notified = self.state.published_notify.notified();
            let published = self.published();
            if published.len() >= n {
                return published;
            }
            notified.await;
        }
    }

    /// Handler registered by the last subscribe, even after unsubscribe
    pub fn last_handler(&self) -> Option<MessageHandler> {
        self.state.handler.lock().clone()
    }

    /// Deliver a message on the downlink subscription. Returns `false` when
    /// nothing is subscribed.
    pub fn deliver(&self, payload: Vec<u8>) -> bool {
        if self.state.subscription.lock().is_none() {
            return false;
        }
        let Some(handler) = self.last_handler() else {
            return false;
        };
        handler(InboundMessage {
            topic: TX_TOPIC.to_string(),
            payload,
        });
        true
    }

    /// Emit a connection lifecycle event
    pub fn emit(&self, event: LinkEvent) {
        let handler = self.state.link_handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(&self) -> Result<(), TransportError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.state.connect_failures) {
            return Err(TransportError::new("connection refused"));
        }
        self.state.disconnected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn on_link_event(&self, handler: LinkEventHandler) -> Result<(), TransportError> {
        *self.state.link_handler.lock() = Some(handler);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), TransportError> {
        self.state.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.state.subscribe_failures) {
            return Err(TransportError::new("not authorized"));
        }
        *self.state.subscription.lock() = Some((topic.to_string(), qos));
        *self.state.handler.lock() = Some(handler);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.state.unsubscribed.lock().push(topic.to_string());
        if take_failure(&self.state.unsubscribe_failures) {
            return Err(TransportError::new("unsubscribe not acknowledged"));
        }
        *self.state.subscription.lock() = None;
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError> {
        let index = self.state.publish_calls.fetch_add(1, Ordering::SeqCst);
        let accepted = !self.state.failing_publishes.lock().contains(&index);
        let published = Published {
            topic: topic.to_string(),
            qos,
            payload,
            accepted,
        };

        let responder = self.state.responder.lock().clone();
        let replies = match (&responder, accepted) {
            (Some(responder), true) => responder(&published),
            _ => Vec::new(),
        };

        self.state.published.lock().push(published);
        self.state.published_notify.notify_waiters();

        for reply in replies {
            self.deliver(reply);
        }
        // Let the delivery tasks run before the publisher continues
        tokio::task::yield_now().await;

        if accepted {
            Ok(())
        } else {
            Err(TransportError::new("publish not acknowledged"))
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.state.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Fake network server answering join requests
#[derive(Debug, Clone)]
pub struct NetworkServer {
    pub app_key: AESKey,
    pub app_nonce: AppNonce,
    pub net_id: NetID,
    pub dev_addr: DevAddr,
}

impl NetworkServer {
    pub fn new(app_key: AESKey) -> Self {
        Self {
            app_key,
            app_nonce: AppNonce::from(0x000001u32),
            net_id: NetID::from(0x000002u32),
            dev_addr: DevAddr::from(0x0102_0304u32),
        }
    }

    /// Join accept for a device, encrypted with `key`
    pub fn join_accept_with_key(&self, key: &AESKey) -> PhyPayload {
        let mut phy = PhyPayload::join_accept(JoinAcceptPayload {
            app_nonce: self.app_nonce,
            net_id: self.net_id,
            dev_addr: self.dev_addr,
            dl_settings: 0,
            rx_delay: 1,
            cf_list: None,
        });
        phy.set_mic(key).unwrap();
        phy.encrypt_join_accept(key).unwrap();
        phy
    }

    /// Join accept as it arrives from the air
    pub fn join_accept(&self) -> PhyPayload {
        self.join_accept_with_key(&self.app_key)
    }

    /// Session keys for a device that joined with `request`
    pub fn session_keys(&self, request: &PhyPayload) -> (AESKey, AESKey) {
        let Payload::JoinRequest(req) = &request.payload else {
            panic!("not a join request: {:?}", request.mhdr.mtype);
        };
        crypto::derive_session_keys(&self.app_key, self.app_nonce, self.net_id, req.dev_nonce)
            .unwrap()
    }

    /// Data downlink to the joined device
    pub fn data_down(
        &self,
        nwk_skey: &AESKey,
        app_skey: &AESKey,
        f_cnt: u32,
        f_port: u8,
        payload: &[u8],
    ) -> PhyPayload {
        let mut phy = PhyPayload::data(
            MType::UnconfirmedDataDown,
            FHDR::new(self.dev_addr, f_cnt),
            f_port,
            payload,
        )
        .unwrap();
        phy.apply_frm_cipher(app_skey).unwrap();
        phy.set_mic(nwk_skey).unwrap();
        phy
    }

    /// Responder that answers every join request with `accepts` copies of
    /// the join accept
    pub fn responder(&self, accepts: usize) -> Responder {
        let server = self.clone();
        Arc::new(move |published: &Published| {
            let frame = published.uplink();
            if frame.phy_payload.mhdr.mtype != MType::JoinRequest {
                return Vec::new();
            }
            let reply = downlink_json(&server.join_accept());
            vec![reply; accepts]
        })
    }
}

/// Downlink wire envelope for `phy`
pub fn downlink_json(phy: &PhyPayload) -> Vec<u8> {
    let frame = DownlinkFrame {
        tx_info: TxInfo {
            mac: EUI64::new([0x01; 8]),
            immediately: true,
            frequency: 500_300_000,
            ..TxInfo::default()
        },
        phy_payload: phy.clone(),
    };
    serde_json::to_vec(&DownlinkEnvelope::from_frame(&frame).unwrap()).unwrap()
}
