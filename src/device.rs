//! Simulated LoRaWAN device
//!
//! Drives one OTAA device through the join procedure and then the uplink
//! loop, with every radio frame carried by a [`Gateway`]:
//!
//! ```text
//! Idle -> Joining -> Joined -> Transmitting
//! ```
//!
//! Join failures are fatal to the run. Once transmitting, failures are logged
//! and the loop moves on to the next payload; the only fatal condition is an
//! exhausted uplink frame counter.

use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Uplink payload sources
pub mod payload;

pub use payload::{IntervalPayloads, LinePayloads, PayloadSource};

use crate::backend::{BackendError, Gateway, InboundQueue};
use crate::config::{DevNonce, DeviceConfig, SessionState, SimulatorConfig};
use crate::crypto::{self, KeyDerivationError};
use crate::lorawan::{FrameError, MType, Payload, PhyPayload, FHDR};
use crate::radio::{DownlinkFrame, RxInfo, UplinkFrame};

/// Default FPort of application uplinks
pub const DEFAULT_F_PORT: u8 = 1;

/// Driver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Not joined, no join in progress
    Idle,
    /// Join request sent, waiting for the join accept
    Joining,
    /// Session established
    Joined,
    /// Uplink loop running
    Transmitting,
}

/// Join accept failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinAcceptError {
    /// Backend closed before a join accept arrived
    #[error("inbound queue closed before a join accept arrived")]
    QueueClosed,

    /// No join accept within the configured timeout
    #[error("no join accept within {0:?}")]
    Timeout(Duration),

    /// Downlink could not be decrypted or decoded
    #[error("join accept decrypt error: {0}")]
    Decrypt(FrameError),

    /// Downlink was some other message type
    #[error("expected join accept, got {0:?}")]
    NotJoinAccept(MType),

    /// MIC did not verify with the root key
    #[error("join accept MIC mismatch")]
    InvalidMic,
}

/// Device driver errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// Join accept missing or invalid
    #[error("join accept error: {0}")]
    JoinAccept(#[from] JoinAcceptError),

    /// Session keys could not be derived
    #[error("key derivation error: {0}")]
    KeyDerivation(#[from] KeyDerivationError),

    /// Gateway backend failure
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Operation requires a session
    #[error("device has not joined")]
    NotJoined,

    /// Uplink frame counter would wrap; a new join is required
    #[error("uplink frame counter exhausted")]
    FrameCounterExhausted,

    /// Frame could not be built
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// One simulated OTAA device talking through a [`Gateway`]
pub struct SimulatedDevice<G: Gateway> {
    config: DeviceConfig,
    rx_info: RxInfo,
    gateway: G,
    inbound: InboundQueue,
    state: DeviceState,
    session: Option<SessionState>,
    fcnt_exhausted: bool,
    f_port: u8,
    join_timeout: Option<Duration>,
}

impl<G: Gateway> SimulatedDevice<G> {
    /// Create an idle device. Uplinks carry `rx_info` as receive metadata.
    pub fn new(config: DeviceConfig, rx_info: RxInfo, gateway: G) -> Self {
        let inbound = gateway.inbound();
        Self {
            config,
            rx_info,
            gateway,
            inbound,
            state: DeviceState::Idle,
            session: None,
            fcnt_exhausted: false,
            f_port: DEFAULT_F_PORT,
            join_timeout: None,
        }
    }

    /// Create a device from the simulator settings
    pub fn from_config(config: &SimulatorConfig, gateway: G) -> Self {
        let rx_info = RxInfo::new(config.gateway_id, config.frequency, config.data_rate);
        Self::new(config.device.clone(), rx_info, gateway)
            .with_f_port(config.f_port)
            .with_join_timeout(config.join_timeout)
    }

    /// FPort used for application uplinks
    pub fn with_f_port(mut self, f_port: u8) -> Self {
        self.f_port = f_port;
        self
    }

    /// Give up waiting for the join accept after `timeout`
    pub fn with_join_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Current state
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Session, once joined
    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref()
    }

    /// Mutable session, e.g. to resume from known counters
    pub fn session_mut(&mut self) -> Option<&mut SessionState> {
        self.session.as_mut()
    }

    /// The gateway this device talks through
    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Perform the OTAA join.
    ///
    /// Sends a join request with a fresh random device nonce, then waits for
    /// the first downlink and requires it to be a valid join accept.
    #[instrument(skip(self), fields(dev_eui = %self.config.dev_eui))]
    pub async fn join(&mut self) -> Result<&SessionState, DeviceError> {
        let mut nonce = [0u8; DevNonce::SIZE];
        OsRng.fill_bytes(&mut nonce);
        let dev_nonce = DevNonce::new(nonce);

        self.state = DeviceState::Joining;
        self.session = None;
        self.fcnt_exhausted = false;

        let mut request =
            PhyPayload::join_request(self.config.app_eui, self.config.dev_eui, dev_nonce);
        request.set_mic(&self.config.app_key)?;

        self.discard_stale_downlinks();
        info!(dev_nonce = %dev_nonce, "device: sending join request");
        if let Err(e) = self.publish(request).await {
            self.state = DeviceState::Idle;
            return Err(e);
        }

        let session = match self.await_join_accept(dev_nonce).await {
            Ok(session) => session,
            Err(e) => {
                self.state = DeviceState::Idle;
                return Err(e);
            }
        };

        info!(
            dev_addr = %session.dev_addr,
            fcnt_up = session.fcnt_up,
            "device: joined"
        );
        self.state = DeviceState::Joined;
        Ok(self.session.insert(session))
    }

    /// Drop downlinks queued before the join request, so the reply is the
    /// first frame seen
    fn discard_stale_downlinks(&self) {
        let mut discarded = 0usize;
        while self.inbound.try_recv().is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "device: stale downlinks discarded before join");
        }
    }

    async fn await_join_accept(&self, dev_nonce: DevNonce) -> Result<SessionState, DeviceError> {
        let frame = match self.join_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.inbound.recv())
                .await
                .map_err(|_| JoinAcceptError::Timeout(timeout))?,
            None => self.inbound.recv().await,
        }
        .ok_or(JoinAcceptError::QueueClosed)?;

        let mut phy = frame.phy_payload;
        if phy.mhdr.mtype != MType::JoinAccept {
            return Err(JoinAcceptError::NotJoinAccept(phy.mhdr.mtype).into());
        }
        phy.decrypt_join_accept(&self.config.app_key)
            .map_err(JoinAcceptError::Decrypt)?;
        if !phy
            .validate_mic(&self.config.app_key)
            .map_err(JoinAcceptError::Decrypt)?
        {
            return Err(JoinAcceptError::InvalidMic.into());
        }
        let Payload::JoinAccept(accept) = phy.payload else {
            return Err(JoinAcceptError::Decrypt(FrameError::NotJoinAccept).into());
        };

        let (nwk_skey, app_skey) = crypto::derive_session_keys(
            &self.config.app_key,
            accept.app_nonce,
            accept.net_id,
            dev_nonce,
        )?;
        debug!(
            net_id = %accept.net_id,
            app_nonce = %accept.app_nonce,
            rx1_dr_offset = accept.rx1_dr_offset(),
            rx2_data_rate = accept.rx2_data_rate(),
            rx_delay = accept.rx_delay,
            "device: session keys derived"
        );

        Ok(SessionState::new_otaa(
            accept.dev_addr,
            nwk_skey,
            app_skey,
            dev_nonce,
        ))
    }

    /// Encrypt and publish one unconfirmed uplink, returning the frame
    /// counter it was sent with.
    ///
    /// The counter advances even when the publish fails. A payload too large
    /// for one frame is rejected before anything is sent and does not consume
    /// a counter.
    pub async fn send_uplink(&mut self, payload: &[u8]) -> Result<u32, DeviceError> {
        if self.fcnt_exhausted {
            return Err(DeviceError::FrameCounterExhausted);
        }
        let session = self.session.as_ref().ok_or(DeviceError::NotJoined)?;
        let fcnt = session.fcnt_up;
        let key = if self.f_port == 0 {
            session.nwk_skey
        } else {
            session.app_skey
        };

        let mut frame = PhyPayload::data(
            MType::UnconfirmedDataUp,
            FHDR::new(session.dev_addr, fcnt),
            self.f_port,
            payload,
        )?;
        frame.apply_frm_cipher(&key)?;
        frame.set_mic(&session.nwk_skey)?;

        let published = self.publish(frame).await;

        if let Some(session) = self.session.as_mut() {
            if !session.increment_fcnt_up() {
                warn!(fcnt, "device: uplink frame counter exhausted");
                self.fcnt_exhausted = true;
            }
        }

        published.map(|()| fcnt)
    }

    async fn publish(&self, phy_payload: PhyPayload) -> Result<(), DeviceError> {
        let frame = UplinkFrame {
            rx_info: self.rx_info.clone(),
            phy_payload,
        };
        self.gateway.send_uplink(&frame).await?;
        Ok(())
    }

    /// Process every downlink already queued, without waiting
    pub fn drain_downlinks(&mut self) {
        while let Some(frame) = self.inbound.try_recv() {
            self.handle_downlink(frame);
        }
    }

    fn handle_downlink(&mut self, frame: DownlinkFrame) {
        let mut phy = frame.phy_payload;
        let mtype = phy.mhdr.mtype;
        match mtype {
            MType::JoinAccept => {
                debug!("device: already joined, join accept ignored");
            }
            MType::UnconfirmedDataDown | MType::ConfirmedDataDown => {
                if let Err(e) = self.handle_data_down(&mut phy) {
                    warn!(error = %e, "device: downlink dropped");
                }
            }
            other => debug!(mtype = ?other, "device: unexpected downlink dropped"),
        }
    }

    fn handle_data_down(&mut self, phy: &mut PhyPayload) -> Result<(), FrameError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(mac) = phy.mac_payload_mut() else {
            return Err(FrameError::NotData);
        };
        if mac.fhdr.dev_addr != session.dev_addr {
            debug!(dev_addr = %mac.fhdr.dev_addr, "device: downlink for another device");
            return Ok(());
        }

        let fcnt = session.widen_fcnt_down(mac.fhdr.f_cnt as u16);
        mac.fhdr.f_cnt = fcnt;
        let f_port = mac.f_port;

        if !phy.validate_mic(&session.nwk_skey)? {
            warn!(fcnt, "device: downlink MIC mismatch, dropped");
            return Ok(());
        }
        session.fcnt_down = fcnt;

        let key = if f_port == Some(0) {
            session.nwk_skey
        } else {
            session.app_skey
        };
        phy.apply_frm_cipher(&key)?;

        if let Some(mac) = phy.mac_payload() {
            info!(
                fcnt,
                f_port = ?f_port,
                ack = mac.fhdr.f_ctrl.ack,
                payload = %hex::encode(&mac.frm_payload),
                "device: downlink received"
            );
        }
        Ok(())
    }

    /// Join, then publish one uplink per payload from `source` until it runs
    /// dry.
    ///
    /// Uplink failures are logged and skipped.
    #[instrument(skip_all, fields(dev_eui = %self.config.dev_eui))]
    pub async fn run<S: PayloadSource>(&mut self, source: &mut S) -> Result<(), DeviceError> {
        self.join().await?;
        self.state = DeviceState::Transmitting;

        loop {
            self.drain_downlinks();
            let Some(payload) = source.next_payload().await else {
                info!("device: payload source exhausted, stopping");
                return Ok(());
            };
            self.drain_downlinks();

            match self.send_uplink(&payload).await {
                Ok(fcnt) => info!(fcnt, size = payload.len(), "device: uplink sent"),
                Err(DeviceError::FrameCounterExhausted) => {
                    return Err(DeviceError::FrameCounterExhausted);
                }
                Err(e) => warn!(error = %e, "device: uplink failed"),
            }
        }
    }
}
