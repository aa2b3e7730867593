//! Simulated radio packets
//!
//! Radio metadata attached to frames crossing the gateway bridge and the JSON
//! envelopes they travel in.

/// JSON wire envelopes
pub mod envelope;

/// Receive and transmit metadata
pub mod metadata;

pub use envelope::{DownlinkEnvelope, UplinkEnvelope};
pub use metadata::{DataRate, Modulation, RxInfo, TxInfo};

use crate::lorawan::PhyPayload;

/// Uplink as heard by a gateway: receive metadata and the protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkFrame {
    /// Receive metadata
    pub rx_info: RxInfo,
    /// LoRaWAN frame
    pub phy_payload: PhyPayload,
}

/// Downlink to be transmitted by a gateway: transmit metadata and the frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownlinkFrame {
    /// Transmit metadata
    pub tx_info: TxInfo,
    /// LoRaWAN frame, decoded but still encrypted
    pub phy_payload: PhyPayload,
}
