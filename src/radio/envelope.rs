//! JSON wire envelopes
//!
//! Both directions carry the radio metadata plus the binary PHY payload,
//! base64 encoded:
//!
//! ```json
//! {"rxInfo": {"mac": "0101010101010101", ...}, "phyPayload": "QAQDAgGAAQAB..."}
//! ```

use serde::{Deserialize, Serialize};

use super::{DownlinkFrame, RxInfo, TxInfo, UplinkFrame};
use crate::lorawan::{FrameError, PhyPayload};

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Uplink as published on `gateway/<gatewayID>/rx`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkEnvelope {
    /// Receive metadata
    pub rx_info: RxInfo,
    /// Binary PHY payload
    #[serde(with = "base64_bytes")]
    pub phy_payload: Vec<u8>,
}

impl UplinkEnvelope {
    /// Encode the frame; `rx_info.size` is set from the encoded length
    pub fn from_frame(frame: &UplinkFrame) -> Result<Self, FrameError> {
        let phy_payload = frame.phy_payload.to_bytes()?.to_vec();
        let mut rx_info = frame.rx_info.clone();
        rx_info.size = phy_payload.len();
        Ok(Self {
            rx_info,
            phy_payload,
        })
    }

    /// Decode the binary frame
    pub fn into_frame(self) -> Result<UplinkFrame, FrameError> {
        Ok(UplinkFrame {
            phy_payload: PhyPayload::from_bytes(&self.phy_payload)?,
            rx_info: self.rx_info,
        })
    }
}

/// Downlink as received on `gateway/<gatewayID>/tx`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownlinkEnvelope {
    /// Transmit metadata
    #[serde(default)]
    pub tx_info: TxInfo,
    /// Binary PHY payload
    #[serde(with = "base64_bytes")]
    pub phy_payload: Vec<u8>,
}

impl DownlinkEnvelope {
    /// Encode the frame
    pub fn from_frame(frame: &DownlinkFrame) -> Result<Self, FrameError> {
        Ok(Self {
            tx_info: frame.tx_info.clone(),
            phy_payload: frame.phy_payload.to_bytes()?.to_vec(),
        })
    }

    /// Decode the binary frame
    pub fn into_frame(self) -> Result<DownlinkFrame, FrameError> {
        Ok(DownlinkFrame {
            phy_payload: PhyPayload::from_bytes(&self.phy_payload)?,
            tx_info: self.tx_info,
        })
    }
}
