use serde::{Deserialize, Serialize};

use crate::config::device::EUI64;

/// Modulation scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Modulation {
    /// LoRa chirp spread spectrum
    #[default]
    #[serde(rename = "LORA")]
    LoRa,
    /// Frequency shift keying
    #[serde(rename = "FSK")]
    Fsk,
}

/// Data rate parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataRate {
    /// Modulation scheme
    pub modulation: Modulation,
    /// Spreading factor (SF7-SF12), LoRa only
    #[serde(default)]
    pub spread_factor: u8,
    /// Bandwidth in kHz
    #[serde(default)]
    pub bandwidth: u32,
    /// Bit rate, FSK only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<u32>,
}

impl DataRate {
    /// LoRa data rate with the given spreading factor and bandwidth (kHz)
    pub fn lora(spread_factor: u8, bandwidth: u32) -> Self {
        Self {
            modulation: Modulation::LoRa,
            spread_factor,
            bandwidth,
            bit_rate: None,
        }
    }
}

/// Receive metadata attached to every simulated uplink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RxInfo {
    /// Receiving gateway
    pub mac: EUI64,
    /// Gateway internal timestamp in microseconds
    pub timestamp: u32,
    /// Frequency in Hz
    pub frequency: u32,
    /// Concentrator IF channel
    pub channel: u8,
    /// Concentrator RF chain
    pub rf_chain: u8,
    /// CRC status (1 = OK)
    pub crc_status: i8,
    /// LoRa coding rate
    pub code_rate: String,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Signal to noise ratio in dB
    #[serde(rename = "loRaSNR")]
    pub lora_snr: i8,
    /// PHY payload size in bytes
    pub size: usize,
    /// Data rate
    pub data_rate: DataRate,
}

impl RxInfo {
    /// Metadata for an uplink heard by `gateway` on `frequency` at `data_rate`
    pub fn new(gateway: EUI64, frequency: u32, data_rate: DataRate) -> Self {
        Self {
            mac: gateway,
            timestamp: 0,
            frequency,
            channel: 0,
            rf_chain: 0,
            crc_status: 1,
            code_rate: "4/5".to_string(),
            rssi: -50,
            lora_snr: 10,
            size: 0,
            data_rate,
        }
    }
}

/// Transmit metadata returned with every downlink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TxInfo {
    /// Transmitting gateway
    pub mac: EUI64,
    /// Send immediately instead of at `timestamp`
    pub immediately: bool,
    /// Gateway timestamp at which to transmit
    pub timestamp: u32,
    /// Frequency in Hz
    pub frequency: u32,
    /// Transmit power in dBm
    pub power: i8,
    /// Data rate
    pub data_rate: DataRate,
    /// LoRa coding rate
    pub code_rate: String,
    /// Inverted IQ polarization
    #[serde(rename = "iPol")]
    pub i_polarization: Option<bool>,
}
