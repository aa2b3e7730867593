//! LoRaWAN protocol implementation
//!
//! This module contains the frame codec used by the simulated device:
//! - MAC header, frame header and payload types
//! - Binary encoding and decoding of PHY payloads
//! - MIC handling and join accept / FRMPayload ciphers

/// MAC layer frame codec
pub mod mac;

pub use mac::{
    FCtrl, FrameError, JoinAcceptPayload, JoinRequestPayload, MType, MacPayload, Payload,
    PhyBytes, PhyPayload, FHDR, MHDR,
};
