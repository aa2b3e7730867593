//! Device and simulator configuration
//!
//! This module contains types and functions for configuring the simulated
//! device and its gateway bridge. It includes:
//! - Device identity (DevEUI, AppEUI, AppKey) and identifier types
//! - Session state management
//! - Runtime settings loaded from the environment

/// Device identity and session state
pub mod device;

/// Simulator settings
pub mod simulator;

pub use device::{
    AESKey, AppNonce, DevAddr, DevNonce, DeviceConfig, IdentifierError, NetID, SessionState, EUI64,
};
pub use simulator::{BrokerConfig, ConfigError, SimulatorConfig, UplinkMode};
