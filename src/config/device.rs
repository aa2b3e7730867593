use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error returned when an identifier or key cannot be parsed from hex.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {kind}: expected {expected} hex-encoded bytes, got {input:?}")]
pub struct IdentifierError {
    kind: &'static str,
    expected: usize,
    input: String,
}

macro_rules! byte_identifier {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Size in bytes
            pub const SIZE: usize = $len;

            /// Create from big-endian (display order) bytes
            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Big-endian (display order) bytes
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Bytes in on-air order (little-endian)
            pub fn to_wire(&self) -> [u8; $len] {
                let mut bytes = self.0;
                bytes.reverse();
                bytes
            }

            /// Build from on-air (little-endian) bytes
            pub fn from_wire(wire: &[u8]) -> Option<Self> {
                let mut bytes: [u8; $len] = wire.try_into().ok()?;
                bytes.reverse();
                Some(Self(bytes))
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = IdentifierError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let err = || IdentifierError {
                    kind: stringify!($name),
                    expected: $len,
                    input: s.to_string(),
                };
                let bytes = hex::decode(s.trim()).map_err(|_| err())?;
                let bytes: [u8; $len] = bytes.try_into().map_err(|_| err())?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

byte_identifier!(
    /// EUI-64 (8 bytes)
    EUI64,
    8
);
byte_identifier!(
    /// AES-128 key (16 bytes)
    AESKey,
    16
);
byte_identifier!(
    /// Device address (4 bytes)
    DevAddr,
    4
);
byte_identifier!(
    /// Device nonce sent in the join request (2 bytes)
    DevNonce,
    2
);
byte_identifier!(
    /// Network-generated nonce returned in the join accept (3 bytes)
    AppNonce,
    3
);
byte_identifier!(
    /// Network identifier (3 bytes)
    NetID,
    3
);

impl From<u32> for DevAddr {
    fn from(value: u32) -> Self {
        Self(value.to_be_bytes())
    }
}

impl From<u16> for DevNonce {
    fn from(value: u16) -> Self {
        Self(value.to_be_bytes())
    }
}

impl From<u32> for AppNonce {
    fn from(value: u32) -> Self {
        let b = value.to_be_bytes();
        Self([b[1], b[2], b[3]])
    }
}

impl From<u32> for NetID {
    fn from(value: u32) -> Self {
        let b = value.to_be_bytes();
        Self([b[1], b[2], b[3]])
    }
}

/// Device activation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    /// Device is not activated
    Idle,
    /// Device is activated through OTAA
    OTAAActivated,
}

/// Immutable identity of the simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Device EUI (unique device identifier)
    pub dev_eui: EUI64,
    /// Application EUI
    pub app_eui: EUI64,
    /// Application (root) key used for the join procedure
    pub app_key: AESKey,
}

impl DeviceConfig {
    /// Create a new OTAA device configuration
    pub fn new_otaa(dev_eui: EUI64, app_eui: EUI64, app_key: AESKey) -> Self {
        Self {
            dev_eui,
            app_eui,
            app_key,
        }
    }
}

/// First uplink frame counter of a fresh session
pub const INITIAL_FCNT_UP: u32 = 1;

/// Session state for an activated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// Current activation state
    pub activation_state: ActivationState,
    /// Device address (assigned during activation)
    pub dev_addr: DevAddr,
    /// Network session key
    pub nwk_skey: AESKey,
    /// Application session key
    pub app_skey: AESKey,
    /// Next uplink frame counter
    pub fcnt_up: u32,
    /// Last seen downlink frame counter
    pub fcnt_down: u32,
    /// Device nonce of the join that created this session
    pub dev_nonce: DevNonce,
}

impl SessionState {
    /// Create a new session state for OTAA activation
    pub fn new_otaa(
        dev_addr: DevAddr,
        nwk_skey: AESKey,
        app_skey: AESKey,
        dev_nonce: DevNonce,
    ) -> Self {
        Self {
            activation_state: ActivationState::OTAAActivated,
            dev_addr,
            nwk_skey,
            app_skey,
            fcnt_up: INITIAL_FCNT_UP,
            fcnt_down: 0,
            dev_nonce,
        }
    }

    /// Advance the uplink frame counter.
    ///
    /// Returns `false` when the counter is exhausted; it never wraps.
    pub fn increment_fcnt_up(&mut self) -> bool {
        match self.fcnt_up.checked_add(1) {
            Some(next) => {
                self.fcnt_up = next;
                true
            }
            None => false,
        }
    }

    /// Widen a 16-bit downlink counter from the air against the last seen one
    pub fn widen_fcnt_down(&self, wire: u16) -> u32 {
        let full = (self.fcnt_down & 0xFFFF_0000) | u32::from(wire);
        if full < self.fcnt_down {
            full.wrapping_add(0x1_0000)
        } else {
            full
        }
    }

    /// Widen and record a downlink counter
    pub fn observe_fcnt_down(&mut self, wire: u16) -> u32 {
        self.fcnt_down = self.widen_fcnt_down(wire);
        self.fcnt_down
    }
}
