use core::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use super::device::{AESKey, DeviceConfig, EUI64};
use crate::backend::{BackendOptions, RetryPolicy};
use crate::radio::DataRate;

/// Prefix of every environment variable read by [`SimulatorConfig::from_env`]
pub const ENV_PREFIX: &str = "SIMDEV_";

const DEFAULT_BROKER: &str = "tcp://localhost:1883";
const DEFAULT_CREDENTIAL: &str = "loraserver";
const DEFAULT_CLIENT_ID: &str = "lorawan-simdev";
const DEFAULT_APP_KEY: AESKey = AESKey::new([
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10,
]);
const DEFAULT_APP_EUI: EUI64 = EUI64::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
const DEFAULT_DEV_EUI: EUI64 = EUI64::new([0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09]);
const DEFAULT_GATEWAY_ID: EUI64 = EUI64::new([0x01; 8]);
const DEFAULT_FREQUENCY: u32 = 470_300_000;
const DEFAULT_SPREAD_FACTOR: u8 = 12;
const DEFAULT_BANDWIDTH: u32 = 125;

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Variable present but not parseable
    #[error("invalid value for {var}: {reason}")]
    InvalidValue {
        /// Variable name
        var: String,
        /// Parse failure
        reason: String,
    },

    /// Values parse but do not make sense together
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where uplink payloads come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UplinkMode {
    /// One uplink per line read from standard input
    #[default]
    Stdin,
    /// A fixed payload at a fixed interval
    Interval,
}

impl FromStr for UplinkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdin" => Ok(Self::Stdin),
            "interval" => Ok(Self::Interval),
            other => Err(format!("unknown uplink mode {other:?}, expected stdin or interval")),
        }
    }
}

/// MQTT broker connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Server URL, e.g. `tcp://localhost:1883`
    pub server: String,
    /// Username, empty for anonymous
    pub username: String,
    /// Password
    pub password: String,
    /// MQTT client identifier
    pub client_id: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_BROKER.to_string(),
            username: DEFAULT_CREDENTIAL.to_string(),
            password: DEFAULT_CREDENTIAL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// Complete simulator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorConfig {
    /// Broker connection
    pub broker: BrokerConfig,
    /// Device identity
    pub device: DeviceConfig,
    /// Gateway the uplinks are reported through
    pub gateway_id: EUI64,
    /// Uplink frequency in Hz
    pub frequency: u32,
    /// Uplink data rate
    pub data_rate: DataRate,
    /// FPort of application uplinks
    pub f_port: u8,
    /// Uplink payload source
    pub uplink_mode: UplinkMode,
    /// Period of [`UplinkMode::Interval`]
    pub uplink_interval: Duration,
    /// Payload of [`UplinkMode::Interval`]
    pub uplink_payload: Vec<u8>,
    /// Give up waiting for a join accept after this long; `None` waits forever
    pub join_timeout: Option<Duration>,
    /// Delay between connection attempts
    pub connect_retry: Duration,
    /// Delay between subscription attempts
    pub subscribe_retry: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            device: DeviceConfig::new_otaa(DEFAULT_DEV_EUI, DEFAULT_APP_EUI, DEFAULT_APP_KEY),
            gateway_id: DEFAULT_GATEWAY_ID,
            frequency: DEFAULT_FREQUENCY,
            data_rate: DataRate::lora(DEFAULT_SPREAD_FACTOR, DEFAULT_BANDWIDTH),
            f_port: 1,
            uplink_mode: UplinkMode::Stdin,
            uplink_interval: Duration::from_secs(10),
            uplink_payload: b"hello".to_vec(),
            join_timeout: None,
            connect_retry: Duration::from_secs(2),
            subscribe_retry: Duration::from_secs(1),
        }
    }
}

impl SimulatorConfig {
    /// Load from `SIMDEV_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using `lookup` to resolve variable names. Unset variables keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        env.string("BROKER", &mut config.broker.server);
        env.string("USERNAME", &mut config.broker.username);
        env.string("PASSWORD", &mut config.broker.password);
        env.string("CLIENT_ID", &mut config.broker.client_id);
        env.secs("KEEP_ALIVE_SECS", &mut config.broker.keep_alive)?;

        env.parse("DEV_EUI", &mut config.device.dev_eui)?;
        env.parse("APP_EUI", &mut config.device.app_eui)?;
        env.parse("APP_KEY", &mut config.device.app_key)?;

        env.parse("GATEWAY_ID", &mut config.gateway_id)?;
        env.parse("FREQUENCY", &mut config.frequency)?;
        env.parse("SPREAD_FACTOR", &mut config.data_rate.spread_factor)?;
        env.parse("BANDWIDTH", &mut config.data_rate.bandwidth)?;
        env.parse("FPORT", &mut config.f_port)?;

        env.parse("UPLINK_MODE", &mut config.uplink_mode)?;
        env.secs("UPLINK_INTERVAL_SECS", &mut config.uplink_interval)?;
        if let Some(payload) = env.get("UPLINK_PAYLOAD") {
            config.uplink_payload = payload.into_bytes();
        }

        if let Some(secs) = env.get("JOIN_TIMEOUT_SECS") {
            let secs: u64 = parse_var("JOIN_TIMEOUT_SECS", &secs)?;
            config.join_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        env.millis("CONNECT_RETRY_MS", &mut config.connect_retry)?;
        env.millis("SUBSCRIBE_RETRY_MS", &mut config.subscribe_retry)?;

        config.validate()?;
        Ok(config)
    }

    /// Check that the values make sense together
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.server.trim().is_empty() {
            return Err(ConfigError::Invalid("broker server must not be empty".into()));
        }
        if self.broker.client_id.is_empty() {
            return Err(ConfigError::Invalid("client id must not be empty".into()));
        }
        if self.f_port == 0 || self.f_port > 223 {
            return Err(ConfigError::Invalid(format!(
                "fport {} outside application range 1..=223",
                self.f_port
            )));
        }
        if !(7..=12).contains(&self.data_rate.spread_factor) {
            return Err(ConfigError::Invalid(format!(
                "spread factor {} outside 7..=12",
                self.data_rate.spread_factor
            )));
        }
        if self.frequency == 0 {
            return Err(ConfigError::Invalid("frequency must not be zero".into()));
        }
        if self.uplink_mode == UplinkMode::Interval {
            if self.uplink_interval.is_zero() {
                return Err(ConfigError::Invalid("uplink interval must not be zero".into()));
            }
            if self.uplink_payload.is_empty() {
                return Err(ConfigError::Invalid("uplink payload must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Backend retry settings
    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            connect_retry: RetryPolicy::fixed(self.connect_retry),
            subscribe_retry: RetryPolicy::fixed(self.subscribe_retry),
            ..BackendOptions::default()
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}")).filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, slot: &mut String) {
        if let Some(value) = self.get(key) {
            *slot = value;
        }
    }

    fn parse<T>(&self, key: &str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        if let Some(value) = self.get(key) {
            *slot = parse_var(key, &value)?;
        }
        Ok(())
    }

    fn secs(&self, key: &str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(value) = self.get(key) {
            *slot = Duration::from_secs(parse_var(key, &value)?);
        }
        Ok(())
    }

    fn millis(&self, key: &str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(value) = self.get(key) {
            *slot = Duration::from_millis(parse_var(key, &value)?);
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        var: format!("{ENV_PREFIX}{key}"),
        reason: e.to_string(),
    })
}
