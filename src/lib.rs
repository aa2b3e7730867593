//! LoRaWAN end-device simulator in Rust
//!
//! This crate simulates a single LoRaWAN 1.0 OTAA end-device for testing a
//! gateway bridge and network server. Instead of radio hardware, every frame
//! travels through an MQTT broker the way a packet forwarder's gateway
//! bridge would carry it.
//!
//! # Features
//! - OTAA join with session key derivation
//! - Encrypted, MIC-protected unconfirmed uplinks with monotonic frame counters
//! - Gateway backend with connect/subscribe retry and graceful drain on close
//! - In-crate LoRaWAN frame codec and crypto
//! - Broker abstraction so the backend can run against an in-memory broker
//!
//! # Example
//! ```no_run
//! use simdev::{
//!     backend::{GatewayBackend, MqttBroker},
//!     config::SimulatorConfig,
//!     device::{LinePayloads, SimulatedDevice},
//! };
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = SimulatorConfig::from_env()?;
//!
//! // Connect to the broker, retrying until it is reachable
//! let broker = MqttBroker::new(&config.broker);
//! let backend = GatewayBackend::connect(broker, config.backend_options()).await?;
//!
//! // Join, then send one uplink per line of standard input
//! let mut device = SimulatedDevice::from_config(&config, backend);
//! let mut source = LinePayloads::new(tokio::io::BufReader::new(tokio::io::stdin()));
//! device.run(&mut source).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Gateway backend over a publish/subscribe broker
pub mod backend;

/// Device identity and simulator configuration
pub mod config;

/// Cryptographic functions
pub mod crypto;

/// Simulated device driver
pub mod device;

/// LoRaWAN frame codec
pub mod lorawan;

/// Radio metadata and wire envelopes
pub mod radio;
