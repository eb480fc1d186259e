//! mqpoll-client - Polling MQTT 3.1/3.1.1 client engine.
//!
//! Clients created from one [`Context`] share a single mio poll. Each
//! client takes itself from "not connected" through the TCP (optionally
//! TLS) and MQTT handshakes, then moves QoS 0/1/2 traffic with retries and
//! keep-alive supervision.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use mqpoll_client::{Client, ConnectOptions, QoS};
//!
//! let client = Client::new("tcp://localhost:1883", "my-client")?;
//! client.connect(&ConnectOptions::new().keep_alive(30))?;
//!
//! client.subscribe("sensors/#", QoS::AtLeastOnce)?;
//! let token = client.publish("sensors/temp", "25.5", QoS::AtLeastOnce, false)?;
//! if let Some(token) = token {
//!     client.wait_for_completion(token, Duration::from_secs(5))?;
//! }
//!
//! while let Some(message) = client.receive(Duration::from_secs(1))? {
//!     println!("{}: {:?}", message.topic, message.payload_str());
//! }
//! client.disconnect(Duration::from_secs(1))?;
//! ```
//!
//! # Callbacks
//!
//! With [`Client::set_handler`] messages, completed deliveries and lost
//! connections are reported to an [`MqttHandler`] from a background thread
//! instead.

mod address;
mod callback;
mod client;
mod config;
mod connection;
mod engine;
mod error;
pub mod logging;
mod packet_id;
pub mod persistence;
mod protocol;
mod registry;
mod session;
pub mod settings;
mod socket;
mod sync;
#[cfg(feature = "tls")]
mod tls;
mod will;

pub use address::{ServerAddress, MQTT_PORT, MQTT_TLS_PORT};
pub use callback::{DeliveryToken, MqttHandler};
pub use client::{Client, PublishMessage, ACK_TIMEOUT};
pub use config::{ConnectOptions, MqttVersion, TlsOptions, DEFAULT_MAX_INFLIGHT, MIN_RETRY_INTERVAL};
pub use connection::ConnectionState;
pub use engine::Context;
pub use error::{ClientError, Result};
pub use logging::LogConfig;
#[cfg(feature = "persistence")]
pub use persistence::FjallPersistence;
pub use persistence::{MemoryPersistence, Persistence, PersistenceError};
pub use registry::DeliveredMessage;
pub use settings::{Settings, SettingsError};
pub use will::Will;

// Re-export useful types from core
pub use mqpoll_core::{ConnackCode, QoS, SubscribeReturnCode};
