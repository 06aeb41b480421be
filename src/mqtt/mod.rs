//! # MQTT Ingestion Module
//!
//! Keeps a persistent connection to an MQTT broker, subscribes to one topic
//! filter and turns every received PUBLISH into an [`InboundMessage`] that is
//! handed to the [`DispatchChannel`](crate::dispatch::DispatchChannel).
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker settings, bridge options, topic filter rules
//! ├── message_manager.rs  - Inbound message representation and payload conversion
//! ├── mqtt_handler.rs     - Session state machine, bridge task and handle
//! ├── backoff.rs          - Reconnect delays
//! └── error.rs            - Error kinds of the bridge
//! ```
//!
//! ## Failure Handling
//!
//! - **Start**: unreachable broker, refused handshake and refused subscription
//!   are returned to the caller of [`InboundBridge::start`]; nothing is retried
//! - **Running**: connection loss and stalled deliveries drop the connection and
//!   reconnect with exponential backoff
//! - **Per message**: payloads that fail conversion are logged and dropped,
//!   the next message is processed normally
//!
//! ## Delivery Guarantees
//!
//! QoS 1 and 2 messages are acknowledged to the broker only after the dispatch
//! channel accepted them. Consumers must tolerate duplicates, the bridge does
//! not deduplicate redeliveries.

pub mod backoff;
pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;

pub use config::{BridgeOptions, BrokerSettings, PayloadFormat};
pub use error::{BridgeError, ConnectError, SubscriptionError};
pub use message_manager::{ConversionError, InboundMessage, PayloadConverter};
pub use mqtt_handler::{BridgeHandle, ConnectionState, InboundBridge};
