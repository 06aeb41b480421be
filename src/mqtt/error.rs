//! Error types of the inbound bridge
//!
//! Only [`BridgeError`] leaves the bridge. Everything else is handled inside
//! the bridge task and shows up in the logs.

use std::time::Duration;

use rumqttc::{ClientError, ConnectionError};
use thiserror::Error;

use crate::config::ConfigError;

/// Failure of [`InboundBridge::start`](super::mqtt_handler::InboundBridge::start)
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}

/// The broker could not be reached or refused the handshake
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Invalid broker settings: {0}")]
    InvalidSettings(#[from] ConfigError),

    #[error("Unable to resolve {endpoint}: {source}")]
    Unresolvable {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Broker {endpoint} unreachable: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Broker {endpoint} rejected the connection: {code}")]
    Rejected { endpoint: String, code: String },

    #[error("No CONNACK from {endpoint} within {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
}

/// The broker did not accept the subscription
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Invalid topic filter '{topic}': {reason}")]
    InvalidFilter { topic: String, reason: String },

    #[error("Failed to request subscription to '{topic}': {source}")]
    Request {
        topic: String,
        #[source]
        source: ClientError,
    },

    #[error("Broker refused subscription to '{topic}'")]
    Refused { topic: String },

    #[error("Connection lost while subscribing to '{topic}': {source}")]
    Connection {
        topic: String,
        #[source]
        source: ConnectionError,
    },

    #[error("No SUBACK for '{topic}' within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },
}

/// A convert-dispatch-acknowledge cycle took longer than the completion timeout
#[derive(Debug, Error)]
#[error("Delivery on '{topic}' stalled for more than {timeout:?}")]
pub struct DeliveryTimeoutError {
    pub topic: String,
    pub timeout: Duration,
}

/// Reasons for leaving the `Subscribed` state, all of them trigger a reconnect
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error(transparent)]
    DeliveryTimeout(#[from] DeliveryTimeoutError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Failed to acknowledge message: {0}")]
    Ack(#[from] ClientError),

    #[error("Broker closed the session")]
    BrokerDisconnect,
}
