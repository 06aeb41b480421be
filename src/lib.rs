//! Inbound MQTT bridge
//!
//! Subscribes to a broker topic and delivers every message to in-process
//! consumers.
//!
//! ```text
//! Broker ──► InboundBridge ──► DispatchChannel ──► Consumer(s)
//!            (receive, convert)   (fan-out)
//! ```

pub mod config;
pub mod dispatch;
pub mod mqtt;
