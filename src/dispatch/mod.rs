//! In-process delivery of inbound messages
//!
//! The bridge only knows the [`DispatchChannel`]. Consumers register on the
//! channel and are fed by their own worker task:
//!
//! ```text
//! InboundBridge ──► DispatchChannel ──► worker ──► Consumer
//!  (network task)     (fan-out)         (one per consumer)
//! ```
//!
//! The channel is constructed by whoever composes the bridge and its
//! consumers and is handed to the bridge explicitly. Several bridges and
//! channels can live side by side in one process.

pub mod channel;
pub mod consumer;

pub use channel::{ConsumerId, DispatchChannel, DispatchReport};
pub use consumer::{Consumer, ConsumerError, LoggingConsumer};
