use thiserror::Error;
use tracing::{info, warn};

use crate::mqtt::message_manager::InboundMessage;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Consumer rejected message: {0}")]
    Rejected(String),

    #[error("Consumer panicked: {0}")]
    Panicked(String),
}

/// Receives every message published on the [`DispatchChannel`](super::DispatchChannel)
/// it is registered with.
///
/// `consume` runs on the consumer's own blocking worker thread, so it may block
/// or do slow synchronous work. Errors and panics are logged by the worker and
/// never reach the bridge.
pub trait Consumer: Send + 'static {
    fn name(&self) -> &str {
        "handler"
    }

    fn consume(&mut self, message: &InboundMessage) -> Result<(), ConsumerError>;
}

impl<F> Consumer for F
where
    F: FnMut(&InboundMessage) -> Result<(), ConsumerError> + Send + 'static,
{
    fn consume(&mut self, message: &InboundMessage) -> Result<(), ConsumerError> {
        self(message)
    }
}

/// Writes every received message to the log.
#[derive(Debug, Clone)]
pub struct LoggingConsumer {
    name: String,
    received: u64,
}

impl LoggingConsumer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            received: 0,
        }
    }
}

impl Default for LoggingConsumer {
    fn default() -> Self {
        Self::new("log")
    }
}

impl Consumer for LoggingConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&mut self, message: &InboundMessage) -> Result<(), ConsumerError> {
        self.received += 1;
        match message.payload_str() {
            Some(text) => info!(
                seq = self.received,
                topic = %message.topic,
                qos = message.qos_level(),
                retained = message.retained,
                received_at = %message.received_at.format("%H:%M:%S%.3f"),
                "{}",
                text
            ),
            None => info!(
                seq = self.received,
                topic = %message.topic,
                qos = message.qos_level(),
                retained = message.retained,
                received_at = %message.received_at.format("%H:%M:%S%.3f"),
                "<{} bytes of binary payload>",
                message.payload.len()
            ),
        }
        if message.duplicate {
            warn!("Message on {} is a broker redelivery", message.topic);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::QoS;

    #[test]
    fn logging_consumer_counts_messages() {
        let mut consumer = LoggingConsumer::default();
        let text = InboundMessage::new("test", "Simple Message - 0", QoS::AtLeastOnce);
        let binary = InboundMessage::new("test", vec![0xff, 0x00], QoS::AtMostOnce);

        consumer.consume(&text).unwrap();
        consumer.consume(&binary).unwrap();

        assert_eq!(consumer.name(), "log");
        assert_eq!(consumer.received, 2);
    }

    #[test]
    fn closures_are_consumers() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut handler = move |message: &InboundMessage| -> Result<(), ConsumerError> {
            tx.send(message.topic.clone())
                .map_err(|e| ConsumerError::Rejected(e.to_string()))
        };

        handler
            .consume(&InboundMessage::new("a", "1", QoS::AtMostOnce))
            .unwrap();

        assert_eq!(Consumer::name(&handler), "handler");
        assert_eq!(rx.try_recv().unwrap(), "a");
    }
}
