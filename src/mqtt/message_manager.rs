use chrono::{DateTime, Local};
use rumqttc::{Publish, QoS};
use std::fmt;
use thiserror::Error;

use super::config::PayloadFormat;

const PREVIEW_CHARS: usize = 32;

/// A message received from the broker in the bridge's own representation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
    /// DUP flag, set when the broker redelivers a QoS 1/2 message
    pub duplicate: bool,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained: false,
            duplicate: false,
            received_at: Local::now(),
        }
    }

    /// Payload as text, `None` if it is not valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn qos_level(&self) -> u8 {
        self.qos as u8
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.payload_str() {
            Some(text) => {
                let preview: String = text.chars().take(PREVIEW_CHARS).collect();
                let ellipsis = if text.chars().count() > PREVIEW_CHARS { "..." } else { "" };
                write!(f, "[{}] {}{}", self.topic, preview, ellipsis)
            }
            None => write!(f, "[{}] <{} bytes>", self.topic, self.payload.len()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Received message without a topic")]
    EmptyTopic,

    #[error("Received message on wildcard topic '{0}'")]
    WildcardTopic(String),

    #[error("Payload on '{topic}' is not valid UTF-8: {source}")]
    InvalidUtf8 {
        topic: String,
        #[source]
        source: std::str::Utf8Error,
    },
}

/// Turns client library publishes into [`InboundMessage`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct PayloadConverter {
    format: PayloadFormat,
}

impl PayloadConverter {
    pub fn new(format: PayloadFormat) -> Self {
        Self { format }
    }

    pub fn convert(&self, publish: &Publish) -> Result<InboundMessage, ConversionError> {
        if publish.topic.is_empty() {
            return Err(ConversionError::EmptyTopic);
        }
        // wildcards are only legal in filters, never in a delivered topic name
        if publish.topic.contains(['+', '#']) {
            return Err(ConversionError::WildcardTopic(publish.topic.clone()));
        }

        if self.format == PayloadFormat::Text {
            std::str::from_utf8(&publish.payload).map_err(|source| {
                ConversionError::InvalidUtf8 {
                    topic: publish.topic.clone(),
                    source,
                }
            })?;
        }

        Ok(InboundMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
            qos: publish.qos,
            retained: publish.retain,
            duplicate: publish.dup,
            received_at: Local::now(),
        })
    }
}
