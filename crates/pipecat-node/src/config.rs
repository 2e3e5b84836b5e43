use std::fmt;
use std::str::FromStr;

use pipecat_core::{QueueSpec, SubscribeOptions, CONTENT_TYPE_TEXT_PLAIN};
use serde::Deserialize;
use thiserror::Error;

use crate::pending::KeyStrategy;

/// Where acknowledgment commands come from while consuming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum AckSourceKind {
    /// Nothing settles deliveries; the pending set only grows.
    #[default]
    None,
    /// `ack <key>` lines on standard input.
    Stdin,
    /// Command messages on the named control queue.
    Queue(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AckSourceParseError {
    #[error("unknown ack source `{0}` (expected none, stdin or queue:<name>)")]
    Unknown(String),
    #[error("ack source `queue:` needs a queue name")]
    MissingQueue,
}

impl FromStr for AckSourceKind {
    type Err = AckSourceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(queue) = s.strip_prefix("queue:") {
            let queue = queue.trim();
            if queue.is_empty() {
                return Err(AckSourceParseError::MissingQueue);
            }
            return Ok(AckSourceKind::Queue(queue.to_string()));
        }
        match s {
            "" | "none" => Ok(AckSourceKind::None),
            "stdin" => Ok(AckSourceKind::Stdin),
            other => Err(AckSourceParseError::Unknown(other.to_string())),
        }
    }
}

impl TryFrom<String> for AckSourceKind {
    type Error = AckSourceParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for AckSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckSourceKind::None => f.write_str("none"),
            AckSourceKind::Stdin => f.write_str("stdin"),
            AckSourceKind::Queue(queue) => write!(f, "queue:{queue}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// How received deliveries are keyed in the pending set.
    pub key_strategy: KeyStrategy,
    /// Trigger for settling pending deliveries.
    pub ack_source: AckSourceKind,
    /// Consumer tag; empty lets the broker assign one.
    pub consumer_tag: String,
    /// Content type stamped on published lines.
    pub content_type: String,
    /// Max unacknowledged deliveries in flight, `0` for no limit.
    pub prefetch: u16,
    /// Declare queues as durable.
    pub durable: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            key_strategy: KeyStrategy::Content,
            ack_source: AckSourceKind::None,
            consumer_tag: String::new(),
            content_type: CONTENT_TYPE_TEXT_PLAIN.to_string(),
            prefetch: 0,
            durable: true,
        }
    }
}

impl BridgeConfig {
    pub fn queue_spec(&self, name: &str) -> QueueSpec {
        QueueSpec {
            durable: self.durable,
            ..QueueSpec::durable(name)
        }
    }

    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions::manual_ack(self.consumer_tag.clone())
    }

    /// Subscription used for a control queue, tagged apart from the data one.
    pub fn control_subscribe_options(&self) -> SubscribeOptions {
        let tag = if self.consumer_tag.is_empty() {
            String::new()
        } else {
            format!("{}-acks", self.consumer_tag)
        };
        SubscribeOptions::manual_ack(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::{AckSourceKind, AckSourceParseError, BridgeConfig};
    use crate::pending::KeyStrategy;

    #[test]
    fn defaults_match_plain_bridge() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.key_strategy, KeyStrategy::Content);
        assert_eq!(cfg.ack_source, AckSourceKind::None);
        assert_eq!(cfg.content_type, "text/plain");
        assert_eq!(cfg.prefetch, 0);
        assert!(cfg.durable);
        assert!(!cfg.subscribe_options().auto_ack);
    }

    #[test]
    fn queue_spec_reflects_durability() {
        let cfg = BridgeConfig {
            durable: false,
            ..BridgeConfig::default()
        };
        let spec = cfg.queue_spec("q1");
        assert_eq!(spec.name, "q1");
        assert!(!spec.durable);
        assert!(!spec.auto_delete);
    }

    #[test]
    fn control_tag_derives_from_consumer_tag() {
        let cfg = BridgeConfig {
            consumer_tag: "tail".into(),
            ..BridgeConfig::default()
        };
        assert_eq!(cfg.control_subscribe_options().consumer_tag, "tail-acks");
        assert_eq!(
            BridgeConfig::default()
                .control_subscribe_options()
                .consumer_tag,
            ""
        );
    }

    #[test]
    fn ack_source_parsing() {
        assert_eq!("none".parse(), Ok(AckSourceKind::None));
        assert_eq!("stdin".parse(), Ok(AckSourceKind::Stdin));
        assert_eq!(
            "queue:q1-acks".parse(),
            Ok(AckSourceKind::Queue("q1-acks".into()))
        );
        assert_eq!(
            "queue:".parse::<AckSourceKind>(),
            Err(AckSourceParseError::MissingQueue)
        );
        assert!("fifo".parse::<AckSourceKind>().is_err());
        assert_eq!(
            AckSourceKind::Queue("x".into()).to_string().parse(),
            Ok(AckSourceKind::Queue("x".into()))
        );
    }
}
