use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use pipecat_broker::adapter::DeliveryHandle;
use pipecat_core::{BrokerError, DeliveryTag};
use serde::Deserialize;
use thiserror::Error;

/// How a delivery is addressed inside the pending set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStrategy {
    /// Key by decoded message text. Identical bodies collide: the newer
    /// delivery replaces the older one, which can then never be settled here.
    #[default]
    Content,
    /// Key by broker delivery tag. Unique per channel.
    DeliveryTag,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("unknown pending key strategy `{0}` (expected content or delivery-tag)")]
    UnknownStrategy(String),
    #[error("`{0}` is not a delivery tag")]
    InvalidTag(String),
}

impl KeyStrategy {
    /// Key for a freshly received delivery.
    pub fn key_for(self, text: &str, delivery_tag: DeliveryTag) -> PendingKey {
        match self {
            KeyStrategy::Content => PendingKey::Content(text.to_string()),
            KeyStrategy::DeliveryTag => PendingKey::Tag(delivery_tag),
        }
    }

    /// Key named by an external actor, e.g. in an `ack <key>` command.
    pub fn parse_key(self, text: &str) -> Result<PendingKey, KeyError> {
        match self {
            KeyStrategy::Content => Ok(PendingKey::Content(text.to_string())),
            KeyStrategy::DeliveryTag => text
                .trim()
                .parse()
                .map(PendingKey::Tag)
                .map_err(|_| KeyError::InvalidTag(text.to_string())),
        }
    }
}

impl FromStr for KeyStrategy {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "content" => Ok(KeyStrategy::Content),
            "delivery-tag" | "tag" => Ok(KeyStrategy::DeliveryTag),
            other => Err(KeyError::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::Content => f.write_str("content"),
            KeyStrategy::DeliveryTag => f.write_str("delivery-tag"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PendingKey {
    Content(String),
    Tag(DeliveryTag),
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingKey::Content(text) => write!(f, "{text:?}"),
            PendingKey::Tag(tag) => write!(f, "#{tag}"),
        }
    }
}

/// A received, not yet settled delivery.
#[derive(Debug)]
pub struct PendingEntry<H> {
    pub delivery_tag: DeliveryTag,
    pub handle: H,
}

#[derive(Debug)]
pub struct InsertOutcome<H> {
    /// Pending set size after the insert.
    pub backlog: usize,
    /// Entry evicted by a key collision. Its delivery stays unacknowledged on
    /// the broker until the connection closes.
    pub displaced: Option<PendingEntry<H>>,
}

/// How a pending delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Ack,
    Reject { requeue: bool },
}

#[derive(Debug, Error)]
pub enum AckError {
    #[error("no pending delivery for key {0}")]
    UnknownKey(PendingKey),
    #[error("settling {key} failed: {source}")]
    Broker {
        key: PendingKey,
        #[source]
        source: BrokerError,
    },
    #[error("pending set lock poisoned")]
    Poisoned,
}

/// Deliveries received but not yet acknowledged or rejected.
#[derive(Debug)]
pub struct PendingSet<H> {
    entries: HashMap<PendingKey, PendingEntry<H>>,
}

impl<H> Default for PendingSet<H> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

/// Pending set shared between the consumer loop and an acknowledgment source.
pub type SharedPending<H> = Arc<Mutex<PendingSet<H>>>;

pub fn shared_pending<H>() -> SharedPending<H> {
    Arc::new(Mutex::new(PendingSet::default()))
}

impl<H> PendingSet<H> {
    /// Tracks a delivery under `key`, replacing any entry already there.
    pub fn insert(
        &mut self,
        key: PendingKey,
        delivery_tag: DeliveryTag,
        handle: H,
    ) -> InsertOutcome<H> {
        let displaced = self.entries.insert(
            key,
            PendingEntry {
                delivery_tag,
                handle,
            },
        );
        InsertOutcome {
            backlog: self.entries.len(),
            displaced,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &PendingKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &PendingKey) -> Option<&PendingEntry<H>> {
        self.entries.get(key)
    }

    /// Pending keys ordered by delivery tag (arrival order).
    pub fn keys(&self) -> Vec<PendingKey> {
        let mut keys: Vec<(&PendingKey, DeliveryTag)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key, entry.delivery_tag))
            .collect();
        keys.sort_by_key(|(_, tag)| *tag);
        keys.into_iter().map(|(key, _)| key.clone()).collect()
    }
}

impl<H: DeliveryHandle> PendingSet<H> {
    /// Acknowledges and forgets the delivery under `key`.
    pub fn acknowledge(&mut self, key: &PendingKey) -> Result<DeliveryTag, AckError> {
        self.settle(key, Settle::Ack)
    }

    /// Rejects and forgets the delivery under `key`.
    pub fn reject(&mut self, key: &PendingKey, requeue: bool) -> Result<DeliveryTag, AckError> {
        self.settle(key, Settle::Reject { requeue })
    }

    /// Removes the entry and settles it with the broker. If the broker call
    /// fails the entry is put back so the settlement can be retried.
    pub fn settle(&mut self, key: &PendingKey, how: Settle) -> Result<DeliveryTag, AckError> {
        let entry = self
            .entries
            .remove(key)
            .ok_or_else(|| AckError::UnknownKey(key.clone()))?;
        let result = match how {
            Settle::Ack => entry.handle.ack(),
            Settle::Reject { requeue } => entry.handle.reject(requeue),
        };
        match result {
            Ok(()) => Ok(entry.delivery_tag),
            Err(source) => {
                self.entries.insert(key.clone(), entry);
                Err(AckError::Broker {
                    key: key.clone(),
                    source,
                })
            }
        }
    }
}
