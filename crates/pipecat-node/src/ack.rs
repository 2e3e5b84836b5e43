use std::io::{self, BufRead};
use std::str::FromStr;

use pipecat_broker::adapter::DeliveryHandle;
use pipecat_core::{BrokerError, Delivery};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pending::{AckError, KeyError, KeyStrategy, Settle, SharedPending};

/// What an external actor asks the tracker to do with one pending delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    /// `ack <key>`: processed downstream.
    Ack,
    /// `nack <key>`: reject and ask the broker to redeliver.
    Requeue,
    /// `reject <key>`: reject without redelivery.
    Drop,
}

impl AckAction {
    pub fn settle(self) -> Settle {
        match self {
            AckAction::Ack => Settle::Ack,
            AckAction::Requeue => Settle::Reject { requeue: true },
            AckAction::Drop => Settle::Reject { requeue: false },
        }
    }

    fn verb(self) -> &'static str {
        match self {
            AckAction::Ack => "ack",
            AckAction::Requeue => "nack",
            AckAction::Drop => "reject",
        }
    }
}

/// One `<verb> <key>` command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckCommand {
    pub action: AckAction,
    /// Key text exactly as given; interpreted by the active key strategy.
    pub key: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AckParseError {
    #[error("empty ack command")]
    Empty,
    #[error("unknown ack command `{0}` (expected ack, nack or reject)")]
    UnknownAction(String),
    #[error("`{0}` needs a key")]
    MissingKey(&'static str),
}

impl FromStr for AckCommand {
    type Err = AckParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(AckParseError::Empty);
        }
        let (verb, key) = match line.split_once(' ') {
            Some((verb, key)) => (verb, Some(key)),
            None => (line, None),
        };
        let action = match verb {
            "ack" => AckAction::Ack,
            "nack" => AckAction::Requeue,
            "reject" => AckAction::Drop,
            other => return Err(AckParseError::UnknownAction(other.to_string())),
        };
        // Content keys may legitimately contain spaces or be empty.
        let key = key.ok_or(AckParseError::MissingKey(action.verb()))?;
        Ok(AckCommand {
            action,
            key: key.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum AckSourceError {
    #[error("bad ack command: {0}")]
    Parse(#[from] AckParseError),
    #[error("ack source read failed: {0}")]
    Io(#[from] io::Error),
    #[error("ack source broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl AckSourceError {
    /// Parse errors only spoil one command; anything else ends the source.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AckSourceError::Parse(_))
    }
}

/// Produces acknowledgment commands for the pending set.
///
/// `next_command` blocks until a command is available and returns `None`
/// once the source is exhausted.
pub trait AckSource {
    fn next_command(&mut self) -> Option<Result<AckCommand, AckSourceError>>;
}

/// Commands read line by line, e.g. typed by an operator on the terminal.
pub struct LineAckSource<R> {
    reader: R,
    buf: String,
}

impl<R: BufRead> LineAckSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: String::new(),
        }
    }
}

impl<R: BufRead> AckSource for LineAckSource<R> {
    fn next_command(&mut self) -> Option<Result<AckCommand, AckSourceError>> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) if self.buf.trim().is_empty() => continue,
                Ok(_) => return Some(self.buf.parse().map_err(AckSourceError::from)),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

/// Commands carried as messages on a control queue.
///
/// Each control message is acknowledged once its command has been read;
/// malformed ones are rejected without requeue.
pub struct SubscriptionAckSource<S> {
    subscription: S,
}

impl<S> SubscriptionAckSource<S> {
    pub fn new(subscription: S) -> Self {
        Self { subscription }
    }
}

impl<S, H> AckSource for SubscriptionAckSource<S>
where
    S: Iterator<Item = Result<Delivery<H>, BrokerError>>,
    H: DeliveryHandle,
{
    fn next_command(&mut self) -> Option<Result<AckCommand, AckSourceError>> {
        let delivery = match self.subscription.next()? {
            Ok(delivery) => delivery,
            Err(err) => return Some(Err(err.into())),
        };
        let parsed = delivery.text().parse::<AckCommand>();
        let settled = match &parsed {
            Ok(_) => delivery.handle.ack(),
            Err(_) => delivery.handle.reject(false),
        };
        if let Err(err) = settled {
            warn!(
                "ack source: settling control message {} failed: {err}",
                delivery.delivery_tag
            );
        }
        Some(parsed.map_err(AckSourceError::from))
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Ack(#[from] AckError),
}

/// Resolves the command's key and settles the matching pending delivery.
pub fn apply_ack_command<H: DeliveryHandle>(
    pending: &SharedPending<H>,
    strategy: KeyStrategy,
    command: &AckCommand,
) -> Result<usize, ApplyError> {
    let key = strategy.parse_key(&command.key)?;
    let mut set = pending.lock().map_err(|_| AckError::Poisoned)?;
    let tag = set.settle(&key, command.action.settle())?;
    debug!(
        "ack source: {} {key} (delivery {tag})",
        command.action.verb()
    );
    Ok(set.len())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckSourceStats {
    pub applied: u64,
    pub failed: u64,
}

/// Drains `source` into the pending set until it is exhausted or fails.
pub fn run_ack_source<A, H>(
    mut source: A,
    pending: SharedPending<H>,
    strategy: KeyStrategy,
) -> AckSourceStats
where
    A: AckSource,
    H: DeliveryHandle,
{
    let mut stats = AckSourceStats::default();
    while let Some(next) = source.next_command() {
        let command = match next {
            Ok(command) => command,
            Err(err) if err.is_fatal() => {
                warn!("ack source stopped: {err}");
                break;
            }
            Err(err) => {
                warn!("ack source: {err}");
                stats.failed += 1;
                continue;
            }
        };
        match apply_ack_command(&pending, strategy, &command) {
            Ok(backlog) => {
                stats.applied += 1;
                info!("{} {}: backlog {backlog}", command.action.verb(), command.key);
            }
            Err(err) => {
                stats.failed += 1;
                warn!("ack source: {err}");
            }
        }
    }
    debug!(
        "ack source finished: applied={}, failed={}",
        stats.applied, stats.failed
    );
    stats
}
