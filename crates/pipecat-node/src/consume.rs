use std::io::{self, Write};

use pipecat_broker::adapter::DeliveryHandle;
use pipecat_core::{BrokerError, Delivery};
use thiserror::Error;
use tracing::{debug, warn};

use crate::pending::{KeyStrategy, SharedPending};

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("delivery stream failed: {0}")]
    Subscription(#[source] BrokerError),
    #[error("failed to write message to output: {0}")]
    Output(#[source] io::Error),
    #[error("pending set lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub delivered: u64,
    pub redelivered: u64,
    /// Deliveries that displaced an earlier one with the same key.
    pub collisions: u64,
    pub peak_backlog: usize,
}

/// Forwards deliveries to `output` while tracking them as pending.
///
/// Per delivery, in order: the body is decoded as text, tracked in `pending`
/// under the key chosen by `strategy`, written to `output` as one line, and
/// the resulting backlog is written to `diagnostics` as one integer line.
/// Returns when the subscription ends.
pub fn run_consumer<S, H>(
    subscription: S,
    pending: &SharedPending<H>,
    strategy: KeyStrategy,
    output: &mut dyn Write,
    diagnostics: &mut dyn Write,
) -> Result<ConsumeStats, ConsumeError>
where
    S: IntoIterator<Item = Result<Delivery<H>, BrokerError>>,
    H: DeliveryHandle,
{
    let mut stats = ConsumeStats::default();
    for next in subscription {
        let delivery = next.map_err(ConsumeError::Subscription)?;
        let line = delivery.text();
        let key = strategy.key_for(&line, delivery.delivery_tag);

        let outcome = pending
            .lock()
            .map_err(|_| ConsumeError::Poisoned)?
            .insert(key, delivery.delivery_tag, delivery.handle);

        stats.delivered += 1;
        if delivery.redelivered {
            stats.redelivered += 1;
        }
        stats.peak_backlog = stats.peak_backlog.max(outcome.backlog);
        if let Some(displaced) = outcome.displaced {
            stats.collisions += 1;
            warn!(
                "pending key collision: delivery {} replaced {}, which can no longer be acknowledged",
                delivery.delivery_tag, displaced.delivery_tag
            );
        }

        writeln!(output, "{line}").map_err(ConsumeError::Output)?;
        output.flush().map_err(ConsumeError::Output)?;
        if let Err(err) = writeln!(diagnostics, "{}", outcome.backlog) {
            debug!("backlog report dropped: {err}");
        }
    }
    debug!(
        "consumer finished: delivered={}, redelivered={}, collisions={}, peak_backlog={}",
        stats.delivered, stats.redelivered, stats.collisions, stats.peak_backlog
    );
    Ok(stats)
}
