use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use pipecat_broker::adapter::Broker;
use pipecat_core::BrokerError;
use thiserror::Error;
use tracing::{info, warn};

use crate::ack::{run_ack_source, AckSourceStats, LineAckSource, SubscriptionAckSource};
use crate::config::{AckSourceKind, BridgeConfig};
use crate::consume::{run_consumer, ConsumeError, ConsumeStats};
use crate::mode::Mode;
use crate::pending::{shared_pending, SharedPending};
use crate::publish::{run_publisher, PublishError, PublishStats};

/// Every failure that ends a bridge run. Each message names the failing
/// operation followed by the underlying cause.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to connect to AMQP broker: {0}")]
    Connect(#[source] BrokerError),
    #[error("failed to open a channel: {0}")]
    Channel(#[source] BrokerError),
    #[error("failed to declare a queue: {0}")]
    Declare(#[source] BrokerError),
    #[error("failed to set prefetch: {0}")]
    Prefetch(#[source] BrokerError),
    #[error("failed to register a consumer: {0}")]
    Subscribe(#[source] BrokerError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Consume(#[from] ConsumeError),
    #[error("failed to start ack source: {0}")]
    AckSource(#[source] io::Error),
}

impl BridgeError {
    /// Classifies a failure from opening the broker session.
    pub fn from_connect(err: BrokerError) -> Self {
        match err {
            BrokerError::Channel(_) => BridgeError::Channel(err),
            other => BridgeError::Connect(other),
        }
    }
}

/// Process streams handed to the bridge.
pub struct BridgeIo<'a> {
    /// Lines to publish, or ack commands when consuming with a stdin source.
    pub input: Box<dyn BufRead + Send>,
    /// Echoed lines or forwarded message bodies.
    pub output: &'a mut dyn Write,
    /// Diagnostics and backlog counts.
    pub diagnostics: &'a mut dyn Write,
}

#[derive(Debug)]
pub enum BridgeReport<H> {
    Published(PublishStats),
    Consumed {
        stats: ConsumeStats,
        /// Deliveries still unacknowledged when the subscription ended.
        pending: SharedPending<H>,
        /// Thread applying ack commands, if an ack source was configured.
        ack_worker: Option<JoinHandle<AckSourceStats>>,
    },
}

/// Declares `queue_name` and runs the publisher or the consumer against it.
///
/// Nothing is published or consumed unless the declaration succeeds.
pub fn run_bridge<B: Broker>(
    broker: &mut B,
    queue_name: &str,
    mode: Mode,
    config: &BridgeConfig,
    io: BridgeIo<'_>,
) -> Result<BridgeReport<B::Handle>, BridgeError> {
    let queue = broker
        .declare_queue(&config.queue_spec(queue_name))
        .map_err(BridgeError::Declare)?;
    info!(
        "queue {} declared (ready={:?}, consumers={:?}), mode={mode}",
        queue.name, queue.message_count, queue.consumer_count
    );

    match mode {
        Mode::Publish => {
            if config.ack_source != AckSourceKind::None {
                warn!("ack source {} ignored while publishing", config.ack_source);
            }
            let stats = run_publisher(
                broker,
                &queue,
                &config.content_type,
                io.input,
                io.output,
                io.diagnostics,
            )?;
            Ok(BridgeReport::Published(stats))
        }
        Mode::Consume => {
            if config.prefetch > 0 {
                broker
                    .set_prefetch(config.prefetch)
                    .map_err(BridgeError::Prefetch)?;
            }
            let subscription = broker
                .subscribe(&queue, &config.subscribe_options())
                .map_err(BridgeError::Subscribe)?;
            let pending = shared_pending();
            let ack_worker = spawn_ack_source(broker, config, io.input, &pending)?;
            info!(
                "consuming {} (pending key={}, ack source={})",
                queue.name, config.key_strategy, config.ack_source
            );

            let stats = run_consumer(
                subscription,
                &pending,
                config.key_strategy,
                io.output,
                io.diagnostics,
            )?;
            Ok(BridgeReport::Consumed {
                stats,
                pending,
                ack_worker,
            })
        }
    }
}

fn spawn_ack_source<B: Broker>(
    broker: &mut B,
    config: &BridgeConfig,
    input: Box<dyn BufRead + Send>,
    pending: &SharedPending<B::Handle>,
) -> Result<Option<JoinHandle<AckSourceStats>>, BridgeError> {
    let strategy = config.key_strategy;
    let pending = Arc::clone(pending);
    let builder = thread::Builder::new().name("pipecat-acks".to_string());

    let worker = match &config.ack_source {
        AckSourceKind::None => return Ok(None),
        AckSourceKind::Stdin => builder.spawn(move || {
            run_ack_source(LineAckSource::new(input), pending, strategy)
        }),
        AckSourceKind::Queue(control) => {
            let control_queue = broker
                .declare_queue(&config.queue_spec(control))
                .map_err(BridgeError::Declare)?;
            let subscription = broker
                .subscribe(&control_queue, &config.control_subscribe_options())
                .map_err(BridgeError::Subscribe)?;
            info!("reading ack commands from queue {}", control_queue.name);
            builder.spawn(move || {
                run_ack_source(SubscriptionAckSource::new(subscription), pending, strategy)
            })
        }
    };
    worker.map(Some).map_err(BridgeError::AckSource)
}
