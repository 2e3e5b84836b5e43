//! AMQP 0-9-1 broker adapter for pipecat.
//!
//! This crate provides a blocking `Broker` implementation backed by one
//! `lapin` connection and channel, driven on a runtime owned by the adapter.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use pipecat_broker::adapter::{Broker, DeliveryHandle};
use pipecat_core::{BrokerError, Delivery, OutboundMessage, QueueRef, QueueSpec, SubscribeOptions};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Clone)]
pub struct AmqpBrokerConfig {
    pub uri: String,
    /// Connection name shown in the broker's management view.
    pub connection_name: Option<String>,
}

impl AmqpBrokerConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            connection_name: Some("pipecat".to_string()),
        }
    }
}

/// Returns `host:port/vhost` for logging, leaving credentials out.
pub fn endpoint_label(uri: &str) -> Result<String, BrokerError> {
    let parsed: AMQPUri = uri
        .parse()
        .map_err(|err| BrokerError::Connection(format!("invalid AMQP URI: {err}")))?;
    Ok(format!(
        "{}:{}/{}",
        parsed.authority.host, parsed.authority.port, parsed.vhost
    ))
}

pub fn queue_declare_options(spec: &QueueSpec) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: false,
        durable: spec.durable,
        exclusive: spec.exclusive,
        auto_delete: spec.auto_delete,
        nowait: spec.no_wait,
    }
}

pub fn basic_consume_options(options: &SubscribeOptions) -> BasicConsumeOptions {
    BasicConsumeOptions {
        no_local: options.no_local,
        no_ack: options.auto_ack,
        exclusive: options.exclusive,
        nowait: options.no_wait,
    }
}

pub fn basic_publish_options(message: &OutboundMessage) -> BasicPublishOptions {
    BasicPublishOptions {
        mandatory: message.mandatory,
        immediate: message.immediate,
    }
}

/// Runs a close sequence at most once. A caller arriving while it runs
/// blocks until it has finished.
#[derive(Debug, Default)]
struct CloseGate {
    closed: Mutex<bool>,
}

impl CloseGate {
    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close_with<F>(&self, close: F) -> Result<(), BrokerError>
    where
        F: FnOnce() -> Result<(), BrokerError>,
    {
        let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Ok(());
        }
        *closed = true;
        close()
    }
}

/// Closes the session from any thread; used by signal handling.
#[derive(Clone)]
pub struct AmqpCloser {
    runtime: Arc<Runtime>,
    connection: Arc<Connection>,
    channel: Channel,
    gate: Arc<CloseGate>,
}

impl AmqpCloser {
    /// Closes the channel, then the connection. Only the first call does work;
    /// later calls return once that close has completed.
    pub fn close(&self) -> Result<(), BrokerError> {
        self.gate.close_with(|| {
            let channel_result = self
                .runtime
                .block_on(self.channel.close(REPLY_SUCCESS, "OK"))
                .map_err(|err| BrokerError::Channel(err.to_string()));
            let connection_result = self
                .runtime
                .block_on(self.connection.close(REPLY_SUCCESS, "OK"))
                .map_err(|err| BrokerError::Connection(err.to_string()));
            debug!("amqp session closed");
            channel_result.and(connection_result)
        })
    }
}

/// One connection plus one channel.
///
/// Dropping the adapter closes both, so every exit path releases the session.
pub struct AmqpBroker {
    closer: AmqpCloser,
}

impl AmqpBroker {
    pub fn connect(config: AmqpBrokerConfig) -> Result<Self, BrokerError> {
        let endpoint = endpoint_label(&config.uri)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("pipecat-amqp")
            .enable_all()
            .build()
            .map_err(|err| BrokerError::Connection(format!("runtime start failed: {err}")))?;

        // Socket I/O and lapin's background tasks run on this runtime.
        let mut properties = {
            let _entered = runtime.enter();
            ConnectionProperties::default()
                .with_executor(tokio_executor_trait::Tokio::current())
                .with_reactor(tokio_reactor_trait::Tokio)
        };
        if let Some(name) = &config.connection_name {
            properties = properties.with_connection_name(name.as_str().into());
        }
        let connection = runtime
            .block_on(Connection::connect(&config.uri, properties))
            .map_err(|err| BrokerError::Connection(err.to_string()))?;
        info!("amqp: connected to {endpoint}");

        let channel = match runtime.block_on(connection.create_channel()) {
            Ok(channel) => channel,
            Err(err) => {
                let _ = runtime.block_on(connection.close(REPLY_SUCCESS, "OK"));
                return Err(BrokerError::Channel(err.to_string()));
            }
        };
        debug!("amqp: channel {} open", channel.id());

        Ok(Self {
            closer: AmqpCloser {
                runtime: Arc::new(runtime),
                connection: Arc::new(connection),
                channel,
                gate: Arc::new(CloseGate::default()),
            },
        })
    }

    pub fn closer(&self) -> AmqpCloser {
        self.closer.clone()
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closer.gate.is_closed() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for AmqpBroker {
    fn drop(&mut self) {
        if let Err(err) = self.closer.close() {
            warn!("amqp: close on drop failed: {err}");
        }
    }
}

impl Broker for AmqpBroker {
    type Handle = AmqpDeliveryHandle;
    type Subscription = AmqpSubscription;

    fn declare_queue(&mut self, spec: &QueueSpec) -> Result<QueueRef, BrokerError> {
        self.ensure_open()?;
        let queue = self
            .closer
            .runtime
            .block_on(self.closer.channel.queue_declare(
                &spec.name,
                queue_declare_options(spec),
                FieldTable::default(),
            ))
            .map_err(|err| BrokerError::Declare {
                queue: spec.name.clone(),
                reason: err.to_string(),
            })?;
        Ok(QueueRef {
            name: queue.name().as_str().to_string(),
            message_count: Some(queue.message_count()),
            consumer_count: Some(queue.consumer_count()),
        })
    }

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let properties =
            BasicProperties::default().with_content_type(message.content_type.as_str().into());
        // The returned confirm is dropped: publisher confirms are not enabled.
        self.closer
            .runtime
            .block_on(self.closer.channel.basic_publish(
                &message.exchange,
                &message.routing_key,
                basic_publish_options(message),
                &message.payload,
                properties,
            ))
            .map(|_confirm| ())
            .map_err(|err| BrokerError::Publish(err.to_string()))
    }

    fn subscribe(
        &mut self,
        queue: &QueueRef,
        options: &SubscribeOptions,
    ) -> Result<Self::Subscription, BrokerError> {
        self.ensure_open()?;
        let consumer = self
            .closer
            .runtime
            .block_on(self.closer.channel.basic_consume(
                &queue.name,
                &options.consumer_tag,
                basic_consume_options(options),
                FieldTable::default(),
            ))
            .map_err(|err| BrokerError::Subscribe(err.to_string()))?;
        info!(
            "amqp: consuming {} as {}",
            queue.name,
            consumer.tag().as_str()
        );
        Ok(AmqpSubscription {
            runtime: Arc::clone(&self.closer.runtime),
            consumer,
        })
    }

    fn set_prefetch(&mut self, prefetch: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.closer
            .runtime
            .block_on(
                self.closer
                    .channel
                    .basic_qos(prefetch, BasicQosOptions::default()),
            )
            .map_err(|err| BrokerError::Channel(err.to_string()))
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        self.closer.close()
    }
}

/// Blocking iterator over a `lapin` consumer.
pub struct AmqpSubscription {
    runtime: Arc<Runtime>,
    consumer: Consumer,
}

impl Iterator for AmqpSubscription {
    type Item = Result<Delivery<AmqpDeliveryHandle>, BrokerError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.runtime.block_on(self.consumer.next())?;
        Some(
            next.map(|delivery| Delivery {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                payload: delivery.data,
                handle: AmqpDeliveryHandle {
                    runtime: Arc::clone(&self.runtime),
                    acker: delivery.acker,
                },
            })
            .map_err(|err| BrokerError::Subscribe(err.to_string())),
        )
    }
}

pub struct AmqpDeliveryHandle {
    runtime: Arc<Runtime>,
    acker: Acker,
}

impl DeliveryHandle for AmqpDeliveryHandle {
    fn ack(&self) -> Result<(), BrokerError> {
        self.runtime
            .block_on(self.acker.ack(BasicAckOptions::default()))
            .map(|_| ())
            .map_err(|err| BrokerError::Acknowledge(err.to_string()))
    }

    fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.runtime
            .block_on(self.acker.reject(BasicRejectOptions { requeue }))
            .map(|_| ())
            .map_err(|err| BrokerError::Acknowledge(err.to_string()))
    }
}
