use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pipecat_core::{
    BrokerError, Delivery, DeliveryTag, OutboundMessage, QueueRef, QueueSpec, SubscribeOptions,
};

/// Settles one delivered message with the broker.
///
/// Handles are moved into the pending set and may be settled from a thread
/// other than the one that received them.
pub trait DeliveryHandle: Send + 'static {
    /// Confirms the delivery as processed.
    fn ack(&self) -> Result<(), BrokerError>;
    /// Refuses the delivery; `requeue` asks the broker to deliver it again.
    fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// Blocking broker session contract used by the bridge.
pub trait Broker {
    /// Per-delivery settlement handle.
    type Handle: DeliveryHandle;
    /// Lazy, blocking sequence of deliveries. Ends when the session tears down.
    type Subscription: Iterator<Item = Result<Delivery<Self::Handle>, BrokerError>> + Send + 'static;

    /// Declares (or confirms) a queue.
    fn declare_queue(&mut self, spec: &QueueSpec) -> Result<QueueRef, BrokerError>;

    /// Fire-and-forget publish; no broker confirmation is awaited.
    fn publish(&mut self, message: &OutboundMessage) -> Result<(), BrokerError>;

    /// Registers a consumer on `queue`.
    fn subscribe(
        &mut self,
        queue: &QueueRef,
        options: &SubscribeOptions,
    ) -> Result<Self::Subscription, BrokerError>;

    /// Caps unacknowledged deliveries in flight. `0` means unlimited.
    fn set_prefetch(&mut self, _prefetch: u16) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Closes the channel and then the connection. Idempotent.
    fn close(&mut self) -> Result<(), BrokerError>;
}

/// Settlement recorded by [`InMemoryHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack(DeliveryTag),
    Reject { tag: DeliveryTag, requeue: bool },
}

/// Delivery handle issued by [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct InMemoryHandle {
    tag: DeliveryTag,
    settlements: Arc<Mutex<Vec<Settlement>>>,
    fail_settle: Arc<AtomicBool>,
}

impl InMemoryHandle {
    fn record(&self, settlement: Settlement) -> Result<(), BrokerError> {
        if self.fail_settle.load(Ordering::Relaxed) {
            return Err(BrokerError::Acknowledge(format!(
                "delivery {} could not be settled",
                self.tag
            )));
        }
        self.settlements
            .lock()
            .map_err(|_| BrokerError::Acknowledge("settlement log poisoned".into()))?
            .push(settlement);
        Ok(())
    }
}

impl DeliveryHandle for InMemoryHandle {
    fn ack(&self) -> Result<(), BrokerError> {
        self.record(Settlement::Ack(self.tag))
    }

    fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.record(Settlement::Reject {
            tag: self.tag,
            requeue,
        })
    }
}

/// Deliveries captured at subscribe time, optionally ending in an error.
#[derive(Debug, Default)]
pub struct InMemorySubscription {
    deliveries: VecDeque<Delivery<InMemoryHandle>>,
    trailing_error: Option<BrokerError>,
}

impl Iterator for InMemorySubscription {
    type Item = Result<Delivery<InMemoryHandle>, BrokerError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.deliveries.pop_front() {
            Some(delivery) => Some(Ok(delivery)),
            None => self.trailing_error.take().map(Err),
        }
    }
}

/// In-memory broker for tests and dry runs.
///
/// Publishes are recorded and routed into the named queue; a subscription
/// drains whatever is ready in the queue when it is opened and then ends,
/// which plays the part of the connection tearing down.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    ready: HashMap<String, VecDeque<Vec<u8>>>,
    declared: Vec<QueueSpec>,
    published: Vec<OutboundMessage>,
    subscriptions: Vec<(String, SubscribeOptions)>,
    next_tag: DeliveryTag,
    prefetch: Option<u16>,
    settlements: Arc<Mutex<Vec<Settlement>>>,
    fail_settle: Arc<AtomicBool>,
    fail_declare: Option<String>,
    fail_subscribe: Option<String>,
    fail_publish_after: Option<usize>,
    stream_error: Option<String>,
    close_calls: usize,
    closed: bool,
}

impl InMemoryBroker {
    /// Queues `payload` as ready for delivery on `queue`.
    pub fn enqueue_inbound(&mut self, queue: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.ready
            .entry(queue.into())
            .or_default()
            .push_back(payload.into());
    }

    /// Makes the next `declare_queue` fail with `reason`.
    pub fn fail_declare(&mut self, reason: impl Into<String>) {
        self.fail_declare = Some(reason.into());
    }

    /// Makes the next `subscribe` fail with `reason`.
    pub fn fail_subscribe(&mut self, reason: impl Into<String>) {
        self.fail_subscribe = Some(reason.into());
    }

    /// Lets `count` publishes succeed, then fails every later one.
    pub fn fail_publish_after(&mut self, count: usize) {
        self.fail_publish_after = Some(count);
    }

    /// Ends the next subscription with a delivery-stream error.
    pub fn fail_stream(&mut self, reason: impl Into<String>) {
        self.stream_error = Some(reason.into());
    }

    /// If enabled, every ack/reject on issued handles fails.
    pub fn set_fail_settle(&mut self, fail: bool) {
        self.fail_settle.store(fail, Ordering::Relaxed);
    }

    /// All publishes accepted so far, in call order.
    pub fn published(&self) -> &[OutboundMessage] {
        &self.published
    }

    /// Queue declarations seen so far.
    pub fn declared(&self) -> &[QueueSpec] {
        &self.declared
    }

    /// Subscriptions opened so far, as `(queue, options)`.
    pub fn subscriptions(&self) -> &[(String, SubscribeOptions)] {
        &self.subscriptions
    }

    /// Prefetch requested through `set_prefetch`, if any.
    pub fn prefetch(&self) -> Option<u16> {
        self.prefetch
    }

    /// Shared view of settlements made through issued handles.
    pub fn settlements(&self) -> Arc<Mutex<Vec<Settlement>>> {
        Arc::clone(&self.settlements)
    }

    /// Number of times `close` was called.
    pub fn close_calls(&self) -> usize {
        self.close_calls
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Broker for InMemoryBroker {
    type Handle = InMemoryHandle;
    type Subscription = InMemorySubscription;

    fn declare_queue(&mut self, spec: &QueueSpec) -> Result<QueueRef, BrokerError> {
        self.ensure_open()?;
        if let Some(reason) = self.fail_declare.take() {
            return Err(BrokerError::Declare {
                queue: spec.name.clone(),
                reason,
            });
        }
        self.declared.push(spec.clone());
        let ready = self.ready.entry(spec.name.clone()).or_default();
        Ok(QueueRef {
            name: spec.name.clone(),
            message_count: Some(ready.len() as u32),
            consumer_count: Some(0),
        })
    }

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if let Some(limit) = self.fail_publish_after {
            if self.published.len() >= limit {
                return Err(BrokerError::Publish("channel closed by broker".into()));
            }
        }
        self.published.push(message.clone());
        if message.exchange.is_empty() {
            if let Some(queue) = self.ready.get_mut(&message.routing_key) {
                queue.push_back(message.payload.clone());
            }
        }
        Ok(())
    }

    fn subscribe(
        &mut self,
        queue: &QueueRef,
        options: &SubscribeOptions,
    ) -> Result<Self::Subscription, BrokerError> {
        self.ensure_open()?;
        if let Some(reason) = self.fail_subscribe.take() {
            return Err(BrokerError::Subscribe(reason));
        }
        self.subscriptions.push((queue.name.clone(), options.clone()));

        let payloads: Vec<Vec<u8>> = self
            .ready
            .get_mut(&queue.name)
            .map(|ready| ready.drain(..).collect())
            .unwrap_or_default();
        let mut deliveries = VecDeque::with_capacity(payloads.len());
        for payload in payloads {
            self.next_tag += 1;
            deliveries.push_back(Delivery {
                delivery_tag: self.next_tag,
                redelivered: false,
                payload,
                handle: InMemoryHandle {
                    tag: self.next_tag,
                    settlements: Arc::clone(&self.settlements),
                    fail_settle: Arc::clone(&self.fail_settle),
                },
            });
        }

        Ok(InMemorySubscription {
            deliveries,
            trailing_error: self.stream_error.take().map(BrokerError::Subscribe),
        })
    }

    fn set_prefetch(&mut self, prefetch: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.prefetch = Some(prefetch);
        Ok(())
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        self.close_calls += 1;
        self.closed = true;
        Ok(())
    }
}
