//! Core pipecat primitives shared across crates.
//!
//! Includes queue/delivery value types, broker defaults, and the base broker
//! error.

pub mod error;
pub mod types;

pub use error::BrokerError;
pub use types::{
    Delivery, DeliveryTag, OutboundMessage, QueueRef, QueueSpec, SubscribeOptions,
    CONTENT_TYPE_TEXT_PLAIN, DEFAULT_AMQP_URI, DEFAULT_EXCHANGE,
};
