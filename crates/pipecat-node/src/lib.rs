//! pipecat bridge primitives.
//!
//! This crate wires line publishing, the acknowledgment-tracking consumer
//! loop, and pluggable acknowledgment triggers on top of any `Broker`.

pub mod ack;
pub mod config;
pub mod consume;
pub mod mode;
pub mod pending;
pub mod publish;
pub mod service;
