//! Broker abstractions for pipecat.
//!
//! The bridge only depends on the blocking session and delivery-handle traits
//! defined in this crate.

pub mod adapter;
