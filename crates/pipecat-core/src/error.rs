use thiserror::Error;

/// Failures reported by a broker implementation.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Could not reach or authenticate with the broker.
    #[error("connection error: {0}")]
    Connection(String),
    /// Could not open a channel on an established connection.
    #[error("channel error: {0}")]
    Channel(String),
    /// Queue declaration was refused.
    #[error("declare queue {queue}: {reason}")]
    Declare { queue: String, reason: String },
    /// A single publish failed.
    #[error("publish error: {0}")]
    Publish(String),
    /// Registering a consumer failed, or the delivery stream broke.
    #[error("subscribe error: {0}")]
    Subscribe(String),
    /// Settling a single delivery failed.
    #[error("acknowledge error: {0}")]
    Acknowledge(String),
    /// The session was already closed.
    #[error("broker session is closed")]
    Closed,
}

impl BrokerError {
    /// Connection-level failures leave the session unusable; the rest concern
    /// a single message and may be retried or reported.
    pub fn is_connection_level(&self) -> bool {
        match self {
            BrokerError::Connection(_)
            | BrokerError::Channel(_)
            | BrokerError::Declare { .. }
            | BrokerError::Subscribe(_)
            | BrokerError::Closed => true,
            BrokerError::Publish(_) | BrokerError::Acknowledge(_) => false,
        }
    }
}
