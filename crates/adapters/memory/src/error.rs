//! In-memory broker error types.

/// Errors raised by [`MemoryBroker`](crate::MemoryBroker) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryBrokerError {
    /// The broker is refusing connections.
    #[error("connection refused")]
    Refused,

    /// The connection was closed or severed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The channel was closed or failed.
    #[error("channel is closed")]
    ChannelClosed,

    /// Publishing to an exchange that was never declared.
    #[error("no exchange named {0:?}")]
    UnknownExchange(String),

    /// Operating on a queue that does not exist.
    #[error("no queue named {0:?}")]
    UnknownQueue(String),

    /// The broker negatively confirmed a publish.
    #[error("publish to {exchange:?} was nacked")]
    Nacked { exchange: String },

    /// The consumer tag is not registered on this broker.
    #[error("no consumer tagged {0:?}")]
    UnknownConsumer(String),
}
