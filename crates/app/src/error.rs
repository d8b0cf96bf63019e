//! Errors surfaced by the buses and the broker port.

use std::sync::Arc;

use courier_domain::error::PatternError;

/// A broker operation failed. Wraps the adapter's own error.
///
/// Cloneable so a single failure can be handed to every caller sharing an
/// in-flight operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("broker {operation} failed")]
pub struct BrokerError {
    pub operation: &'static str,
    #[source]
    pub source: Arc<dyn std::error::Error + Send + Sync>,
}

impl BrokerError {
    pub fn new(
        operation: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            operation,
            source: Arc::new(source),
        }
    }
}

/// Errors returned to callers of [`EventBus`](crate::ports::EventBus).
///
/// Connection failures never appear here directly: they drive reconnection
/// and only surface once the buffer or the retry budget is exhausted.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// The bus was shut down or gave up reconnecting.
    #[error("event bus is closed")]
    Closed,

    /// Publishing while reconnecting with the buffer at capacity.
    #[error("publish buffer is full ({capacity} events)")]
    BufferFull { capacity: usize },

    /// The reconnect budget ran out while the publish was buffered.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// The event could not be encoded for the wire.
    #[error("failed to serialize event")]
    Serialization(#[source] Arc<serde_json::Error>),

    /// The broker refused or failed an operation.
    #[error("broker error")]
    Broker(#[from] BrokerError),

    /// A subscription pattern could not be compiled.
    #[error("invalid subscription pattern")]
    Pattern(#[from] PatternError),
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(err))
    }
}
