//! AMQP adapter error types.

/// Errors specific to the lapin adapter.
#[derive(Debug, thiserror::Error)]
pub enum LapinError {
    /// The AMQP client returned an error.
    #[error("AMQP client error")]
    Amqp(#[from] lapin::Error),

    /// The broker negatively confirmed a publish.
    #[error("broker nacked publish to {exchange:?}")]
    Nacked { exchange: String },
}
