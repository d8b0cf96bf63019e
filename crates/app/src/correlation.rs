//! Request-scoped correlation context.
//!
//! Handlers run inside [`scope`] so that anything they log or publish can
//! read the correlation id of the event that triggered them via [`current`].

use std::future::Future;

use courier_domain::event::DomainEvent;
use courier_domain::id::new_correlation_id;

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Run `future` with `correlation_id` as the ambient correlation id.
pub async fn scope<F: Future>(correlation_id: String, future: F) -> F::Output {
    CORRELATION_ID.scope(correlation_id, future).await
}

/// The ambient correlation id, if the caller runs inside a [`scope`].
#[must_use]
pub fn current() -> Option<String> {
    CORRELATION_ID.try_with(Clone::clone).ok()
}

/// Correlation id to use while handling `event`: its own, or a fresh one.
#[must_use]
pub fn for_event(event: &DomainEvent) -> String {
    event
        .correlation_id()
        .map_or_else(new_correlation_id, str::to_string)
}
