//! Running a handler in isolation and recording what happened.
//!
//! A handler failure (returned error or panic) is turned into a
//! [`HandlerOutcome`] value; callers decide what to do with it.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use courier_domain::event::DomainEvent;

use crate::correlation;
use crate::ports::{Handler, HandlerError};

/// Result of running one handler for one event.
#[derive(Debug)]
pub enum HandlerOutcome {
    Completed,
    Failed(HandlerError),
    Panicked,
}

impl HandlerOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Run `handler` inside the event's correlation scope, catching panics.
pub async fn run_handler(handler: &Handler, event: DomainEvent) -> HandlerOutcome {
    let correlation_id = correlation::for_event(&event);
    let run = correlation::scope(correlation_id, (**handler)(event));
    match AssertUnwindSafe(run).catch_unwind().await {
        Ok(Ok(())) => HandlerOutcome::Completed,
        Ok(Err(err)) => HandlerOutcome::Failed(err),
        Err(_) => HandlerOutcome::Panicked,
    }
}
