//! # courier-domain
//!
//! Pure domain model for the courier event bus.
//!
//! ## Responsibilities
//! - Define the **domain event** envelope (immutable value with routing and
//!   tracing metadata) and its factory defaults
//! - Validate untrusted envelopes at process boundaries
//! - Compile dot-delimited **topic patterns** (`*`, `#`) into matchers
//! - Foundational types: identifiers, timestamps, error conventions
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or external IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod error;
pub mod id;
pub mod time;

pub mod event;
pub mod topic;
pub mod validation;

pub use event::{DomainEvent, EventMetadata, MetadataInput, NewDomainEvent};
pub use topic::TopicPattern;
pub use validation::{validate_domain_event, validate_domain_event_bytes};
