//! Error types shared across the workspace.
//!
//! Validation failures are reported as values: boundary code branches on the
//! `Result` returned by [`validate_domain_event`](crate::validation::validate_domain_event)
//! instead of unwinding.

use std::fmt;

/// A single rule an event envelope violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// The envelope was not a JSON object.
    NotAnObject,
    /// A required field was absent or `null`.
    Missing(&'static str),
    /// A field was present with the wrong JSON type.
    WrongType(&'static str),
    /// A required string field was present but empty.
    Empty(&'static str),
    /// `timestamp` is not an ISO 8601 date-time with an offset.
    InvalidTimestamp(String),
    /// `metadata.version` is below 1 or not an integer.
    InvalidVersion,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => f.write_str("envelope must be a JSON object"),
            Self::Missing(field) => write!(f, "{field} is required"),
            Self::WrongType(field) => write!(f, "{field} has the wrong type"),
            Self::Empty(field) => write!(f, "{field} must not be empty"),
            Self::InvalidTimestamp(value) => {
                write!(f, "timestamp {value:?} is not an ISO 8601 date-time with offset")
            }
            Self::InvalidVersion => f.write_str("metadata.version must be an integer >= 1"),
        }
    }
}

/// An event envelope failed validation. Carries every violated rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid domain event: {}", join_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    #[must_use]
    pub fn single(issue: ValidationIssue) -> Self {
        Self {
            issues: vec![issue],
        }
    }

    /// Check whether a given rule is among the violations.
    #[must_use]
    pub fn contains(&self, issue: &ValidationIssue) -> bool {
        self.issues.contains(issue)
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A topic pattern could not be compiled.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid topic pattern {pattern:?}")]
pub struct PatternError {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}
