//! Topic pattern compiler.
//!
//! Patterns are dot-delimited like event types. A literal segment matches
//! itself, `*` matches exactly one segment, and `#` matches zero or more
//! whole segments. Because `#` may collapse to nothing, the dot that would
//! separate it from a neighbour has to disappear along with it, so the
//! regex fragment depends on where the `#` sits:
//!
//! | Position | Fragment |
//! |----------|----------|
//! | whole pattern | anything, including the empty string |
//! | first | optional prefix `(?:seg(\.seg)*\.)?` |
//! | last | optional suffix `(?:\.seg(\.seg)*)?` |
//! | middle | optional infix `(?:\.seg(\.seg)*)?\.` |

use std::fmt;

use regex::Regex;

use crate::error::PatternError;

const SEGMENT: &str = r"[^.]+";
const SEGMENTS: &str = r"[^.]+(?:\.[^.]+)*";

/// A compiled topic pattern.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    source: String,
    regex: Regex,
}

impl TopicPattern {
    /// Compile a pattern into an anchored matcher.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] if the generated expression exceeds the regex
    /// engine's size limits.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let expression = to_regex(pattern);
        let regex = Regex::new(&expression).map_err(|source| PatternError {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Test a full event type against the pattern.
    #[must_use]
    pub fn matches(&self, event_type: &str) -> bool {
        self.regex.is_match(event_type)
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// `true` when the pattern has no wildcard segment.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        !self.source.split('.').any(|s| s == "*" || s == "#")
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn to_regex(pattern: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in pattern.split('.') {
        // `#.#` is equivalent to `#`
        if segment == "#" && segments.last() == Some(&"#") {
            continue;
        }
        segments.push(segment);
    }

    if segments == ["#"] {
        return "^.*$".to_string();
    }

    let last = segments.len() - 1;
    let mut out = String::from("^");
    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "#" if i == 0 => {
                out.push_str("(?:");
                out.push_str(SEGMENTS);
                out.push_str(r"\.)?");
            }
            "#" if i == last => {
                out.push_str(r"(?:\.");
                out.push_str(SEGMENTS);
                out.push_str(")?");
            }
            "#" => {
                out.push_str(r"(?:\.");
                out.push_str(SEGMENTS);
                out.push_str(r")?\.");
            }
            other => {
                if i > 0 && segments[i - 1] != "#" {
                    out.push_str(r"\.");
                }
                if other == "*" {
                    out.push_str(SEGMENT);
                } else {
                    out.push_str(&regex::escape(other));
                }
            }
        }
    }
    out.push('$');
    out
}
