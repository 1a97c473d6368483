//! Fault model: the single failure channel for runs.
//!
//! A `Fault` ends a run, whichever side produced it:
//! - a step body returned it,
//! - a completion handle fired with it.
//! Both reach the terminal consumer the same way. Firing a handle twice
//! is not a `Fault` — it is a programming error and panics at the call
//! site (see `CompletionHandle`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Where a fault originated.
///
/// `Step` and `Completion` are equivalent from the consumer's point of
/// view; the origin is kept for logs and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOrigin {
    /// A step body reported failure.
    Step,
    /// A completion handle fired with an error.
    Completion,
    /// The engine itself could not deliver an outcome.
    Engine,
}

impl fmt::Display for FaultOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultOrigin::Step => "step",
            FaultOrigin::Completion => "completion",
            FaultOrigin::Engine => "engine",
        };
        f.write_str(s)
    }
}

/// A run-ending failure.
///
/// Keeps an optional structured `detail` so callers can attach whatever
/// payload their domain needs without the engine constraining it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{origin} fault: {message}")]
pub struct Fault {
    pub origin: FaultOrigin,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl Fault {
    pub fn step(message: impl Into<String>) -> Self {
        Self {
            origin: FaultOrigin::Step,
            message: message.into(),
            detail: None,
        }
    }

    pub fn completion(message: impl Into<String>) -> Self {
        Self {
            origin: FaultOrigin::Completion,
            message: message.into(),
            detail: None,
        }
    }

    pub(crate) fn engine(message: impl Into<String>) -> Self {
        Self {
            origin: FaultOrigin::Engine,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}
