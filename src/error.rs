//! Error types for the loader and the remote-call layer

use serde::Serialize;
use thiserror::Error;

/// Faults that abort a load: bad configuration, schema mismatches, or bugs.
///
/// Everything except [`CocoonError::Dispatch`] and [`CocoonError::Provisioning`]
/// is raised before the first network call.
#[derive(Debug, Error)]
pub enum CocoonError {
    #[error("unknown entity type `{0}`")]
    UnknownEntityType(String),

    #[error("invalid mapping for `{path}`: {reason}")]
    Mapping { path: String, reason: String },

    #[error("model `{model}`: {reason}")]
    Schema { model: String, reason: String },

    #[error("row {row}: {reason}")]
    Population { row: i64, reason: String },

    #[error("{0}")]
    Validation(String),

    #[error("entity policy table: {0}")]
    Policy(String),

    #[error("failed to provision property definition `{key}`: {source}")]
    Provisioning {
        key: String,
        #[source]
        source: BatchError,
    },

    #[error("dispatch aborted: {0}")]
    Dispatch(String),

    #[error(transparent)]
    Polars(#[from] polars::prelude::PolarsError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("failed to start worker runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

impl CocoonError {
    pub(crate) fn mapping(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Mapping {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn schema(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Schema {
            model: model.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome of a remote call that did not succeed.
///
/// These are expected business outcomes: they are collected per batch and
/// never abort sibling batches.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchError {
    /// The platform understood the request and declined it.
    #[error("rejected ({status} {reason})")]
    Rejected {
        status: u16,
        reason: String,
        body: serde_json::Value,
    },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("call timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl BatchError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            BatchError::Rejected { status, .. } => *status == 429 || *status >= 500,
            BatchError::Transport { .. } | BatchError::Timeout { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let conflict = BatchError::Rejected {
            status: 409,
            reason: "Conflict".into(),
            body: serde_json::Value::Null,
        };
        let throttled = BatchError::Rejected {
            status: 429,
            reason: "Too Many Requests".into(),
            body: serde_json::Value::Null,
        };
        assert!(!conflict.is_transient());
        assert!(throttled.is_transient());
        assert!(BatchError::Transport {
            message: "reset".into()
        }
        .is_transient());
    }

    #[test]
    fn rejected_serializes_with_kind_tag() {
        let err = BatchError::Rejected {
            status: 400,
            reason: "Bad Request".into(),
            body: serde_json::json!({"title": "invalid"}),
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "rejected");
        assert_eq!(value["status"], 400);
        assert_eq!(value["body"]["title"], "invalid");
    }
}
