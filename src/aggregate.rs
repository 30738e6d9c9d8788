//! Response aggregator - splits dispatch outcomes into rejections and successes

use crate::api::BatchResponse;
use crate::dispatch::CallOutcome;
use crate::error::BatchError;
use serde::Serialize;

/// Per-entity result of a load: every dispatched batch lands in exactly one list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadOutcome<R = BatchResponse> {
    pub errors: Vec<BatchError>,
    pub success: Vec<R>,
}

impl<R> Default for LoadOutcome<R> {
    fn default() -> Self {
        Self {
            errors: Vec::new(),
            success: Vec::new(),
        }
    }
}

impl<R> LoadOutcome<R> {
    /// Number of batches that were dispatched
    pub fn attempted(&self) -> usize {
        self.errors.len() + self.success.len()
    }
}

impl LoadOutcome<BatchResponse> {
    /// Items rejected inside successful batches
    pub fn failed_items(&self) -> usize {
        self.success.iter().map(BatchResponse::failed_count).sum()
    }
}

/// Partition outcomes, keeping their relative order in each list
pub fn aggregate<R>(outcomes: Vec<CallOutcome<R>>) -> LoadOutcome<R> {
    let mut outcome = LoadOutcome::default();
    for result in outcomes {
        match result {
            Ok(response) => outcome.success.push(response),
            Err(error) => {
                tracing::warn!("Batch rejected: {}", error);
                outcome.errors.push(error);
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErrorDetail, UpsertResponse, VersionedResponse};

    fn rejected(status: u16) -> BatchError {
        BatchError::Rejected {
            status,
            reason: "Bad Request".into(),
            body: serde_json::Value::Null,
        }
    }

    #[test]
    fn partitions_and_preserves_order() {
        let outcomes = vec![
            Ok(1),
            Err(rejected(400)),
            Ok(2),
            Err(BatchError::Timeout { secs: 3 }),
            Ok(3),
        ];

        let outcome = aggregate(outcomes);

        assert_eq!(outcome.success, vec![1, 2, 3]);
        assert_eq!(outcome.errors, vec![rejected(400), BatchError::Timeout { secs: 3 }]);
        assert_eq!(outcome.attempted(), 5);
    }

    #[test]
    fn embedded_failures_stay_inside_success() {
        let mut partial = UpsertResponse::default();
        partial.failed.insert(
            "2".into(),
            ErrorDetail {
                id: Some("2".into()),
                error_type: Some("InvalidIdentifier".into()),
                detail: Some("unknown figi".into()),
            },
        );
        let outcomes = vec![
            Ok(BatchResponse::Upsert(partial)),
            Ok(BatchResponse::Versioned(VersionedResponse::default())),
        ];

        let outcome = aggregate(outcomes);

        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.success.len(), 2);
        assert_eq!(outcome.failed_items(), 1);
    }

    #[test]
    fn serializes_as_errors_and_success() {
        let outcome: LoadOutcome<BatchResponse> = aggregate(vec![Err(rejected(409))]);
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["errors"][0]["kind"], "rejected");
        assert_eq!(value["success"], serde_json::json!([]));
    }
}
