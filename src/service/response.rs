//! Wire shapes returned by the command surface

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::metadata::{EntityType, FileId};

/// Outcome kind of a deletion request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    HardDeleted,
    SoftDetached,
    Protected,
    AlreadyProcessed,
    /// Only produced inside batch responses
    Failed,
}

/// Response to a single deletion request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationResponse {
    pub file_id: FileId,
    pub operation: FileOperation,
    pub reason: String,
    pub references_count: Option<u64>,
    pub reference_types: Option<Vec<String>>,
    pub storage_freed: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl OperationResponse {
    pub fn new(file_id: FileId, operation: FileOperation, reason: impl Into<String>) -> Self {
        Self {
            file_id,
            operation,
            reason: reason.into(),
            references_count: None,
            reference_types: None,
            storage_freed: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_references<'a>(
        mut self,
        count: u64,
        types: impl IntoIterator<Item = &'a EntityType>,
    ) -> Self {
        self.references_count = Some(count);
        self.reference_types = Some(types.into_iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn with_storage_freed(mut self, bytes: u64) -> Self {
        self.storage_freed = Some(bytes);
        self
    }
}

/// Per-operation tally of a batch
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchOperationSummary {
    pub hard_deleted: u64,
    pub soft_detached: u64,
    pub protected: u64,
    pub already_processed: u64,
    pub failed: u64,
}

impl BatchOperationSummary {
    fn record(&mut self, operation: FileOperation) {
        match operation {
            FileOperation::HardDeleted => self.hard_deleted += 1,
            FileOperation::SoftDetached => self.soft_detached += 1,
            FileOperation::Protected => self.protected += 1,
            FileOperation::AlreadyProcessed => self.already_processed += 1,
            FileOperation::Failed => self.failed += 1,
        }
    }
}

/// Response to a batch deletion request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchDeletionResponse {
    pub results: Vec<OperationResponse>,
    pub total_processed: u64,
    pub total_storage_freed: u64,
    pub summary: BatchOperationSummary,
}

impl BatchDeletionResponse {
    pub fn from_results(results: Vec<OperationResponse>) -> Self {
        let mut summary = BatchOperationSummary::default();
        let mut total_storage_freed = 0;
        for result in &results {
            summary.record(result.operation);
            total_storage_freed += result.storage_freed.unwrap_or(0);
        }
        Self {
            total_processed: results.len() as u64,
            total_storage_freed,
            summary,
            results,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceTypeCount {
    pub reference_type: String,
    pub count: u64,
}

/// Reference listing for a file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceSummary {
    pub file_id: FileId,
    pub count: u64,
    pub types: Vec<String>,
    pub by_type: Vec<ReferenceTypeCount>,
}

impl ReferenceSummary {
    pub fn from_breakdown(file_id: FileId, breakdown: BTreeMap<EntityType, u64>) -> Self {
        let count = breakdown.values().sum();
        let types = breakdown.keys().map(|t| t.to_string()).collect();
        let by_type = breakdown
            .into_iter()
            .map(|(reference_type, count)| ReferenceTypeCount {
                reference_type: reference_type.to_string(),
                count,
            })
            .collect();
        Self {
            file_id,
            count,
            types,
            by_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_operation_response_wire_shape() {
        let id = Uuid::new_v4();
        let response = OperationResponse::new(id, FileOperation::SoftDetached, "in use")
            .with_references(1, [&EntityType::Story]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["operation"], "soft_detached");
        assert_eq!(json["references_count"], 1);
        assert_eq!(json["reference_types"][0], "story");
        assert!(json["storage_freed"].is_null());
        assert!(json["timestamp"].is_string());
        assert_eq!(json["file_id"], id.to_string());
    }

    #[test]
    fn test_batch_summary_totals() {
        let results = vec![
            OperationResponse::new(Uuid::new_v4(), FileOperation::HardDeleted, "")
                .with_storage_freed(100),
            OperationResponse::new(Uuid::new_v4(), FileOperation::HardDeleted, "")
                .with_storage_freed(50),
            OperationResponse::new(Uuid::new_v4(), FileOperation::Protected, ""),
            OperationResponse::new(Uuid::new_v4(), FileOperation::Failed, "not found"),
        ];
        let batch = BatchDeletionResponse::from_results(results);
        assert_eq!(batch.total_processed, 4);
        assert_eq!(batch.total_storage_freed, 150);
        assert_eq!(batch.summary.hard_deleted, 2);
        assert_eq!(batch.summary.protected, 1);
        assert_eq!(batch.summary.failed, 1);
    }

    #[test]
    fn test_reference_summary() {
        let mut breakdown = BTreeMap::new();
        breakdown.insert(EntityType::Story, 2);
        breakdown.insert(EntityType::Avatar, 1);
        let summary = ReferenceSummary::from_breakdown(Uuid::new_v4(), breakdown);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.types, vec!["story", "avatar"]);
        assert_eq!(summary.by_type[0].count, 2);
    }
}
