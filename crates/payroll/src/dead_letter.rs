//! Dead letters: permanent records of items that exhausted their retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use payrun_core::{
    DeadLetterId, DomainError, DomainResult, EmployeeId, QueueItemId, RunId, TenantId, UserId,
};

use crate::item::{AttemptRecord, QueueItem, QueueItemStatus};

/// Operator decision on a dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Awaiting triage
    Unresolved,
    /// Root cause addressed (e.g. item manually retried)
    Resolved,
    /// Deliberately left unprocessed
    Ignored,
}

/// Permanent record created exactly once when a queue item exhausts
/// `max_retries`. Never auto-deleted; mutated only by an operator resolving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub id: DeadLetterId,
    pub tenant_id: TenantId,
    pub queue_item_id: QueueItemId,
    pub run_id: RunId,
    pub employee_id: EmployeeId,
    pub final_error_message: String,
    /// Full ordered attempt history carried over from the item
    pub error_history: Vec<AttemptRecord>,
    pub total_attempts: u32,
    pub resolution: Resolution,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterItem {
    /// Build the dead letter for an exhausted item.
    ///
    /// The item must already be `Failed`; the caller persists both in one
    /// atomic store operation.
    pub fn from_exhausted_item(item: &QueueItem) -> DomainResult<Self> {
        if item.status != QueueItemStatus::Failed {
            return Err(DomainError::illegal_transition(format!(
                "dead letter requires a Failed item, item {} is {:?}",
                item.id, item.status
            )));
        }
        Ok(Self {
            id: DeadLetterId::new(),
            tenant_id: item.tenant_id,
            queue_item_id: item.id,
            run_id: item.run_id,
            employee_id: item.employee_id,
            final_error_message: item
                .error_message
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
            error_history: item.error_history.clone(),
            total_attempts: item.total_attempts(),
            resolution: Resolution::Unresolved,
            resolved_at: None,
            resolved_by: None,
            created_at: Utc::now(),
        })
    }

    /// Record an operator decision. Does not requeue any work.
    pub fn resolve(&mut self, resolution: Resolution, resolved_by: UserId) -> DomainResult<()> {
        if resolution == Resolution::Unresolved {
            return Err(DomainError::validation(
                "cannot resolve a dead letter back to Unresolved",
            ));
        }
        if self.resolution != Resolution::Unresolved {
            return Err(DomainError::conflict(format!(
                "dead letter {} already resolved as {:?}",
                self.id, self.resolution
            )));
        }
        self.resolution = resolution;
        self.resolved_at = Some(Utc::now());
        self.resolved_by = Some(resolved_by);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemError;
    use crate::retry::RetryPolicy;
    use payrun_core::WorkerId;
    use std::time::Duration;

    fn exhausted_item() -> QueueItem {
        let mut item = QueueItem::new(TenantId::new(), RunId::new(), EmployeeId::new(), 1, 0);
        let now = Utc::now();
        item.mark_claimed(WorkerId::new(), now).unwrap();
        item.record_failure(
            ItemError::render("template exploded"),
            &RetryPolicy::fixed(0, Duration::ZERO),
            now,
        )
        .unwrap();
        item
    }

    #[test]
    fn dead_letter_carries_history_and_attempts() {
        let item = exhausted_item();
        let dl = DeadLetterItem::from_exhausted_item(&item).unwrap();

        assert_eq!(dl.queue_item_id, item.id);
        assert_eq!(dl.total_attempts, 1);
        assert_eq!(dl.error_history.len(), 1);
        assert_eq!(dl.final_error_message, "template exploded");
        assert_eq!(dl.resolution, Resolution::Unresolved);
    }

    #[test]
    fn dead_letter_requires_failed_item() {
        let item = QueueItem::new(TenantId::new(), RunId::new(), EmployeeId::new(), 1, 3);
        assert!(DeadLetterItem::from_exhausted_item(&item).is_err());
    }

    #[test]
    fn resolution_is_recorded_once() {
        let item = exhausted_item();
        let mut dl = DeadLetterItem::from_exhausted_item(&item).unwrap();
        let operator = UserId::new();

        dl.resolve(Resolution::Ignored, operator).unwrap();
        assert_eq!(dl.resolution, Resolution::Ignored);
        assert_eq!(dl.resolved_by, Some(operator));
        assert!(dl.resolved_at.is_some());

        assert!(dl.resolve(Resolution::Resolved, operator).is_err());
    }
}
