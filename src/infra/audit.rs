// src/infra/audit.rs — Append-only audit records for decisions and executions

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::budget::store_server::StoreHandle;
use crate::budget::BudgetKey;
use crate::core::actions::ActionResult;
use crate::core::circuit::CircuitTransition;
use crate::core::guard::GuardDecision;
use crate::core::scheduler::TaskResult;

/// One structured audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    GuardDecision {
        key: BudgetKey,
        decision: GuardDecision,
    },
    TaskResult(TaskResult),
    ActionResult(ActionResult),
    CircuitTransition(CircuitTransition),
}

impl AuditRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditRecord::GuardDecision { .. } => "guard_decision",
            AuditRecord::TaskResult(_) => "task_result",
            AuditRecord::ActionResult(_) => "action_result",
            AuditRecord::CircuitTransition(_) => "circuit_transition",
        }
    }

    /// The budget, task, or rule the record is about.
    pub fn subject_id(&self) -> Option<&str> {
        match self {
            AuditRecord::GuardDecision { decision, .. } => decision.budget_id.as_deref(),
            AuditRecord::TaskResult(r) => Some(&r.task_id),
            AuditRecord::ActionResult(r) => Some(&r.rule_id),
            AuditRecord::CircuitTransition(t) => Some(&t.budget_id),
        }
    }

    pub fn success(&self) -> bool {
        match self {
            AuditRecord::GuardDecision { decision, .. } => decision.allowed,
            AuditRecord::TaskResult(r) => r.success,
            AuditRecord::ActionResult(r) => r.success,
            AuditRecord::CircuitTransition(_) => true,
        }
    }
}

/// Destination for audit records. Implementations must not block.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: AuditRecord);
}

/// Emits records as structured tracing events.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, record: AuditRecord) {
        let payload = serde_json::to_string(&record).unwrap_or_default();
        tracing::debug!(
            target: "spendguard::audit",
            kind = record.kind(),
            subject = record.subject_id().unwrap_or("-"),
            success = record.success(),
            "{payload}"
        );
    }
}

/// Keeps the most recent records in memory.
pub struct MemoryAuditSink {
    records: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
}

impl MemoryAuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.records
            .lock()
            .map(|r| r.iter().filter(|rec| rec.kind() == kind).count())
            .unwrap_or(0)
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, record: AuditRecord) {
        if let Ok(mut records) = self.records.lock() {
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(record);
        }
    }
}

/// Writes records to the SQLite audit_log table through the store actor.
pub struct StoreAuditSink {
    handle: StoreHandle,
}

impl StoreAuditSink {
    pub fn new(handle: StoreHandle) -> Self {
        Self { handle }
    }
}

impl AuditSink for StoreAuditSink {
    fn append(&self, record: AuditRecord) {
        match serde_json::to_string(&record) {
            Ok(payload) => self.handle.append_audit(
                record.kind(),
                record.subject_id(),
                record.success(),
                payload,
            ),
            Err(e) => tracing::warn!("Failed to serialize audit record: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit::{CircuitMode, TripReason};
    use chrono::Utc;

    fn transition(id: &str) -> AuditRecord {
        AuditRecord::CircuitTransition(CircuitTransition {
            budget_id: id.into(),
            budget_name: id.into(),
            from: CircuitMode::Closed,
            to: CircuitMode::Open,
            reason: TripReason::Manual,
            detail: None,
            at: Utc::now(),
        })
    }

    #[test]
    fn test_memory_sink_bounded() {
        let sink = MemoryAuditSink::new(2);
        sink.append(transition("a"));
        sink.append(transition("b"));
        sink.append(transition("c"));
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].subject_id(), Some("b"));
        assert_eq!(sink.count_kind("circuit_transition"), 2);
    }

    #[test]
    fn test_record_serializes_with_kind_tag() {
        let json = serde_json::to_value(transition("b1")).unwrap();
        assert_eq!(json["kind"], "circuit_transition");
        assert_eq!(json["budget_id"], "b1");
        assert_eq!(json["to"], "open");
    }
}
