use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::catalog::{FlowConfig, StepDefinition};
use crate::error::FlowError;
use crate::round::RoundId;

/// An audit row as the engine writes it. Stores assign `seq` and `entry_id`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditLogInput {
    pub flow_id: String,
    pub entity_kind: String,
    pub prev_status: String,
    pub action: String,
    pub next_status: String,
    pub comment: String,
    pub actor: String,
    pub record_id: String,
    pub round_id: Option<RoundId>,
    #[serde(with = "crate::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditLogEntry {
    pub seq: i64,
    pub entry_id: Ulid,
    pub flow_id: String,
    pub entity_kind: String,
    pub prev_status: String,
    pub action: String,
    pub next_status: String,
    pub comment: String,
    pub actor: String,
    pub record_id: String,
    pub round_id: Option<RoundId>,
    #[serde(with = "crate::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Has `prev_status` already been handled in this round (for this action)?
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AuditLookup {
    pub round_id: RoundId,
    pub action: Option<String>,
    pub prev_status: String,
}

impl AuditLookup {
    #[must_use]
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        entry.round_id == Some(self.round_id)
            && entry.prev_status == self.prev_status
            && match &self.action {
                Some(action) => &entry.action == action,
                None => true,
            }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AuditFilter {
    pub flow: FlowConfig,
    pub record_id: String,
    pub round_id: Option<RoundId>,
}

impl AuditFilter {
    #[must_use]
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        entry.flow_id == self.flow.flow_id
            && entry.entity_kind == self.flow.entity_kind
            && entry.record_id == self.record_id
            && match self.round_id {
                Some(round) => entry.round_id == Some(round),
                None => true,
            }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogOrder {
    Ascending,
    Descending,
}

#[allow(clippy::missing_errors_doc)]
pub trait AuditStore {
    fn find_one(&self, lookup: &AuditLookup) -> Result<Option<AuditLogEntry>, FlowError>;

    /// Entries ordered by `(created_at, seq)` in the requested direction.
    fn list(&self, filter: &AuditFilter, order: LogOrder) -> Result<Vec<AuditLogEntry>, FlowError>;

    fn append_batch(&self, entries: &[AuditLogInput]) -> Result<Vec<AuditLogEntry>, FlowError>;
}

/// One entry per authorized step, sharing action, comment, actor, round and
/// timestamp.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn audit_entries(
    flow: &FlowConfig,
    steps: &[StepDefinition],
    next_status: &str,
    comment: &str,
    actor: &str,
    record_id: &str,
    round_id: Option<RoundId>,
    at: OffsetDateTime,
) -> Vec<AuditLogInput> {
    steps
        .iter()
        .map(|step| AuditLogInput {
            flow_id: flow.flow_id.clone(),
            entity_kind: flow.entity_kind.clone(),
            prev_status: step.prev_status.clone(),
            action: step.action.clone(),
            next_status: next_status.to_string(),
            comment: comment.to_string(),
            actor: actor.to_string(),
            record_id: record_id.to_string(),
            round_id,
            created_at: at,
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditLogEntry>>,
}

impl InMemoryAuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<AuditLogEntry>>, FlowError> {
        self.entries
            .lock()
            .map_err(|_| FlowError::store("audit log lock poisoned"))
    }
}

impl AuditStore for InMemoryAuditLog {
    fn find_one(&self, lookup: &AuditLookup) -> Result<Option<AuditLogEntry>, FlowError> {
        Ok(self
            .lock()?
            .iter()
            .find(|entry| lookup.matches(entry))
            .cloned())
    }

    fn list(&self, filter: &AuditFilter, order: LogOrder) -> Result<Vec<AuditLogEntry>, FlowError> {
        let mut selected = self
            .lock()?
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect::<Vec<_>>();
        selected.sort_by_key(|entry| (entry.created_at, entry.seq));
        if order == LogOrder::Descending {
            selected.reverse();
        }
        Ok(selected)
    }

    fn append_batch(&self, entries: &[AuditLogInput]) -> Result<Vec<AuditLogEntry>, FlowError> {
        let mut log = self.lock()?;
        let mut appended = Vec::with_capacity(entries.len());
        for input in entries {
            let seq = i64::try_from(log.len())
                .map_err(|_| FlowError::store("audit log sequence overflow"))?
                + 1;
            let entry = AuditLogEntry {
                seq,
                entry_id: Ulid::new(),
                flow_id: input.flow_id.clone(),
                entity_kind: input.entity_kind.clone(),
                prev_status: input.prev_status.clone(),
                action: input.action.clone(),
                next_status: input.next_status.clone(),
                comment: input.comment.clone(),
                actor: input.actor.clone(),
                record_id: input.record_id.clone(),
                round_id: input.round_id,
                created_at: input.created_at,
            };
            log.push(entry.clone());
            appended.push(entry);
        }
        Ok(appended)
    }
}
