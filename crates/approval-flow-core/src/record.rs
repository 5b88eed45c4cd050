use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::catalog::FlowConfig;
use crate::codec::{ApprovalState, StatusDetail};
use crate::now_utc;
use crate::round::RoundId;

/// Who touched the record last, when, and why.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActorStamp {
    pub actor: String,
    pub comment: String,
    #[serde(with = "crate::rfc3339")]
    pub at: OffsetDateTime,
}

/// Flow bookkeeping embedded in a business record.
///
/// When `status` is a combination, `status_detail` holds exactly its
/// members; otherwise it holds the single status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FlowFields {
    pub status: Option<String>,
    pub status_detail: Option<StatusDetail>,
    pub round_id: Option<RoundId>,
    pub last_submit: Option<ActorStamp>,
    pub last_audit: Option<ActorStamp>,
}

impl FlowFields {
    /// The status, treating blank strings as absent.
    #[must_use]
    pub fn current_status(&self) -> Option<&str> {
        self.status
            .as_deref()
            .filter(|status| !status.trim().is_empty())
    }

    #[must_use]
    pub fn approval_state(&self) -> Option<ApprovalState> {
        self.current_status().map(ApprovalState::decode)
    }

    /// Sets `status` and resets the completion map to all-pending.
    pub fn enter(&mut self, status: &str) {
        let state = ApprovalState::decode(status);
        self.status_detail = Some(state.pending_detail());
        self.status = Some(status.to_string());
    }
}

/// Typed access the engine needs from a business record.
pub trait FlowRecord {
    fn record_id(&self) -> &str;

    fn flow_state(&self) -> &FlowFields;

    fn flow_state_mut(&mut self) -> &mut FlowFields;

    /// Object bound as `vo` when rendering template-valued edges.
    fn rule_context(&self) -> Value;
}

/// A schemaless business record: free-form `fields` plus flow bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowDocument {
    pub record_id: String,
    pub flow_id: String,
    pub entity_kind: String,
    pub name: String,
    pub fields: Map<String, Value>,
    pub flow: FlowFields,
    pub revision: i64,
    #[serde(with = "crate::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "crate::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl FlowDocument {
    #[must_use]
    pub fn new(flow: &FlowConfig, name: impl Into<String>, fields: Map<String, Value>) -> Self {
        let now = now_utc();
        Self {
            record_id: Ulid::new().to_string(),
            flow_id: flow.flow_id.clone(),
            entity_kind: flow.entity_kind.clone(),
            name: name.into(),
            fields,
            flow: FlowFields::default(),
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn flow_config(&self) -> FlowConfig {
        FlowConfig::new(self.flow_id.clone(), self.entity_kind.clone())
    }
}

impl FlowRecord for FlowDocument {
    fn record_id(&self) -> &str {
        &self.record_id
    }

    fn flow_state(&self) -> &FlowFields {
        &self.flow
    }

    fn flow_state_mut(&mut self) -> &mut FlowFields {
        &mut self.flow
    }

    /// The business `fields`, plus `id`, `name` and `status` for any of
    /// those keys the fields do not already define. A field of the same
    /// name wins.
    fn rule_context(&self) -> Value {
        let mut context = self.fields.clone();
        context
            .entry("id")
            .or_insert_with(|| Value::String(self.record_id.clone()));
        context
            .entry("name")
            .or_insert_with(|| Value::String(self.name.clone()));
        context.entry("status").or_insert_with(|| {
            self.flow
                .status
                .clone()
                .map_or(Value::Null, Value::String)
        });
        Value::Object(context)
    }
}
