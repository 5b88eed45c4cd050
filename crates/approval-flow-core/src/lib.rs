//! Approval-flow state-transition engine.
//!
//! Records move through a catalog of `(prev_status, action) -> next_status`
//! edges. A status may be a single name, an AND-split (`"A&&B"`, all
//! branches must act) or an OR-split (`"A||B"`, any branch may act). The
//! engine owns matching, authorization hand-off, branch resolution, round
//! bookkeeping and audit logging; storage and authorization data live
//! behind the traits in [`catalog`], [`audit`], [`round`] and [`policy`].

use time::{OffsetDateTime, UtcOffset};

pub mod audit;
pub mod catalog;
pub mod codec;
pub mod engine;
pub mod error;
pub mod policy;
pub mod projector;
pub mod record;
pub mod round;
pub mod rule;
pub mod todo;

pub use audit::{
    audit_entries, AuditFilter, AuditLogEntry, AuditLogInput, AuditLookup, AuditStore,
    InMemoryAuditLog, LogOrder,
};
pub use catalog::{
    load_catalog_from_path, parse_catalog_json, parse_catalog_yaml, validate_catalog,
    BranchAlias, CatalogDocument, CatalogStore, FlowConfig, InMemoryCatalog, StepDefinition,
    StepFilter, TerminalOutcome,
};
pub use codec::{ApprovalState, StateKind, StatusDetail, AND_SEPARATOR, OR_SEPARATOR};
pub use engine::{
    FlowCollaborators, FlowEngine, NoopTransitionHook, OnTransitioned, TransitionOutcome,
    TransitionRequest,
};
pub use error::{codes, ErrorCategory, FlowError};
pub use policy::{
    load_role_directory_from_path, AuthorizationPolicy, RoleDirectory, RoleMembershipPolicy,
};
pub use projector::{FlowMetaEdge, FlowRoot, FlowTrace};
pub use record::{ActorStamp, FlowDocument, FlowFields, FlowRecord};
pub use round::{ensure_round, ApprovalRound, InMemoryRoundStore, RoundId, RoundStore};
pub use rule::{is_template, resolve_next_status, LiquidRuleResolver, RuleResolver};
pub use todo::{collect_todo_statuses, PendingPredicate, TodoScope};

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`FlowError::Store`] when parsing fails or the timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, FlowError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| FlowError::store(format!("invalid RFC3339 timestamp {value}: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(FlowError::store(format!(
            "timestamp {value} MUST use UTC offset Z"
        )));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`FlowError::Store`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, FlowError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| FlowError::store(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// `#[serde(with = "...")]` adapter storing timestamps as RFC3339 strings.
pub mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    /// # Errors
    /// Fails when the timestamp cannot be formatted.
    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = super::format_rfc3339(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    /// # Errors
    /// Fails on anything but a UTC RFC3339 string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_rfc3339_utc(&raw).map_err(serde::de::Error::custom)
    }
}
