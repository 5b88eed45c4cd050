//! Read-only views of a flow for visualization.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::audit::AuditLogEntry;
use crate::catalog::StepDefinition;
use crate::error::{codes, FlowError};
use crate::record::FlowFields;
use crate::rule::{resolve_next_status, RuleResolver};

pub const FLOW_META_V1_CONTRACT: &str = "flow_meta.v1";
pub const FLOW_META_V2_CONTRACT: &str = "flow_meta.v2";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FlowMetaEdge {
    pub prev_status: String,
    pub prev_status_alias: Option<String>,
    pub action: String,
    pub next_status: String,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FlowTrace {
    pub prev_status: String,
    pub action: String,
    pub next_status: String,
    pub actor: String,
    pub comment: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowRoot {
    pub contract_version: String,
    pub flow_meta: Vec<FlowMetaEdge>,
    pub flow_trace: Vec<FlowTrace>,
    pub approval_status: Map<String, Value>,
}

fn edge(step: &StepDefinition, next_status: String, label: Option<String>) -> FlowMetaEdge {
    FlowMetaEdge {
        prev_status: step.prev_status.clone(),
        prev_status_alias: step.prev_status_alias.clone(),
        action: step.action.clone(),
        next_status,
        label,
    }
}

/// Every forward edge; template edges expand into one edge per declared
/// alternative.
///
/// # Errors
/// Returns [`FlowError::Configuration`] when a template edge declares no
/// alternatives.
pub fn project_v1(steps: &[StepDefinition]) -> Result<Vec<FlowMetaEdge>, FlowError> {
    let mut edges = Vec::new();
    for step in steps.iter().filter(|step| step.order_marker >= 1) {
        if !step.is_template() {
            edges.push(edge(step, step.next_status.clone(), None));
            continue;
        }
        if step.next_status_alias.is_empty() {
            return Err(FlowError::configuration(
                codes::ALIAS_MISSING,
                format!(
                    "edge ({}, {}) has a rule but no next_status_alias",
                    step.prev_status, step.action
                ),
            ));
        }
        for alias in &step.next_status_alias {
            edges.push(edge(
                step,
                alias.next_status.clone(),
                Some(alias.label.clone()),
            ));
        }
    }
    Ok(edges)
}

/// The single path a record would take from the start edge, with rules
/// resolved against `record`.
///
/// # Errors
/// Returns [`FlowError::Configuration`] when the start edge is missing or
/// duplicated, or when the walk revisits a status; rule failures propagate.
pub fn project_v2(
    steps: &[StepDefinition],
    resolver: &dyn RuleResolver,
    record: &Value,
) -> Result<Vec<FlowMetaEdge>, FlowError> {
    let forward = steps
        .iter()
        .filter(|step| step.order_marker >= 1)
        .collect::<Vec<_>>();

    let mut by_prev = BTreeMap::new();
    let mut start = None;
    for step in &forward {
        // Several forward edges out of one status: the later catalog row wins.
        if let Some(replaced) = by_prev.insert(step.prev_status.as_str(), *step) {
            tracing::debug!(
                prev_status = %step.prev_status,
                dropped = %replaced.next_status,
                kept = %step.next_status,
                "resolved path follows the later of two forward edges"
            );
        }
        if step.is_start() {
            if start.is_some() {
                return Err(FlowError::configuration(
                    codes::MULTIPLE_START_NODES,
                    "only one edge may have order_marker = 1",
                ));
            }
            start = Some(*step);
        }
    }
    let Some(mut current) = start else {
        return Err(FlowError::configuration(
            codes::NO_START_NODE,
            "one edge must have order_marker = 1",
        ));
    };

    let mut edges = Vec::new();
    let mut visited = BTreeSet::new();
    loop {
        if !visited.insert(current.prev_status.as_str()) {
            return Err(FlowError::configuration(
                codes::CYCLE_DETECTED,
                format!("path revisits status {}", current.prev_status),
            ));
        }
        let next_status = resolve_next_status(resolver, &current.next_status, record)?;
        let label = if current.is_template() {
            current
                .next_status_alias
                .iter()
                .find(|alias| alias.next_status.eq_ignore_ascii_case(&next_status))
                .map(|alias| alias.label.clone())
        } else {
            None
        };
        let following = by_prev.get(next_status.as_str()).copied();
        edges.push(edge(current, next_status, label));
        match following {
            Some(step) => current = step,
            None => break,
        }
    }
    Ok(edges)
}

/// `{status_detail..., "current_status": status}`.
#[must_use]
pub fn approval_status_snapshot(fields: &FlowFields) -> Map<String, Value> {
    let mut snapshot = Map::new();
    if let Some(detail) = &fields.status_detail {
        for (branch, flag) in detail.iter() {
            snapshot.insert(branch.to_string(), Value::from(flag));
        }
    }
    snapshot.insert(
        "current_status".to_string(),
        fields.status.clone().map_or(Value::Null, Value::String),
    );
    snapshot
}

/// # Errors
/// Returns [`FlowError::Store`] if a timestamp cannot be formatted.
pub fn trace_from_entries(entries: &[AuditLogEntry]) -> Result<Vec<FlowTrace>, FlowError> {
    entries
        .iter()
        .map(|entry| {
            Ok(FlowTrace {
                prev_status: entry.prev_status.clone(),
                action: entry.action.clone(),
                next_status: entry.next_status.clone(),
                actor: entry.actor.clone(),
                comment: entry.comment.clone(),
                created_at: crate::format_rfc3339(entry.created_at)?,
            })
        })
        .collect()
}
