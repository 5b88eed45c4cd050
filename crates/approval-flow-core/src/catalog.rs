use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{codes, FlowError};
use crate::rule::is_template;

/// Identifies which catalog slice an engine operates on.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FlowConfig {
    pub flow_id: String,
    pub entity_kind: String,
}

impl FlowConfig {
    pub fn new(flow_id: impl Into<String>, entity_kind: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            entity_kind: entity_kind.into(),
        }
    }

    /// # Errors
    /// Returns [`FlowError::Configuration`] when the flow id or entity kind
    /// is blank.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.flow_id.trim().is_empty() {
            return Err(FlowError::configuration(
                codes::FLOW_ID_MISSING,
                "flow_id MUST be non-empty",
            ));
        }
        if self.entity_kind.trim().is_empty() {
            return Err(FlowError::configuration(
                codes::ENTITY_KIND_MISSING,
                "entity_kind MUST be non-empty",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOutcome {
    Approved,
    Rejected,
}

impl TerminalOutcome {
    #[must_use]
    pub fn marker(self) -> i32 {
        match self {
            Self::Approved => 1,
            Self::Rejected => -1,
        }
    }

    #[must_use]
    pub fn from_marker(marker: i32) -> Option<Self> {
        match marker {
            1 => Some(Self::Approved),
            -1 => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// One declared alternative of a template-valued edge.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BranchAlias {
    #[serde(alias = "next_step")]
    pub next_status: String,
    pub label: String,
}

/// A `(prev_status, action) -> next_status` edge.
///
/// `order_marker` is 1 for the start edge, 0 or negative for resubmission
/// and rejection edges, and greater than 1 for forward approval edges.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StepDefinition {
    pub flow_id: String,
    pub entity_kind: String,
    pub prev_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_status_alias: Option<String>,
    pub action: String,
    pub next_status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_status_alias: Vec<BranchAlias>,
    #[serde(default)]
    pub allowed_roles: Vec<String>,
    pub order_marker: i32,
    #[serde(default)]
    pub terminal_marker: i32,
}

impl StepDefinition {
    #[must_use]
    pub fn is_start(&self) -> bool {
        self.order_marker == 1
    }

    #[must_use]
    pub fn is_forward(&self) -> bool {
        self.order_marker > 0
    }

    #[must_use]
    pub fn terminal(&self) -> Option<TerminalOutcome> {
        TerminalOutcome::from_marker(self.terminal_marker)
    }

    #[must_use]
    pub fn is_template(&self) -> bool {
        is_template(&self.next_status)
    }

    #[must_use]
    pub fn belongs_to(&self, flow: &FlowConfig) -> bool {
        self.flow_id == flow.flow_id && self.entity_kind == flow.entity_kind
    }

    /// # Errors
    /// Returns [`FlowError::Configuration`] naming the first blank field.
    pub fn validate(&self) -> Result<(), FlowError> {
        for (field, value) in [
            ("flow_id", &self.flow_id),
            ("entity_kind", &self.entity_kind),
            ("prev_status", &self.prev_status),
            ("action", &self.action),
            ("next_status", &self.next_status),
        ] {
            if value.trim().is_empty() {
                return Err(FlowError::configuration(
                    codes::CATALOG_INVALID,
                    format!(
                        "{field} MUST be non-empty (flow {}, step {} -> {})",
                        self.flow_id, self.prev_status, self.action
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Row filter applied by every [`CatalogStore`].
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct StepFilter {
    pub prev_status_in: Option<BTreeSet<String>>,
    pub action: Option<String>,
    pub order_marker: Option<i32>,
    pub min_order_marker: Option<i32>,
    pub terminal_marker: Option<i32>,
}

impl StepFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn start() -> Self {
        Self {
            order_marker: Some(1),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn terminal(outcome: TerminalOutcome) -> Self {
        Self {
            terminal_marker: Some(outcome.marker()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn forward() -> Self {
        Self {
            min_order_marker: Some(1),
            ..Self::default()
        }
    }

    /// Blank actions match any action.
    #[must_use]
    pub fn current<'a>(
        prev_statuses: impl IntoIterator<Item = &'a str>,
        action: Option<&str>,
    ) -> Self {
        Self {
            prev_status_in: Some(prev_statuses.into_iter().map(str::to_string).collect()),
            action: action
                .filter(|value| !value.trim().is_empty())
                .map(str::to_string),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn matches(&self, step: &StepDefinition) -> bool {
        if let Some(prev) = &self.prev_status_in {
            if !prev.contains(&step.prev_status) {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if &step.action != action {
                return false;
            }
        }
        if let Some(order) = self.order_marker {
            if step.order_marker != order {
                return false;
            }
        }
        if let Some(min) = self.min_order_marker {
            if step.order_marker < min {
                return false;
            }
        }
        if let Some(terminal) = self.terminal_marker {
            if step.terminal_marker != terminal {
                return false;
            }
        }
        true
    }
}

pub trait CatalogStore {
    /// Steps of `flow` accepted by `filter`, ordered by order marker then
    /// insertion.
    ///
    /// # Errors
    /// Returns [`FlowError::Store`] when the backing store fails.
    fn list_steps(
        &self,
        flow: &FlowConfig,
        filter: &StepFilter,
    ) -> Result<Vec<StepDefinition>, FlowError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    steps: Vec<StepDefinition>,
}

impl InMemoryCatalog {
    #[must_use]
    pub fn new(steps: Vec<StepDefinition>) -> Self {
        Self { steps }
    }

    pub fn push(&mut self, step: StepDefinition) {
        self.steps.push(step);
    }
}

impl CatalogStore for InMemoryCatalog {
    fn list_steps(
        &self,
        flow: &FlowConfig,
        filter: &StepFilter,
    ) -> Result<Vec<StepDefinition>, FlowError> {
        let mut indexed = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.belongs_to(flow) && filter.matches(step))
            .collect::<Vec<_>>();
        indexed.sort_by_key(|(index, step)| (step.order_marker, *index));
        Ok(indexed.into_iter().map(|(_, step)| step.clone()).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CatalogDocument {
    pub flows: Vec<FlowDefinition>,
}

/// Steps under a flow inherit its `flow_id` and `entity_kind`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FlowDefinition {
    pub flow_id: String,
    pub entity_kind: String,
    pub steps: Vec<FlowStepSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FlowStepSpec {
    pub prev_status: String,
    #[serde(default)]
    pub prev_status_alias: Option<String>,
    pub action: String,
    pub next_status: String,
    #[serde(default)]
    pub next_status_alias: Vec<BranchAlias>,
    #[serde(default)]
    pub allowed_roles: Vec<String>,
    pub order_marker: i32,
    #[serde(default)]
    pub terminal_marker: i32,
}

impl CatalogDocument {
    #[must_use]
    pub fn into_steps(self) -> Vec<StepDefinition> {
        self.flows
            .into_iter()
            .flat_map(|flow| {
                let FlowDefinition {
                    flow_id,
                    entity_kind,
                    steps,
                } = flow;
                steps.into_iter().map(move |spec| StepDefinition {
                    flow_id: flow_id.clone(),
                    entity_kind: entity_kind.clone(),
                    prev_status: spec.prev_status,
                    prev_status_alias: spec.prev_status_alias,
                    action: spec.action,
                    next_status: spec.next_status,
                    next_status_alias: spec.next_status_alias,
                    allowed_roles: spec.allowed_roles,
                    order_marker: spec.order_marker,
                    terminal_marker: spec.terminal_marker,
                })
            })
            .collect()
    }
}

/// Parses a catalog from YAML (`.yaml`/`.yml`) or JSON and validates it.
///
/// # Errors
/// Returns [`FlowError::Configuration`] when the file cannot be read or
/// parsed, or when [`validate_catalog`] rejects it.
pub fn load_catalog_from_path(path: &Path) -> Result<Vec<StepDefinition>, FlowError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        FlowError::configuration(
            codes::CATALOG_INVALID,
            format!("failed to read catalog {}: {err}", path.display()),
        )
    })?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        parse_catalog_json(&raw)
    } else {
        parse_catalog_yaml(&raw)
    }
}

/// # Errors
/// Returns [`FlowError::Configuration`] on malformed YAML or an invalid catalog.
pub fn parse_catalog_yaml(raw: &str) -> Result<Vec<StepDefinition>, FlowError> {
    let document: CatalogDocument = serde_yaml::from_str(raw).map_err(|err| {
        FlowError::configuration(codes::CATALOG_INVALID, format!("invalid catalog YAML: {err}"))
    })?;
    let steps = document.into_steps();
    validate_catalog(&steps)?;
    Ok(steps)
}

/// # Errors
/// Returns [`FlowError::Configuration`] on malformed JSON or an invalid catalog.
pub fn parse_catalog_json(raw: &str) -> Result<Vec<StepDefinition>, FlowError> {
    let document: CatalogDocument = serde_json::from_str(raw).map_err(|err| {
        FlowError::configuration(codes::CATALOG_INVALID, format!("invalid catalog JSON: {err}"))
    })?;
    let steps = document.into_steps();
    validate_catalog(&steps)?;
    Ok(steps)
}

/// Checks blank fields, duplicate `(prev_status, action)` edges, and that
/// each flow has exactly one start edge.
///
/// # Errors
/// Returns [`FlowError::Configuration`] describing the first violation.
pub fn validate_catalog(steps: &[StepDefinition]) -> Result<(), FlowError> {
    let mut edges = BTreeSet::new();
    let mut starts: BTreeMap<(&str, &str), usize> = BTreeMap::new();

    for step in steps {
        step.validate()?;
        let key = (
            step.flow_id.as_str(),
            step.entity_kind.as_str(),
            step.prev_status.as_str(),
            step.action.as_str(),
        );
        if !edges.insert(key) {
            return Err(FlowError::configuration(
                codes::CATALOG_INVALID,
                format!(
                    "duplicate edge ({}, {}) in flow {}/{}",
                    step.prev_status, step.action, step.flow_id, step.entity_kind
                ),
            ));
        }
        let count = starts
            .entry((step.flow_id.as_str(), step.entity_kind.as_str()))
            .or_insert(0);
        if step.is_start() {
            *count += 1;
        }
    }

    for ((flow_id, entity_kind), count) in starts {
        match count {
            1 => {}
            0 => {
                return Err(FlowError::configuration(
                    codes::NO_START_NODE,
                    format!("flow {flow_id}/{entity_kind} has no start edge (order_marker = 1)"),
                ))
            }
            _ => {
                return Err(FlowError::configuration(
                    codes::MULTIPLE_START_NODES,
                    format!("flow {flow_id}/{entity_kind} has {count} start edges"),
                ))
            }
        }
    }

    Ok(())
}
