use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::catalog::StepDefinition;
use crate::codec::StatusDetail;

/// Which edges count toward a to-do list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TodoScope {
    All,
    /// Start and resubmission edges (order marker 0 or 1).
    PendingSubmit,
    /// Everything else.
    PendingApproval,
}

impl TodoScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::PendingSubmit => "pending_submit",
            Self::PendingApproval => "pending_approval",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(Self::All),
            "pending_submit" => Some(Self::PendingSubmit),
            "pending_approval" => Some(Self::PendingApproval),
            _ => None,
        }
    }

    #[must_use]
    pub fn includes(self, step: &StepDefinition) -> bool {
        let submit_edge = matches!(step.order_marker, 0 | 1);
        match self {
            Self::All => true,
            Self::PendingSubmit => submit_edge,
            Self::PendingApproval => !submit_edge,
        }
    }
}

/// Source statuses of role-guarded steps in `scope`. With `roles`, only
/// steps sharing at least one role are kept.
#[must_use]
pub fn collect_todo_statuses(
    steps: &[StepDefinition],
    scope: TodoScope,
    roles: Option<&BTreeSet<String>>,
) -> BTreeSet<String> {
    let roles = roles.filter(|roles| !roles.is_empty());
    steps
        .iter()
        .filter(|step| scope.includes(step) && !step.allowed_roles.is_empty())
        .filter(|step| match roles {
            Some(roles) => step.allowed_roles.iter().any(|role| roles.contains(role)),
            None => true,
        })
        .map(|step| step.prev_status.clone())
        .collect()
}

/// True for records whose completion map leaves any listed branch pending.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PendingPredicate {
    branches: BTreeSet<String>,
}

impl PendingPredicate {
    /// `None` when there is nothing to wait on.
    #[must_use]
    pub fn from_statuses(statuses: &BTreeSet<String>) -> Option<Self> {
        if statuses.is_empty() {
            return None;
        }
        Some(Self {
            branches: statuses.clone(),
        })
    }

    pub fn branches(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().map(String::as_str)
    }

    #[must_use]
    pub fn matches(&self, detail: &StatusDetail) -> bool {
        self.branches.iter().any(|branch| detail.is_pending(branch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ApprovalState;
    use proptest::prelude::*;

    fn step(prev: &str, order_marker: i32, roles: &[&str]) -> StepDefinition {
        StepDefinition {
            flow_id: "purchase".to_string(),
            entity_kind: "order".to_string(),
            prev_status: prev.to_string(),
            prev_status_alias: None,
            action: "Act".to_string(),
            next_status: "Next".to_string(),
            next_status_alias: Vec::new(),
            allowed_roles: roles.iter().map(|role| (*role).to_string()).collect(),
            order_marker,
            terminal_marker: 0,
        }
    }

    fn catalog() -> Vec<StepDefinition> {
        vec![
            step("New", 1, &["submitter"]),
            step("Rejected", 0, &["submitter"]),
            step("Legal", 2, &["legal"]),
            step("Finance", 2, &["finance"]),
            step("Archive", 3, &[]),
        ]
    }

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| (*value).to_string()).collect()
    }

    #[test]
    fn scopes_split_submit_and_approval_edges() {
        let steps = catalog();
        assert_eq!(
            collect_todo_statuses(&steps, TodoScope::PendingSubmit, None),
            set(&["New", "Rejected"])
        );
        assert_eq!(
            collect_todo_statuses(&steps, TodoScope::PendingApproval, None),
            set(&["Finance", "Legal"])
        );
        assert_eq!(collect_todo_statuses(&steps, TodoScope::All, None).len(), 4);
    }

    #[test]
    fn roles_narrow_the_statuses() {
        let roles = set(&["legal"]);
        assert_eq!(
            collect_todo_statuses(&catalog(), TodoScope::All, Some(&roles)),
            set(&["Legal"])
        );
        let empty = BTreeSet::new();
        assert_eq!(
            collect_todo_statuses(&catalog(), TodoScope::All, Some(&empty)).len(),
            4
        );
    }

    #[test]
    fn predicate_is_absent_for_empty_sets() {
        assert!(PendingPredicate::from_statuses(&BTreeSet::new()).is_none());
    }

    #[test]
    fn predicate_ignores_completed_branches() {
        let predicate = match PendingPredicate::from_statuses(&set(&["Legal"])) {
            Some(value) => value,
            None => panic!("predicate missing"),
        };
        let mut detail = ApprovalState::decode("Legal&&Finance").pending_detail();
        assert!(predicate.matches(&detail));
        detail.mark_completed("Legal");
        assert!(!predicate.matches(&detail));
    }

    proptest! {
        #[test]
        fn predicate_matches_iff_some_listed_branch_is_pending(
            completed in proptest::collection::btree_set("[A-E]", 0..5),
            listed in proptest::collection::btree_set("[A-E]", 1..5),
        ) {
            let mut detail = StatusDetail::pending(["A", "B", "C", "D", "E"]);
            for branch in &completed {
                detail.mark_completed(branch);
            }
            let predicate = match PendingPredicate::from_statuses(&listed) {
                Some(value) => value,
                None => panic!("listed set is non-empty"),
            };
            let expected = listed.iter().any(|branch| !completed.contains(branch));
            prop_assert_eq!(predicate.matches(&detail), expected);
        }
    }
}
