#![allow(clippy::too_many_lines)]

use std::cell::Cell;
use std::collections::BTreeSet;

use approval_flow_core::{
    codes, ApprovalRound, BranchAlias, ErrorCategory, FlowCollaborators, FlowConfig, FlowDocument,
    FlowEngine, FlowError, InMemoryAuditLog, InMemoryCatalog, InMemoryRoundStore,
    LiquidRuleResolver, NoopTransitionHook, RoleDirectory, RoleMembershipPolicy, RoundId,
    RoundStore, StepDefinition, TodoScope, TransitionRequest,
};
use serde_json::{json, Map, Value};

fn must<T>(result: Result<T, FlowError>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

fn must_err<T: std::fmt::Debug>(result: Result<T, FlowError>) -> FlowError {
    match result {
        Ok(value) => panic!("expected failure, got {value:?}"),
        Err(err) => err,
    }
}

#[allow(clippy::too_many_arguments)]
fn edge(
    flow_id: &str,
    prev: &str,
    action: &str,
    next: &str,
    roles: &[&str],
    order_marker: i32,
    terminal_marker: i32,
) -> StepDefinition {
    StepDefinition {
        flow_id: flow_id.to_string(),
        entity_kind: "order".to_string(),
        prev_status: prev.to_string(),
        prev_status_alias: None,
        action: action.to_string(),
        next_status: next.to_string(),
        next_status_alias: Vec::new(),
        allowed_roles: roles.iter().map(|role| (*role).to_string()).collect(),
        order_marker,
        terminal_marker,
    }
}

const UNCLOSED_RULE: &str = "<%{% if vo.amount > 1000 %}Director Review%>";

fn catalog() -> InMemoryCatalog {
    let mut branch_submit = edge(
        "branch",
        "New",
        "Submit",
        "<%{% if vo.amount > 1000 %}Director Review{% else %}Manager Review{% endif %}%>",
        &["submitter"],
        1,
        0,
    );
    branch_submit.next_status_alias = vec![
        BranchAlias {
            next_status: "Manager Review".to_string(),
            label: "up to 1000".to_string(),
        },
        BranchAlias {
            next_status: "Director Review".to_string(),
            label: "over 1000".to_string(),
        },
    ];

    InMemoryCatalog::new(vec![
        edge("single", "New", "Submit", "PendingApproval", &["submitter"], 1, 0),
        edge("single", "PendingApproval", "Approve", "Done", &["manager"], 2, 1),
        edge("single", "PendingApproval", "Reject", "Rejected", &["manager"], -1, -1),
        edge("single", "Rejected", "Resubmit", "PendingApproval", &["submitter"], 0, 0),
        edge("parallel", "New", "Submit", "Legal&&Finance&&Security", &["submitter"], 1, 0),
        edge("parallel", "Legal", "Approve", "Done", &["legal"], 2, 1),
        edge("parallel", "Finance", "Approve", "Done", &["finance"], 2, 1),
        edge("parallel", "Security", "Approve", "Done", &["security"], 2, 1),
        edge("parallel", "Legal", "Reject", "Rejected", &["legal"], -1, -1),
        edge("parallel", "Finance", "Reject", "Rejected", &["finance"], -1, -1),
        edge("parallel", "Security", "Reject", "Rejected", &["security"], -1, -1),
        edge("either", "New", "Submit", "Manager||Director", &["submitter"], 1, 0),
        edge("either", "Manager", "Approve", "Done", &["manager"], 2, 1),
        edge("either", "Director", "Approve", "Done", &["director"], 2, 1),
        branch_submit,
        edge("branch", "Manager Review", "Approve", "Done", &["manager"], 2, 1),
        edge("branch", "Director Review", "Approve", "Done", &["director"], 2, 1),
        edge("gated", "New", "Submit", "Legal&&Finance", &["submitter"], 1, 0),
        edge("gated", "Legal", "Approve", UNCLOSED_RULE, &["legal"], 2, 0),
        edge("gated", "Finance", "Approve", UNCLOSED_RULE, &["finance"], 2, 0),
    ])
}

fn roles() -> RoleMembershipPolicy {
    let mut directory = RoleDirectory::default();
    directory.assign("alice", "submitter");
    directory.assign("mike", "manager");
    directory.assign("dora", "director");
    directory.assign("lena", "legal");
    directory.assign("fred", "finance");
    directory.assign("sam", "security");
    directory.assign("olga", "legal");
    directory.assign("olga", "finance");
    RoleMembershipPolicy::new(directory)
}

struct Harness {
    catalog: InMemoryCatalog,
    audit: InMemoryAuditLog,
    rounds: InMemoryRoundStore,
    policy: RoleMembershipPolicy,
    rules: LiquidRuleResolver,
}

impl Harness {
    fn new() -> Self {
        Self {
            catalog: catalog(),
            audit: InMemoryAuditLog::new(),
            rounds: InMemoryRoundStore::new(),
            policy: roles(),
            rules: must(LiquidRuleResolver::new()),
        }
    }

    fn engine(&self, flow_id: &str) -> FlowEngine<'_, FlowDocument> {
        must(FlowEngine::new(
            FlowConfig::new(flow_id, "order"),
            FlowCollaborators {
                catalog: &self.catalog,
                audit: &self.audit,
                rounds: &self.rounds,
                authorizer: &self.policy,
                rules: &self.rules,
                on_transitioned: &NoopTransitionHook,
            },
        ))
    }
}

/// Round store that counts how many rounds were opened.
#[derive(Default)]
struct CountingRounds {
    inner: InMemoryRoundStore,
    created: Cell<usize>,
}

impl RoundStore for CountingRounds {
    fn create_round(&self, actor: &str) -> Result<ApprovalRound, FlowError> {
        self.created.set(self.created.get() + 1);
        self.inner.create_round(actor)
    }

    fn get_round(&self, round_id: RoundId) -> Result<Option<ApprovalRound>, FlowError> {
        self.inner.get_round(round_id)
    }

    fn record_change_snapshot(&self, round_id: RoundId, payload: &Value) -> Result<(), FlowError> {
        self.inner.record_change_snapshot(round_id, payload)
    }
}

fn document(flow_id: &str, fields: Map<String, serde_json::Value>) -> FlowDocument {
    FlowDocument::new(&FlowConfig::new(flow_id, "order"), "office chairs", fields)
}

fn status(doc: &FlowDocument) -> &str {
    doc.flow.status.as_deref().unwrap_or_default()
}

fn detail_flag(doc: &FlowDocument, branch: &str) -> Option<u8> {
    doc.flow
        .status_detail
        .as_ref()
        .and_then(|detail| detail.get(branch))
}

#[test]
fn single_approver_flow_reaches_terminal_status() {
    let harness = Harness::new();
    let engine = harness.engine("single");
    let mut doc = document("single", Map::new());

    assert_eq!(must(engine.init_approval_status(&mut doc)), "New");
    assert_eq!(status(&doc), "New");
    assert_eq!(detail_flag(&doc, "New"), Some(0));
    assert_eq!(doc.flow.status_detail.as_ref().map(|d| d.len()), Some(1));

    let submitted = must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "please")));
    assert_eq!(submitted.next_status, "PendingApproval");
    assert!(!submitted.partial);
    assert_eq!(status(&doc), "PendingApproval");
    assert_eq!(doc.flow.last_submit.as_ref().map(|s| s.actor.as_str()), Some("alice"));

    let log = must(engine.history(&doc, true));
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].prev_status, "New");
    assert_eq!(log[0].action, "Submit");
    assert_eq!(log[0].next_status, "PendingApproval");
    assert_eq!(log[0].round_id, doc.flow.round_id);

    must(engine.process(&mut doc, &TransitionRequest::review("Approve", "mike", "ok")));
    assert_eq!(status(&doc), "Done");
    assert_eq!(doc.flow.last_audit.as_ref().map(|s| s.comment.as_str()), Some("ok"));
    assert!(must(engine.approved_statuses()).contains("Done"));
    assert!(must(engine.rejected_statuses()).contains("Rejected"));
    assert_eq!(must(engine.initial_status()), "New");
}

#[test]
fn reject_before_submit_has_no_matching_step() {
    let harness = Harness::new();
    let engine = harness.engine("single");
    let mut doc = document("single", Map::new());
    must(engine.init_approval_status(&mut doc));

    let err = must_err(engine.process(&mut doc, &TransitionRequest::review("Reject", "mike", "no")));
    assert_eq!(err.category(), ErrorCategory::NoMatchingStep);
    assert_eq!(err.code(), codes::NO_MATCHING_STEP);
    assert_eq!(status(&doc), "New");
}

#[test]
fn and_split_waits_for_every_branch() {
    let harness = Harness::new();
    let engine = harness.engine("parallel");
    let mut doc = document("parallel", Map::new());
    must(engine.init_approval_status(&mut doc));
    must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));
    assert_eq!(status(&doc), "Legal&&Finance&&Security");

    let first = must(engine.process(&mut doc, &TransitionRequest::review("Approve", "lena", "legal ok")));
    assert!(first.partial);
    assert_eq!(first.next_status, "Done");
    assert_eq!(status(&doc), "Legal&&Finance&&Security");
    assert_eq!(detail_flag(&doc, "Legal"), Some(1));
    assert_eq!(detail_flag(&doc, "Finance"), Some(0));
    assert_eq!(detail_flag(&doc, "Security"), Some(0));

    let second = must(engine.process(&mut doc, &TransitionRequest::review("Approve", "fred", "")));
    assert!(second.partial);
    assert_eq!(detail_flag(&doc, "Finance"), Some(1));

    let last = must(engine.process(&mut doc, &TransitionRequest::review("Approve", "sam", "")));
    assert!(!last.partial);
    assert_eq!(status(&doc), "Done");
    assert_eq!(detail_flag(&doc, "Done"), Some(0));

    let log = must(engine.history(&doc, true));
    assert_eq!(log.len(), 4);
}

#[test]
fn one_actor_holding_every_waiting_branch_advances_at_once() {
    let harness = Harness::new();
    let engine = harness.engine("parallel");
    let mut doc = document("parallel", Map::new());
    must(engine.init_approval_status(&mut doc));
    must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));
    must(engine.process(&mut doc, &TransitionRequest::review("Approve", "sam", "")));

    let outcome = must(engine.process(&mut doc, &TransitionRequest::review("Approve", "olga", "both")));
    assert!(!outcome.partial);
    assert_eq!(outcome.steps.len(), 2);
    assert_eq!(status(&doc), "Done");

    let entries = must(engine.history(&doc, true));
    let by_olga = entries
        .iter()
        .filter(|entry| entry.actor == "olga")
        .map(|entry| entry.prev_status.as_str())
        .collect::<BTreeSet<_>>();
    assert_eq!(by_olga, BTreeSet::from(["Finance", "Legal"]));
}

#[test]
fn rejecting_one_branch_ends_the_and_split() {
    let harness = Harness::new();
    let engine = harness.engine("parallel");
    let mut doc = document("parallel", Map::new());
    must(engine.init_approval_status(&mut doc));
    must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));

    let outcome = must(engine.process(&mut doc, &TransitionRequest::review("Reject", "fred", "over budget")));
    assert!(!outcome.partial);
    assert_eq!(status(&doc), "Rejected");
}

#[test]
fn fully_handled_and_split_has_no_waiting_branch() {
    let harness = Harness::new();
    let engine = harness.engine("parallel");
    let mut doc = document("parallel", Map::new());
    must(engine.init_approval_status(&mut doc));
    must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));
    must(engine.process(&mut doc, &TransitionRequest::review("Approve", "olga", "")));
    must(engine.process(&mut doc, &TransitionRequest::review("Approve", "sam", "")));

    doc.flow.enter("Legal&&Finance&&Security");
    let err = must_err(engine.process(&mut doc, &TransitionRequest::review("Approve", "sam", "")));
    assert_eq!(err.code(), codes::NO_WAITING_BRANCH);
}

#[test]
fn or_split_advances_on_any_branch() {
    let harness = Harness::new();
    let engine = harness.engine("either");
    let mut doc = document("either", Map::new());
    must(engine.init_approval_status(&mut doc));
    must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));
    assert_eq!(status(&doc), "Manager||Director");
    assert_eq!(detail_flag(&doc, "Manager"), Some(0));
    assert_eq!(detail_flag(&doc, "Director"), Some(0));

    let outcome = must(engine.process(&mut doc, &TransitionRequest::review("Approve", "dora", "")));
    assert!(!outcome.partial);
    assert_eq!(outcome.steps[0].prev_status, "Director");
    assert_eq!(status(&doc), "Done");
}

#[test]
fn template_edge_picks_branch_from_record_fields() {
    let harness = Harness::new();
    let engine = harness.engine("branch");

    let mut large = Map::new();
    large.insert("amount".to_string(), json!(2500));
    let mut doc = document("branch", large);
    must(engine.init_approval_status(&mut doc));
    must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));
    assert_eq!(status(&doc), "Director Review");

    let err = must_err(engine.process(&mut doc, &TransitionRequest::review("Approve", "mike", "")));
    assert_eq!(err.category(), ErrorCategory::Unauthorized);
    assert_eq!(err.code(), codes::UNAUTHORIZED);

    let mut small = Map::new();
    small.insert("amount".to_string(), json!(300));
    let mut doc = document("branch", small);
    must(engine.init_approval_status(&mut doc));
    must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));
    assert_eq!(status(&doc), "Manager Review");
}

#[test]
fn argument_validation_uses_distinct_codes() {
    let harness = Harness::new();
    let engine = harness.engine("single");
    let mut doc = document("single", Map::new());
    must(engine.init_approval_status(&mut doc));

    let err = must_err(engine.process(&mut doc, &TransitionRequest::review(" ", "mike", "")));
    assert_eq!(err.code(), codes::ACTION_MISSING);
    let err = must_err(engine.process(&mut doc, &TransitionRequest::review("Approve", "", "")));
    assert_eq!(err.code(), codes::ACTOR_MISSING);

    doc.record_id = String::new();
    let err = must_err(engine.process(&mut doc, &TransitionRequest::review("Approve", "mike", "")));
    assert_eq!(err.code(), codes::RECORD_ID_MISSING);

    let mut blank = document("single", Map::new());
    let err = must_err(engine.process(&mut blank, &TransitionRequest::submit("Submit", "alice", "")));
    assert_eq!(err.category(), ErrorCategory::MissingState);
    assert_eq!(err.code(), codes::STATE_MISSING);
}

#[test]
fn engine_rejects_blank_flow_identity() {
    let harness = Harness::new();
    let result = FlowEngine::<FlowDocument>::new(
        FlowConfig::new("", "order"),
        FlowCollaborators {
            catalog: &harness.catalog,
            audit: &harness.audit,
            rounds: &harness.rounds,
            authorizer: &harness.policy,
            rules: &harness.rules,
            on_transitioned: &NoopTransitionHook,
        },
    );
    let err = match result {
        Ok(_) => panic!("expected failure"),
        Err(err) => err,
    };
    assert_eq!(err.code(), codes::FLOW_ID_MISSING);
}

#[test]
fn unknown_flow_reports_missing_start_and_terminal_edges() {
    let harness = Harness::new();
    let engine = harness.engine("missing");
    assert_eq!(must_err(engine.initial_status()).code(), codes::NO_START_NODE);
    assert_eq!(must_err(engine.approved_statuses()).code(), codes::NO_APPROVED_STATUS);
    assert_eq!(must_err(engine.rejected_statuses()).code(), codes::NO_REJECTED_STATUS);
}

#[test]
fn handle_access_reflects_current_steps_and_roles() {
    let harness = Harness::new();
    let engine = harness.engine("parallel");
    let mut doc = document("parallel", Map::new());
    must(engine.init_approval_status(&mut doc));

    assert!(must(engine.verify_handle_access(&doc, "alice")));
    assert!(!must(engine.verify_handle_access(&doc, "lena")));

    must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));
    assert!(must(engine.verify_handle_access(&doc, "lena")));
    assert!(!must(engine.verify_handle_access(&doc, "alice")));

    must(engine.process(&mut doc, &TransitionRequest::review("Approve", "lena", "")));
    assert!(!must(engine.verify_handle_access(&doc, "unknown")));

    let err = must_err(engine.verify_handle_access(&doc, " "));
    assert_eq!(err.code(), codes::ACCESS_QUERY_INVALID);
}

#[test]
fn resubmission_opens_a_new_round() {
    let harness = Harness::new();
    let engine = harness.engine("single");
    let mut doc = document("single", Map::new());
    must(engine.init_approval_status(&mut doc));
    must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));
    let first_round = doc.flow.round_id;
    must(engine.process(&mut doc, &TransitionRequest::review("Reject", "mike", "fix quote")));
    assert_eq!(status(&doc), "Rejected");

    must(engine.process(&mut doc, &TransitionRequest::submit("Resubmit", "alice", "fixed")));
    assert_ne!(doc.flow.round_id, first_round);
    assert_eq!(status(&doc), "PendingApproval");

    assert_eq!(must(engine.history(&doc, true)).len(), 1);
    let all = must(engine.history(&doc, false));
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].action, "Resubmit");
    assert_eq!(all[2].action, "Submit");
}

#[test]
fn todo_statuses_follow_scope_and_roles() {
    let harness = Harness::new();
    let engine = harness.engine("parallel");
    let legal = BTreeSet::from(["legal".to_string()]);

    assert_eq!(
        must(engine.todo_statuses(TodoScope::PendingSubmit, None)),
        BTreeSet::from(["New".to_string()])
    );
    assert_eq!(
        must(engine.todo_statuses(TodoScope::PendingApproval, Some(&legal))),
        BTreeSet::from(["Legal".to_string()])
    );

    let predicate = match must(engine.pending_predicate(TodoScope::PendingApproval, Some(&legal))) {
        Some(value) => value,
        None => panic!("predicate missing"),
    };
    let mut doc = document("parallel", Map::new());
    must(engine.init_approval_status(&mut doc));
    must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));
    let detail = doc.flow.status_detail.clone().unwrap_or_default();
    assert!(predicate.matches(&detail));

    must(engine.process(&mut doc, &TransitionRequest::review("Approve", "lena", "")));
    let detail = doc.flow.status_detail.clone().unwrap_or_default();
    assert!(!predicate.matches(&detail));

    let nobody = BTreeSet::from(["auditor".to_string()]);
    assert!(must(engine.pending_predicate(TodoScope::All, Some(&nobody))).is_none());
}

#[test]
fn flow_meta_views_carry_trace_and_snapshot() {
    let harness = Harness::new();
    let engine = harness.engine("branch");
    let mut fields = Map::new();
    fields.insert("amount".to_string(), json!(50));
    let mut doc = document("branch", fields);
    must(engine.init_approval_status(&mut doc));
    must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));

    let v1 = must(engine.flow_meta_v1(&doc));
    assert_eq!(v1.contract_version, "flow_meta.v1");
    assert_eq!(v1.flow_meta.len(), 4);
    assert_eq!(v1.flow_trace.len(), 1);
    assert_eq!(v1.approval_status.get("current_status"), Some(&json!("Manager Review")));
    assert_eq!(v1.approval_status.get("Manager Review"), Some(&json!(0)));

    let v2 = must(engine.flow_meta_v2(&doc));
    assert_eq!(v2.contract_version, "flow_meta.v2");
    let path = v2
        .flow_meta
        .iter()
        .map(|edge| edge.next_status.as_str())
        .collect::<Vec<_>>();
    assert_eq!(path, vec!["Manager Review", "Done"]);
    assert_eq!(v2.flow_meta[0].label.as_deref(), Some("up to 1000"));
    assert_eq!(v2.flow_trace[0].actor, "alice");
}

#[test]
fn hook_sees_the_updated_record_and_can_abort() {
    let harness = Harness::new();
    let calls = Cell::new(0_usize);
    let counting = |doc: &FlowDocument| {
        calls.set(calls.get() + 1);
        if doc.flow.status.as_deref() == Some("Done") {
            return Err(FlowError::conflict("record changed underneath"));
        }
        Ok(())
    };
    let engine = must(FlowEngine::new(
        FlowConfig::new("single", "order"),
        FlowCollaborators {
            catalog: &harness.catalog,
            audit: &harness.audit,
            rounds: &harness.rounds,
            authorizer: &harness.policy,
            rules: &harness.rules,
            on_transitioned: &counting,
        },
    ));

    let mut doc = document("single", Map::new());
    must(engine.init_approval_status(&mut doc));
    must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));
    assert_eq!(calls.get(), 1);

    let err = must_err(engine.process(&mut doc, &TransitionRequest::review("Approve", "mike", "")));
    assert_eq!(err.code(), codes::REVISION_CONFLICT);
    assert_eq!(calls.get(), 2);
    assert_eq!(status(&doc), "PendingApproval");
    assert!(doc.flow.last_audit.is_none());
}

#[test]
fn denied_resubmit_keeps_the_record_and_its_round() {
    let harness = Harness::new();
    let rounds = CountingRounds::default();
    let engine = must(FlowEngine::new(
        FlowConfig::new("single", "order"),
        FlowCollaborators {
            catalog: &harness.catalog,
            audit: &harness.audit,
            rounds: &rounds,
            authorizer: &harness.policy,
            rules: &harness.rules,
            on_transitioned: &NoopTransitionHook,
        },
    ));
    let mut doc = document("single", Map::new());
    must(engine.init_approval_status(&mut doc));
    must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));
    must(engine.process(&mut doc, &TransitionRequest::review("Reject", "mike", "wrong vendor")));
    assert_eq!(rounds.created.get(), 1);
    assert_eq!(must(engine.history(&doc, true)).len(), 2);

    let before = doc.clone();
    let err = must_err(engine.process(&mut doc, &TransitionRequest::submit("Resubmit", "mike", "")));
    assert_eq!(err.code(), codes::UNAUTHORIZED);
    assert_eq!(doc, before);
    assert_eq!(rounds.created.get(), 1);
    assert_eq!(must(engine.history(&doc, true)).len(), 2);

    let trace = must(engine.flow_meta_v1(&doc)).flow_trace;
    assert_eq!(trace.len(), 2);
}

#[test]
fn failed_transitions_leave_the_record_untouched() {
    let harness = Harness::new();

    let single = harness.engine("single");
    let mut doc = document("single", Map::new());
    must(single.init_approval_status(&mut doc));
    let before = doc.clone();
    let err = must_err(single.process(&mut doc, &TransitionRequest::review("Approve", "mike", "")));
    assert_eq!(err.code(), codes::NO_MATCHING_STEP);
    assert_eq!(doc, before);

    let parallel = harness.engine("parallel");
    let mut doc = document("parallel", Map::new());
    must(parallel.init_approval_status(&mut doc));
    must(parallel.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));
    must(parallel.process(&mut doc, &TransitionRequest::review("Approve", "olga", "")));
    must(parallel.process(&mut doc, &TransitionRequest::review("Approve", "sam", "")));
    doc.flow.enter("Legal&&Finance&&Security");
    let before = doc.clone();
    let err = must_err(parallel.process(&mut doc, &TransitionRequest::review("Approve", "lena", "")));
    assert_eq!(err.code(), codes::NO_WAITING_BRANCH);
    assert_eq!(doc, before);
}

#[test]
fn partial_approval_without_status_detail_is_missing_state() {
    let harness = Harness::new();
    let engine = harness.engine("parallel");
    let mut doc = document("parallel", Map::new());
    must(engine.init_approval_status(&mut doc));
    let submitted = must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));
    doc.flow.status_detail = None;

    let before = doc.clone();
    let err = must_err(engine.process(&mut doc, &TransitionRequest::review("Approve", "lena", "")));
    assert_eq!(err.category(), ErrorCategory::MissingState);
    assert_eq!(err.code(), codes::STATE_MISSING);
    assert_eq!(doc, before);
    assert_eq!(doc.flow.round_id, submitted.round_id);
    assert_eq!(must(engine.history(&doc, true)).len(), 1);
}

#[test]
fn rule_on_an_and_split_runs_only_when_the_last_branch_approves() {
    let harness = Harness::new();
    let engine = harness.engine("gated");
    let mut doc = document("gated", Map::new());
    must(engine.init_approval_status(&mut doc));
    must(engine.process(&mut doc, &TransitionRequest::submit("Submit", "alice", "")));

    let legal = must(engine.process(&mut doc, &TransitionRequest::review("Approve", "lena", "")));
    assert!(legal.partial);
    assert_eq!(legal.next_status, UNCLOSED_RULE);
    assert_eq!(detail_flag(&doc, "Legal"), Some(1));

    let before = doc.clone();
    let err = must_err(engine.process(&mut doc, &TransitionRequest::review("Approve", "fred", "")));
    assert_eq!(err.category(), ErrorCategory::RuleEvaluation);
    assert_eq!(err.code(), codes::RULE_EVALUATION);
    assert_eq!(doc, before);
    assert_eq!(detail_flag(&doc, "Finance"), Some(0));
}
