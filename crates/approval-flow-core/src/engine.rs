use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::audit::{audit_entries, AuditFilter, AuditLogEntry, AuditLookup, AuditStore, LogOrder};
use crate::catalog::{CatalogStore, FlowConfig, StepDefinition, StepFilter, TerminalOutcome};
use crate::codec::ApprovalState;
use crate::error::{codes, ErrorCategory, FlowError};
use crate::now_utc;
use crate::policy::AuthorizationPolicy;
use crate::projector::{
    approval_status_snapshot, project_v1, project_v2, trace_from_entries, FlowMetaEdge, FlowRoot,
    FLOW_META_V1_CONTRACT, FLOW_META_V2_CONTRACT,
};
use crate::record::{ActorStamp, FlowRecord};
use crate::round::{ensure_round, RoundId, RoundStore};
use crate::rule::{resolve_next_status, RuleResolver};
use crate::todo::{collect_todo_statuses, PendingPredicate, TodoScope};

/// Runs after a transition has been applied and logged.
pub trait OnTransitioned<R: ?Sized> {
    /// # Errors
    /// A failure is returned from [`FlowEngine::process`] unchanged.
    fn after_process(&self, record: &R) -> Result<(), FlowError>;
}

impl<R: ?Sized, F> OnTransitioned<R> for F
where
    F: Fn(&R) -> Result<(), FlowError>,
{
    fn after_process(&self, record: &R) -> Result<(), FlowError> {
        self(record)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransitionHook;

impl<R: ?Sized> OnTransitioned<R> for NoopTransitionHook {
    fn after_process(&self, _record: &R) -> Result<(), FlowError> {
        Ok(())
    }
}

/// Everything the engine reads from or hands off to.
pub struct FlowCollaborators<'a, R: ?Sized> {
    pub catalog: &'a dyn CatalogStore,
    pub audit: &'a dyn AuditStore,
    pub rounds: &'a dyn RoundStore,
    pub authorizer: &'a dyn AuthorizationPolicy,
    pub rules: &'a dyn RuleResolver,
    pub on_transitioned: &'a dyn OnTransitioned<R>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TransitionRequest {
    pub action: String,
    pub actor: String,
    pub comment: String,
    pub is_submit: bool,
    pub is_restart: bool,
}

impl TransitionRequest {
    /// An approve/reject style request within the current round.
    pub fn review(
        action: impl Into<String>,
        actor: impl Into<String>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            actor: actor.into(),
            comment: comment.into(),
            is_submit: false,
            is_restart: false,
        }
    }

    /// A submit/resubmit request: stamps the submitter and opens a new round.
    pub fn submit(
        action: impl Into<String>,
        actor: impl Into<String>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            is_submit: true,
            is_restart: true,
            ..Self::review(action, actor, comment)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TransitionOutcome {
    /// The authorized steps that were handled.
    pub steps: Vec<StepDefinition>,
    pub next_status: String,
    /// True when an AND-split branch completed but others are still waiting.
    pub partial: bool,
    pub round_id: Option<RoundId>,
}

pub struct FlowEngine<'a, R: ?Sized> {
    config: FlowConfig,
    collaborators: FlowCollaborators<'a, R>,
}

impl<'a, R: FlowRecord + ?Sized> FlowEngine<'a, R> {
    /// # Errors
    /// Returns [`FlowError::Configuration`] when `config` is incomplete.
    pub fn new(config: FlowConfig, collaborators: FlowCollaborators<'a, R>) -> Result<Self, FlowError> {
        config.validate()?;
        Ok(Self {
            config,
            collaborators,
        })
    }

    #[must_use]
    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Moves `record` along the edge matching its status and `request.action`.
    /// On error the record's flow fields are left as they were.
    ///
    /// # Errors
    /// - [`FlowError::InvalidArgument`] for a blank record id, action or actor.
    /// - [`FlowError::MissingState`] when the record has no status.
    /// - [`FlowError::NoMatchingStep`] when no edge matches.
    /// - [`FlowError::Unauthorized`] when the actor may take none of them.
    /// - Rule, store and hook failures propagate.
    pub fn process(
        &self,
        record: &mut R,
        request: &TransitionRequest,
    ) -> Result<TransitionOutcome, FlowError> {
        let record_id = record.record_id().to_string();
        if record_id.trim().is_empty() {
            return Err(FlowError::invalid_argument(
                codes::RECORD_ID_MISSING,
                "record id MUST be non-empty",
            ));
        }
        if request.action.trim().is_empty() {
            return Err(FlowError::invalid_argument(
                codes::ACTION_MISSING,
                "action MUST be non-empty",
            ));
        }
        if request.actor.trim().is_empty() {
            return Err(FlowError::invalid_argument(
                codes::ACTOR_MISSING,
                "actor MUST be non-empty",
            ));
        }

        let before = record.flow_state().clone();
        let outcome = self.apply(record, request, &record_id);
        if outcome.is_err() {
            *record.flow_state_mut() = before;
        }
        outcome
    }

    fn apply(
        &self,
        record: &mut R,
        request: &TransitionRequest,
        record_id: &str,
    ) -> Result<TransitionOutcome, FlowError> {
        let state = record
            .flow_state()
            .approval_state()
            .ok_or_else(|| FlowError::missing_state(format!("record {record_id} has no status")))?;

        // A restart is matched against a round that has no entries yet.
        let lookup_round = if request.is_restart {
            None
        } else {
            record.flow_state().round_id
        };
        let current = self.find_current_steps(&state, Some(&request.action), lookup_round)?;
        let authorized = self
            .collaborators
            .authorizer
            .authorize(&current, &request.actor)?;
        let Some(first) = authorized.first() else {
            tracing::warn!(
                record_id = %record_id,
                actor = %request.actor,
                action = %request.action,
                status = %state,
                "actor holds no role for the current steps"
            );
            return Err(FlowError::unauthorized(format!(
                "{} may not {} record {record_id} in status {state}",
                request.actor, request.action
            )));
        };

        let partial = state.is_and() && current.len() > authorized.len() && first.is_forward();
        let next_status = if partial {
            if record.flow_state().status_detail.is_none() {
                return Err(FlowError::missing_state(format!(
                    "record {record_id} has no status detail"
                )));
            }
            // Logged as declared; the rule runs once the last branch is in.
            first.next_status.clone()
        } else {
            resolve_next_status(self.collaborators.rules, &first.next_status, &record.rule_context())?
        };

        let round_id = ensure_round(
            self.collaborators.rounds,
            record,
            request.is_restart,
            &request.actor,
        )?;

        let at = now_utc();
        let fields = record.flow_state_mut();
        if partial {
            if let Some(detail) = fields.status_detail.as_mut() {
                for step in &authorized {
                    detail.mark_completed(&step.prev_status);
                }
            }
        } else {
            fields.enter(&next_status);
        }

        let stamp = ActorStamp {
            actor: request.actor.clone(),
            comment: request.comment.clone(),
            at,
        };
        if request.is_submit {
            fields.last_submit = Some(stamp);
        } else {
            fields.last_audit = Some(stamp);
        }

        let entries = audit_entries(
            &self.config,
            &authorized,
            &next_status,
            &request.comment,
            &request.actor,
            record_id,
            round_id,
            at,
        );
        self.collaborators.audit.append_batch(&entries)?;
        self.collaborators.on_transitioned.after_process(record)?;

        tracing::info!(
            flow_id = %self.config.flow_id,
            record_id = %record_id,
            action = %request.action,
            actor = %request.actor,
            prev_status = %state,
            next_status = %next_status,
            partial,
            "transition applied"
        );

        Ok(TransitionOutcome {
            steps: authorized,
            next_status,
            partial,
            round_id,
        })
    }

    /// Catalog edges leaving `state`. For AND-combinations, branches already
    /// logged in `round_id` (for `action`) are skipped.
    ///
    /// # Errors
    /// Returns [`FlowError::NoMatchingStep`] when nothing is left to match.
    pub fn find_current_steps(
        &self,
        state: &ApprovalState,
        action: Option<&str>,
        round_id: Option<RoundId>,
    ) -> Result<Vec<StepDefinition>, FlowError> {
        let action = action.filter(|value| !value.trim().is_empty());
        let candidates = match state {
            ApprovalState::And(members) => {
                let mut waiting = Vec::new();
                for member in members {
                    let handled = match round_id {
                        Some(round_id) => self
                            .collaborators
                            .audit
                            .find_one(&AuditLookup {
                                round_id,
                                action: action.map(str::to_string),
                                prev_status: member.clone(),
                            })?
                            .is_some(),
                        None => false,
                    };
                    if !handled {
                        waiting.push(member.as_str());
                    }
                }
                waiting
            }
            ApprovalState::Simple(_) | ApprovalState::Or(_) => state.members(),
        };

        if candidates.is_empty() {
            return Err(FlowError::no_matching_step(
                codes::NO_WAITING_BRANCH,
                format!("every branch of {state} is already handled in this round"),
            ));
        }

        tracing::debug!(status = %state, ?candidates, ?action, "looking up current steps");
        let steps = self
            .collaborators
            .catalog
            .list_steps(&self.config, &StepFilter::current(candidates, action))?;
        if steps.is_empty() {
            return Err(FlowError::no_matching_step(
                codes::NO_MATCHING_STEP,
                format!(
                    "no step leaves {state} via {}",
                    action.unwrap_or("any action")
                ),
            ));
        }
        Ok(steps)
    }

    /// Places a fresh record at the start edge's source status.
    ///
    /// # Errors
    /// Returns [`FlowError::Configuration`] unless exactly one start edge exists.
    pub fn init_approval_status(&self, record: &mut R) -> Result<String, FlowError> {
        let start = self.start_step()?;
        record.flow_state_mut().enter(&start.prev_status);
        Ok(start.prev_status)
    }

    /// # Errors
    /// Returns [`FlowError::Configuration`] unless exactly one start edge exists.
    pub fn initial_status(&self) -> Result<String, FlowError> {
        Ok(self.start_step()?.prev_status)
    }

    /// # Errors
    /// Returns [`FlowError::Configuration`] when no terminal-approved edge exists.
    pub fn approved_statuses(&self) -> Result<BTreeSet<String>, FlowError> {
        self.terminal_statuses(TerminalOutcome::Approved, codes::NO_APPROVED_STATUS)
    }

    /// # Errors
    /// Returns [`FlowError::Configuration`] when no terminal-rejected edge exists.
    pub fn rejected_statuses(&self) -> Result<BTreeSet<String>, FlowError> {
        self.terminal_statuses(TerminalOutcome::Rejected, codes::NO_REJECTED_STATUS)
    }

    /// Whether `actor` may act on `record` right now, with any action.
    ///
    /// # Errors
    /// Returns [`FlowError::InvalidArgument`] for a blank actor or record id
    /// and [`FlowError::MissingState`] when the record has no status.
    pub fn verify_handle_access(&self, record: &R, actor: &str) -> Result<bool, FlowError> {
        if actor.trim().is_empty() || record.record_id().trim().is_empty() {
            return Err(FlowError::invalid_argument(
                codes::ACCESS_QUERY_INVALID,
                "record id and actor MUST be non-empty",
            ));
        }
        let state = record.flow_state().approval_state().ok_or_else(|| {
            FlowError::missing_state(format!("record {} has no status", record.record_id()))
        })?;

        let steps = match self.find_current_steps(&state, None, record.flow_state().round_id) {
            Ok(steps) => steps,
            Err(err) if err.category() == ErrorCategory::NoMatchingStep => return Ok(false),
            Err(err) => return Err(err),
        };
        let authorized = self.collaborators.authorizer.authorize(&steps, actor)?;
        Ok(!authorized.is_empty())
    }

    /// Statuses a holder of `roles` has work in.
    ///
    /// # Errors
    /// Propagates catalog failures.
    pub fn todo_statuses(
        &self,
        scope: TodoScope,
        roles: Option<&BTreeSet<String>>,
    ) -> Result<BTreeSet<String>, FlowError> {
        let steps = self
            .collaborators
            .catalog
            .list_steps(&self.config, &StepFilter::all())?;
        Ok(collect_todo_statuses(&steps, scope, roles))
    }

    /// [`PendingPredicate`] over [`Self::todo_statuses`]; `None` when there
    /// is nothing pending.
    ///
    /// # Errors
    /// Propagates catalog failures.
    pub fn pending_predicate(
        &self,
        scope: TodoScope,
        roles: Option<&BTreeSet<String>>,
    ) -> Result<Option<PendingPredicate>, FlowError> {
        Ok(PendingPredicate::from_statuses(
            &self.todo_statuses(scope, roles)?,
        ))
    }

    /// Audit entries for `record`, newest first.
    ///
    /// # Errors
    /// Propagates audit store failures.
    pub fn history(
        &self,
        record: &R,
        current_round_only: bool,
    ) -> Result<Vec<AuditLogEntry>, FlowError> {
        let round_id = if current_round_only {
            match record.flow_state().round_id {
                Some(round_id) => Some(round_id),
                None => return Ok(Vec::new()),
            }
        } else {
            None
        };
        self.collaborators.audit.list(
            &AuditFilter {
                flow: self.config.clone(),
                record_id: record.record_id().to_string(),
                round_id,
            },
            LogOrder::Descending,
        )
    }

    /// Every forward edge plus the record's trace in its current round.
    ///
    /// # Errors
    /// See [`project_v1`].
    pub fn flow_meta_v1(&self, record: &R) -> Result<FlowRoot, FlowError> {
        let steps = self
            .collaborators
            .catalog
            .list_steps(&self.config, &StepFilter::forward())?;
        let flow_meta = project_v1(&steps)?;
        self.flow_root(record, FLOW_META_V1_CONTRACT, flow_meta)
    }

    /// The record's resolved path plus its trace in the current round.
    ///
    /// # Errors
    /// See [`project_v2`].
    pub fn flow_meta_v2(&self, record: &R) -> Result<FlowRoot, FlowError> {
        let steps = self
            .collaborators
            .catalog
            .list_steps(&self.config, &StepFilter::forward())?;
        let flow_meta = project_v2(&steps, self.collaborators.rules, &record.rule_context())?;
        self.flow_root(record, FLOW_META_V2_CONTRACT, flow_meta)
    }

    fn flow_root(
        &self,
        record: &R,
        contract_version: &str,
        flow_meta: Vec<FlowMetaEdge>,
    ) -> Result<FlowRoot, FlowError> {
        let trace = match record.flow_state().round_id {
            Some(round_id) => self.collaborators.audit.list(
                &AuditFilter {
                    flow: self.config.clone(),
                    record_id: record.record_id().to_string(),
                    round_id: Some(round_id),
                },
                LogOrder::Ascending,
            )?,
            None => Vec::new(),
        };
        Ok(FlowRoot {
            contract_version: contract_version.to_string(),
            flow_meta,
            flow_trace: trace_from_entries(&trace)?,
            approval_status: approval_status_snapshot(record.flow_state()),
        })
    }

    fn start_step(&self) -> Result<StepDefinition, FlowError> {
        let mut starts = self
            .collaborators
            .catalog
            .list_steps(&self.config, &StepFilter::start())?;
        match starts.len() {
            0 => Err(FlowError::configuration(
                codes::NO_START_NODE,
                format!(
                    "flow {}/{} has no start edge",
                    self.config.flow_id, self.config.entity_kind
                ),
            )),
            1 => Ok(starts.remove(0)),
            count => Err(FlowError::configuration(
                codes::MULTIPLE_START_NODES,
                format!(
                    "flow {}/{} has {count} start edges",
                    self.config.flow_id, self.config.entity_kind
                ),
            )),
        }
    }

    fn terminal_statuses(
        &self,
        outcome: TerminalOutcome,
        code: u32,
    ) -> Result<BTreeSet<String>, FlowError> {
        let statuses = self
            .collaborators
            .catalog
            .list_steps(&self.config, &StepFilter::terminal(outcome))?
            .into_iter()
            .map(|step| step.next_status)
            .filter(|status| !status.trim().is_empty())
            .collect::<BTreeSet<_>>();
        if statuses.is_empty() {
            return Err(FlowError::configuration(
                code,
                format!(
                    "flow {}/{} has no {} edge",
                    self.config.flow_id,
                    self.config.entity_kind,
                    match outcome {
                        TerminalOutcome::Approved => "terminal-approved",
                        TerminalOutcome::Rejected => "terminal-rejected",
                    }
                ),
            ));
        }
        Ok(statuses)
    }
}
