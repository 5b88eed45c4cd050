//! `flowctl`: drives approval flows whose catalog, records, rounds and audit
//! log live in one `SQLite` database.
//!
//! Hosts embed it through [`run_cli`] (parsed arguments) or [`run_with_store`]
//! (an already migrated [`SqliteFlowStore`]). Every command prints pretty JSON
//! on stdout; failures are rendered by [`render_error`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use approval_flow_core::{
    codes, load_catalog_from_path, load_role_directory_from_path, AuditLogEntry, CatalogStore,
    FlowCollaborators, FlowConfig, FlowDocument, FlowEngine, FlowError, LiquidRuleResolver,
    OnTransitioned, RoleDirectory, RoleMembershipPolicy, RoundStore, StepDefinition, StepFilter,
    TodoScope, TransitionOutcome, TransitionRequest,
};
use approval_flow_store_sqlite::SqliteFlowStore;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const TRANSITION_CONTRACT: &str = "transition_outcome.v1";
pub const STATUSES_CONTRACT: &str = "flow_statuses.v1";
pub const TODO_CONTRACT: &str = "todo_statuses.v1";

#[derive(Debug, Parser)]
#[command(name = "flowctl")]
#[command(about = "Approval flow engine CLI")]
pub struct Cli {
    #[arg(long, default_value = "./approval_flow.sqlite3")]
    db: PathBuf,

    /// YAML role directory; read only by commands that authorize an actor.
    #[arg(long, default_value = "./flow_roles.yaml")]
    roles: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Catalog {
        #[command(subcommand)]
        command: Box<CatalogCommand>,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    Todo(TodoArgs),
}

#[derive(Debug, Subcommand)]
pub enum CatalogCommand {
    Import(ImportArgs),
    List(FlowArgs),
    Statuses(FlowArgs),
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    replace: bool,
}

#[derive(Debug, Clone, Args)]
pub struct FlowArgs {
    #[arg(long = "flow")]
    flow_id: String,
    #[arg(long = "entity")]
    entity_kind: String,
}

impl FlowArgs {
    fn config(&self) -> FlowConfig {
        FlowConfig::new(self.flow_id.clone(), self.entity_kind.clone())
    }
}

#[derive(Debug, Subcommand)]
pub enum RecordCommand {
    Create(CreateArgs),
    Show(RecordArgs),
    List(ListArgs),
    Submit(LifecycleArgs),
    Resubmit(LifecycleArgs),
    Approve(LifecycleArgs),
    Reject(LifecycleArgs),
    Process(ProcessArgs),
    Access(AccessArgs),
    History(HistoryArgs),
    Meta(MetaArgs),
    Snapshot(SnapshotArgs),
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    #[command(flatten)]
    flow: FlowArgs,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "{}")]
    fields_json: String,
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[command(flatten)]
    flow: FlowArgs,
    /// Only records waiting on this actor.
    #[arg(long)]
    pending_for: Option<String>,
    #[arg(long, value_enum, default_value_t = ScopeArg::All)]
    scope: ScopeArg,
}

#[derive(Debug, Args)]
pub struct LifecycleArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    actor: String,
    #[arg(long, default_value = "")]
    comment: String,
    /// Catalog action name, when it differs from the command name.
    #[arg(long)]
    action: Option<String>,
}

#[derive(Debug, Args)]
pub struct ProcessArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    action: String,
    #[arg(long)]
    actor: String,
    #[arg(long, default_value = "")]
    comment: String,
    #[arg(long)]
    submit: bool,
    #[arg(long)]
    restart: bool,
}

#[derive(Debug, Args)]
pub struct AccessArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    current_round: bool,
}

#[derive(Debug, Args)]
pub struct MetaArgs {
    #[arg(long)]
    id: String,
    #[arg(long, value_enum, default_value_t = MetaViewArg::V1)]
    view: MetaViewArg,
}

#[derive(Debug, Args)]
pub struct SnapshotArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    payload_json: String,
}

#[derive(Debug, Args)]
pub struct TodoArgs {
    #[command(flatten)]
    flow: FlowArgs,
    #[arg(long, value_enum, default_value_t = ScopeArg::All)]
    scope: ScopeArg,
    #[arg(long)]
    actor: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ScopeArg {
    All,
    PendingSubmit,
    PendingApproval,
}

impl From<ScopeArg> for TodoScope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::All => Self::All,
            ScopeArg::PendingSubmit => Self::PendingSubmit,
            ScopeArg::PendingApproval => Self::PendingApproval,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MetaViewArg {
    V1,
    V2,
}

/// The four lifecycle commands and the status each one may start from.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Lifecycle {
    Submit,
    Resubmit,
    Approve,
    Reject,
}

impl Lifecycle {
    #[must_use]
    pub fn default_action(self) -> &'static str {
        match self {
            Self::Submit => "Submit",
            Self::Resubmit => "Resubmit",
            Self::Approve => "Approve",
            Self::Reject => "Reject",
        }
    }

    #[must_use]
    pub fn request(self, action: &str, actor: &str, comment: &str) -> TransitionRequest {
        match self {
            Self::Submit | Self::Resubmit => TransitionRequest::submit(action, actor, comment),
            Self::Approve | Self::Reject => TransitionRequest::review(action, actor, comment),
        }
    }
}

/// Statuses the lifecycle guards compare against.
#[derive(Debug, Clone, Default)]
pub struct GuardStatuses {
    pub initial: String,
    pub approved: BTreeSet<String>,
    pub rejected: BTreeSet<String>,
}

/// Rejects lifecycle commands issued from the wrong status.
///
/// # Errors
/// Returns [`FlowError::InvalidTransition`] when `status` does not permit
/// `lifecycle`.
pub fn check_lifecycle_guard(
    lifecycle: Lifecycle,
    status: Option<&str>,
    statuses: &GuardStatuses,
) -> Result<(), FlowError> {
    let current = status.unwrap_or_default();
    let permitted = match lifecycle {
        Lifecycle::Submit => current.eq_ignore_ascii_case(&statuses.initial),
        Lifecycle::Resubmit => statuses.rejected.contains(current),
        Lifecycle::Approve | Lifecycle::Reject => {
            !current.eq_ignore_ascii_case(&statuses.initial)
                && !statuses.approved.contains(current)
                && !statuses.rejected.contains(current)
        }
    };
    if permitted {
        Ok(())
    } else {
        Err(FlowError::invalid_transition(format!(
            "cannot {} from status {current:?}",
            lifecycle.default_action().to_ascii_lowercase()
        )))
    }
}

/// Stderr payload for a failed command.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ErrorEnvelope {
    pub code: Option<u32>,
    pub category: Option<String>,
    pub message: String,
}

#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> ErrorEnvelope {
    match err.downcast_ref::<FlowError>() {
        Some(flow_err) => ErrorEnvelope {
            code: Some(flow_err.code()),
            category: Some(flow_err.category().as_str().to_string()),
            message: format!("{err:#}"),
        },
        None => ErrorEnvelope {
            code: None,
            category: None,
            message: format!("{err:#}"),
        },
    }
}

#[must_use]
pub fn render_error(err: &anyhow::Error) -> String {
    let envelope = error_envelope(err);
    serde_json::to_string_pretty(&envelope).unwrap_or(envelope.message)
}

/// Installs the stderr log subscriber; `RUST_LOG` overrides the `warn` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

#[derive(Debug, Serialize)]
struct TransitionReport {
    contract_version: &'static str,
    record_id: String,
    outcome: TransitionOutcome,
    record: FlowDocument,
}

#[derive(Debug, Serialize)]
struct StatusesReport {
    contract_version: &'static str,
    flow_id: String,
    entity_kind: String,
    initial_status: String,
    approved_statuses: BTreeSet<String>,
    rejected_statuses: BTreeSet<String>,
}

#[derive(Debug, Serialize)]
struct TodoReport {
    contract_version: &'static str,
    flow_id: String,
    entity_kind: String,
    scope: TodoScope,
    actor: Option<String>,
    statuses: BTreeSet<String>,
}

#[derive(Debug, Serialize)]
struct AccessReport {
    record_id: String,
    actor: String,
    allowed: bool,
}

#[derive(Debug, Serialize)]
struct ImportReport {
    file: String,
    imported_steps: usize,
    replace: bool,
}

/// Engine wiring for one command: the store is every collaborator, and each
/// applied transition is saved back through it.
struct Runtime<'s> {
    store: &'s SqliteFlowStore,
    policy: RoleMembershipPolicy,
    rules: LiquidRuleResolver,
}

impl<'s> Runtime<'s> {
    fn new(store: &'s SqliteFlowStore, directory: RoleDirectory) -> Result<Self> {
        Ok(Self {
            store,
            policy: RoleMembershipPolicy::new(directory),
            rules: LiquidRuleResolver::new()?,
        })
    }

    fn engine(&self, flow: FlowConfig) -> Result<FlowEngine<'_, FlowDocument>> {
        let engine = FlowEngine::new(
            flow,
            FlowCollaborators {
                catalog: self.store,
                audit: self.store,
                rounds: self.store,
                authorizer: &self.policy,
                rules: &self.rules,
                on_transitioned: self,
            },
        )?;
        Ok(engine)
    }

    fn roles_of(&self, actor: &str) -> BTreeSet<String> {
        self.policy
            .directory()
            .roles_of(actor)
            .cloned()
            .unwrap_or_default()
    }
}

impl OnTransitioned<FlowDocument> for Runtime<'_> {
    fn after_process(&self, record: &FlowDocument) -> Result<(), FlowError> {
        self.store.save_document(record)
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate, role loading or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = SqliteFlowStore::open(&cli.db)?;
    store.migrate()?;
    run_with_store(cli.command, &store, &cli.roles)
}

/// Executes a parsed command against an existing, migrated store.
///
/// # Errors
/// Returns an error when the command fails; engine failures keep their
/// [`FlowError`] so [`error_envelope`] can report the code.
pub fn run_with_store(command: Command, store: &SqliteFlowStore, roles: &Path) -> Result<()> {
    match command {
        Command::Catalog { command } => run_catalog(*command, store),
        Command::Record { command } => run_record(*command, store, roles),
        Command::Todo(args) => {
            let runtime = Runtime::new(store, load_roles(roles)?)?;
            let engine = runtime.engine(args.flow.config())?;
            let statuses = match &args.actor {
                Some(actor) => {
                    let roles = runtime.roles_of(actor);
                    if roles.is_empty() {
                        BTreeSet::new()
                    } else {
                        engine.todo_statuses(args.scope.into(), Some(&roles))?
                    }
                }
                None => engine.todo_statuses(args.scope.into(), None)?,
            };
            print_json(&TodoReport {
                contract_version: TODO_CONTRACT,
                flow_id: args.flow.flow_id,
                entity_kind: args.flow.entity_kind,
                scope: args.scope.into(),
                actor: args.actor,
                statuses,
            })
        }
    }
}

fn run_catalog(command: CatalogCommand, store: &SqliteFlowStore) -> Result<()> {
    match command {
        CatalogCommand::Import(args) => {
            let steps = load_catalog_from_path(&args.file)?;
            let imported_steps = store.import_catalog(&steps, args.replace)?;
            print_json(&ImportReport {
                file: args.file.display().to_string(),
                imported_steps,
                replace: args.replace,
            })
        }
        CatalogCommand::List(args) => {
            let steps: Vec<StepDefinition> = store.list_steps(&args.config(), &StepFilter::all())?;
            print_json(&steps)
        }
        CatalogCommand::Statuses(args) => {
            let runtime = Runtime::new(store, RoleDirectory::default())?;
            let engine = runtime.engine(args.config())?;
            print_json(&StatusesReport {
                contract_version: STATUSES_CONTRACT,
                flow_id: args.flow_id,
                entity_kind: args.entity_kind,
                initial_status: engine.initial_status()?,
                approved_statuses: engine.approved_statuses()?,
                rejected_statuses: engine.rejected_statuses()?,
            })
        }
    }
}

fn run_record(command: RecordCommand, store: &SqliteFlowStore, roles: &Path) -> Result<()> {
    match command {
        RecordCommand::Create(args) => {
            let fields = parse_fields_json(&args.fields_json)?;
            let runtime = Runtime::new(store, RoleDirectory::default())?;
            let engine = runtime.engine(args.flow.config())?;
            let mut doc = FlowDocument::new(&args.flow.config(), args.name, fields);
            engine.init_approval_status(&mut doc)?;
            store.insert_document(&doc)?;
            print_json(&doc)
        }
        RecordCommand::Show(args) => print_json(&load_document(store, &args.id)?),
        RecordCommand::List(args) => {
            let flow = args.flow.config();
            let docs = match &args.pending_for {
                Some(actor) => {
                    let runtime = Runtime::new(store, load_roles(roles)?)?;
                    let engine = runtime.engine(flow.clone())?;
                    let actor_roles = runtime.roles_of(actor);
                    if actor_roles.is_empty() {
                        Vec::new()
                    } else {
                        match engine.pending_predicate(args.scope.into(), Some(&actor_roles))? {
                            Some(predicate) => store.list_pending_documents(&flow, &predicate)?,
                            None => Vec::new(),
                        }
                    }
                }
                None => store.list_documents(&flow)?,
            };
            print_json(&docs)
        }
        RecordCommand::Submit(args) => run_lifecycle(store, roles, Lifecycle::Submit, &args),
        RecordCommand::Resubmit(args) => run_lifecycle(store, roles, Lifecycle::Resubmit, &args),
        RecordCommand::Approve(args) => run_lifecycle(store, roles, Lifecycle::Approve, &args),
        RecordCommand::Reject(args) => run_lifecycle(store, roles, Lifecycle::Reject, &args),
        RecordCommand::Process(args) => {
            let request = TransitionRequest {
                action: args.action,
                actor: args.actor,
                comment: args.comment,
                is_submit: args.submit,
                is_restart: args.restart,
            };
            let report = run_transition(store, roles, &args.id, None, &request)?;
            print_json(&report)
        }
        RecordCommand::Access(args) => {
            let doc = load_document(store, &args.id)?;
            let runtime = Runtime::new(store, load_roles(roles)?)?;
            let engine = runtime.engine(doc.flow_config())?;
            let allowed = engine.verify_handle_access(&doc, &args.actor)?;
            print_json(&AccessReport {
                record_id: doc.record_id,
                actor: args.actor,
                allowed,
            })
        }
        RecordCommand::History(args) => {
            let doc = load_document(store, &args.id)?;
            let runtime = Runtime::new(store, RoleDirectory::default())?;
            let engine = runtime.engine(doc.flow_config())?;
            let entries: Vec<AuditLogEntry> = engine.history(&doc, args.current_round)?;
            print_json(&entries)
        }
        RecordCommand::Meta(args) => {
            let doc = load_document(store, &args.id)?;
            let runtime = Runtime::new(store, RoleDirectory::default())?;
            let engine = runtime.engine(doc.flow_config())?;
            let root = match args.view {
                MetaViewArg::V1 => engine.flow_meta_v1(&doc)?,
                MetaViewArg::V2 => engine.flow_meta_v2(&doc)?,
            };
            print_json(&root)
        }
        RecordCommand::Snapshot(args) => {
            let payload = parse_payload_json(&args.payload_json)?;
            let doc = load_document(store, &args.id)?;
            let Some(round_id) = doc.flow.round_id else {
                return Err(anyhow!("record {} has not been submitted", doc.record_id));
            };
            store.record_change_snapshot(round_id, &payload)?;
            let round = store
                .get_round(round_id)?
                .ok_or_else(|| anyhow!("round {round_id} not found"))?;
            print_json(&round)
        }
    }
}

fn run_lifecycle(
    store: &SqliteFlowStore,
    roles: &Path,
    lifecycle: Lifecycle,
    args: &LifecycleArgs,
) -> Result<()> {
    let action = args
        .action
        .as_deref()
        .unwrap_or_else(|| lifecycle.default_action());
    let request = lifecycle.request(action, &args.actor, &args.comment);
    let report = run_transition(store, roles, &args.id, Some(lifecycle), &request)?;
    print_json(&report)
}

fn run_transition(
    store: &SqliteFlowStore,
    roles: &Path,
    record_id: &str,
    lifecycle: Option<Lifecycle>,
    request: &TransitionRequest,
) -> Result<TransitionReport> {
    let flow = load_document(store, record_id)?.flow_config();
    let runtime = Runtime::new(store, load_roles(roles)?)?;
    let engine = runtime.engine(flow)?;

    let outcome = store.with_transaction(|| {
        let mut doc = store
            .get_document(record_id)
            .map_err(|err| FlowError::store(format!("{err:#}")))?
            .ok_or_else(|| FlowError::store(format!("record {record_id} not found")))?;
        if let Some(lifecycle) = lifecycle {
            let statuses = guard_statuses(&engine, lifecycle)?;
            check_lifecycle_guard(lifecycle, doc.flow.current_status(), &statuses)?;
        }
        engine.process(&mut doc, request)
    })?;

    Ok(TransitionReport {
        contract_version: TRANSITION_CONTRACT,
        record_id: record_id.to_string(),
        outcome,
        record: load_document(store, record_id)?,
    })
}

fn guard_statuses(
    engine: &FlowEngine<'_, FlowDocument>,
    lifecycle: Lifecycle,
) -> Result<GuardStatuses, FlowError> {
    Ok(match lifecycle {
        Lifecycle::Submit => GuardStatuses {
            initial: engine.initial_status()?,
            ..GuardStatuses::default()
        },
        Lifecycle::Resubmit => GuardStatuses {
            rejected: engine.rejected_statuses()?,
            ..GuardStatuses::default()
        },
        Lifecycle::Approve | Lifecycle::Reject => GuardStatuses {
            initial: engine.initial_status()?,
            approved: engine.approved_statuses()?,
            rejected: engine.rejected_statuses()?,
        },
    })
}

fn load_document(store: &SqliteFlowStore, record_id: &str) -> Result<FlowDocument> {
    if record_id.trim().is_empty() {
        return Err(FlowError::invalid_argument(codes::RECORD_ID_MISSING, "record id is blank").into());
    }
    store
        .get_document(record_id)?
        .ok_or_else(|| anyhow!("record {record_id} not found"))
}

fn load_roles(path: &Path) -> Result<RoleDirectory> {
    let directory = load_role_directory_from_path(path)
        .with_context(|| format!("failed to load roles from {}", path.display()))?;
    tracing::debug!(path = %path.display(), users = directory.users.len(), "role directory loaded");
    Ok(directory)
}

fn parse_payload_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("payload_json must be valid JSON: {raw}"))
}

fn parse_fields_json(raw: &str) -> Result<Map<String, Value>> {
    match parse_payload_json(raw)? {
        Value::Object(fields) => Ok(fields),
        other => Err(anyhow!("fields_json must be a JSON object, got {other}")),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
