#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeSet;
use std::fmt::Display;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use approval_flow_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, validate_catalog, ActorStamp, ApprovalRound,
    AuditFilter, AuditLogEntry, AuditLogInput, AuditLookup, AuditStore, BranchAlias,
    CatalogStore, FlowConfig, FlowDocument, FlowError, FlowFields, LogOrder, PendingPredicate,
    RoundId, RoundStore, StatusDetail, StepDefinition, StepFilter,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};
use ulid::Ulid;

const FLOW_MIGRATION_VERSION: i64 = 1;

const SCHEMA_FLOW_V1: &str = r"
CREATE TABLE IF NOT EXISTS flow_steps (
  step_id INTEGER PRIMARY KEY AUTOINCREMENT,
  flow_id TEXT NOT NULL,
  entity_kind TEXT NOT NULL,
  prev_status TEXT NOT NULL,
  prev_status_alias TEXT,
  action TEXT NOT NULL,
  next_status TEXT NOT NULL,
  next_status_alias_json TEXT NOT NULL DEFAULT '[]',
  allowed_roles_json TEXT NOT NULL DEFAULT '[]',
  order_marker INTEGER NOT NULL,
  terminal_marker INTEGER NOT NULL DEFAULT 0 CHECK (terminal_marker IN (-1, 0, 1)),
  created_at TEXT NOT NULL,
  UNIQUE(flow_id, entity_kind, prev_status, action)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_flow_steps_single_start
  ON flow_steps(flow_id, entity_kind) WHERE order_marker = 1;

CREATE TABLE IF NOT EXISTS approval_rounds (
  round_id TEXT PRIMARY KEY,
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  change_record_json TEXT,
  change_recorded_at TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_approval_rounds_identity_frozen
BEFORE UPDATE OF round_id, created_by, created_at ON approval_rounds
BEGIN
  SELECT RAISE(FAIL, 'approval_rounds identity is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_approval_rounds_no_delete
BEFORE DELETE ON approval_rounds
BEGIN
  SELECT RAISE(FAIL, 'approval_rounds cannot be deleted');
END;

CREATE TABLE IF NOT EXISTS flow_logs (
  log_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  flow_id TEXT NOT NULL,
  entity_kind TEXT NOT NULL,
  prev_status TEXT NOT NULL,
  action TEXT NOT NULL,
  next_status TEXT NOT NULL,
  comment TEXT NOT NULL DEFAULT '',
  actor TEXT NOT NULL,
  record_id TEXT NOT NULL,
  round_id TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (round_id) REFERENCES approval_rounds(round_id)
);

CREATE TRIGGER IF NOT EXISTS trg_flow_logs_no_update
BEFORE UPDATE ON flow_logs
BEGIN
  SELECT RAISE(FAIL, 'flow_logs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_flow_logs_no_delete
BEFORE DELETE ON flow_logs
BEGIN
  SELECT RAISE(FAIL, 'flow_logs is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_flow_logs_round_prev_action
  ON flow_logs(round_id, prev_status, action);
CREATE INDEX IF NOT EXISTS idx_flow_logs_record_seq
  ON flow_logs(flow_id, entity_kind, record_id, log_seq);

CREATE TABLE IF NOT EXISTS flow_documents (
  record_id TEXT PRIMARY KEY,
  flow_id TEXT NOT NULL,
  entity_kind TEXT NOT NULL,
  name TEXT NOT NULL,
  fields_json TEXT NOT NULL DEFAULT '{}',
  status TEXT,
  status_detail_json TEXT,
  round_id TEXT,
  last_submit_json TEXT,
  last_audit_json TEXT,
  revision INTEGER NOT NULL DEFAULT 0 CHECK (revision >= 0),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_flow_documents_flow_status
  ON flow_documents(flow_id, entity_kind, status);
";

const STEP_COLUMNS: &str = "step_id, flow_id, entity_kind, prev_status, prev_status_alias, action,
  next_status, next_status_alias_json, allowed_roles_json, order_marker, terminal_marker";

const LOG_COLUMNS: &str = "log_seq, entry_id, flow_id, entity_kind, prev_status, action, next_status,
  comment, actor, record_id, round_id, created_at";

const DOCUMENT_COLUMNS: &str = "record_id, flow_id, entity_kind, name, fields_json, status,
  status_detail_json, round_id, last_submit_json, last_audit_json, revision, created_at, updated_at";

pub struct SqliteFlowStore {
    conn: Connection,
}

fn store_error(context: &str, err: impl Display) -> FlowError {
    FlowError::store(format!("{context}: {err}"))
}

impl SqliteFlowStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_FLOW_V1)
            .context("failed to apply approval flow schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![FLOW_MIGRATION_VERSION, now],
            )
            .context("failed to register approval flow schema migration")?;

        Ok(())
    }

    /// Runs `work` inside an IMMEDIATE transaction on this connection.
    /// Everything the engine writes through this store inside `work`
    /// commits or rolls back together.
    pub fn with_transaction<T, F>(&self, work: F) -> Result<T, FlowError>
    where
        F: FnOnce() -> Result<T, FlowError>,
    {
        let tx = rusqlite::Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(|err| store_error("failed to begin transaction", err))?;
        let value = work()?;
        tx.commit()
            .map_err(|err| store_error("failed to commit transaction", err))?;
        Ok(value)
    }

    /// Validates and stores `steps`. With `replace`, every flow present in
    /// `steps` is cleared first.
    pub fn import_catalog(&self, steps: &[StepDefinition], replace: bool) -> Result<usize> {
        validate_catalog(steps).map_err(|err| anyhow!("invalid catalog: {err}"))?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to begin catalog import")?;

        if replace {
            let flows = steps
                .iter()
                .map(|step| (step.flow_id.as_str(), step.entity_kind.as_str()))
                .collect::<BTreeSet<_>>();
            for (flow_id, entity_kind) in flows {
                tx.execute(
                    "DELETE FROM flow_steps WHERE flow_id = ?1 AND entity_kind = ?2",
                    params![flow_id, entity_kind],
                )
                .with_context(|| format!("failed to clear flow {flow_id}/{entity_kind}"))?;
            }
        }

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        for step in steps {
            let aliases = serde_json::to_string(&step.next_status_alias)
                .context("failed to serialize next_status_alias")?;
            let roles = serde_json::to_string(&step.allowed_roles)
                .context("failed to serialize allowed_roles")?;
            tx.execute(
                "INSERT INTO flow_steps(
                    flow_id, entity_kind, prev_status, prev_status_alias, action, next_status,
                    next_status_alias_json, allowed_roles_json, order_marker, terminal_marker, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    step.flow_id,
                    step.entity_kind,
                    step.prev_status,
                    step.prev_status_alias,
                    step.action,
                    step.next_status,
                    aliases,
                    roles,
                    step.order_marker,
                    step.terminal_marker,
                    now,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert step ({}, {}) for flow {}/{}",
                    step.prev_status, step.action, step.flow_id, step.entity_kind
                )
            })?;
        }

        tx.commit().context("failed to commit catalog import")?;
        tracing::info!(steps = steps.len(), replace, "catalog imported");
        Ok(steps.len())
    }

    pub fn list_flows(&self) -> Result<Vec<FlowConfig>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT flow_id, entity_kind FROM flow_steps ORDER BY flow_id, entity_kind",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FlowConfig::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        collect_rows(rows)
    }

    pub fn insert_document(&self, doc: &FlowDocument) -> Result<()> {
        let row = DocumentRow::encode(doc)?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO flow_documents({DOCUMENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    doc.record_id,
                    doc.flow_id,
                    doc.entity_kind,
                    doc.name,
                    row.fields_json,
                    doc.flow.status,
                    row.status_detail_json,
                    row.round_id,
                    row.last_submit_json,
                    row.last_audit_json,
                    doc.revision,
                    row.created_at,
                    row.updated_at,
                ],
            )
            .with_context(|| format!("failed to insert document {}", doc.record_id))?;
        Ok(())
    }

    pub fn get_document(&self, record_id: &str) -> Result<Option<FlowDocument>> {
        self.conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM flow_documents WHERE record_id = ?1"),
                params![record_id],
                parse_document_row,
            )
            .optional()
            .with_context(|| format!("failed to load document {record_id}"))
    }

    /// Persists `doc` only if nobody saved it since it was read.
    pub fn save_document(&self, doc: &FlowDocument) -> Result<(), FlowError> {
        let row = DocumentRow::encode(doc).map_err(|err| store_error("failed to encode document", err))?;
        let changed = self
            .conn
            .execute(
                "UPDATE flow_documents SET
                    name = ?1,
                    fields_json = ?2,
                    status = ?3,
                    status_detail_json = ?4,
                    round_id = ?5,
                    last_submit_json = ?6,
                    last_audit_json = ?7,
                    revision = revision + 1,
                    updated_at = ?8
                 WHERE record_id = ?9 AND revision = ?10",
                params![
                    doc.name,
                    row.fields_json,
                    doc.flow.status,
                    row.status_detail_json,
                    row.round_id,
                    row.last_submit_json,
                    row.last_audit_json,
                    format_rfc3339(now_utc())?,
                    doc.record_id,
                    doc.revision,
                ],
            )
            .map_err(|err| store_error("failed to save document", err))?;

        if changed == 1 {
            return Ok(());
        }

        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM flow_documents WHERE record_id = ?1",
                params![doc.record_id],
                |_| Ok(()),
            )
            .optional()
            .map_err(|err| store_error("failed to check document", err))?
            .is_some();
        if exists {
            Err(FlowError::conflict(format!(
                "document {} changed since revision {}",
                doc.record_id, doc.revision
            )))
        } else {
            Err(FlowError::store(format!("document {} not found", doc.record_id)))
        }
    }

    pub fn list_documents(&self, flow: &FlowConfig) -> Result<Vec<FlowDocument>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM flow_documents
             WHERE flow_id = ?1 AND entity_kind = ?2
             ORDER BY created_at ASC, record_id ASC"
        ))?;
        let rows = stmt.query_map(params![flow.flow_id, flow.entity_kind], parse_document_row)?;
        collect_rows(rows)
    }

    /// Documents of `flow` whose completion map leaves a branch of
    /// `predicate` pending.
    pub fn list_pending_documents(
        &self,
        flow: &FlowConfig,
        predicate: &PendingPredicate,
    ) -> Result<Vec<FlowDocument>> {
        let Some((clause, paths)) = pending_clause("status_detail_json", predicate) else {
            return Ok(self
                .list_documents(flow)?
                .into_iter()
                .filter(|doc| {
                    doc.flow
                        .status_detail
                        .as_ref()
                        .is_some_and(|detail| predicate.matches(detail))
                })
                .collect());
        };

        let mut values = vec![flow.flow_id.clone(), flow.entity_kind.clone()];
        values.extend(paths);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM flow_documents
             WHERE flow_id = ?1 AND entity_kind = ?2 AND {clause}
             ORDER BY created_at ASC, record_id ASC"
        ))?;
        let rows = stmt.query_map(params_from_iter(values.iter()), parse_document_row)?;
        collect_rows(rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// `(json_extract(column, ?3) = 0 OR ...)` plus the bound JSON paths.
///
/// Returns `None` when a branch name cannot be written as a JSON path; callers
/// then evaluate [`PendingPredicate::matches`] in memory.
#[must_use]
pub fn pending_clause(column: &str, predicate: &PendingPredicate) -> Option<(String, Vec<String>)> {
    let mut terms = Vec::new();
    let mut paths = Vec::new();
    for (offset, branch) in predicate.branches().enumerate() {
        if branch.contains('"') {
            return None;
        }
        terms.push(format!("json_extract({column}, ?{}) = 0", offset + 3));
        paths.push(format!("$.\"{branch}\""));
    }
    Some((format!("({})", terms.join(" OR ")), paths))
}

impl CatalogStore for SqliteFlowStore {
    fn list_steps(
        &self,
        flow: &FlowConfig,
        filter: &StepFilter,
    ) -> Result<Vec<StepDefinition>, FlowError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM flow_steps
                 WHERE flow_id = ?1 AND entity_kind = ?2
                 ORDER BY order_marker ASC, step_id ASC"
            ))
            .map_err(|err| store_error("failed to prepare step query", err))?;
        let rows = stmt
            .query_map(params![flow.flow_id, flow.entity_kind], parse_step_row)
            .map_err(|err| store_error("failed to query steps", err))?;
        let steps = collect_rows(rows).map_err(|err| store_error("failed to read steps", err))?;
        Ok(steps.into_iter().filter(|step| filter.matches(step)).collect())
    }
}

impl AuditStore for SqliteFlowStore {
    fn find_one(&self, lookup: &AuditLookup) -> Result<Option<AuditLogEntry>, FlowError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM flow_logs
                     WHERE round_id = ?1 AND prev_status = ?2 AND (?3 IS NULL OR action = ?3)
                     ORDER BY log_seq ASC
                     LIMIT 1"
                ),
                params![lookup.round_id.to_string(), lookup.prev_status, lookup.action],
                parse_log_row,
            )
            .optional()
            .map_err(|err| store_error("failed to look up audit entry", err))
    }

    fn list(&self, filter: &AuditFilter, order: LogOrder) -> Result<Vec<AuditLogEntry>, FlowError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {LOG_COLUMNS} FROM flow_logs
                 WHERE flow_id = ?1 AND entity_kind = ?2 AND record_id = ?3
                   AND (?4 IS NULL OR round_id = ?4)
                 ORDER BY log_seq ASC"
            ))
            .map_err(|err| store_error("failed to prepare audit query", err))?;
        let rows = stmt
            .query_map(
                params![
                    filter.flow.flow_id,
                    filter.flow.entity_kind,
                    filter.record_id,
                    filter.round_id.map(|round| round.to_string()),
                ],
                parse_log_row,
            )
            .map_err(|err| store_error("failed to query audit entries", err))?;
        let mut entries =
            collect_rows(rows).map_err(|err| store_error("failed to read audit entries", err))?;
        entries.sort_by_key(|entry| (entry.created_at, entry.seq));
        if order == LogOrder::Descending {
            entries.reverse();
        }
        Ok(entries)
    }

    fn append_batch(&self, entries: &[AuditLogInput]) -> Result<Vec<AuditLogEntry>, FlowError> {
        let own_tx = if self.conn.is_autocommit() {
            Some(
                self.conn
                    .unchecked_transaction()
                    .map_err(|err| store_error("failed to begin audit append", err))?,
            )
        } else {
            None
        };

        let mut appended = Vec::with_capacity(entries.len());
        for input in entries {
            let entry_id = Ulid::new();
            let created_at = format_rfc3339(input.created_at)?;
            self.conn
                .execute(
                    "INSERT INTO flow_logs(
                        entry_id, flow_id, entity_kind, prev_status, action, next_status,
                        comment, actor, record_id, round_id, created_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        entry_id.to_string(),
                        input.flow_id,
                        input.entity_kind,
                        input.prev_status,
                        input.action,
                        input.next_status,
                        input.comment,
                        input.actor,
                        input.record_id,
                        input.round_id.map(|round| round.to_string()),
                        created_at,
                    ],
                )
                .map_err(|err| store_error("failed to append audit entry", err))?;
            appended.push(AuditLogEntry {
                seq: self.conn.last_insert_rowid(),
                entry_id,
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
            });
        }

        if let Some(tx) = own_tx {
            tx.commit()
                .map_err(|err| store_error("failed to commit audit append", err))?;
        }
        Ok(appended)
    }
}

impl RoundStore for SqliteFlowStore {
    fn create_round(&self, actor: &str) -> Result<ApprovalRound, FlowError> {
        let round = ApprovalRound {
            round_id: RoundId::new(),
            created_by: actor.to_string(),
            created_at: now_utc(),
            change_record: None,
        };
        self.conn
            .execute(
                "INSERT INTO approval_rounds(round_id, created_by, created_at) VALUES (?1, ?2, ?3)",
                params![
                    round.round_id.to_string(),
                    round.created_by,
                    format_rfc3339(round.created_at)?,
                ],
            )
            .map_err(|err| store_error("failed to create round", err))?;
        Ok(round)
    }

    fn get_round(&self, round_id: RoundId) -> Result<Option<ApprovalRound>, FlowError> {
        self.conn
            .query_row(
                "SELECT round_id, created_by, created_at, change_record_json
                 FROM approval_rounds WHERE round_id = ?1",
                params![round_id.to_string()],
                parse_round_row,
            )
            .optional()
            .map_err(|err| store_error("failed to load round", err))
    }

    fn record_change_snapshot(
        &self,
        round_id: RoundId,
        payload: &Value,
    ) -> Result<(), FlowError> {
        let json = serde_json::to_string(payload)
            .map_err(|err| store_error("failed to serialize change record", err))?;
        let changed = self
            .conn
            .execute(
                "UPDATE approval_rounds SET change_record_json = ?1, change_recorded_at = ?2
                 WHERE round_id = ?3",
                params![json, format_rfc3339(now_utc())?, round_id.to_string()],
            )
            .map_err(|err| store_error("failed to record change snapshot", err))?;
        if changed == 0 {
            return Err(FlowError::store(format!("round {round_id} not found")));
        }
        Ok(())
    }
}

struct DocumentRow {
    fields_json: String,
    status_detail_json: Option<String>,
    round_id: Option<String>,
    last_submit_json: Option<String>,
    last_audit_json: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DocumentRow {
    fn encode(doc: &FlowDocument) -> Result<Self> {
        let encode_stamp = |stamp: &Option<ActorStamp>| -> Result<Option<String>> {
            stamp
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("failed to serialize actor stamp")
        };
        Ok(Self {
            fields_json: serde_json::to_string(&doc.fields)
                .context("failed to serialize document fields")?,
            status_detail_json: doc
                .flow
                .status_detail
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("failed to serialize status detail")?,
            round_id: doc.flow.round_id.map(|round| round.to_string()),
            last_submit_json: encode_stamp(&doc.flow.last_submit)?,
            last_audit_json: encode_stamp(&doc.flow.last_audit)?,
            created_at: format_rfc3339(doc.created_at).map_err(|err| anyhow!(err.to_string()))?,
            updated_at: format_rfc3339(doc.updated_at).map_err(|err| anyhow!(err.to_string()))?,
        })
    }
}

fn conversion_error(column: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    column: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|err| {
        conversion_error(
            column,
            rusqlite::types::Type::Text,
            format!("invalid JSON in column {column}: {err}"),
        )
    })
}

fn optional_json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    column: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|err| {
            conversion_error(
                column,
                rusqlite::types::Type::Text,
                format!("invalid JSON in column {column}: {err}"),
            )
        })
    })
    .transpose()
}

fn timestamp_column(
    row: &rusqlite::Row<'_>,
    column: usize,
) -> rusqlite::Result<time::OffsetDateTime> {
    let raw: String = row.get(column)?;
    parse_rfc3339_utc(&raw)
        .map_err(|err| conversion_error(column, rusqlite::types::Type::Text, err.to_string()))
}

fn round_column(row: &rusqlite::Row<'_>, column: usize) -> rusqlite::Result<Option<RoundId>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|raw| {
        RoundId::parse(&raw)
            .map_err(|err| conversion_error(column, rusqlite::types::Type::Text, err.to_string()))
    })
    .transpose()
}

fn parse_step_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepDefinition> {
    let next_status_alias: Vec<BranchAlias> = json_column(row, 7)?;
    let allowed_roles: Vec<String> = json_column(row, 8)?;
    Ok(StepDefinition {
        flow_id: row.get(1)?,
        entity_kind: row.get(2)?,
        prev_status: row.get(3)?,
        prev_status_alias: row.get(4)?,
        action: row.get(5)?,
        next_status: row.get(6)?,
        next_status_alias,
        allowed_roles,
        order_marker: row.get(9)?,
        terminal_marker: row.get(10)?,
    })
}

fn parse_log_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    let entry_id_raw: String = row.get(1)?;
    let entry_id = Ulid::from_string(&entry_id_raw).map_err(|err| {
        conversion_error(
            1,
            rusqlite::types::Type::Text,
            format!("invalid entry_id {entry_id_raw}: {err}"),
        )
    })?;
    Ok(AuditLogEntry {
        seq: row.get(0)?,
        entry_id,
        flow_id: row.get(2)?,
        entity_kind: row.get(3)?,
        prev_status: row.get(4)?,
        action: row.get(5)?,
        next_status: row.get(6)?,
        comment: row.get(7)?,
        actor: row.get(8)?,
        record_id: row.get(9)?,
        round_id: round_column(row, 10)?,
        created_at: timestamp_column(row, 11)?,
    })
}

fn parse_round_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRound> {
    let round_id = round_column(row, 0)?.ok_or_else(|| {
        conversion_error(0, rusqlite::types::Type::Null, "round_id is NULL".to_string())
    })?;
    Ok(ApprovalRound {
        round_id,
        created_by: row.get(1)?,
        created_at: timestamp_column(row, 2)?,
        change_record: optional_json_column(row, 3)?,
    })
}

fn parse_document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowDocument> {
    let fields: Map<String, Value> = json_column(row, 4)?;
    let status_detail: Option<StatusDetail> = optional_json_column(row, 6)?;
    Ok(FlowDocument {
        record_id: row.get(0)?,
        flow_id: row.get(1)?,
        entity_kind: row.get(2)?,
        name: row.get(3)?,
        fields,
        flow: FlowFields {
            status: row.get(5)?,
            status_detail,
            round_id: round_column(row, 7)?,
            last_submit: optional_json_column(row, 8)?,
            last_audit: optional_json_column(row, 9)?,
        },
        revision: row.get(10)?,
        created_at: timestamp_column(row, 11)?,
        updated_at: timestamp_column(row, 12)?,
    })
}

fn collect_rows<T, F>(rows: rusqlite::MappedRows<'_, F>) -> Result<Vec<T>>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
