use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::error::FlowError;
use crate::now_utc;
use crate::record::FlowRecord;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RoundId(pub Ulid);

impl RoundId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`FlowError::Store`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, FlowError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| FlowError::store(format!("invalid round id {value}: {err}")))
    }
}

impl Default for RoundId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RoundId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One submit-to-resolution cycle of a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRound {
    pub round_id: RoundId,
    pub created_by: String,
    #[serde(with = "crate::rfc3339")]
    pub created_at: OffsetDateTime,
    pub change_record: Option<Value>,
}

#[allow(clippy::missing_errors_doc)]
pub trait RoundStore {
    fn create_round(&self, actor: &str) -> Result<ApprovalRound, FlowError>;

    fn get_round(&self, round_id: RoundId) -> Result<Option<ApprovalRound>, FlowError>;

    /// Attaches a change snapshot to an existing round. This is the only
    /// mutation a round ever sees.
    fn record_change_snapshot(&self, round_id: RoundId, payload: &Value)
        -> Result<(), FlowError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRoundStore {
    rounds: Mutex<BTreeMap<RoundId, ApprovalRound>>,
}

impl InMemoryRoundStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<RoundId, ApprovalRound>>, FlowError> {
        self.rounds
            .lock()
            .map_err(|_| FlowError::store("round store lock poisoned"))
    }
}

impl RoundStore for InMemoryRoundStore {
    fn create_round(&self, actor: &str) -> Result<ApprovalRound, FlowError> {
        let round = ApprovalRound {
            round_id: RoundId::new(),
            created_by: actor.to_string(),
            created_at: now_utc(),
            change_record: None,
        };
        self.lock()?.insert(round.round_id, round.clone());
        Ok(round)
    }

    fn get_round(&self, round_id: RoundId) -> Result<Option<ApprovalRound>, FlowError> {
        Ok(self.lock()?.get(&round_id).cloned())
    }

    fn record_change_snapshot(
        &self,
        round_id: RoundId,
        payload: &Value,
    ) -> Result<(), FlowError> {
        let mut rounds = self.lock()?;
        let round = rounds
            .get_mut(&round_id)
            .ok_or_else(|| FlowError::store(format!("round {round_id} not found")))?;
        round.change_record = Some(payload.clone());
        Ok(())
    }
}

/// Starts a fresh round and points `record` at it when `is_restart`,
/// otherwise returns the record's current round. A record that was never
/// submitted has none. Call it only once the transition is accepted.
///
/// # Errors
/// Propagates [`RoundStore::create_round`] failures.
pub fn ensure_round<R: FlowRecord + ?Sized>(
    rounds: &dyn RoundStore,
    record: &mut R,
    is_restart: bool,
    actor: &str,
) -> Result<Option<RoundId>, FlowError> {
    if is_restart {
        let round = rounds.create_round(actor)?;
        tracing::debug!(
            record_id = record.record_id(),
            round_id = %round.round_id,
            "started approval round"
        );
        record.flow_state_mut().round_id = Some(round.round_id);
        return Ok(Some(round.round_id));
    }
    Ok(record.flow_state().round_id)
}
