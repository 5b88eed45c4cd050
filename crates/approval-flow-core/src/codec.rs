//! Wire encoding of a record's position in the flow.
//!
//! A status string is either a single status name, an AND-combination
//! (`"A&&B"`, every branch must complete) or an OR-combination (`"A||B"`,
//! any branch may be taken). The string form is the storage and query
//! contract; everything inside the engine works on [`ApprovalState`].

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub const AND_SEPARATOR: &str = "&&";
pub const OR_SEPARATOR: &str = "||";

pub const BRANCH_PENDING: u8 = 0;
pub const BRANCH_COMPLETED: u8 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Simple,
    And,
    Or,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ApprovalState {
    Simple(String),
    And(Vec<String>),
    Or(Vec<String>),
}

impl ApprovalState {
    /// Splits on the AND separator first, then the OR separator. Empty
    /// segments are dropped.
    #[must_use]
    pub fn decode(status: &str) -> Self {
        if status.contains(AND_SEPARATOR) {
            Self::And(split_members(status, AND_SEPARATOR))
        } else if status.contains(OR_SEPARATOR) {
            Self::Or(split_members(status, OR_SEPARATOR))
        } else {
            Self::Simple(status.to_string())
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Simple(member) => member.clone(),
            Self::And(members) => members.join(AND_SEPARATOR),
            Self::Or(members) => members.join(OR_SEPARATOR),
        }
    }

    #[must_use]
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Simple(_) => StateKind::Simple,
            Self::And(_) => StateKind::And,
            Self::Or(_) => StateKind::Or,
        }
    }

    #[must_use]
    pub fn members(&self) -> Vec<&str> {
        match self {
            Self::Simple(member) => vec![member.as_str()],
            Self::And(members) | Self::Or(members) => members.iter().map(String::as_str).collect(),
        }
    }

    #[must_use]
    pub fn is_and(&self) -> bool {
        matches!(self, Self::And(_))
    }

    /// Fresh completion map: every member pending.
    #[must_use]
    pub fn pending_detail(&self) -> StatusDetail {
        StatusDetail::pending(self.members())
    }
}

impl Display for ApprovalState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

fn split_members(status: &str, separator: &str) -> Vec<String> {
    status
        .split(separator)
        .filter(|member| !member.is_empty())
        .map(str::to_string)
        .collect()
}

/// Per-branch completion flags paired with the status string.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct StatusDetail(BTreeMap<String, u8>);

impl StatusDetail {
    #[must_use]
    pub fn pending<'a>(members: impl IntoIterator<Item = &'a str>) -> Self {
        Self(
            members
                .into_iter()
                .map(|member| (member.to_string(), BRANCH_PENDING))
                .collect(),
        )
    }

    #[must_use]
    pub fn get(&self, member: &str) -> Option<u8> {
        self.0.get(member).copied()
    }

    #[must_use]
    pub fn is_pending(&self, member: &str) -> bool {
        self.get(member) == Some(BRANCH_PENDING)
    }

    pub fn mark_completed(&mut self, member: &str) {
        self.0.insert(member.to_string(), BRANCH_COMPLETED);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u8)> {
        self.0.iter().map(|(key, value)| (key.as_str(), *value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
