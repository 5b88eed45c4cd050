use std::fmt::{Display, Formatter};

/// Stable numeric codes surfaced to callers alongside every [`FlowError`].
pub mod codes {
    pub const FLOW_ID_MISSING: u32 = 10001;
    pub const ENTITY_KIND_MISSING: u32 = 10002;
    pub const RECORD_ID_MISSING: u32 = 10003;
    pub const ACTION_MISSING: u32 = 10004;
    pub const ACTOR_MISSING: u32 = 10005;
    pub const NO_WAITING_BRANCH: u32 = 10008;
    pub const UNAUTHORIZED: u32 = 10009;
    pub const STATE_MISSING: u32 = 10016;
    pub const NO_MATCHING_STEP: u32 = 10017;
    pub const NO_START_NODE: u32 = 10018;
    pub const MULTIPLE_START_NODES: u32 = 10019;
    pub const NO_APPROVED_STATUS: u32 = 10020;
    pub const NO_REJECTED_STATUS: u32 = 10021;
    pub const ACCESS_QUERY_INVALID: u32 = 10022;
    pub const ALIAS_MISSING: u32 = 10024;
    pub const RULE_EVALUATION: u32 = 10026;
    pub const CATALOG_INVALID: u32 = 10027;
    pub const REVISION_CONFLICT: u32 = 10028;
    pub const CYCLE_DETECTED: u32 = 10029;
    pub const TRANSITION_GUARD: u32 = 10030;
    pub const STORE_FAILURE: u32 = 10031;
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    InvalidArgument,
    MissingState,
    NoMatchingStep,
    Unauthorized,
    RuleEvaluation,
    Conflict,
    InvalidTransition,
    Store,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::InvalidArgument => "invalid_argument",
            Self::MissingState => "missing_state",
            Self::NoMatchingStep => "no_matching_step",
            Self::Unauthorized => "unauthorized",
            Self::RuleEvaluation => "rule_evaluation",
            Self::Conflict => "conflict",
            Self::InvalidTransition => "invalid_transition",
            Self::Store => "store",
        }
    }
}

impl Display for ErrorCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FlowError {
    #[error("configuration error [{code}]: {message}")]
    Configuration { code: u32, message: String },
    #[error("invalid argument [{code}]: {message}")]
    InvalidArgument { code: u32, message: String },
    #[error("missing state [{code}]: {message}")]
    MissingState { code: u32, message: String },
    #[error("no matching step [{code}]: {message}")]
    NoMatchingStep { code: u32, message: String },
    #[error("unauthorized [{code}]: {message}")]
    Unauthorized { code: u32, message: String },
    #[error("rule evaluation error [{code}]: {message}")]
    RuleEvaluation { code: u32, message: String },
    #[error("conflict [{code}]: {message}")]
    Conflict { code: u32, message: String },
    #[error("invalid transition [{code}]: {message}")]
    InvalidTransition { code: u32, message: String },
    #[error("store error [{code}]: {message}")]
    Store { code: u32, message: String },
}

impl FlowError {
    pub fn configuration(code: u32, message: impl Into<String>) -> Self {
        Self::Configuration {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(code: u32, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            code,
            message: message.into(),
        }
    }

    pub fn missing_state(message: impl Into<String>) -> Self {
        Self::MissingState {
            code: codes::STATE_MISSING,
            message: message.into(),
        }
    }

    pub fn no_matching_step(code: u32, message: impl Into<String>) -> Self {
        Self::NoMatchingStep {
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            code: codes::UNAUTHORIZED,
            message: message.into(),
        }
    }

    pub fn rule_evaluation(message: impl Into<String>) -> Self {
        Self::RuleEvaluation {
            code: codes::RULE_EVALUATION,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            code: codes::REVISION_CONFLICT,
            message: message.into(),
        }
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition {
            code: codes::TRANSITION_GUARD,
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            code: codes::STORE_FAILURE,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::Configuration { code, .. }
            | Self::InvalidArgument { code, .. }
            | Self::MissingState { code, .. }
            | Self::NoMatchingStep { code, .. }
            | Self::Unauthorized { code, .. }
            | Self::RuleEvaluation { code, .. }
            | Self::Conflict { code, .. }
            | Self::InvalidTransition { code, .. }
            | Self::Store { code, .. } => *code,
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Configuration { message, .. }
            | Self::InvalidArgument { message, .. }
            | Self::MissingState { message, .. }
            | Self::NoMatchingStep { message, .. }
            | Self::Unauthorized { message, .. }
            | Self::RuleEvaluation { message, .. }
            | Self::Conflict { message, .. }
            | Self::InvalidTransition { message, .. }
            | Self::Store { message, .. } => message,
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::InvalidArgument { .. } => ErrorCategory::InvalidArgument,
            Self::MissingState { .. } => ErrorCategory::MissingState,
            Self::NoMatchingStep { .. } => ErrorCategory::NoMatchingStep,
            Self::Unauthorized { .. } => ErrorCategory::Unauthorized,
            Self::RuleEvaluation { .. } => ErrorCategory::RuleEvaluation,
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::InvalidTransition { .. } => ErrorCategory::InvalidTransition,
            Self::Store { .. } => ErrorCategory::Store,
        }
    }
}
