use thiserror::Error;

/// Classification of a single upstream call failure, used by the retry policy
/// in [`crate::upstream`] and by the fan-out to decide whether a model's
/// failure should be treated as transient or final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// Network-level or 5xx failure; worth retrying.
    Transient,
    /// Exceeded the per-attempt deadline.
    Timeout,
    /// 4xx other than transient; retrying will not help.
    Permanent,
    /// Caller cancelled the call.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CouncilError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("already processing session {0}")]
    AlreadyProcessing(String),

    #[error("at capacity: {active}/{max} sessions processing")]
    AtCapacity { active: usize, max: usize },

    #[error("session limit reached for user")]
    SessionLimitReached,

    #[error("no active processing for session {0}")]
    NotProcessing(String),

    #[error("upstream gateway credential is not configured")]
    UnconfiguredUpstream,

    #[error("no models configured for mode {0:?}")]
    ModeUnconfigured(crate::model::Mode),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("upstream error from {model} ({kind:?}): {message}")]
    Upstream {
        model: String,
        kind: UpstreamErrorKind,
        message: String,
    },

    #[error("all models failed to respond")]
    AllModelsFailed,

    #[error("chairman failed to synthesize response: {0}")]
    ChairmanFailed(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl CouncilError {
    /// Sanitized message safe to surface to a client; never leaks upstream
    /// bodies, URLs, or credentials.
    pub fn user_message(&self) -> String {
        match self {
            Self::SessionNotFound(_) => "session not found".to_string(),
            Self::AlreadyProcessing(_) => "a message is already being processed".to_string(),
            Self::AtCapacity { .. } => "server is at capacity, try again shortly".to_string(),
            Self::SessionLimitReached => "session limit reached".to_string(),
            Self::NotProcessing(_) => "no active processing for this session".to_string(),
            Self::UnconfiguredUpstream => "upstream is not configured".to_string(),
            Self::ModeUnconfigured(mode) => format!("mode {mode:?} is not configured"),
            Self::Validation(msg) => msg.clone(),
            Self::Upstream { model, .. } => format!("upstream error from model {model}"),
            Self::AllModelsFailed => "All models failed to respond. Please try again.".to_string(),
            Self::ChairmanFailed(_) => "Chairman failed to synthesize response.".to_string(),
            Self::Persistence(_) => "failed to persist result".to_string(),
            Self::Request(_) => "request to upstream failed".to_string(),
            Self::Other(_) => "an error occurred".to_string(),
        }
    }
}
