use thiserror::Error;

/// Error taxonomy shared by the store and the engine services.
///
/// Parse failures from agents are intentionally absent: the gateway
/// substitutes the agent's documented safe default and reports the failure
/// through a non-throwing flag instead of an error.
#[derive(Debug, Error)]
pub enum CrucibleError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("{0}")]
    Validation(String),

    #[error("agent `{agent}` failed: {message}")]
    AgentFailure { agent: String, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CrucibleError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn agent_failure(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AgentFailure {
            agent: agent.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CrucibleError>;
