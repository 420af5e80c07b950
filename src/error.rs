use thiserror::Error;

pub type Result<T> = std::result::Result<T, PeargentError>;

#[derive(Debug, Error)]
pub enum PeargentError {
    #[error("tool `{0}` not found")]
    ToolNotFound(String),

    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),

    #[error("invalid arguments for tool `{tool}`: {reason}")]
    ToolArgument { tool: String, reason: String },

    #[error("tool `{name}` invocation failed: {message}")]
    ToolExecution { name: String, message: String },

    #[error("tool `{name}` timed out after {seconds}s")]
    ToolTimeout { name: String, seconds: f64 },

    #[error("language model error: {0}")]
    LanguageModel(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no agent matched the request (session `{session_id}`)")]
    NoMatchingAgent { session_id: String },

    #[error("iteration budget of {max_iter} exhausted (session `{session_id}`)")]
    IterationBudgetExceeded { session_id: String, max_iter: usize },

    #[error("request cancelled (session `{session_id}`)")]
    Cancelled { session_id: String },

    #[error("pear version {found} is newer than the supported version {supported}")]
    UnsupportedBundleVersion { found: u32, supported: u32 },

    #[error("malformed pear bundle: {0}")]
    MalformedBundle(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl PeargentError {
    /// Errors the owning agent can observe and recover from on its next turn.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PeargentError::ToolNotFound(_)
                | PeargentError::ToolArgument { .. }
                | PeargentError::ToolExecution { .. }
                | PeargentError::ToolTimeout { .. }
        )
    }

    /// Session id carried by request-level failures, for follow-up inspection.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            PeargentError::NoMatchingAgent { session_id }
            | PeargentError::IterationBudgetExceeded { session_id, .. }
            | PeargentError::Cancelled { session_id } => Some(session_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_recoverable_errors() {
        let arg = PeargentError::ToolArgument {
            tool: "t1".into(),
            reason: "missing `query`".into(),
        };
        assert!(arg.is_recoverable());
        assert!(arg.session_id().is_none());

        let budget = PeargentError::IterationBudgetExceeded {
            session_id: "s-1".into(),
            max_iter: 3,
        };
        assert!(!budget.is_recoverable());
        assert_eq!(budget.session_id(), Some("s-1"));
    }
}
