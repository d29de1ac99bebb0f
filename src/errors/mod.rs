use thiserror::Error;

fn format_key_list(keys: &[String]) -> String {
    if keys.is_empty() {
        "(none)".to_string()
    } else {
        keys.join(", ")
    }
}

/// Typed error hierarchy for toolgate.
///
/// Use at module boundaries (dispatch, tool execution, plan/graph stores).
/// Internal/leaf functions can continue using `anyhow::Result` — the `Internal`
/// variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Sandbox violation, blocked policy, or rejected HITL review.
    #[error("{0}")]
    Security(String),

    #[error("{message}")]
    NotFound {
        message: String,
        /// Tool that would locate the missing object, surfaced to callers.
        suggestion_tool: Option<&'static str>,
    },

    /// Shape/range/value violation: duplicate ids, cycles, unknown HITL id.
    #[error("{0}")]
    InvalidParameter(String),

    /// HITL TTL or tool-level timeout elapsed.
    #[error("{0}")]
    Timeout(String),

    #[error("Secret key '{key}' not found. Available keys: {}", format_key_list(.available))]
    SecretNotFound { key: String, available: Vec<String> },

    /// Ambiguous name reference or duplicate state transition.
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            suggestion_tool: None,
        }
    }

    pub fn not_found_with_suggestion(
        message: impl Into<String>,
        suggestion_tool: &'static str,
    ) -> Self {
        Self::NotFound {
            message: message.into(),
            suggestion_tool: Some(suggestion_tool),
        }
    }

    /// Stable machine-readable error kind, as surfaced on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Security(_) => "security_error",
            Self::NotFound { .. } => "not_found",
            Self::InvalidParameter(_) => "invalid_parameter",
            Self::Timeout(_) => "timeout",
            Self::SecretNotFound { .. } => "secret_not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status the transport adapter should map this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Security(_) => 403,
            Self::NotFound { .. } => 404,
            Self::InvalidParameter(_) | Self::SecretNotFound { .. } => 400,
            Self::Timeout(_) => 408,
            Self::Conflict(_) => 409,
            Self::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests;
