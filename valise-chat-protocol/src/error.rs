//! Error handling for chat operations
//!
//! Errors fall into four families with different recovery policies: transport
//! failures (recovered by the next poll cycle for reads, surfaced to the
//! caller for sends), validation failures (rejected before any I/O), push
//! subscription failures (logged, non-fatal), and stale-scope callbacks
//! (discarded silently after a conversation switch).

use thiserror::Error;

/// Result type for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Errors that can occur during chat synchronization
///
/// # Examples
///
/// ```rust
/// use valise_chat_protocol::ChatError;
///
/// let error = ChatError::transport("connection reset");
/// assert!(error.is_recoverable());
///
/// let error = ChatError::EmptyContent;
/// assert!(error.is_validation());
/// ```
#[derive(Error, Debug)]
pub enum ChatError {
    /// Network or store failure
    ///
    /// For reads this is recovered silently by the next poll cycle; for sends
    /// it is surfaced to the caller with the optimistic entry rolled back.
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON deserialization error (malformed push row)
    ///
    /// Automatically converted from `serde_json::Error`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Push channel failed to establish or deliver
    ///
    /// Non-fatal: polling remains the correctness backstop.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// An asynchronous callback arrived tagged with an expired epoch
    ///
    /// Raised internally after a conversation switch; never surfaced to the
    /// operator.
    #[error("Stale scope: callback epoch {callback_epoch}, current epoch {current_epoch}")]
    StaleScope {
        /// Epoch the callback was issued under
        callback_epoch: u64,
        /// Epoch currently in force
        current_epoch: u64,
    },

    /// Message content is empty after trimming
    #[error("Message content is empty")]
    EmptyContent,

    /// An operation that requires an open conversation was called without one
    #[error("No conversation is open")]
    NoOpenConversation,
}

impl ChatError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a subscription error
    pub fn subscription(message: impl Into<String>) -> Self {
        Self::Subscription(message.into())
    }

    /// Whether the error clears on its own through the normal sync cycle
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Json(_) | Self::Subscription(_)
        )
    }

    /// Whether the error was rejected before any network call
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::EmptyContent | Self::NoOpenConversation)
    }

    /// Whether the error is a discarded callback from a torn-down scope
    pub fn is_stale_scope(&self) -> bool {
        matches!(self, Self::StaleScope { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(ChatError::transport("timeout").is_recoverable());
        assert!(ChatError::subscription("channel closed").is_recoverable());
        assert!(!ChatError::EmptyContent.is_recoverable());
        assert!(!ChatError::NoOpenConversation.is_recoverable());
    }

    #[test]
    fn test_validation_classification() {
        assert!(ChatError::EmptyContent.is_validation());
        assert!(ChatError::NoOpenConversation.is_validation());
        assert!(!ChatError::transport("reset").is_validation());
    }

    #[test]
    fn test_stale_scope_classification() {
        let error = ChatError::StaleScope {
            callback_epoch: 3,
            current_epoch: 5,
        };
        assert!(error.is_stale_scope());
        assert!(!error.is_recoverable());
        assert!(!error.is_validation());
        assert_eq!(
            error.to_string(),
            "Stale scope: callback epoch 3, current epoch 5"
        );
    }

    #[test]
    fn test_json_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let error = ChatError::from(json_err);
        assert!(matches!(error, ChatError::Json(_)));
        assert!(error.is_recoverable());
    }
}
