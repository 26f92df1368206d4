//! Model-call seam.

use async_trait::async_trait;

/// What the model-call collaborator returns for one prompt pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelReply {
    /// Raw completion text (reasoning preamble included, if any).
    Text(String),
    /// Retries exhausted, timed out, or the API refused the request.
    NoAnswer { reason: String },
}

impl ModelReply {
    pub fn no_answer(reason: impl Into<String>) -> Self {
        Self::NoAnswer {
            reason: reason.into(),
        }
    }
}

/// Asks the model under test one question.
///
/// Implementations own their retry, backoff and per-call timeout. They must
/// not fail: exhaustion is reported as [`ModelReply::NoAnswer`] so that every
/// assignment still yields a result record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelCaller: Send + Sync {
    async fn answer_question(&self, system_prompt: &str, user_prompt: &str) -> ModelReply;
}
