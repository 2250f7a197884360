//! Error types for the handoff verification system.

use thiserror::Error;

use crate::request::{CodeStage, RequestId, UserId};

/// Result type alias using the handoff error type.
pub type Result<T> = std::result::Result<T, HandoffError>;

/// Main error type for the handoff verification system.
///
/// Wrong caller, wrong id and wrong status are all collapsed into
/// [`HandoffError::RequestNotFound`] so a response never reveals whether a
/// request exists to someone who is not a party to it.
#[derive(Error, Debug)]
pub enum HandoffError {
    /// Request not found (or not visible to this caller in this status)
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    /// Submitted code did not match the stored code
    #[error("Invalid {stage} code for request {request_id}: {remaining_attempts} attempts remaining")]
    InvalidCode {
        request_id: RequestId,
        stage: CodeStage,
        remaining_attempts: u32,
    },

    /// The attempt counter reached its maximum; validation is refused
    #[error("Verification attempts exhausted for {stage} stage of request {request_id}")]
    AttemptsExhausted {
        request_id: RequestId,
        stage: CodeStage,
    },

    /// The code generator hit its re-draw bound without finding a free code
    #[error("Code space exhausted while generating a {0} code")]
    CodeSpaceExhausted(CodeStage),

    /// Requester has not completed identity verification
    #[error("Sender {0} is not identity-verified")]
    SenderNotVerified(UserId),

    /// Validation error (e.g., malformed code value, missing required fields)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Notification transport error
    #[error("Notification request failed: {0}")]
    Notify(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandoffError {
    /// Remaining-attempts payload for the structured error envelope, when
    /// the error carries one.
    pub fn remaining_attempts(&self) -> Option<u32> {
        match self {
            HandoffError::InvalidCode {
                remaining_attempts, ..
            } => Some(*remaining_attempts),
            HandoffError::AttemptsExhausted { .. } => Some(0),
            _ => None,
        }
    }
}
