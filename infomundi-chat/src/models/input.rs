//! Input DTOs with garde validation.
//!
//! These structs validate caller-supplied data before it reaches the
//! protocol core.

use garde::Validate;
use serde::Deserialize;

use crate::error::{ChatError, ChatResult};

/// Validation constants
pub const MAX_USER_ID_LENGTH: usize = 128;
pub const MAX_MESSAGE_LENGTH: usize = 10000;

/// Identifiers must not carry control characters (they end up in logs and URLs)
fn validate_identifier(value: &str, _ctx: &()) -> garde::Result {
    if value.chars().any(|c| c.is_control()) {
        return Err(garde::Error::new("contains control characters"));
    }
    if value.trim() != value {
        return Err(garde::Error::new("has leading or trailing whitespace"));
    }
    Ok(())
}

/// Input for opening a conversation
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct OpenConversationInput {
    #[garde(length(chars, min = 1, max = MAX_USER_ID_LENGTH), custom(validate_identifier))]
    pub peer_id: String,
}

/// Input for sending a message
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct SendMessageInput {
    #[garde(length(chars, min = 1, max = MAX_MESSAGE_LENGTH))]
    pub content: String,
}

/// Input for the local identity
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct UserIdInput {
    #[garde(length(chars, min = 1, max = MAX_USER_ID_LENGTH), custom(validate_identifier))]
    pub user_id: String,
}

/// Helper trait to convert garde validation errors to `ChatError`
pub trait ValidateExt {
    fn validate_input(&self) -> ChatResult<()>;
}

impl<T: Validate<Context = ()>> ValidateExt for T {
    fn validate_input(&self) -> ChatResult<()> {
        self.validate()
            .map_err(|e| ChatError::InvalidInput(e.to_string()))
    }
}
