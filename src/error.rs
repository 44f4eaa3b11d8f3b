//! Failures a single message can hit on its way from the queue to the mail
//! relay. Each variant names the stage that failed so the pool can log it and
//! decide whether redelivery could help.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("cannot classify message: {0}")]
    Classification(String),

    #[error("payload does not match the {notification_type} schema: {source}")]
    Payload {
        notification_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("recipients rejected: {0}")]
    Recipient(String),

    #[error("template '{template}' unavailable: {reason}")]
    Template { template: String, reason: String },

    #[error("failed to render template '{template}': {reason}")]
    Render { template: String, reason: String },

    #[error("mail delivery failed: {0}")]
    Delivery(#[source] anyhow::Error),

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl DispatchError {
    pub fn stage(&self) -> &'static str {
        match self {
            DispatchError::Classification(_) => "classify",
            DispatchError::Payload { .. } => "deserialize",
            DispatchError::Recipient(_) => "recipients",
            DispatchError::Template { .. } => "template",
            DispatchError::Render { .. } => "render",
            DispatchError::Delivery(_) => "deliver",
            DispatchError::Unexpected(_) => "unexpected",
        }
    }

    /// Whether redelivering the same message can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DispatchError::Classification(_)
                | DispatchError::Payload { .. }
                | DispatchError::Recipient(_)
        )
    }
}
