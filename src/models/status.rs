use std::fmt::{Display, Formatter, Result};

use crate::models::notification::NotificationType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Remove the message from the queue.
    Acknowledge,
    /// Hand the message back for redelivery.
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered {
        notification_type: NotificationType,
        recipients: usize,
    },
    Skipped {
        notification_type: NotificationType,
    },
}

impl Display for AckDecision {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            AckDecision::Acknowledge => write!(f, "acknowledge"),
            AckDecision::Leave => write!(f, "leave"),
        }
    }
}
