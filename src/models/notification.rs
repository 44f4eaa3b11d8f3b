use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

/// Message attribute carrying the notification type.
pub const EMAIL_TYPE_ATTRIBUTE: &str = "emailType";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Error,
    UserRegistration,
    ContactMessage,
    ContactMessageReply,
    FriendshipRequested,
    /// Recognized on the wire but has no template binding yet.
    UserAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientSource {
    /// The request envelope's `recipients` list.
    Envelope,
    /// The address carried by the payload itself.
    Payload,
    /// The configured administrator list.
    Administrators,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateBinding {
    pub template: &'static str,
    pub recipients: RecipientSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownNotificationType(pub String);

impl NotificationType {
    pub const ALL: [NotificationType; 6] = [
        NotificationType::Error,
        NotificationType::UserRegistration,
        NotificationType::ContactMessage,
        NotificationType::ContactMessageReply,
        NotificationType::FriendshipRequested,
        NotificationType::UserAction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Error => "ERROR",
            NotificationType::UserRegistration => "USER_REGISTRATION",
            NotificationType::ContactMessage => "CONTACT_MESSAGE",
            NotificationType::ContactMessageReply => "CONTACT_MESSAGE_REPLY",
            NotificationType::FriendshipRequested => "FRIENDSHIP_REQUESTED",
            NotificationType::UserAction => "USER_ACTION",
        }
    }

    /// Template and recipient source for the type, `None` when the type is
    /// accepted but not delivered.
    pub fn binding(&self) -> Option<TemplateBinding> {
        let (template, recipients) = match self {
            NotificationType::Error => ("error-message", RecipientSource::Administrators),
            NotificationType::UserRegistration => ("user-registration", RecipientSource::Payload),
            NotificationType::ContactMessage => ("contact-message", RecipientSource::Envelope),
            NotificationType::ContactMessageReply => {
                ("contact-message-reply", RecipientSource::Envelope)
            }
            NotificationType::FriendshipRequested => {
                ("friendship-requested", RecipientSource::Envelope)
            }
            NotificationType::UserAction => return None,
        };

        Some(TemplateBinding {
            template,
            recipients,
        })
    }
}

impl FromStr for NotificationType {
    type Err = UnknownNotificationType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "error" => Ok(NotificationType::Error),
            "userregistration" => Ok(NotificationType::UserRegistration),
            "contactmessage" => Ok(NotificationType::ContactMessage),
            "contactmessagereply" => Ok(NotificationType::ContactMessageReply),
            "friendshiprequested" => Ok(NotificationType::FriendshipRequested),
            "useraction" | "anotheruseraction" => Ok(NotificationType::UserAction),
            _ => Err(UnknownNotificationType(s.to_string())),
        }
    }
}

impl Display for NotificationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}
