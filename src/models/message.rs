use std::collections::HashMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::models::{
    notification::{EMAIL_TYPE_ATTRIBUTE, NotificationType},
    payload::{
        ContactMessagePayload, ContactReplyPayload, ErrorPayload, FriendshipRequestedPayload,
        WelcomePayload,
    },
};

/// A delivery pulled from the queue, independent of the broker in use.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub attributes: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl InboundMessage {
    pub fn new(delivery_tag: u64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_email_type(self, email_type: impl Into<String>) -> Self {
        self.with_attribute(EMAIL_TYPE_ATTRIBUTE, email_type)
    }

    pub fn email_type(&self) -> Option<&str> {
        self.attributes.get(EMAIL_TYPE_ATTRIBUTE).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest<P> {
    #[serde(default)]
    pub application_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<String>>,

    pub body: P,
}

/// A request whose payload shape has been fixed by its notification type.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Error(NotificationRequest<ErrorPayload>),
    UserRegistration(NotificationRequest<WelcomePayload>),
    ContactMessage(NotificationRequest<ContactMessagePayload>),
    ContactMessageReply(NotificationRequest<ContactReplyPayload>),
    FriendshipRequested(NotificationRequest<FriendshipRequestedPayload>),
}

impl Notification {
    /// Decodes `body` with the schema bound to `kind`. Returns `Ok(None)` for
    /// types that are recognized but have no schema.
    pub fn decode(kind: NotificationType, body: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        let notification = match kind {
            NotificationType::Error => Notification::Error(parse(body)?),
            NotificationType::UserRegistration => Notification::UserRegistration(parse(body)?),
            NotificationType::ContactMessage => Notification::ContactMessage(parse(body)?),
            NotificationType::ContactMessageReply => {
                Notification::ContactMessageReply(parse(body)?)
            }
            NotificationType::FriendshipRequested => {
                Notification::FriendshipRequested(parse(body)?)
            }
            NotificationType::UserAction => return Ok(None),
        };

        Ok(Some(notification))
    }

    pub fn kind(&self) -> NotificationType {
        match self {
            Notification::Error(_) => NotificationType::Error,
            Notification::UserRegistration(_) => NotificationType::UserRegistration,
            Notification::ContactMessage(_) => NotificationType::ContactMessage,
            Notification::ContactMessageReply(_) => NotificationType::ContactMessageReply,
            Notification::FriendshipRequested(_) => NotificationType::FriendshipRequested,
        }
    }

    pub fn application_id(&self) -> &str {
        match self {
            Notification::Error(request) => &request.application_id,
            Notification::UserRegistration(request) => &request.application_id,
            Notification::ContactMessage(request) => &request.application_id,
            Notification::ContactMessageReply(request) => &request.application_id,
            Notification::FriendshipRequested(request) => &request.application_id,
        }
    }

    pub fn envelope_recipients(&self) -> Option<&[String]> {
        match self {
            Notification::Error(request) => request.recipients.as_deref(),
            Notification::UserRegistration(request) => request.recipients.as_deref(),
            Notification::ContactMessage(request) => request.recipients.as_deref(),
            Notification::ContactMessageReply(request) => request.recipients.as_deref(),
            Notification::FriendshipRequested(request) => request.recipients.as_deref(),
        }
    }

    /// Address carried by self-addressing payloads.
    pub fn payload_recipient(&self) -> Option<&str> {
        match self {
            Notification::UserRegistration(request) => Some(request.body.email.as_str()),
            _ => None,
        }
    }

    pub fn payload_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Notification::Error(request) => serde_json::to_value(&request.body),
            Notification::UserRegistration(request) => serde_json::to_value(&request.body),
            Notification::ContactMessage(request) => serde_json::to_value(&request.body),
            Notification::ContactMessageReply(request) => serde_json::to_value(&request.body),
            Notification::FriendshipRequested(request) => serde_json::to_value(&request.body),
        }
    }
}

fn parse<P: DeserializeOwned>(body: &[u8]) -> Result<NotificationRequest<P>, serde_json::Error> {
    serde_json::from_slice(body)
}
