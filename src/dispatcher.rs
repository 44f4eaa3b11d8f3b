//! Turns a queue message into a rendered, addressed email.
//!
//! The dispatcher classifies the message by its `emailType` attribute, decodes
//! the body with the schema bound to that type, resolves recipients and subject,
//! renders the bound template and hands the result to the mail sender. It never
//! decides what happens to the message afterwards; the pool does that from the
//! returned outcome.

use std::sync::Arc;

use lettre::message::Mailbox;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{
    clients::{smtp::MailSender, template::TemplateRenderer},
    error::DispatchError,
    models::{
        message::{InboundMessage, Notification},
        notification::{
            EMAIL_TYPE_ATTRIBUTE, NotificationType, RecipientSource, UnknownNotificationType,
        },
        render::RenderJob,
        status::DispatchOutcome,
    },
};

pub const WELCOME_SUBJECT: &str = "Welcome to DareU!";
pub const CONTACT_MESSAGE_SUBJECT: &str = "New  contact message!";
pub const CONTACT_REPLY_FALLBACK_SUBJECT: &str = "We answered your message";
pub const FRIENDSHIP_REQUESTED_SUBJECT: &str = "New friendship request!";

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub sender: String,
    pub admin_recipients: Vec<String>,
}

pub struct NotificationDispatcher {
    renderer: Arc<TemplateRenderer>,
    mailer: Arc<dyn MailSender>,
    settings: DispatchSettings,
}

impl NotificationDispatcher {
    pub fn new(
        renderer: Arc<TemplateRenderer>,
        mailer: Arc<dyn MailSender>,
        settings: DispatchSettings,
    ) -> Self {
        info!(
            sender = %settings.sender,
            admin_recipients = settings.admin_recipients.len(),
            "Notification dispatcher initialized"
        );

        Self {
            renderer,
            mailer,
            settings,
        }
    }

    pub async fn dispatch(&self, message: &InboundMessage) -> Result<DispatchOutcome, DispatchError> {
        let kind = classify(message)?;

        let notification = Notification::decode(kind, &message.body).map_err(|source| {
            DispatchError::Payload {
                notification_type: kind.to_string(),
                source,
            }
        })?;

        let Some(notification) = notification else {
            warn!(
                delivery_tag = message.delivery_tag,
                email_type = %kind,
                "No template bound to notification type, skipping"
            );
            return Ok(DispatchOutcome::Skipped {
                notification_type: kind,
            });
        };

        let job = self.prepare(&notification)?;

        let template = self
            .renderer
            .get_template(job.template)
            .map_err(|e| DispatchError::Template {
                template: job.template.to_string(),
                reason: e.to_string(),
            })?;

        let html_body = self
            .renderer
            .render(&template, &job.context)
            .map_err(|e| DispatchError::Render {
                template: job.template.to_string(),
                reason: e.to_string(),
            })?;

        let recipients = job.recipients.len();
        let email = job.into_email(html_body);

        self.mailer
            .send(&email)
            .await
            .map_err(DispatchError::Delivery)?;

        info!(
            delivery_tag = message.delivery_tag,
            email_type = %kind,
            recipients,
            subject = %email.subject,
            "Notification delivered"
        );

        Ok(DispatchOutcome::Delivered {
            notification_type: kind,
            recipients,
        })
    }

    /// Resolves template, recipients, subject and context for a decoded
    /// notification without rendering or sending anything.
    pub fn prepare(&self, notification: &Notification) -> Result<RenderJob, DispatchError> {
        let kind = notification.kind();
        let binding = kind.binding().ok_or_else(|| {
            DispatchError::Unexpected(format!("no template bound to {}", kind))
        })?;

        let recipients = match binding.recipients {
            RecipientSource::Envelope => notification
                .envelope_recipients()
                .map(clean_addresses)
                .unwrap_or_default(),
            RecipientSource::Payload => notification
                .payload_recipient()
                .map(str::trim)
                .filter(|address| !address.is_empty())
                .map(str::to_string)
                .into_iter()
                .collect(),
            RecipientSource::Administrators => self.settings.admin_recipients.clone(),
        };

        if recipients.is_empty() {
            return Err(DispatchError::Recipient(format!("no recipients for {}", kind)));
        }

        if let Some(invalid) = recipients
            .iter()
            .find(|address| address.parse::<Mailbox>().is_err())
        {
            return Err(DispatchError::Recipient(format!(
                "invalid address '{}' for {}",
                invalid, kind
            )));
        }

        let job = RenderJob {
            template: binding.template,
            context: template_context(notification)?,
            recipients,
            from: self.settings.sender.clone(),
            subject: subject_for(notification),
        };

        debug!(
            email_type = %kind,
            template = job.template,
            recipients = job.recipients.len(),
            "Render job prepared"
        );

        Ok(job)
    }
}

fn classify(message: &InboundMessage) -> Result<NotificationType, DispatchError> {
    let raw = message
        .email_type()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            DispatchError::Classification(format!("missing '{}' attribute", EMAIL_TYPE_ATTRIBUTE))
        })?;

    raw.parse().map_err(|UnknownNotificationType(value)| {
        DispatchError::Classification(format!("unrecognized email type '{}'", value))
    })
}

fn clean_addresses(addresses: &[String]) -> Vec<String> {
    addresses
        .iter()
        .map(|address| address.trim())
        .filter(|address| !address.is_empty())
        .map(str::to_string)
        .collect()
}

fn subject_for(notification: &Notification) -> String {
    match notification {
        Notification::Error(request) => format!("{} error", request.application_id),
        Notification::UserRegistration(_) => WELCOME_SUBJECT.to_string(),
        Notification::ContactMessage(_) => CONTACT_MESSAGE_SUBJECT.to_string(),
        Notification::ContactMessageReply(request) => request
            .body
            .subject
            .as_deref()
            .map(str::trim)
            .filter(|subject| !subject.is_empty())
            .map(|subject| format!("Re: {}", subject))
            .unwrap_or_else(|| CONTACT_REPLY_FALLBACK_SUBJECT.to_string()),
        Notification::FriendshipRequested(_) => FRIENDSHIP_REQUESTED_SUBJECT.to_string(),
    }
}

/// Payload fields at the top level plus `applicationId`. A bare string error
/// payload is exposed as `message`.
fn template_context(notification: &Notification) -> Result<Map<String, Value>, DispatchError> {
    let payload = notification
        .payload_value()
        .map_err(|e| DispatchError::Unexpected(format!("payload serialization failed: {}", e)))?;

    let mut context = match payload {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("message".to_string(), other);
            map
        }
    };

    context
        .entry("applicationId")
        .or_insert_with(|| Value::String(notification.application_id().to_string()));

    Ok(context)
}
