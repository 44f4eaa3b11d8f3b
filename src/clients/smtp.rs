use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use tracing::{debug, info};

use crate::{config::Config, models::render::OutboundEmail};

/// Outbound mail capability used by the dispatcher.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), Error>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl SmtpMailer {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let builder = if config.smtp_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| anyhow!("Failed to create SMTP relay: {}", e))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };

        let mut builder = builder
            .port(config.smtp_port)
            .timeout(Some(Duration::from_secs(config.smtp_timeout_seconds)));

        if let (Some(username), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        info!(
            host = %config.smtp_host,
            port = config.smtp_port,
            starttls = config.smtp_starttls,
            "SMTP mailer initialized"
        );

        Ok(Self {
            transport: builder.build(),
            host: config.smtp_host.clone(),
        })
    }

    pub async fn test_connection(&self) -> Result<bool, Error> {
        self.transport
            .test_connection()
            .await
            .map_err(|e| anyhow!("SMTP connection test failed: {}", e))
    }
}

#[async_trait]
impl MailSender for SmtpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), Error> {
        debug!(
            to = ?email.to,
            subject = %email.subject,
            host = %self.host,
            "Sending email via SMTP"
        );

        let message = build_message(email)?;

        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| anyhow!("SMTP send failed: {}", e))?;

        info!(
            recipients = email.to.len(),
            code = %response.code(),
            "Email accepted by SMTP relay"
        );

        Ok(())
    }
}

pub fn build_message(email: &OutboundEmail) -> Result<Message, Error> {
    let from: Mailbox = email
        .from
        .parse()
        .map_err(|e| anyhow!("Invalid sender address '{}': {}", email.from, e))?;

    let mut builder = Message::builder().from(from).subject(&email.subject);

    for address in &email.to {
        let to: Mailbox = address
            .parse()
            .map_err(|e| anyhow!("Invalid recipient address '{}': {}", address, e))?;
        builder = builder.to(to);
    }

    builder
        .header(ContentType::TEXT_HTML)
        .body(email.html_body.clone())
        .map_err(|e| anyhow!("Failed to build email message: {}", e))
}
