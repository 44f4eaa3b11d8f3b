use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use lettre::message::Mailbox;
use serde::Deserialize;
use tracing::warn;

use crate::{
    dispatcher::DispatchSettings,
    models::retry::RetryConfig,
    pool::{AckPolicy, PoolSettings},
    utils::parse_address_list,
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    pub email_queue_name: String,

    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    #[serde(default = "default_true")]
    pub smtp_starttls: bool,
    #[serde(default = "default_smtp_timeout_seconds")]
    pub smtp_timeout_seconds: u64,

    pub mail_sender: String,
    #[serde(default)]
    pub admin_recipients: String,

    #[serde(default = "default_templates_dir")]
    pub templates_dir: String,

    #[serde(default = "default_concurrent_consumers")]
    pub concurrent_consumers: usize,
    #[serde(default = "default_concurrent_consumers")]
    pub max_concurrent_consumers: usize,
    #[serde(default = "default_idle_task_execution_limit")]
    pub idle_task_execution_limit: u32,
    #[serde(default = "default_idle_consumer_limit")]
    pub idle_consumer_limit: usize,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub ack_on_failure: bool,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;

        config.validate()
    }

    /// Rejects unusable values and clamps the consumer ceiling to the minimum.
    pub fn validate(mut self) -> Result<Self, Error> {
        if self.email_queue_name.trim().is_empty() {
            return Err(anyhow!("EMAIL_QUEUE_NAME must not be empty"));
        }

        if self.mail_sender.trim().is_empty() {
            return Err(anyhow!("MAIL_SENDER must not be empty"));
        }

        self.mail_sender
            .parse::<Mailbox>()
            .map_err(|e| anyhow!("MAIL_SENDER '{}' is not a mailbox: {}", self.mail_sender, e))?;

        for address in self.admin_recipients() {
            address
                .parse::<Mailbox>()
                .map_err(|e| anyhow!("ADMIN_RECIPIENTS entry '{}' is invalid: {}", address, e))?;
        }

        if self.concurrent_consumers == 0 {
            return Err(anyhow!("CONCURRENT_CONSUMERS must be at least 1"));
        }

        if self.max_concurrent_consumers < self.concurrent_consumers {
            warn!(
                concurrent_consumers = self.concurrent_consumers,
                max_concurrent_consumers = self.max_concurrent_consumers,
                "Maximum consumer count below minimum, raising it to the minimum"
            );
            self.max_concurrent_consumers = self.concurrent_consumers;
        }

        if self.max_retry_attempts == 0 {
            self.max_retry_attempts = 1;
        }

        if self.admin_recipients().is_empty() {
            warn!("ADMIN_RECIPIENTS is empty, error notifications will be dropped");
        }

        Ok(self)
    }

    pub fn admin_recipients(&self) -> Vec<String> {
        parse_address_list(&self.admin_recipients)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            concurrent_consumers: self.concurrent_consumers,
            max_concurrent_consumers: self.max_concurrent_consumers,
            idle_task_execution_limit: self.idle_task_execution_limit,
            idle_consumer_limit: self.idle_consumer_limit,
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
        }
    }

    pub fn ack_policy(&self) -> AckPolicy {
        AckPolicy {
            ack_on_failure: self.ack_on_failure,
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            sender: self.mail_sender.clone(),
            admin_recipients: self.admin_recipients(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_timeout_seconds() -> u64 {
    30
}

fn default_templates_dir() -> String {
    "templates".to_string()
}

fn default_concurrent_consumers() -> usize {
    5
}

fn default_idle_task_execution_limit() -> u32 {
    30
}

fn default_idle_consumer_limit() -> usize {
    5
}

fn default_receive_timeout_ms() -> u64 {
    1000
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_initial_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    10_000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

fn default_server_port() -> u16 {
    8080
}
