use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::{rbmq::RabbitMqClient, smtp::SmtpMailer},
    models::health::{
        ConsumerStats, ErrorStats, HealthCheckResponse, HealthStatus, ServiceHealth,
    },
    pool::PoolState,
    reporter::ErrorReporter,
};

pub struct HealthChecker {
    rabbitmq: Arc<RabbitMqClient>,
    mailer: Arc<SmtpMailer>,
    pool: Arc<PoolState>,
    reporter: Arc<ErrorReporter>,
}

impl HealthChecker {
    pub fn new(
        rabbitmq: Arc<RabbitMqClient>,
        mailer: Arc<SmtpMailer>,
        pool: Arc<PoolState>,
        reporter: Arc<ErrorReporter>,
    ) -> Self {
        Self {
            rabbitmq,
            mailer,
            pool,
            reporter,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert("message_broker".to_string(), self.check_rabbitmq());
        checks.insert("smtp".to_string(), self.check_smtp().await);

        let consumers = self.pool.stats();
        checks.insert("consumer_pool".to_string(), check_consumers(&consumers));

        let errors = ErrorStats {
            reported: self.reporter.reported_count(),
            recent: self.reporter.recent(),
        };

        HealthCheckResponse {
            status: determine_overall_status(&checks),
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            checks,
            consumers,
            errors,
        }
    }

    fn check_rabbitmq(&self) -> ServiceHealth {
        if self.rabbitmq.is_connected() {
            debug!(queue = %self.rabbitmq.queue_name(), "RabbitMQ health check passed");
            ServiceHealth::healthy(0)
        } else {
            warn!(queue = %self.rabbitmq.queue_name(), "RabbitMQ connection lost");
            ServiceHealth::unhealthy("Connection lost".to_string())
        }
    }

    async fn check_smtp(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.mailer.test_connection().await {
            Ok(true) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "SMTP health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Ok(false) => {
                warn!("SMTP relay rejected the connection test");
                ServiceHealth::degraded("Relay rejected the connection test".to_string())
            }
            Err(e) => {
                warn!(error = %e, "SMTP health check failed");
                ServiceHealth::degraded(format!("Connection failed: {}", e))
            }
        }
    }
}

fn check_consumers(stats: &ConsumerStats) -> ServiceHealth {
    if stats.active == 0 {
        ServiceHealth::unhealthy("No consumers running".to_string())
    } else if stats.active < stats.minimum {
        ServiceHealth::degraded(format!(
            "{} of {} consumers running",
            stats.active, stats.minimum
        ))
    } else {
        ServiceHealth::healthy(0)
    }
}

/// The broker and the consumer pool are critical. SMTP trouble only degrades,
/// since failed sends are already handled per message.
fn determine_overall_status(checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
    let has_unhealthy = checks
        .values()
        .any(|health| health.status == HealthStatus::Unhealthy);

    let has_degraded = checks
        .values()
        .any(|health| health.status == HealthStatus::Degraded);

    if has_unhealthy {
        HealthStatus::Unhealthy
    } else if has_degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
