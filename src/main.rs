use std::{path::Path, sync::Arc};

use anyhow::{Error, Result, anyhow};
use email_dispatcher::{
    api::run_api_server,
    clients::{
        health::HealthChecker,
        rbmq::RabbitMqClient,
        smtp::SmtpMailer,
        template::{FileTemplateSource, TemplateRenderer},
    },
    config::Config,
    dispatcher::NotificationDispatcher,
    pool::ConsumerPool,
    reporter::ErrorReporter,
    utils::retry_with_backoff,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = Config::load()?;

    info!(
        queue = %config.email_queue_name,
        smtp_host = %config.smtp_host,
        "Configuration validated, starting email dispatcher"
    );

    let retry_config = config.retry_config();
    let rabbitmq = Arc::new(
        retry_with_backoff(&retry_config, || RabbitMqClient::connect(&config))
            .await
            .map_err(|e| anyhow!("Giving up on RabbitMQ: {}", e))?,
    );

    let mailer = Arc::new(SmtpMailer::new(&config)?);

    let templates = FileTemplateSource::new(Path::new(&config.templates_dir))?;
    let renderer = Arc::new(TemplateRenderer::new(Arc::new(templates)));

    let dispatcher = Arc::new(NotificationDispatcher::new(
        renderer,
        mailer.clone(),
        config.dispatch_settings(),
    ));

    let reporter = Arc::new(ErrorReporter::new());

    let pool = ConsumerPool::new(
        rabbitmq.clone(),
        dispatcher,
        reporter.clone(),
        config.pool_settings(),
        config.ack_policy(),
    );

    let health_checker = HealthChecker::new(rabbitmq.clone(), mailer, pool.state(), reporter);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api_shutdown = shutdown_rx.clone();
    let server_port = config.server_port;
    let api = tokio::spawn(async move {
        if let Err(e) = run_api_server(server_port, health_checker, api_shutdown).await {
            error!(error = %e, "Health check server failed");
        }
    });

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    pool.run(shutdown_rx).await?;

    if let Err(e) = api.await {
        error!(error = %e, "Health check server task failed");
    }

    info!("Email dispatcher stopped");

    Ok(())
}
