// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sensor_relay::{
    http::build_client, AmqpTransport, Consumer, HttpForwarder, Pipeline, RelayConfig,
    RetryPolicy, ShutdownReason,
};

#[tokio::main]
pub async fn main() -> ExitCode {
    // a missing .env file is fine
    let _ = dotenvy::dotenv();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    match run(config).await {
        Ok(ShutdownReason::StreamFailed(e)) => {
            error!("Relay stopped after delivery stream failure: {e}");
            ExitCode::FAILURE
        }
        Ok(reason) => {
            info!(?reason, "Relay stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Relay failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let env_filter = format!("h2=off,hyper=off,rustls=off,lapin=warn,{log_level}");

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level in configuration")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")
}

async fn run(config: RelayConfig) -> anyhow::Result<ShutdownReason> {
    info!(
        queue = %config.queue,
        dead_letter_queue = %config.dead_letter_queue,
        sink = %config.sink_url,
        max_retries = config.max_retries,
        "Starting sensor relay"
    );

    let client = build_client(config.https_proxy.as_deref())
        .map_err(|e| anyhow!("failed to build HTTP client: {e}"))?;
    let forwarder = HttpForwarder::new(client, config.sink_url.clone());

    let transport = AmqpTransport::connect(&config)
        .await
        .context("failed to set up broker")?;

    let pipeline = Arc::new(Pipeline::new(
        Arc::new(forwarder),
        Arc::new(transport.publisher()),
        RetryPolicy::new(config.max_retries),
        config.forward_timeout,
    ));

    let subscription = transport
        .subscribe()
        .await
        .context("failed to start consuming")?;

    let cancel_token = CancellationToken::new();
    tokio::spawn(wait_for_shutdown_signal(cancel_token.clone()));

    let consumer = Consumer::new(subscription, pipeline, config.prefetch, cancel_token);
    let (reason, stats) = consumer.run().await;
    info!(
        forwarded = stats.forwarded,
        requeued = stats.requeued,
        dead_lettered = stats.dead_lettered,
        rejected = stats.rejected,
        unsettled = stats.unsettled,
        "Consumer finished"
    );

    if let Err(e) = transport.close().await {
        warn!("Failed to close broker connection cleanly: {e}");
    }

    Ok(reason)
}

async fn wait_for_shutdown_signal(cancel_token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {e}");
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received SIGINT, shutting down");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for shutdown signal: {e}");
            return;
        }
        info!("Received shutdown signal, shutting down");
    }

    cancel_token.cancel();
}
