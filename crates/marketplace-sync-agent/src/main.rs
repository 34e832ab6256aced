// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config_channel;

use std::process;
use std::sync::Arc;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use marketplace_sync::{AgentConfig, Backend, DeviceSyncCoordinator, FirebaseBackend, SyncConfig};

use crate::config_channel::{resolve_secrets, ConfigChannel};

#[tokio::main]
pub async fn main() {
    let mut config = AgentConfig::from_env();
    if let Err(err) = config.validate() {
        eprintln!("marketplace-sync-agent: {err}");
        process::exit(1);
    }

    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,reqwest=off,{}",
        config.log_level
    );
    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(err) => {
            eprintln!("marketplace-sync-agent: could not parse log level: {err}");
            process::exit(1);
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("marketplace-sync-agent: setting default subscriber failed: {err}");
        process::exit(1);
    }
    debug!("Logging subsystem enabled");

    let channel = ConfigChannel::from_config(&config);
    resolve_secrets(&mut config, &channel).await;
    let device = match config.device_credentials() {
        Ok(device) => device,
        Err(err) => {
            error!(%err, "Missing required credentials, exiting");
            eprintln!("marketplace-sync-agent: {err}");
            process::exit(1);
        }
    };

    let sync_config = SyncConfig::default();
    let backend = match FirebaseBackend::new(device, sync_config.poll_interval) {
        Ok(backend) => backend,
        Err(err) => {
            error!(%err, "Failed to build HTTP client, exiting");
            process::exit(1);
        }
    };

    let coordinator = DeviceSyncCoordinator::new(Arc::new(backend) as Arc<dyn Backend>, sync_config);
    info!("Starting marketplace sync agent");
    coordinator.start().await;

    let signal = wait_for_shutdown().await;
    info!(signal, "Received shutdown signal, stopping");
    coordinator.stop().await;
    info!("Marketplace sync agent stopped");
}

/// Resolves with the name of the first SIGINT/SIGTERM received.
#[cfg(unix)]
async fn wait_for_shutdown() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(err) = result {
                        error!(%err, "Failed to listen for SIGINT");
                    }
                    "SIGINT"
                }
                _ = terminate.recv() => "SIGTERM",
            }
        }
        Err(err) => {
            error!(%err, "Failed to install SIGTERM handler; only SIGINT will stop the agent");
            wait_for_ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> &'static str {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> &'static str {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "Failed to listen for SIGINT");
        // Without any signal source there is nothing to wait for.
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
