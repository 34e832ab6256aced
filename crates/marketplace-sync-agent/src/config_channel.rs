// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for the local request/response config channel.
//!
//! The device supervisor serves a ZeroMQ REP socket. Each request is one
//! frame holding `{"command": ..., "params": ...}` as JSON and each reply is
//! one JSON frame. The agent only uses it for secrets that the environment
//! did not provide.

use std::time::Duration;

use marketplace_sync::{AgentConfig, ConfigError, Secret};
use serde::Serialize;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqError, ZmqMessage};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct Request<'a> {
    command: &'a str,
    params: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ConfigChannel {
    endpoint: String,
    timeout: Duration,
}

impl ConfigChannel {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            endpoint: format!("tcp://{host}:{port}"),
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(&config.config_host, config.config_port)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends `command` and returns the decoded response.
    pub async fn request(&self, command: &str) -> Result<Value, ConfigError> {
        match timeout(self.timeout, self.exchange(command)).await {
            Ok(result) => result,
            Err(_) => Err(ConfigError::Channel(format!(
                "`{command}` timed out after {:?}",
                self.timeout
            ))),
        }
    }

    // A REQ socket that missed its reply cannot send again, so every request
    // gets its own socket.
    async fn exchange(&self, command: &str) -> Result<Value, ConfigError> {
        let channel_err = |err: ZmqError| ConfigError::Channel(format!("{}: {err}", self.endpoint));
        let mut socket = ReqSocket::new();
        socket.connect(&self.endpoint).await.map_err(channel_err)?;

        let request = serde_json::to_string(&Request {
            command,
            params: None,
        })
        .map_err(|err| ConfigError::Channel(err.to_string()))?;
        socket
            .send(ZmqMessage::from(request))
            .await
            .map_err(channel_err)?;

        let reply = socket.recv().await.map_err(channel_err)?;
        let frame = reply
            .get(0)
            .ok_or_else(|| ConfigError::Channel(format!("`{command}`: empty reply")))?;
        serde_json::from_slice(&frame[..])
            .map_err(|err| ConfigError::Channel(format!("`{command}`: invalid response: {err}")))
    }

    /// Asks for one secret; anything but a non-blank string counts as missing.
    pub async fn fetch_secret(&self, secret: Secret) -> Option<String> {
        match self.request(secret.command()).await {
            Ok(Value::String(value)) if !value.trim().is_empty() => Some(value),
            Ok(other) => {
                warn!(secret = secret.name(), response = %other, "marketplace-sync: config channel returned no value");
                None
            }
            Err(err) => {
                warn!(secret = secret.name(), %err, "marketplace-sync: config channel request failed");
                None
            }
        }
    }
}

/// Fills every secret the environment left unset from the channel.
pub async fn resolve_secrets(config: &mut AgentConfig, channel: &ConfigChannel) {
    for secret in config.missing_secrets() {
        debug!(secret = secret.name(), "marketplace-sync: requesting secret from config channel");
        if let Some(value) = channel.fetch_secret(secret).await {
            config.set_secret(secret, &value);
        }
    }
}
