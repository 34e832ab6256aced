// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Engine timings and process bootstrap settings.
//!
//! [`SyncConfig`] carries the timer cadences used by the lifecycle manager,
//! the watchdog and the polling transport. [`AgentConfig`] is what the agent
//! binary assembles from its environment (and, for missing secrets, from the
//! config channel) before any engine component is constructed.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

/// Delay before retrying a failed client initialisation.
pub const DEFAULT_INIT_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Id tokens live for an hour; refresh a little before that.
pub const DEFAULT_TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(58 * 60);
/// Window without liveness signals after which the connection is unhealthy.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);
/// Debounce applied to restarts triggered by the unhealthy/expired hooks.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(500);
/// Cadence of the polling change-stream transport.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

const DEFAULT_CONFIG_HOST: &str = "127.0.0.1";
const DEFAULT_CONFIG_PORT: u16 = 5555;
const DEFAULT_LOG_LEVEL: &str = "info";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

const ENV_CONFIG_HOST: &str = "CONFIG_HOST";
const ENV_CONFIG_PORT: &str = "CONFIG_PORT";
const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

/// Timer settings for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Fixed delay between failed initialisation attempts.
    pub init_retry_delay: Duration,
    /// Interval at which the token-expired hook fires.
    pub token_refresh_interval: Duration,
    /// Liveness window enforced by the watchdog.
    pub watchdog_timeout: Duration,
    /// Debounce applied before a hook-triggered restart.
    pub restart_delay: Duration,
    /// Poll cadence of the polling transport; must stay below the watchdog timeout.
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            init_retry_delay: DEFAULT_INIT_RETRY_DELAY,
            token_refresh_interval: DEFAULT_TOKEN_REFRESH_INTERVAL,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            restart_delay: DEFAULT_RESTART_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("init_retry_delay", self.init_retry_delay),
            ("token_refresh_interval", self.token_refresh_interval),
            ("watchdog_timeout", self.watchdog_timeout),
            ("restart_delay", self.restart_delay),
            ("poll_interval", self.poll_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        // A poll slower than the watchdog would flag every healthy connection.
        if self.poll_interval >= self.watchdog_timeout {
            return Err(ConfigError::Invalid(format!(
                "poll_interval {:?} must be shorter than watchdog_timeout {:?}",
                self.poll_interval, self.watchdog_timeout
            )));
        }
        Ok(())
    }
}

/// The four secrets the agent needs before it can talk to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Secret {
    ApiKey,
    ProjectId,
    RefreshToken,
    DeviceId,
}

impl Secret {
    pub const ALL: [Secret; 4] = [
        Secret::ApiKey,
        Secret::ProjectId,
        Secret::RefreshToken,
        Secret::DeviceId,
    ];

    /// Environment variable that may carry the secret.
    pub fn env_var(self) -> &'static str {
        match self {
            Secret::ApiKey => "MARKETPLACE_API_KEY",
            Secret::ProjectId => "MARKETPLACE_PROJECT_ID",
            Secret::RefreshToken => "MARKETPLACE_REFRESH_TOKEN",
            Secret::DeviceId => "MARKETPLACE_DEVICE_ID",
        }
    }

    /// Command understood by the config channel.
    pub fn command(self) -> &'static str {
        match self {
            Secret::ApiKey => "get_api_key",
            Secret::ProjectId => "get_project_id",
            Secret::RefreshToken => "get_refresh_token",
            Secret::DeviceId => "get_device_id",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Secret::ApiKey => "api_key",
            Secret::ProjectId => "project_id",
            Secret::RefreshToken => "refresh_token",
            Secret::DeviceId => "device_id",
        }
    }
}

/// Process-level settings for the agent binary.
#[derive(Clone)]
pub struct AgentConfig {
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub refresh_token: Option<String>,
    pub device_id: Option<String>,
    /// Host of the request/response config channel.
    pub config_host: String,
    /// Port of the request/response config channel.
    pub config_port: u16,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("project_id", &self.project_id)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("device_id", &self.device_id)
            .field("config_host", &self.config_host)
            .field("config_port", &self.config_port)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            project_id: None,
            refresh_token: None,
            device_id: None,
            config_host: DEFAULT_CONFIG_HOST.to_string(),
            config_port: DEFAULT_CONFIG_PORT,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let mut config = Self {
            config_host: map
                .get(ENV_CONFIG_HOST)
                .and_then(|value| sanitize_non_empty(value))
                .unwrap_or_else(|| DEFAULT_CONFIG_HOST.to_string()),
            config_port: map
                .get(ENV_CONFIG_PORT)
                .and_then(|value| value.trim().parse::<u16>().ok())
                .unwrap_or(DEFAULT_CONFIG_PORT),
            log_level: map
                .get(ENV_LOG_LEVEL)
                .map(|value| value.trim().to_lowercase())
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            ..Default::default()
        };
        for secret in Secret::ALL {
            if let Some(value) = map.get(secret.env_var()) {
                config.set_secret(secret, value);
            }
        }
        config
    }

    pub fn secret(&self, secret: Secret) -> Option<&str> {
        match secret {
            Secret::ApiKey => self.api_key.as_deref(),
            Secret::ProjectId => self.project_id.as_deref(),
            Secret::RefreshToken => self.refresh_token.as_deref(),
            Secret::DeviceId => self.device_id.as_deref(),
        }
    }

    /// Stores a secret, ignoring blank values.
    pub fn set_secret(&mut self, secret: Secret, value: &str) {
        let value = sanitize_non_empty(value);
        match secret {
            Secret::ApiKey => self.api_key = value,
            Secret::ProjectId => self.project_id = value,
            Secret::RefreshToken => self.refresh_token = value,
            Secret::DeviceId => self.device_id = value,
        }
    }

    /// Secrets that are still unresolved.
    pub fn missing_secrets(&self) -> Vec<Secret> {
        Secret::ALL
            .into_iter()
            .filter(|secret| self.secret(*secret).is_none())
            .collect()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        if self.config_port == 0 {
            return Err(ConfigError::Invalid(
                "config channel port must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Extracts the device credentials, failing on the first missing secret.
    pub fn device_credentials(&self) -> Result<DeviceCredentials, ConfigError> {
        let require = |secret: Secret| {
            self.secret(secret)
                .map(str::to_string)
                .ok_or(ConfigError::Missing(secret.name()))
        };
        Ok(DeviceCredentials {
            api_key: require(Secret::ApiKey)?,
            project_id: require(Secret::ProjectId)?,
            refresh_token: require(Secret::RefreshToken)?,
            device_id: require(Secret::DeviceId)?,
        })
    }
}

/// Fully resolved secrets identifying this device towards the backend.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub api_key: String,
    pub project_id: String,
    pub refresh_token: String,
    pub device_id: String,
}

impl fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("api_key", &"<redacted>")
            .field("project_id", &self.project_id)
            .field("refresh_token", &"<redacted>")
            .field("device_id", &self.device_id)
            .finish()
    }
}

fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
