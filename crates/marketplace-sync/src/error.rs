// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the sync engine and its backend adapters.
//!
//! Every variant here is recoverable from the engine's point of view: the
//! lifecycle manager retries credential failures, the coordinator retries
//! store writes on the next reconciliation, and malformed documents are
//! skipped. Only [`ConfigError`] is meant to reach the process boundary.

use thiserror::Error;

/// Failures while exchanging the refresh token for an id token.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Network, TLS or body-read failure.
    #[error("token exchange transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The token endpoint answered with a non-success status.
    #[error("token endpoint returned status {0}")]
    Status(u16),
    /// The response body was not the expected JSON object.
    #[error("malformed token response: {0}")]
    MalformedResponse(String),
    /// The response lacked a required field.
    #[error("token response is missing `{0}`")]
    MissingField(&'static str),
}

/// Failures reading or writing the device record.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("device store transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("device store rejected credentials")]
    Unauthorized,
    #[error("device store returned status {0}")]
    Status(u16),
    #[error("failed to decode device record: {0}")]
    Decode(String),
}

/// Failures inside a change-stream subscription.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("change stream transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("change stream returned status {0}")]
    Status(u16),
    #[error("failed to decode change stream payload: {0}")]
    Decode(String),
    /// The transport has been shut down and accepts no subscriptions.
    #[error("change stream transport closed")]
    Closed,
}

/// A document in a change event does not match the expected schema.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document `{id}` is missing field `{field}`")]
    MissingField { id: String, field: &'static str },
    #[error("document `{id}` has invalid field `{field}`: {reason}")]
    InvalidField {
        id: String,
        field: &'static str,
        reason: String,
    },
    #[error("`{id}` is not a semantic version: {reason}")]
    InvalidVersion { id: String, reason: String },
}

/// Bootstrap configuration failures. These are fatal for the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("config channel error: {0}")]
    Channel(String),
}
