// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Refresh-token exchange against the Firebase secure-token endpoint.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AuthError;
use crate::transport::Credentials;

const TOKEN_ENDPOINT: &str = "/v1/token";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    /// The endpoint may rotate the refresh token.
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Clone)]
pub struct SecureTokenClient {
    http: Client,
    url: String,
    api_key: String,
}

impl std::fmt::Debug for SecureTokenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureTokenClient")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl SecureTokenClient {
    pub fn new(http: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            url: format!("{}{TOKEN_ENDPOINT}", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
        }
    }

    /// Exchanges `refresh_token` for a user id and a fresh id token.
    pub async fn exchange(&self, refresh_token: &str) -> Result<Credentials, AuthError> {
        debug!(url = %self.url, "marketplace-sync: exchanging refresh token");
        let response = self
            .http
            .post(&self.url)
            .query(&[("key", self.api_key.as_str())])
            .json(&TokenRequest {
                grant_type: "refresh_token",
                refresh_token,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|err| AuthError::MalformedResponse(err.to_string()))?;

        let user_id = parsed
            .user_id
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::MissingField("user_id"))?;
        let id_token = parsed
            .id_token
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::MissingField("id_token"))?;
        Ok(Credentials {
            user_id,
            id_token,
            refresh_token: parsed
                .refresh_token
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| refresh_token.to_string()),
        })
    }
}
