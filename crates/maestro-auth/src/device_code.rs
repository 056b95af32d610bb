//! RFC 8628 Device Authorization Grant.
//!
//! The device flow lets a CLI authenticate a user without a local browser:
//! the client displays a short code, the user enters it on another device,
//! and the client polls the token endpoint until authorization completes.

use serde::Deserialize;

use crate::error::{AuthError, Result};
use crate::oauth::{TokenGrant, parse_token_response};
use crate::provider::OAuthEndpoints;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Response from the device authorization endpoint.
#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    /// The device verification code used for polling.
    pub device_code: String,

    /// The code to display to the user.
    pub user_code: String,

    /// The URI the user should visit to enter the code.
    pub verification_uri: String,

    /// Optional complete URI with the user code pre-filled.
    pub verification_uri_complete: Option<String>,

    /// Lifetime of the codes in seconds.
    pub expires_in: u64,

    /// The minimum polling interval in seconds.
    pub interval: u64,
}

/// Raw device authorization response.  Some servers use `verification_url`
/// instead of `verification_uri`.
#[derive(Debug, Deserialize)]
struct RawDeviceAuthorization {
    device_code: String,
    user_code: String,
    verification_uri: Option<String>,
    verification_url: Option<String>,
    verification_uri_complete: Option<String>,
    expires_in: u64,
    #[serde(default = "default_interval")]
    interval: u64,
}

fn default_interval() -> u64 {
    5
}

/// Error response from the token endpoint during polling.
#[derive(Debug, Deserialize)]
struct PollErrorResponse {
    error: String,
}

// ---------------------------------------------------------------------------
// Device code flow
// ---------------------------------------------------------------------------

/// Manages an RFC 8628 device authorization grant flow.
pub struct DeviceCodeFlow {
    endpoints: OAuthEndpoints,
    device_auth_url: String,
    http: reqwest::Client,
}

impl DeviceCodeFlow {
    /// Create a flow for the given endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UnsupportedMethod`] if the provider declares no
    /// device authorization endpoint.
    pub fn new(
        provider: &str,
        endpoints: OAuthEndpoints,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let device_auth_url =
            endpoints
                .device_auth_url
                .clone()
                .ok_or_else(|| AuthError::UnsupportedMethod {
                    provider: provider.to_string(),
                    reason: "no device authorization endpoint configured".to_string(),
                })?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Ok(Self {
            endpoints,
            device_auth_url,
            http,
        })
    }

    /// Request a device code from the authorization server.
    pub async fn request_device_code(&self, scopes: &[String]) -> Result<DeviceAuthorization> {
        let mut params = vec![("client_id", self.endpoints.client_id.as_str())];

        let scopes_joined;
        if !scopes.is_empty() {
            scopes_joined = scopes.join(" ");
            params.push(("scope", &scopes_joined));
        }

        tracing::debug!(device_auth_url = %self.device_auth_url, "requesting device code");

        let response = self
            .http
            .post(&self.device_auth_url)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::FlowFailed {
                reason: format!("device code request failed: HTTP {status}: {body}"),
            });
        }

        let raw: RawDeviceAuthorization = response.json().await?;

        let verification_uri = raw
            .verification_uri
            .or(raw.verification_url)
            .ok_or_else(|| AuthError::FlowFailed {
                reason: "device code response missing verification_uri".to_string(),
            })?;

        Ok(DeviceAuthorization {
            device_code: raw.device_code,
            user_code: raw.user_code,
            verification_uri,
            verification_uri_complete: raw.verification_uri_complete,
            expires_in: raw.expires_in,
            interval: raw.interval,
        })
    }

    /// Poll the token endpoint until the user completes authorization.
    ///
    /// Polls every `interval` seconds (increasing on `slow_down`) and gives
    /// up after `timeout` seconds.
    pub async fn poll_for_grant(
        &self,
        device_code: &str,
        interval: u64,
        timeout: u64,
    ) -> Result<TokenGrant> {
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(timeout);
        let mut current_interval = interval;

        tracing::debug!(
            interval = current_interval,
            timeout = timeout,
            "polling for device code grant"
        );

        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(current_interval)).await;

            if tokio::time::Instant::now() >= deadline {
                return Err(AuthError::CallbackTimeout {
                    timeout_secs: timeout,
                });
            }

            let params = [
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("device_code", device_code),
                ("client_id", self.endpoints.client_id.as_str()),
            ];

            let response = self
                .http
                .post(&self.endpoints.token_url)
                .form(&params)
                .send()
                .await?;

            let status = response.status();

            if status.is_success() {
                tracing::info!("device code flow completed");
                return parse_token_response(response).await;
            }

            let body = response.text().await.unwrap_or_default();
            let poll_error =
                serde_json::from_str::<PollErrorResponse>(&body).map_err(|_| {
                    AuthError::FlowFailed {
                        reason: format!("unexpected token response: HTTP {status}: {body}"),
                    }
                })?;

            match poll_error.error.as_str() {
                "authorization_pending" => {
                    tracing::trace!("authorization pending, will retry");
                }
                "slow_down" => {
                    // Increase by 5 seconds per RFC 8628 section 3.5.
                    current_interval += 5;
                    tracing::debug!(
                        new_interval = current_interval,
                        "slow_down received, increasing poll interval"
                    );
                }
                "access_denied" => {
                    return Err(AuthError::FlowFailed {
                        reason: "user denied authorization".to_string(),
                    });
                }
                "expired_token" => {
                    return Err(AuthError::FlowFailed {
                        reason: "device code expired before user completed authorization"
                            .to_string(),
                    });
                }
                other => {
                    return Err(AuthError::FlowFailed {
                        reason: format!("device code poll error: {other}"),
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
