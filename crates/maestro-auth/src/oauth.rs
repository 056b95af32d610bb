//! OAuth 2.0 Authorization Code flow with PKCE.
//!
//! Implements the authorization code flow (RFC 6749) with Proof Key for
//! Code Exchange (RFC 7636).  PKCE is mandatory for every flow to prevent
//! authorization code interception.
//!
//! # Flow Overview
//!
//! 1. Generate a PKCE code verifier and code challenge.
//! 2. Build an authorization URL and send the user to it.
//! 3. Receive the authorization code via the local callback server.
//! 4. Exchange the code + verifier for a token grant.
//! 5. Refresh the grant when it nears expiry.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;
use url::Url;

use crate::error::{AuthError, Result};
use crate::provider::OAuthEndpoints;

/// Length of the PKCE code verifier in bytes (before base64 encoding).
const PKCE_VERIFIER_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Token grant
// ---------------------------------------------------------------------------

/// Tokens returned by the authorization server after a successful exchange
/// or refresh.  Short-lived in memory: the token manager immediately seals
/// grants into the vault.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    /// The access token used to authenticate API requests.
    pub access_token: String,

    /// The refresh token used to obtain new access tokens.
    pub refresh_token: Option<String>,

    /// When the access token expires.
    pub expires_at: Option<DateTime<Utc>>,

    /// The token type (typically "Bearer").
    pub token_type: String,

    /// The scopes the server actually granted.
    pub scopes: Vec<String>,
}

/// Raw token response from the authorization server.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
    scope: Option<String>,
}

impl TokenResponse {
    /// Convert into a [`TokenGrant`], computing `expires_at` from
    /// `expires_in`.
    fn into_grant(self) -> TokenGrant {
        let expires_at = self
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        let scopes = self
            .scope
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        TokenGrant {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scopes,
        }
    }
}

/// Raw error response from the authorization server.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

// ---------------------------------------------------------------------------
// PKCE helpers
// ---------------------------------------------------------------------------

/// Generate a PKCE code verifier (random 32 bytes, base64url encoded).
pub fn generate_pkce_verifier() -> Result<String> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; PKCE_VERIFIER_BYTES];
    rng.fill(&mut bytes).map_err(|_| AuthError::FlowFailed {
        reason: "failed to generate PKCE verifier: CSPRNG error".to_string(),
    })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Derive the PKCE code challenge from a verifier using SHA-256.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn pkce_challenge(verifier: &str) -> String {
    let hash = digest::digest(&digest::SHA256, verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

// ---------------------------------------------------------------------------
// OAuth client
// ---------------------------------------------------------------------------

/// HTTP client for one provider's OAuth endpoints.
///
/// Stateless between calls — flow state (verifier, CSRF state) is held by
/// the caller.
pub struct OAuthClient {
    endpoints: OAuthEndpoints,
    http: reqwest::Client,
}

impl OAuthClient {
    /// Create a client for the given endpoints with the given request
    /// timeout.
    pub fn new(endpoints: OAuthEndpoints, timeout: std::time::Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { endpoints, http }
    }

    /// The configured endpoints.
    pub fn endpoints(&self) -> &OAuthEndpoints {
        &self.endpoints
    }

    /// Build the authorization URL the user should visit, carrying the PKCE
    /// challenge (S256) and a CSRF `state`.
    pub fn authorization_url(
        &self,
        state: &str,
        code_challenge: &str,
        scopes: &[String],
    ) -> Result<String> {
        let mut url = Url::parse(&self.endpoints.auth_url)?;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.endpoints.client_id);
            params.append_pair("redirect_uri", &self.endpoints.redirect_uri);
            params.append_pair("state", state);
            params.append_pair("code_challenge", code_challenge);
            params.append_pair("code_challenge_method", "S256");

            if !scopes.is_empty() {
                params.append_pair("scope", &scopes.join(" "));
            }
        }

        Ok(url.to_string())
    }

    /// Exchange an authorization code for a token grant.  `code_verifier`
    /// must be the verifier whose challenge was sent in the authorization
    /// URL.
    pub async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenGrant> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.endpoints.redirect_uri.as_str()),
            ("client_id", self.endpoints.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];

        let secret_binding;
        if let Some(ref secret) = self.endpoints.client_secret {
            secret_binding = secret.clone();
            params.push(("client_secret", &secret_binding));
        }

        tracing::debug!(token_url = %self.endpoints.token_url, "exchanging authorization code");

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&params)
            .send()
            .await?;

        parse_token_response(response).await
    }

    /// Refresh an access token using a refresh token.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidGrant`] for a definitive rejection (revoked or
    /// invalid refresh token); [`AuthError::ServerError`] /
    /// [`AuthError::Network`] for transient failures the caller may retry.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.endpoints.client_id.as_str()),
        ];

        let secret_binding;
        if let Some(ref secret) = self.endpoints.client_secret {
            secret_binding = secret.clone();
            params.push(("client_secret", &secret_binding));
        }

        tracing::debug!(token_url = %self.endpoints.token_url, "refreshing access token");

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&params)
            .send()
            .await?;

        parse_token_response(response).await
    }
}

/// Parse the HTTP response from a token endpoint, distinguishing transient
/// server failures from definitive grant rejections.
pub(crate) async fn parse_token_response(response: reqwest::Response) -> Result<TokenGrant> {
    let status = response.status();

    if status.is_success() {
        let token_response: TokenResponse = response.json().await?;
        tracing::debug!("token endpoint returned a grant");
        return Ok(token_response.into_grant());
    }

    if status.is_server_error() {
        return Err(AuthError::ServerError {
            status: status.as_u16(),
        });
    }

    let body = response.text().await.unwrap_or_default();
    if let Ok(error_response) = serde_json::from_str::<TokenErrorResponse>(&body) {
        let reason = error_response
            .error_description
            .unwrap_or(error_response.error);
        Err(AuthError::InvalidGrant { reason })
    } else {
        Err(AuthError::InvalidGrant {
            reason: format!("HTTP {status}: {body}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
