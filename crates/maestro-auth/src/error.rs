//! Error types for the auth crate.
//!
//! The credential-error taxonomy matters to callers: `NotFound` (nothing
//! stored), `Expired` (a refresh was attempted and failed), and
//! `InsufficientScope` (stored grant does not cover the request) each call
//! for a different user action and must never collapse into one another.
//! Transient transport failures are retried by the token manager and only
//! escalate to `Expired` once retries exhaust.

/// Unified error type for the Maestro auth crate.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credential is stored for the given (provider, profile).
    #[error("no credential stored: provider={provider}, profile={profile}")]
    NotFound { provider: String, profile: String },

    /// The credential is expired and could not be refreshed.
    #[error("credential expired: provider={provider}, profile={profile}")]
    Expired { provider: String, profile: String },

    /// The request asked for scopes beyond what the stored grant covers.
    #[error(
        "insufficient scope: provider={provider}, profile={profile}, missing={missing:?}"
    )]
    InsufficientScope {
        provider: String,
        profile: String,
        missing: Vec<String>,
    },

    /// The stored record failed authentication in the vault and has been
    /// quarantined.
    #[error("corrupt credential record: provider={provider}, profile={profile}")]
    CorruptRecord { provider: String, profile: String },

    /// The authorization server definitively rejected a grant (revoked or
    /// invalid refresh token, bad authorization code).  Never retried.
    #[error("invalid grant: {reason}")]
    InvalidGrant { reason: String },

    /// The provider is not present in the provider registry.
    #[error("provider not configured: {provider}")]
    ProviderNotConfigured { provider: String },

    /// The requested authentication method does not apply to the provider
    /// (e.g. a device-code flow against an api-key provider).
    #[error("unsupported auth method for provider {provider}: {reason}")]
    UnsupportedMethod { provider: String, reason: String },

    /// The authorization server answered with a 5xx.  Transient.
    #[error("authorization server error: HTTP {status}")]
    ServerError { status: u16 },

    /// An HTTP request to the authorization server failed in transport.
    /// Transient.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The overall authentication flow failed (state mismatch, malformed
    /// callback, user denial).
    #[error("authentication flow failed: {reason}")]
    FlowFailed { reason: String },

    /// The local callback server timed out waiting for the redirect.
    #[error("callback timed out after {timeout_secs} seconds")]
    CallbackTimeout { timeout_secs: u64 },

    /// An error propagated from the vault crate.
    #[error("vault error: {0}")]
    Vault(#[from] maestro_vault::VaultError),

    /// JSON serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (e.g. from the callback TCP listener).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing error.
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl AuthError {
    /// Whether the failure is worth retrying with backoff.  Definitive
    /// rejections (`InvalidGrant`) and everything credential-shaped are
    /// final.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::ServerError { .. })
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
