//! Provider registry.
//!
//! A [`ProviderSpec`] describes one external system the vault can hold
//! credentials for: either a full OAuth 2.0 authorization server (endpoints,
//! client registration, default scopes) or a plain api-key provider with no
//! token lifecycle at all.  The [`ProviderRegistry`] maps provider names to
//! specs and is loaded from configuration by the CLI.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default timeout for blocking auth operations, consistent with the token
/// refresh safety window.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// OAuth 2.0 endpoint and client configuration for a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthEndpoints {
    /// The authorization endpoint URL.
    pub auth_url: String,

    /// The token endpoint URL.
    pub token_url: String,

    /// The device authorization endpoint, for providers supporting RFC 8628.
    pub device_auth_url: Option<String>,

    /// The redirect URI registered with the authorization server.
    pub redirect_uri: String,

    /// The OAuth client ID.
    pub client_id: String,

    /// The OAuth client secret (confidential clients only).
    pub client_secret: Option<String>,

    /// Scopes requested when the caller asks for none explicitly.
    #[serde(default)]
    pub default_scopes: Vec<String>,
}

/// How a provider authenticates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderKind {
    /// OAuth 2.0 with token refresh.
    #[serde(rename = "oauth")]
    OAuth(OAuthEndpoints),

    /// Static API key; no refresh lifecycle.
    ApiKey,
}

/// A configured provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Unique provider name (e.g. "google", "stripe").
    pub name: String,

    /// Authentication shape.
    #[serde(flatten)]
    pub kind: ProviderKind,

    /// Timeout applied to this provider's blocking operations (token
    /// endpoint calls, credential fetches during activation).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl ProviderSpec {
    /// The OAuth endpoints, when this is an OAuth provider.
    pub fn oauth(&self) -> Option<&OAuthEndpoints> {
        match &self.kind {
            ProviderKind::OAuth(endpoints) => Some(endpoints),
            ProviderKind::ApiKey => None,
        }
    }

    /// Whether this provider uses a static API key.
    pub fn is_api_key(&self) -> bool {
        matches!(self.kind, ProviderKind::ApiKey)
    }
}

/// Name-keyed collection of provider specs.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderSpec>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from already-parsed specs (the CLI deserializes
    /// `providers.toml` into these).
    pub fn with_providers(specs: impl IntoIterator<Item = ProviderSpec>) -> Self {
        let mut registry = Self::new();
        for spec in specs {
            registry.insert(spec);
        }
        registry
    }

    /// Register (or replace) a provider spec.
    pub fn insert(&mut self, spec: ProviderSpec) {
        tracing::debug!(provider = %spec.name, "provider registered");
        self.providers.insert(spec.name.clone(), spec);
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Option<&ProviderSpec> {
        self.providers.get(name)
    }

    /// All registered provider names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
