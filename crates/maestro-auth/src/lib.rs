//! OAuth token manager for Maestro.
//!
//! Built on [`maestro_vault`], this crate owns the credential lifecycle:
//! it runs the interactive flows (authorization code with PKCE, RFC 8628
//! device code), refreshes tokens before they expire, validates scopes,
//! and reports health.  Consuming code talks to [`TokenManager`] and never
//! touches token endpoints or vault rows directly.
//!
//! # Modules
//!
//! - [`provider`] — provider specs and the name-keyed registry.
//! - [`oauth`] — PKCE authorization code flow and token endpoint client.
//! - [`device_code`] — RFC 8628 device authorization grant.
//! - [`callback`] — single-shot local HTTP server for the OAuth redirect.
//! - [`token_manager`] — authenticate / ensure-fresh / health on the vault.
//! - [`error`] — unified error type with the credential-error taxonomy.

pub mod callback;
pub mod device_code;
pub mod error;
pub mod oauth;
pub mod provider;
pub mod token_manager;

// Re-export the most commonly used types at the crate root for convenience.
pub use error::{AuthError, Result};
pub use oauth::{OAuthClient, TokenGrant};
pub use provider::{OAuthEndpoints, ProviderKind, ProviderRegistry, ProviderSpec};
pub use token_manager::{
    AccessCredential, AuthMethod, DEFAULT_REFRESH_WINDOW_SECS, TokenManager,
};
