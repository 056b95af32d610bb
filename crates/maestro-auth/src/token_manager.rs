//! Token lifecycle management on top of the vault.
//!
//! The [`TokenManager`] is the single entry point consuming code uses to
//! obtain credentials: it runs interactive flows ([`TokenManager::authenticate`]),
//! serves fresh access credentials ([`TokenManager::ensure_fresh`]), and
//! reports credential health.
//!
//! Refresh is pull-based: nothing refreshes in the background, a token is
//! refreshed lazily when `ensure_fresh` finds it inside the safety window.
//! Concurrent callers for the same (provider, profile) serialize on a
//! per-key async lock and re-check after acquiring it, so a burst of
//! requests triggers exactly one refresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use maestro_vault::{
    Credential, CredentialHealth, CredentialKind, RecordId, Secret, SecretPayload, Vault,
    VaultError,
};

use crate::callback::CallbackServer;
use crate::device_code::DeviceCodeFlow;
use crate::error::{AuthError, Result};
use crate::oauth::{OAuthClient, TokenGrant, generate_pkce_verifier, pkce_challenge};
use crate::provider::{ProviderKind, ProviderRegistry, ProviderSpec};

/// Safety window: a token expiring within this many seconds is refreshed
/// before being handed out.
pub const DEFAULT_REFRESH_WINDOW_SECS: i64 = 300;

/// Maximum refresh attempts on transient network failure.
const REFRESH_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff between refresh attempts.
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Fallback port for the local OAuth callback server when the redirect URI
/// does not carry one.
const DEFAULT_CALLBACK_PORT: u16 = 8737;

/// How long the callback server waits for the browser redirect.
const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 300;

/// How long the device-code flow polls before giving up.
const DEFAULT_DEVICE_TIMEOUT_SECS: u64 = 900;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// How [`TokenManager::authenticate`] should obtain the credential.
pub enum AuthMethod {
    /// Browser-based authorization code flow with PKCE.
    AuthorizationCode,
    /// RFC 8628 device authorization flow.
    DeviceCode,
    /// Directly supplied API key (api-key providers only).
    ApiKey(Secret),
}

/// A credential ready for injection: the bearer secret plus the record
/// handle everything else references it by.
#[derive(Debug, Clone)]
pub struct AccessCredential {
    /// Handle of the backing vault record.  This is what activation records
    /// reference — never the secret itself.
    pub record_id: RecordId,
    pub provider: String,
    pub profile: String,
    pub kind: CredentialKind,
    /// The secret to present to the provider.  Redacted in Debug output.
    pub secret: Secret,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// TokenManager
// ---------------------------------------------------------------------------

/// Credential lifecycle manager backed by the vault and a provider
/// registry.
pub struct TokenManager {
    vault: Arc<Vault>,
    providers: ProviderRegistry,
    refresh_window: chrono::Duration,
    refresh_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl TokenManager {
    /// Create a token manager with the default 5-minute refresh window.
    pub fn new(vault: Arc<Vault>, providers: ProviderRegistry) -> Self {
        Self::with_refresh_window(vault, providers, DEFAULT_REFRESH_WINDOW_SECS)
    }

    /// Create a token manager with a custom refresh safety window.
    pub fn with_refresh_window(
        vault: Arc<Vault>,
        providers: ProviderRegistry,
        window_secs: i64,
    ) -> Self {
        Self {
            vault,
            providers,
            refresh_window: chrono::Duration::seconds(window_secs),
            refresh_locks: DashMap::new(),
        }
    }

    /// The provider registry this manager consults.
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// The vault this manager stores into.
    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    // -- Authentication -----------------------------------------------------

    /// Run an authentication flow for (provider, profile) and store the
    /// resulting credential, superseding any previous one.
    ///
    /// `scopes` are the scopes to request; empty means the provider's
    /// default scopes.
    pub async fn authenticate(
        &self,
        actor: &str,
        provider: &str,
        profile: &str,
        scopes: &[String],
        method: AuthMethod,
    ) -> Result<RecordId> {
        let spec = self.spec(provider)?;

        match (&spec.kind, method) {
            (ProviderKind::ApiKey, AuthMethod::ApiKey(key)) => {
                let payload = SecretPayload::ApiKey { key };
                let id = self
                    .vault
                    .put(actor, provider, profile, &payload, scopes, None)?;
                tracing::info!(provider = provider, profile = profile, "stored api key");
                Ok(id)
            }
            (ProviderKind::ApiKey, _) => Err(AuthError::UnsupportedMethod {
                provider: provider.to_string(),
                reason: "api-key providers take the key directly".to_string(),
            }),
            (ProviderKind::OAuth(_), AuthMethod::ApiKey(_)) => Err(AuthError::UnsupportedMethod {
                provider: provider.to_string(),
                reason: "oauth providers require an authorization flow".to_string(),
            }),
            (ProviderKind::OAuth(endpoints), AuthMethod::AuthorizationCode) => {
                let endpoints = endpoints.clone();
                let requested = requested_scopes(scopes, &endpoints.default_scopes);
                let grant = self
                    .run_authorization_code_flow(provider, &endpoints, &requested, spec.timeout_secs)
                    .await?;
                self.store_grant(actor, provider, profile, &requested, grant)
            }
            (ProviderKind::OAuth(endpoints), AuthMethod::DeviceCode) => {
                let endpoints = endpoints.clone();
                let requested = requested_scopes(scopes, &endpoints.default_scopes);
                let flow = DeviceCodeFlow::new(
                    provider,
                    endpoints,
                    Duration::from_secs(spec.timeout_secs),
                )?;

                let authorization = flow.request_device_code(&requested).await?;
                tracing::info!(
                    user_code = %authorization.user_code,
                    verification_uri = %authorization.verification_uri,
                    "enter this code at the URL shown to authorize"
                );
                if let Some(ref complete) = authorization.verification_uri_complete {
                    tracing::info!(url = %complete, "or open this URL directly");
                }

                let grant = flow
                    .poll_for_grant(
                        &authorization.device_code,
                        authorization.interval,
                        DEFAULT_DEVICE_TIMEOUT_SECS,
                    )
                    .await?;
                self.store_grant(actor, provider, profile, &requested, grant)
            }
        }
    }

    /// PKCE authorization code flow: build the URL, wait for the local
    /// callback, verify CSRF state, exchange the code.
    async fn run_authorization_code_flow(
        &self,
        provider: &str,
        endpoints: &crate::provider::OAuthEndpoints,
        scopes: &[String],
        timeout_secs: u64,
    ) -> Result<TokenGrant> {
        tracing::info!(provider = provider, "starting OAuth authorization code flow");

        let verifier = generate_pkce_verifier()?;
        let challenge = pkce_challenge(&verifier);
        let state = Uuid::now_v7().to_string();

        let client = OAuthClient::new(endpoints.clone(), Duration::from_secs(timeout_secs));
        let auth_url = client.authorization_url(&state, &challenge, scopes)?;

        tracing::info!(url = %auth_url, "open this URL in your browser to authorize");

        let port = callback_port(&endpoints.redirect_uri);
        let (code, returned_state) =
            CallbackServer::wait_for_redirect(port, DEFAULT_CALLBACK_TIMEOUT_SECS).await?;

        if returned_state != state {
            return Err(AuthError::FlowFailed {
                reason: format!("state mismatch: expected {state}, got {returned_state}"),
            });
        }

        tracing::debug!("state parameter verified, exchanging code for tokens");
        client.exchange_code(&code, &verifier).await
    }

    /// Seal a grant into the vault as the new active record.
    fn store_grant(
        &self,
        actor: &str,
        provider: &str,
        profile: &str,
        requested: &[String],
        grant: TokenGrant,
    ) -> Result<RecordId> {
        // Servers that omit the scope field granted exactly what was asked.
        let granted = if grant.scopes.is_empty() {
            requested.to_vec()
        } else {
            grant.scopes.clone()
        };

        let payload = SecretPayload::OAuth {
            access_token: Secret::new(grant.access_token),
            refresh_token: grant.refresh_token.map(Secret::new),
            token_type: grant.token_type,
        };

        let id = self
            .vault
            .put(actor, provider, profile, &payload, &granted, grant.expires_at)?;

        tracing::info!(
            provider = provider,
            profile = profile,
            scopes = ?granted,
            "authentication flow completed, credential stored"
        );
        Ok(id)
    }

    // -- Freshness ----------------------------------------------------------

    /// Return a currently valid credential for (provider, profile),
    /// refreshing first if it expires within the safety window.
    ///
    /// `required_scopes` beyond the stored grant yield
    /// [`AuthError::InsufficientScope`]; api-key records skip the refresh
    /// path entirely and amount to a direct vault get.
    pub async fn ensure_fresh(
        &self,
        actor: &str,
        provider: &str,
        profile: &str,
        required_scopes: &[String],
    ) -> Result<AccessCredential> {
        let spec = self.spec(provider)?.clone();
        let cred = self.vault_get(actor, provider, profile)?;
        check_scopes(provider, profile, &cred.scopes, required_scopes)?;

        match cred.kind {
            CredentialKind::ApiKey | CredentialKind::Basic => Ok(access_credential(cred)),
            CredentialKind::OAuth => {
                if !self.expiring_soon(&cred) {
                    return Ok(access_credential(cred));
                }

                let lock = self.refresh_lock(provider, profile);
                let _guard = lock.lock().await;

                // Another caller may have refreshed while we queued.
                let cred = self.vault_get(actor, provider, profile)?;
                if !self.expiring_soon(&cred) {
                    return Ok(access_credential(cred));
                }

                self.refresh_and_store(actor, &spec, provider, profile, cred)
                    .await
            }
        }
    }

    /// Health of the stored credential for (provider, profile).
    pub fn health(&self, provider: &str, profile: &str) -> Result<CredentialHealth> {
        Ok(self.vault.health(provider, profile)?)
    }

    /// Revoke the stored credential for (provider, profile).
    pub fn revoke(&self, actor: &str, provider: &str, profile: &str) -> Result<()> {
        self.vault
            .revoke(actor, provider, profile)
            .map_err(|e| self.map_vault_error(e, provider, profile))
    }

    // -- Internal helpers ---------------------------------------------------

    /// Refresh the grant and store the result, with bounded backoff on
    /// transient failures.  Holds the caller's per-key refresh lock.
    async fn refresh_and_store(
        &self,
        actor: &str,
        spec: &ProviderSpec,
        provider: &str,
        profile: &str,
        cred: Credential,
    ) -> Result<AccessCredential> {
        let SecretPayload::OAuth {
            refresh_token: Some(ref refresh_token),
            ..
        } = cred.payload
        else {
            tracing::warn!(
                provider = provider,
                profile = profile,
                "token inside refresh window but no refresh token stored"
            );
            return Err(AuthError::Expired {
                provider: provider.to_string(),
                profile: profile.to_string(),
            });
        };

        let endpoints = spec.oauth().ok_or_else(|| AuthError::FlowFailed {
            reason: format!("stored oauth record but provider {provider} is not oauth"),
        })?;
        let client = OAuthClient::new(endpoints.clone(), Duration::from_secs(spec.timeout_secs));

        let mut attempt: u32 = 1;
        loop {
            match client.refresh(refresh_token.expose()).await {
                Ok(mut grant) => {
                    // Keep the old refresh token when the server returns none.
                    if grant.refresh_token.is_none() {
                        grant.refresh_token = Some(refresh_token.expose().to_string());
                    }
                    let requested = cred.scopes.clone();
                    let expires_at = grant.expires_at;
                    let access_token = grant.access_token.clone();
                    let granted = if grant.scopes.is_empty() {
                        requested.clone()
                    } else {
                        grant.scopes.clone()
                    };
                    let id = self.store_grant(actor, provider, profile, &requested, grant)?;

                    tracing::info!(
                        provider = provider,
                        profile = profile,
                        attempt = attempt,
                        "access token refreshed"
                    );
                    return Ok(AccessCredential {
                        record_id: id,
                        provider: provider.to_string(),
                        profile: profile.to_string(),
                        kind: CredentialKind::OAuth,
                        secret: Secret::new(access_token),
                        scopes: granted,
                        expires_at,
                    });
                }
                Err(e) if e.is_transient() && attempt < REFRESH_RETRY_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY_MS << (attempt - 1);
                    tracing::warn!(
                        provider = provider,
                        profile = profile,
                        attempt = attempt,
                        delay_ms = delay,
                        error = %e,
                        "transient refresh failure, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    tracing::error!(
                        provider = provider,
                        profile = profile,
                        attempts = attempt,
                        error = %e,
                        "refresh retries exhausted"
                    );
                    return Err(AuthError::Expired {
                        provider: provider.to_string(),
                        profile: profile.to_string(),
                    });
                }
                Err(AuthError::InvalidGrant { reason }) => {
                    // Definitive rejection: the record needs re-authentication
                    // and must never be silently retried.
                    tracing::error!(
                        provider = provider,
                        profile = profile,
                        reason = %reason,
                        "refresh definitively rejected, marking record failed"
                    );
                    self.vault.mark_failed(actor, provider, profile)?;
                    return Err(AuthError::Expired {
                        provider: provider.to_string(),
                        profile: profile.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spec(&self, provider: &str) -> Result<&ProviderSpec> {
        self.providers
            .get(provider)
            .ok_or_else(|| AuthError::ProviderNotConfigured {
                provider: provider.to_string(),
            })
    }

    fn vault_get(&self, actor: &str, provider: &str, profile: &str) -> Result<Credential> {
        self.vault
            .get(actor, provider, profile)
            .map_err(|e| self.map_vault_error(e, provider, profile))
    }

    fn map_vault_error(&self, e: VaultError, provider: &str, profile: &str) -> AuthError {
        match e {
            VaultError::NotFound { .. } => AuthError::NotFound {
                provider: provider.to_string(),
                profile: profile.to_string(),
            },
            VaultError::CorruptRecord { .. } => AuthError::CorruptRecord {
                provider: provider.to_string(),
                profile: profile.to_string(),
            },
            other => AuthError::Vault(other),
        }
    }

    fn expiring_soon(&self, cred: &Credential) -> bool {
        match cred.expires_at {
            Some(expires_at) => expires_at - Utc::now() <= self.refresh_window,
            // No expiry recorded means the token does not rotate.
            None => false,
        }
    }

    fn refresh_lock(&self, provider: &str, profile: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .entry(format!("{provider}/{profile}"))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn requested_scopes(explicit: &[String], defaults: &[String]) -> Vec<String> {
    if explicit.is_empty() {
        defaults.to_vec()
    } else {
        explicit.to_vec()
    }
}

/// Reject requests whose scopes exceed the stored grant.
fn check_scopes(
    provider: &str,
    profile: &str,
    granted: &[String],
    required: &[String],
) -> Result<()> {
    let missing: Vec<String> = required
        .iter()
        .filter(|scope| !granted.contains(scope))
        .cloned()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(AuthError::InsufficientScope {
            provider: provider.to_string(),
            profile: profile.to_string(),
            missing,
        })
    }
}

fn access_credential(cred: Credential) -> AccessCredential {
    AccessCredential {
        record_id: cred.id,
        provider: cred.provider,
        profile: cred.profile,
        kind: cred.kind,
        secret: cred.payload.bearer_secret().clone(),
        scopes: cred.scopes,
        expires_at: cred.expires_at,
    }
}

/// Extract the callback port from a loopback redirect URI.
fn callback_port(redirect_uri: &str) -> u16 {
    url::Url::parse(redirect_uri)
        .ok()
        .and_then(|u| u.port())
        .unwrap_or(DEFAULT_CALLBACK_PORT)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::OAuthEndpoints;
    use maestro_vault::MasterKey;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_vault() -> Arc<Vault> {
        Arc::new(Vault::open_in_memory(MasterKey::generate().unwrap()).unwrap())
    }

    fn api_key_spec(name: &str) -> ProviderSpec {
        ProviderSpec {
            name: name.to_string(),
            kind: ProviderKind::ApiKey,
            timeout_secs: 5,
        }
    }

    fn oauth_spec(name: &str, token_url: &str) -> ProviderSpec {
        ProviderSpec {
            name: name.to_string(),
            kind: ProviderKind::OAuth(OAuthEndpoints {
                auth_url: "https://auth.example.com/authorize".into(),
                token_url: token_url.to_string(),
                device_auth_url: None,
                redirect_uri: "http://127.0.0.1:8737/callback".into(),
                client_id: "client".into(),
                client_secret: None,
                default_scopes: vec![],
            }),
            timeout_secs: 5,
        }
    }

    fn manager_with(vault: Arc<Vault>, specs: Vec<ProviderSpec>) -> TokenManager {
        TokenManager::new(vault, ProviderRegistry::with_providers(specs))
    }

    fn store_oauth(
        vault: &Vault,
        provider: &str,
        profile: &str,
        access: &str,
        refresh: Option<&str>,
        scopes: &[&str],
        expires_at: Option<DateTime<Utc>>,
    ) {
        let payload = SecretPayload::OAuth {
            access_token: Secret::new(access),
            refresh_token: refresh.map(Secret::new),
            token_type: "Bearer".into(),
        };
        let scopes: Vec<String> = scopes.iter().map(|s| s.to_string()).collect();
        vault
            .put("test", provider, profile, &payload, &scopes, expires_at)
            .unwrap();
    }

    /// Spin up a one-route token endpoint returning a fixed response and
    /// counting hits.  Raw TCP keeps the tests free of a mock framework.
    async fn token_endpoint_stub(status_line: &'static str, body: String) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);

                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;

                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len(),
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.flush().await;
            }
        });

        (format!("http://{addr}/token"), hits)
    }

    #[tokio::test]
    async fn api_key_provider_skips_refresh() {
        let vault = test_vault();
        vault
            .put(
                "test",
                "stripe",
                "default",
                &SecretPayload::ApiKey {
                    key: Secret::new("sk-live-123"),
                },
                &[],
                None,
            )
            .unwrap();

        let manager = manager_with(Arc::clone(&vault), vec![api_key_spec("stripe")]);
        let cred = manager
            .ensure_fresh("test", "stripe", "default", &[])
            .await
            .unwrap();

        assert_eq!(cred.kind, CredentialKind::ApiKey);
        assert_eq!(cred.secret.expose(), "sk-live-123");
    }

    #[tokio::test]
    async fn missing_credential_is_not_found() {
        let manager = manager_with(test_vault(), vec![api_key_spec("stripe")]);
        let result = manager.ensure_fresh("test", "stripe", "default", &[]).await;
        assert!(matches!(result, Err(AuthError::NotFound { .. })));
    }

    #[tokio::test]
    async fn unconfigured_provider_is_rejected() {
        let manager = manager_with(test_vault(), vec![]);
        let result = manager.ensure_fresh("test", "github", "default", &[]).await;
        assert!(matches!(
            result,
            Err(AuthError::ProviderNotConfigured { .. })
        ));
    }

    #[tokio::test]
    async fn excess_scopes_are_insufficient_scope_not_not_found() {
        let vault = test_vault();
        store_oauth(
            &vault,
            "google",
            "default",
            "tok",
            None,
            &["calendar.readonly"],
            Some(Utc::now() + chrono::Duration::hours(1)),
        );

        let manager = manager_with(
            Arc::clone(&vault),
            vec![oauth_spec("google", "https://unused.example.com/token")],
        );

        let result = manager
            .ensure_fresh(
                "test",
                "google",
                "default",
                &["calendar.readonly".into(), "drive".into()],
            )
            .await;

        match result {
            Err(AuthError::InsufficientScope { missing, .. }) => {
                assert_eq!(missing, vec!["drive".to_string()]);
            }
            other => panic!("expected InsufficientScope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let vault = test_vault();
        store_oauth(
            &vault,
            "google",
            "default",
            "still-good",
            Some("refresh"),
            &[],
            Some(Utc::now() + chrono::Duration::hours(2)),
        );

        // Unroutable token URL: any refresh attempt would fail loudly.
        let manager = manager_with(
            Arc::clone(&vault),
            vec![oauth_spec("google", "http://127.0.0.1:1/token")],
        );

        let cred = manager
            .ensure_fresh("test", "google", "default", &[])
            .await
            .unwrap();
        assert_eq!(cred.secret.expose(), "still-good");
    }

    #[tokio::test]
    async fn token_inside_window_triggers_exactly_one_refresh() {
        let body = serde_json::json!({
            "access_token": "refreshed-token",
            "refresh_token": "new-refresh",
            "expires_in": 3600,
            "token_type": "Bearer"
        })
        .to_string();
        let (token_url, hits) = token_endpoint_stub("200 OK", body).await;

        let vault = test_vault();
        // Expires in 4 minutes — inside the 5-minute safety window.
        store_oauth(
            &vault,
            "google",
            "default",
            "stale-token",
            Some("old-refresh"),
            &["calendar.readonly"],
            Some(Utc::now() + chrono::Duration::minutes(4)),
        );

        let manager = manager_with(Arc::clone(&vault), vec![oauth_spec("google", &token_url)]);
        let cred = manager
            .ensure_fresh("test", "google", "default", &[])
            .await
            .unwrap();

        assert_eq!(cred.secret.expose(), "refreshed-token");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The refreshed grant superseded the stale record.
        let stored = vault.get("test", "google", "default").unwrap();
        assert_eq!(stored.payload.bearer_secret().expose(), "refreshed-token");
        // Scope-less refresh responses keep the previously granted scopes.
        assert_eq!(stored.scopes, vec!["calendar.readonly"]);
    }

    #[tokio::test]
    async fn expired_token_without_refresh_token_is_expired() {
        let vault = test_vault();
        store_oauth(
            &vault,
            "google",
            "default",
            "dead",
            None,
            &[],
            Some(Utc::now() - chrono::Duration::minutes(1)),
        );

        let manager = manager_with(
            Arc::clone(&vault),
            vec![oauth_spec("google", "http://127.0.0.1:1/token")],
        );
        let result = manager.ensure_fresh("test", "google", "default", &[]).await;
        assert!(matches!(result, Err(AuthError::Expired { .. })));
    }

    #[tokio::test]
    async fn invalid_grant_marks_record_failed_and_requires_reauth() {
        let body = serde_json::json!({
            "error": "invalid_grant",
            "error_description": "refresh token revoked"
        })
        .to_string();
        let (token_url, hits) = token_endpoint_stub("400 Bad Request", body).await;

        let vault = test_vault();
        store_oauth(
            &vault,
            "google",
            "default",
            "stale",
            Some("revoked-refresh"),
            &[],
            Some(Utc::now() - chrono::Duration::minutes(1)),
        );

        let manager = manager_with(Arc::clone(&vault), vec![oauth_spec("google", &token_url)]);
        let result = manager.ensure_fresh("test", "google", "default", &[]).await;

        assert!(matches!(result, Err(AuthError::Expired { .. })));
        // Definitive rejection: exactly one attempt, never retried.
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The record is no longer active; a new authentication is required.
        let result = vault.get("test", "google", "default");
        assert!(matches!(
            result,
            Err(maestro_vault::VaultError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn transient_failures_retry_then_escalate() {
        let (token_url, hits) = token_endpoint_stub("503 Service Unavailable", String::new()).await;

        let vault = test_vault();
        store_oauth(
            &vault,
            "google",
            "default",
            "stale",
            Some("refresh"),
            &[],
            Some(Utc::now() - chrono::Duration::minutes(1)),
        );

        let manager = manager_with(Arc::clone(&vault), vec![oauth_spec("google", &token_url)]);
        let result = manager.ensure_fresh("test", "google", "default", &[]).await;

        assert!(matches!(result, Err(AuthError::Expired { .. })));
        assert_eq!(hits.load(Ordering::SeqCst), REFRESH_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn authenticate_stores_api_key() {
        let vault = test_vault();
        let manager = manager_with(Arc::clone(&vault), vec![api_key_spec("stripe")]);

        let id = manager
            .authenticate(
                "cli",
                "stripe",
                "work",
                &[],
                AuthMethod::ApiKey(Secret::new("sk-live-xyz")),
            )
            .await
            .unwrap();

        let cred = vault.get("cli", "stripe", "work").unwrap();
        assert_eq!(cred.id, id);
        assert_eq!(cred.payload.bearer_secret().expose(), "sk-live-xyz");
    }

    #[tokio::test]
    async fn authenticate_rejects_mismatched_method() {
        let manager = manager_with(test_vault(), vec![api_key_spec("stripe")]);
        let result = manager
            .authenticate("cli", "stripe", "default", &[], AuthMethod::DeviceCode)
            .await;
        assert!(matches!(result, Err(AuthError::UnsupportedMethod { .. })));
    }

    #[tokio::test]
    async fn revoke_then_authenticate_creates_fresh_record() {
        let vault = test_vault();
        let manager = manager_with(Arc::clone(&vault), vec![api_key_spec("stripe")]);

        manager
            .authenticate(
                "cli",
                "stripe",
                "default",
                &[],
                AuthMethod::ApiKey(Secret::new("old")),
            )
            .await
            .unwrap();
        manager.revoke("cli", "stripe", "default").unwrap();

        let result = manager.ensure_fresh("cli", "stripe", "default", &[]).await;
        assert!(matches!(result, Err(AuthError::NotFound { .. })));

        manager
            .authenticate(
                "cli",
                "stripe",
                "default",
                &[],
                AuthMethod::ApiKey(Secret::new("new")),
            )
            .await
            .unwrap();
        let cred = manager
            .ensure_fresh("cli", "stripe", "default", &[])
            .await
            .unwrap();
        assert_eq!(cred.secret.expose(), "new");
    }

    #[test]
    fn callback_port_parsing() {
        assert_eq!(callback_port("http://127.0.0.1:9123/callback"), 9123);
        assert_eq!(callback_port("http://127.0.0.1/callback"), DEFAULT_CALLBACK_PORT);
        assert_eq!(callback_port("not a url"), DEFAULT_CALLBACK_PORT);
    }

    #[test]
    fn scope_check_logic() {
        let granted = vec!["a".to_string(), "b".to_string()];
        assert!(check_scopes("p", "f", &granted, &["a".into()]).is_ok());
        assert!(check_scopes("p", "f", &granted, &[]).is_ok());

        let err = check_scopes("p", "f", &granted, &["a".into(), "c".into()]).unwrap_err();
        match err {
            AuthError::InsufficientScope { missing, .. } => {
                assert_eq!(missing, vec!["c".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
