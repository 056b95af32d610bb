//! CLI configuration.
//!
//! Everything Maestro persists lives under one data directory:
//!
//! ```text
//! data/
//!   vault.db          encrypted credential store + audit log
//!   master.key        wrapped master key
//!   providers.toml    provider endpoints and orchestrator settings
//!   orchestrate/
//!     state.json      snapshot of the last activation run
//! ```
//!
//! `providers.toml` shape:
//!
//! ```toml
//! [orchestrator]
//! max_concurrency = 4
//! retry_dependency_failed = true
//!
//! [providers.google]
//! kind = "oauth"
//! auth_url = "https://accounts.google.com/o/oauth2/v2/auth"
//! token_url = "https://oauth2.googleapis.com/token"
//! redirect_uri = "http://127.0.0.1:8737/callback"
//! client_id = "..."
//! default_scopes = ["openid"]
//!
//! [providers.stripe]
//! kind = "api_key"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use maestro_auth::{ProviderKind, ProviderSpec};
use maestro_orchestrator::OrchestratorOptions;

/// File name of the provider configuration inside the data directory.
pub const PROVIDERS_FILE: &str = "providers.toml";

/// Relative path of the activation state snapshot.
pub const STATE_FILE: &str = "orchestrate/state.json";

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    orchestrator: OrchestratorSection,
    #[serde(default)]
    providers: BTreeMap<String, RawProvider>,
}

#[derive(Debug, Deserialize)]
struct RawProvider {
    #[serde(flatten)]
    kind: ProviderKind,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    maestro_auth::provider::DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Deserialize)]
struct OrchestratorSection {
    #[serde(default = "default_concurrency")]
    max_concurrency: usize,
    #[serde(default = "default_retry")]
    retry_dependency_failed: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_concurrency(),
            retry_dependency_failed: default_retry(),
        }
    }
}

fn default_concurrency() -> usize {
    OrchestratorOptions::default().max_concurrency
}

fn default_retry() -> bool {
    OrchestratorOptions::default().retry_dependency_failed
}

/// Parsed CLI configuration.
#[derive(Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub providers: Vec<ProviderSpec>,
    pub orchestrator: OrchestratorOptions,
}

impl Config {
    /// Load configuration from `<data_dir>/providers.toml`.  A missing file
    /// yields an empty provider set and default settings.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join(PROVIDERS_FILE);

        let raw: RawConfig = if path.is_file() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "no provider configuration, starting empty");
            RawConfig {
                orchestrator: OrchestratorSection::default(),
                providers: BTreeMap::new(),
            }
        };

        let providers = raw
            .providers
            .into_iter()
            .map(|(name, p)| ProviderSpec {
                name,
                kind: p.kind,
                timeout_secs: p.timeout_secs,
            })
            .collect();

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            providers,
            orchestrator: OrchestratorOptions {
                max_concurrency: raw.orchestrator.max_concurrency,
                retry_dependency_failed: raw.orchestrator.retry_dependency_failed,
            },
        })
    }

    /// Path of the vault database.
    pub fn vault_path(&self) -> PathBuf {
        self.data_dir.join("vault.db")
    }

    /// Path of the activation state snapshot.
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert!(config.providers.is_empty());
        assert_eq!(config.orchestrator.max_concurrency, 4);
        assert!(config.orchestrator.retry_dependency_failed);
    }

    #[test]
    fn providers_and_settings_parse() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROVIDERS_FILE),
            r#"
            [orchestrator]
            max_concurrency = 8
            retry_dependency_failed = false

            [providers.google]
            kind = "oauth"
            auth_url = "https://accounts.google.com/o/oauth2/v2/auth"
            token_url = "https://oauth2.googleapis.com/token"
            redirect_uri = "http://127.0.0.1:8737/callback"
            client_id = "abc"
            default_scopes = ["openid"]

            [providers.stripe]
            kind = "api_key"
            timeout_secs = 30
            "#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.orchestrator.max_concurrency, 8);
        assert!(!config.orchestrator.retry_dependency_failed);

        assert_eq!(config.providers.len(), 2);
        let google = config.providers.iter().find(|p| p.name == "google").unwrap();
        assert!(google.oauth().is_some());
        let stripe = config.providers.iter().find(|p| p.name == "stripe").unwrap();
        assert!(stripe.is_api_key());
        assert_eq!(stripe.timeout_secs, 30);
    }

    #[test]
    fn bad_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PROVIDERS_FILE), "not toml {{{").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }
}
