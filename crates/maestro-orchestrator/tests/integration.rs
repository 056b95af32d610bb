//! Integration tests for the maestro-orchestrator crate.
//!
//! These wire the real token manager and vault under the orchestrator and
//! exercise the end-to-end activation scenarios: failure isolation,
//! dependency cascades with a single root cause, and resolution errors
//! activating nothing.

use std::path::Path;
use std::sync::Arc;

use maestro_auth::{ProviderKind, ProviderRegistry, ProviderSpec, TokenManager};
use maestro_graph::ResolveError;
use maestro_manifest::ManifestRegistry;
use maestro_orchestrator::{
    ActivationError, ModuleRunner, ModuleState, NoopRunner, Orchestrator, OrchestratorError,
};
use maestro_vault::{MasterKey, Secret, SecretPayload, Vault};

fn vault() -> Arc<Vault> {
    Arc::new(Vault::open_in_memory(MasterKey::generate().unwrap()).unwrap())
}

fn api_key_provider(name: &str) -> ProviderSpec {
    ProviderSpec {
        name: name.to_string(),
        kind: ProviderKind::ApiKey,
        timeout_secs: 5,
    }
}

fn oauth_provider(name: &str, token_url: &str) -> ProviderSpec {
    ProviderSpec {
        name: name.to_string(),
        kind: ProviderKind::OAuth(maestro_auth::OAuthEndpoints {
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

fn load(registry: &mut ManifestRegistry, name: &str, content: &str) {
    registry
        .load_str(content, Path::new(&format!("{name}/module.toml")))
        .unwrap();
}

/// The worked example: {A: no deps}, {B: after A}, {C: needs provider "x"}
/// with no credential stored for "x".  Resolution succeeds; A and B reach
/// Active; C fails with a credential error.
#[tokio::test]
async fn partial_failure_scenario() {
    let vault = vault();
    let providers = ProviderRegistry::with_providers([api_key_provider("x")]);
    let manager = Arc::new(TokenManager::new(vault, providers));
    let runner = Arc::new(NoopRunner::new());

    let mut registry = ManifestRegistry::new();
    load(&mut registry, "a", "name = \"a\"\nversion = \"1.0.0\"\n");
    load(
        &mut registry,
        "b",
        "name = \"b\"\nversion = \"1.0.0\"\n\n[depends]\nmodules = [\"a\"]\n",
    );
    load(
        &mut registry,
        "c",
        "name = \"c\"\nversion = \"1.0.0\"\n\n[[depends.auth]]\nprovider = \"x\"\n",
    );

    let orch = Orchestrator::new(manager, runner);
    let report = orch.activate(&registry, &[]).await.unwrap();

    assert_eq!(report.get("a").unwrap().state, ModuleState::Active);
    assert_eq!(report.get("b").unwrap().state, ModuleState::Active);

    let c = report.get("c").unwrap();
    assert_eq!(c.state, ModuleState::Failed);
    match c.error.as_ref().unwrap() {
        ActivationError::Credential {
            provider, reason, ..
        } => {
            assert_eq!(provider, "x");
            assert!(reason.contains("no credential stored"));
        }
        other => panic!("expected Credential error, got {other:?}"),
    }

    assert_eq!(report.exit_code(), 1);
}

/// An expired, unrefreshable token fails its module; every transitive
/// dependent fails with `DependencyFailed`; an unrelated module reaches
/// Active; and `status` traces the whole cascade to one root cause.
#[tokio::test]
async fn expired_token_cascade_traces_to_root_cause() {
    let vault = vault();
    // Token URL points nowhere routable: refresh attempts fail as
    // transient errors and escalate once retries exhaust.
    let providers =
        ProviderRegistry::with_providers([oauth_provider("broker", "http://127.0.0.1:1/token")]);

    // An already-expired token with a refresh token that cannot be used.
    vault
        .put(
            "test",
            "broker",
            "default",
            &SecretPayload::OAuth {
                access_token: Secret::new("expired"),
                refresh_token: Some(Secret::new("useless")),
                token_type: "Bearer".into(),
            },
            &[],
            Some(chrono::Utc::now() - chrono::Duration::hours(1)),
        )
        .unwrap();

    let manager = Arc::new(TokenManager::new(Arc::clone(&vault), providers));
    let runner = Arc::new(NoopRunner::new());

    let mut registry = ManifestRegistry::new();
    load(
        &mut registry,
        "m",
        "name = \"m\"\nversion = \"1.0.0\"\n\n[[depends.auth]]\nprovider = \"broker\"\n",
    );
    load(
        &mut registry,
        "mid",
        "name = \"mid\"\nversion = \"1.0.0\"\n\n[depends]\nmodules = [\"m\"]\n",
    );
    load(
        &mut registry,
        "leaf",
        "name = \"leaf\"\nversion = \"1.0.0\"\n\n[depends]\nmodules = [\"mid\"]\n",
    );
    load(
        &mut registry,
        "unrelated",
        "name = \"unrelated\"\nversion = \"1.0.0\"\n",
    );

    let orch = Orchestrator::new(manager, Arc::clone(&runner) as Arc<dyn ModuleRunner>);
    let report = orch.activate(&registry, &[]).await.unwrap();

    assert_eq!(report.get("unrelated").unwrap().state, ModuleState::Active);

    let m = report.get("m").unwrap();
    assert_eq!(m.state, ModuleState::Failed);
    assert!(matches!(
        m.error,
        Some(ActivationError::Credential { .. })
    ));

    assert_eq!(
        report.get("mid").unwrap().error,
        Some(ActivationError::DependencyFailed {
            dependency: "m".into()
        })
    );
    assert_eq!(
        report.get("leaf").unwrap().error,
        Some(ActivationError::DependencyFailed {
            dependency: "mid".into()
        })
    );

    // One authentication failure never appears as N unrelated failures:
    // the cascade traces back to `m`.
    let (root, error) = report.root_cause("leaf").unwrap();
    assert_eq!(root, "m");
    assert!(matches!(error, ActivationError::Credential { .. }));

    // Neither dependent was ever handed to the runner.
    assert_eq!(runner.started_modules(), vec!["unrelated"]);
}

/// A cycle is a configuration error: reported before any activation, with
/// the full member list, and zero modules started.
#[tokio::test]
async fn cycle_aborts_resolution_entirely() {
    let vault = vault();
    let manager = Arc::new(TokenManager::new(vault, ProviderRegistry::new()));
    let runner = Arc::new(NoopRunner::new());

    let mut registry = ManifestRegistry::new();
    load(
        &mut registry,
        "a",
        "name = \"a\"\nversion = \"1.0.0\"\n\n[depends]\nmodules = [\"b\"]\n",
    );
    load(
        &mut registry,
        "b",
        "name = \"b\"\nversion = \"1.0.0\"\n\n[depends]\nmodules = [\"c\"]\n",
    );
    load(
        &mut registry,
        "c",
        "name = \"c\"\nversion = \"1.0.0\"\n\n[depends]\nmodules = [\"a\"]\n",
    );

    let orch = Orchestrator::new(manager, Arc::clone(&runner) as Arc<dyn ModuleRunner>);
    let result = orch.activate(&registry, &[]).await;

    match result {
        Err(OrchestratorError::Resolve(ResolveError::Cycle { members })) => {
            assert_eq!(members, vec!["a", "b", "c"]);
        }
        other => panic!("expected Cycle, got {other:?}"),
    }
    assert!(runner.started_modules().is_empty());
}

/// A dangling module reference fails resolution as a whole, naming the
/// declaring module and the missing dependency.
#[tokio::test]
async fn missing_dependency_activates_zero_modules() {
    let vault = vault();
    let manager = Arc::new(TokenManager::new(vault, ProviderRegistry::new()));
    let runner = Arc::new(NoopRunner::new());

    let mut registry = ManifestRegistry::new();
    load(
        &mut registry,
        "x",
        "name = \"x\"\nversion = \"1.0.0\"\n\n[depends]\nmodules = [\"y\"]\n",
    );
    load(
        &mut registry,
        "standalone",
        "name = \"standalone\"\nversion = \"1.0.0\"\n",
    );

    let orch = Orchestrator::new(manager, Arc::clone(&runner) as Arc<dyn ModuleRunner>);
    let result = orch.activate(&registry, &[]).await;

    match result {
        Err(OrchestratorError::Resolve(ResolveError::MissingDependency { references })) => {
            assert_eq!(references.len(), 1);
            assert_eq!(references[0].module, "x");
            assert_eq!(references[0].requires, "y");
        }
        other => panic!("expected MissingDependency, got {other:?}"),
    }
    // No partial activation: even the standalone module stayed untouched.
    assert!(runner.started_modules().is_empty());
}
