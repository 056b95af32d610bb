//! Module execution seam.
//!
//! The orchestrator treats modules as opaque executables behind the
//! [`ModuleRunner`] trait.  [`ProcessRunner`] spawns the manifest's `exec`
//! command with credentials injected as short-lived process environment
//! variables — never argv, never files — so secrets stay out of process
//! listings and logs.  [`NoopRunner`] backs tests and dry runs.

use std::process::Stdio;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, BufReader};

use maestro_manifest::ModuleManifest;
use maestro_vault::Secret;

use crate::error::{OrchestratorError, Result};

// ---------------------------------------------------------------------------
// Credential environment
// ---------------------------------------------------------------------------

/// Environment variable prefix for injected credentials.
const ENV_PREFIX: &str = "MAESTRO_TOKEN";

/// Credentials to inject into a module process, keyed by environment
/// variable name.
///
/// Naming: `MAESTRO_TOKEN_<PROVIDER>` for the default profile,
/// `MAESTRO_TOKEN_<PROVIDER>_<PROFILE>` otherwise, uppercased with
/// non-alphanumerics folded to `_`.
#[derive(Debug, Default)]
pub struct CredentialEnv {
    vars: Vec<(String, Secret)>,
}

impl CredentialEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a credential for (provider, profile).
    pub fn insert(&mut self, provider: &str, profile: &str, secret: Secret) {
        let name = Self::var_name(provider, profile);
        self.vars.push((name, secret));
    }

    /// Iterate the variables to set on the child process.
    pub fn vars(&self) -> impl Iterator<Item = (&str, &Secret)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// The environment variable name for a (provider, profile).
    pub fn var_name(provider: &str, profile: &str) -> String {
        let mut name = format!("{ENV_PREFIX}_{}", sanitize(provider));
        if profile != "default" {
            name.push('_');
            name.push_str(&sanitize(profile));
        }
        name
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Runner trait
// ---------------------------------------------------------------------------

/// Handle to a started module, passed back to [`ModuleRunner::stop`].
pub enum ModuleHandle {
    /// A spawned OS process.
    Process {
        module: String,
        child: tokio::process::Child,
    },
    /// A no-op placeholder (tests, dry runs).
    Noop { module: String },
}

impl ModuleHandle {
    /// The module this handle belongs to.
    pub fn module(&self) -> &str {
        match self {
            Self::Process { module, .. } | Self::Noop { module } => module,
        }
    }
}

/// Starts and stops module processes.  The orchestrator's only seam to the
/// outside world besides the token manager.
#[async_trait]
pub trait ModuleRunner: Send + Sync {
    /// Start the module with the given injected credentials and wait until
    /// it is ready.
    async fn start(&self, manifest: &ModuleManifest, env: &CredentialEnv) -> Result<ModuleHandle>;

    /// Stop a previously started module.
    async fn stop(&self, handle: ModuleHandle) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Process runner
// ---------------------------------------------------------------------------

/// Spawns the manifest's `exec` command as a child process.
pub struct ProcessRunner;

#[async_trait]
impl ModuleRunner for ProcessRunner {
    async fn start(&self, manifest: &ModuleManifest, env: &CredentialEnv) -> Result<ModuleHandle> {
        // Declaration-only modules (no exec section) have nothing to spawn;
        // they exist to group capabilities and dependencies.
        let Some(exec) = manifest.exec.as_ref() else {
            tracing::debug!(module = %manifest.name, "no exec section, module is declaration-only");
            return Ok(ModuleHandle::Noop {
                module: manifest.name.clone(),
            });
        };

        let module_dir = manifest
            .source
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| std::path::PathBuf::from("."));

        let mut command = tokio::process::Command::new(&exec.command);
        command
            .args(&exec.args)
            .current_dir(&module_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        for (name, secret) in env.vars() {
            command.env(name, secret.expose());
        }

        tracing::info!(
            module = %manifest.name,
            command = %exec.command,
            credentials = env.len(),
            "starting module process"
        );

        let mut child = command
            .spawn()
            .map_err(|e| OrchestratorError::Internal(format!(
                "failed to spawn `{}`: {e}",
                exec.command
            )))?;

        if exec.wait_for_ready {
            let stdout = child.stdout.take().ok_or_else(|| {
                OrchestratorError::Internal("child stdout not captured".to_string())
            })?;
            let mut lines = BufReader::new(stdout).lines();

            let timeout = tokio::time::Duration::from_secs(exec.ready_timeout_secs);
            match tokio::time::timeout(timeout, lines.next_line()).await {
                Ok(Ok(Some(line))) => {
                    tracing::debug!(module = %manifest.name, line = %line, "module signalled ready");
                }
                Ok(Ok(None)) => {
                    let _ = child.kill().await;
                    return Err(OrchestratorError::Internal(format!(
                        "module `{}` exited before signalling ready",
                        manifest.name
                    )));
                }
                Ok(Err(e)) => {
                    let _ = child.kill().await;
                    return Err(OrchestratorError::Internal(format!(
                        "failed reading ready signal from `{}`: {e}",
                        manifest.name
                    )));
                }
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(OrchestratorError::Internal(format!(
                        "module `{}` did not signal ready within {}s",
                        manifest.name, exec.ready_timeout_secs
                    )));
                }
            }

            // Keep draining stdout so the child never blocks on a full pipe.
            let module = manifest.name.clone();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::trace!(module = %module, line = %line, "module stdout");
                }
            });
        }

        Ok(ModuleHandle::Process {
            module: manifest.name.clone(),
            child,
        })
    }

    async fn stop(&self, handle: ModuleHandle) -> Result<()> {
        match handle {
            ModuleHandle::Process { module, mut child } => {
                tracing::info!(module = %module, "stopping module process");
                if let Err(e) = child.kill().await {
                    tracing::warn!(module = %module, error = %e, "kill failed");
                }
                let _ = child.wait().await;
                Ok(())
            }
            ModuleHandle::Noop { .. } => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Noop runner
// ---------------------------------------------------------------------------

/// Runner that records calls instead of spawning processes.  Backs tests
/// and `--dry-run`; individual modules can be told to fail.
#[derive(Default)]
pub struct NoopRunner {
    /// Module → env var names seen at start (values are not retained).
    started: DashMap<String, Vec<String>>,
    /// Modules whose start should fail, with the reason.
    failures: DashMap<String, String>,
    /// Successful start calls in order.
    start_log: std::sync::Mutex<Vec<String>>,
    /// Stop calls in order.
    stopped: std::sync::Mutex<Vec<String>>,
}

impl NoopRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `start` fail for the given module.
    pub fn fail_module(&self, module: &str, reason: &str) {
        self.failures.insert(module.to_string(), reason.to_string());
    }

    /// Remove a previously injected failure.
    pub fn clear_failure(&self, module: &str) {
        self.failures.remove(module);
    }

    /// Names of modules that started successfully.
    pub fn started_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.started.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Successful start calls in the order they happened.
    pub fn start_order(&self) -> Vec<String> {
        self.start_log.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// The env var names a module was started with.
    pub fn env_vars_for(&self, module: &str) -> Vec<String> {
        self.started
            .get(module)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Stop calls in the order they happened.
    pub fn stop_order(&self) -> Vec<String> {
        self.stopped.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ModuleRunner for NoopRunner {
    async fn start(&self, manifest: &ModuleManifest, env: &CredentialEnv) -> Result<ModuleHandle> {
        if let Some(reason) = self.failures.get(&manifest.name) {
            return Err(OrchestratorError::Internal(reason.clone()));
        }

        let var_names: Vec<String> = env.vars().map(|(k, _)| k.to_string()).collect();
        self.started.insert(manifest.name.clone(), var_names);
        if let Ok(mut log) = self.start_log.lock() {
            log.push(manifest.name.clone());
        }

        Ok(ModuleHandle::Noop {
            module: manifest.name.clone(),
        })
    }

    async fn stop(&self, handle: ModuleHandle) -> Result<()> {
        if let Ok(mut stopped) = self.stopped.lock() {
            stopped.push(handle.module().to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_naming() {
        assert_eq!(
            CredentialEnv::var_name("google", "default"),
            "MAESTRO_TOKEN_GOOGLE"
        );
        assert_eq!(
            CredentialEnv::var_name("google", "work"),
            "MAESTRO_TOKEN_GOOGLE_WORK"
        );
        assert_eq!(
            CredentialEnv::var_name("my-broker", "eu-account"),
            "MAESTRO_TOKEN_MY_BROKER_EU_ACCOUNT"
        );
    }

    #[test]
    fn credential_env_collects_vars() {
        let mut env = CredentialEnv::new();
        assert!(env.is_empty());

        env.insert("google", "default", Secret::new("tok-1"));
        env.insert("stripe", "work", Secret::new("tok-2"));

        let names: Vec<&str> = env.vars().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["MAESTRO_TOKEN_GOOGLE", "MAESTRO_TOKEN_STRIPE_WORK"]);
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn credential_env_debug_redacts_values() {
        let mut env = CredentialEnv::new();
        env.insert("google", "default", Secret::new("super-secret-token"));
        let rendered = format!("{env:?}");
        assert!(!rendered.contains("super-secret-token"));
    }

    #[tokio::test]
    async fn noop_runner_records_start_and_stop() {
        let runner = NoopRunner::new();
        let manifest = maestro_manifest::ModuleManifest::from_toml_str(
            "name = \"crm\"\nversion = \"1.0.0\"\n",
            std::path::Path::new("test/module.toml"),
        )
        .unwrap();

        let mut env = CredentialEnv::new();
        env.insert("google", "default", Secret::new("tok"));

        let handle = runner.start(&manifest, &env).await.unwrap();
        assert_eq!(runner.started_modules(), vec!["crm"]);
        assert_eq!(runner.env_vars_for("crm"), vec!["MAESTRO_TOKEN_GOOGLE"]);

        runner.stop(handle).await.unwrap();
        assert_eq!(runner.stop_order(), vec!["crm"]);
    }

    #[tokio::test]
    async fn noop_runner_failure_injection() {
        let runner = NoopRunner::new();
        runner.fail_module("crm", "simulated crash");

        let manifest = maestro_manifest::ModuleManifest::from_toml_str(
            "name = \"crm\"\nversion = \"1.0.0\"\n",
            std::path::Path::new("test/module.toml"),
        )
        .unwrap();

        let result = runner.start(&manifest, &CredentialEnv::new()).await;
        assert!(result.is_err());
        assert!(runner.started_modules().is_empty());
    }
}
