//! Dataflow activation pipeline.
//!
//! Activation is not a linear loop: modules whose dependencies have all
//! reached a terminal state run concurrently (bounded by a semaphore),
//! while dependent chains serialize.  A module failure only poisons its
//! own dependents — everything else keeps activating.
//!
//! # Scheduling discipline
//!
//! Each module carries an indegree (count of not-yet-terminal
//! prerequisites).  Completion of any module decrements its dependents;
//! whoever hits zero joins the sorted ready set.  A module leaving the
//! ready set either spawns an activation task or, if any prerequisite is
//! `Failed`, is immediately marked `DependencyFailed` and cascades without
//! ever starting.
//!
//! # Abort
//!
//! Aborting a run clears the ready set (not-yet-started modules stay
//! `Pending`), lets in-flight tasks finish their current credential fetch,
//! skips their process start, and deactivates anything already running.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use maestro_auth::TokenManager;
use maestro_auth::provider::DEFAULT_TIMEOUT_SECS;
use maestro_graph::ActivationOrder;
use maestro_manifest::{ManifestRegistry, ModuleManifest};
use maestro_vault::RecordId;

use crate::error::{OrchestratorError, Result};
use crate::record::{ActivationError, ActivationRecord, ModuleState, RunReport};
use crate::runner::{CredentialEnv, ModuleHandle, ModuleRunner};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Tunables for an orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Maximum number of modules activating concurrently.
    pub max_concurrency: usize,

    /// Whether a later run re-tries modules that failed with
    /// `DependencyFailed` (their record resets to `Pending`).  When false,
    /// such verdicts persist across runs until the operator intervenes.
    pub retry_dependency_failed: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry_dependency_failed: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Activates modules in resolved dependency order with injected
/// credentials.
///
/// Cheaply cloneable (`Arc`-backed) so an abort signal can come from
/// another task.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    token_manager: Arc<TokenManager>,
    runner: Arc<dyn ModuleRunner>,
    options: OrchestratorOptions,
    records: DashMap<String, ActivationRecord>,
    /// Started module handles in start order; deactivation drains in
    /// reverse.
    handles: tokio::sync::Mutex<Vec<ModuleHandle>>,
    abort: AtomicBool,
}

/// What an activation task reports back.
enum TaskOutcome {
    Active { refs: Vec<RecordId> },
    Failed {
        error: ActivationError,
        refs: Vec<RecordId>,
    },
    AbortedBeforeStart { refs: Vec<RecordId> },
}

impl Orchestrator {
    /// Create an orchestrator with default options.
    pub fn new(token_manager: Arc<TokenManager>, runner: Arc<dyn ModuleRunner>) -> Self {
        Self::with_options(token_manager, runner, OrchestratorOptions::default())
    }

    /// Create an orchestrator with explicit options.
    pub fn with_options(
        token_manager: Arc<TokenManager>,
        runner: Arc<dyn ModuleRunner>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                token_manager,
                runner,
                options,
                records: DashMap::new(),
                handles: tokio::sync::Mutex::new(Vec::new()),
                abort: AtomicBool::new(false),
            }),
        }
    }

    /// Signal the current activation run to stop scheduling new modules.
    pub fn abort(&self) {
        tracing::info!("activation abort requested");
        self.inner.abort.store(true, Ordering::Release);
    }

    fn is_aborted(&self) -> bool {
        self.inner.abort.load(Ordering::Acquire)
    }

    /// Activate `requested` modules (all loaded modules when empty) plus
    /// their transitive dependencies.
    ///
    /// # Errors
    ///
    /// Returns `Err` only for configuration errors — an unknown requested
    /// module, a cycle, or a missing dependency — in which case nothing
    /// activates.  Per-module failures land in the [`RunReport`].
    pub async fn activate(
        &self,
        registry: &ManifestRegistry,
        requested: &[String],
    ) -> Result<RunReport> {
        self.inner.abort.store(false, Ordering::Release);

        let manifests = select_manifests(registry, requested)?;
        let order = maestro_graph::resolve(&manifests)?;

        tracing::info!(
            modules = order.len(),
            order = ?order.modules(),
            "activation order accepted"
        );

        let by_name: HashMap<String, ModuleManifest> = manifests
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();

        self.init_records(&order);
        self.run_pipeline(&order, &by_name).await?;

        if self.is_aborted() {
            self.deactivate_all().await;
        }

        let mut records: Vec<ActivationRecord> = order
            .modules()
            .iter()
            .filter_map(|name| self.inner.records.get(name).map(|r| r.clone()))
            .collect();
        records.sort_by(|a, b| a.module.cmp(&b.module));

        let report = RunReport {
            records,
            aborted: self.is_aborted(),
            completed_at: Utc::now(),
        };

        tracing::info!(
            active = report
                .records
                .iter()
                .filter(|r| r.state == ModuleState::Active)
                .count(),
            failed = report
                .records
                .iter()
                .filter(|r| r.state == ModuleState::Failed)
                .count(),
            aborted = report.aborted,
            "activation run finished"
        );
        Ok(report)
    }

    /// Deactivate every running module in reverse activation order, giving
    /// dependents a chance to shut down before their dependencies
    /// disappear.  Returns the stop order.
    pub async fn deactivate_all(&self) -> Vec<String> {
        let drained: Vec<ModuleHandle> = {
            let mut handles = self.inner.handles.lock().await;
            handles.drain(..).collect()
        };

        let mut stopped = Vec::new();
        for handle in drained.into_iter().rev() {
            let name = handle.module().to_string();
            if let Err(e) = self.inner.runner.stop(handle).await {
                tracing::warn!(module = %name, error = %e, "deactivation failed");
            }
            if let Some(mut record) = self.inner.records.get_mut(&name) {
                record.state = ModuleState::Deactivated;
                record.finished_at = Some(Utc::now());
            }
            tracing::info!(module = %name, "module deactivated");
            stopped.push(name);
        }
        stopped
    }

    /// Current state of every module known to the registry.  Modules never
    /// part of an accepted run show as `Unresolved`.
    pub fn status(&self, registry: &ManifestRegistry) -> Vec<ActivationRecord> {
        let mut records: Vec<ActivationRecord> = registry
            .all()
            .iter()
            .map(|manifest| {
                self.inner
                    .records
                    .get(&manifest.name)
                    .map(|r| r.clone())
                    .unwrap_or_else(|| {
                        ActivationRecord::new(manifest.name.clone(), ModuleState::Unresolved)
                    })
            })
            .collect();
        records.sort_by(|a, b| a.module.cmp(&b.module));
        records
    }

    // -- Pipeline -----------------------------------------------------------

    /// Seed fresh `Pending` records, preserving records that stay terminal
    /// across runs (still-active modules; standing `DependencyFailed`
    /// verdicts when the retry knob is off).
    fn init_records(&self, order: &ActivationOrder) {
        for name in order.modules() {
            let keep = match self.inner.records.get(name) {
                Some(r) if r.state == ModuleState::Active => true,
                Some(r)
                    if r.state == ModuleState::Failed
                        && matches!(r.error, Some(ActivationError::DependencyFailed { .. }))
                        && !self.inner.options.retry_dependency_failed =>
                {
                    true
                }
                _ => false,
            };
            if !keep {
                self.inner.records.insert(
                    name.clone(),
                    ActivationRecord::new(name.clone(), ModuleState::Pending),
                );
            }
        }
    }

    async fn run_pipeline(
        &self,
        order: &ActivationOrder,
        by_name: &HashMap<String, ModuleManifest>,
    ) -> Result<()> {
        let mut indegree: HashMap<String, usize> = HashMap::new();
        let mut ready: BTreeSet<String> = BTreeSet::new();
        let mut completed: VecDeque<String> = VecDeque::new();

        for name in order.modules() {
            if self.state_of(name).is_terminal() {
                continue;
            }
            let open_deps = order
                .dependencies_of(name)
                .iter()
                .filter(|dep| !self.state_of(dep).is_terminal())
                .count();
            indegree.insert(name.clone(), open_deps);
            if open_deps == 0 {
                ready.insert(name.clone());
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.inner.options.max_concurrency.max(1)));
        let mut join_set: JoinSet<(String, TaskOutcome)> = JoinSet::new();
        let mut task_names: HashMap<tokio::task::Id, String> = HashMap::new();

        loop {
            // 1. Cascade completions into dependents.
            while let Some(name) = completed.pop_front() {
                for dependent in order.dependents_of(&name) {
                    if let Some(count) = indegree.get_mut(dependent) {
                        *count = count.saturating_sub(1);
                        if *count == 0 && self.state_of(dependent) == ModuleState::Pending {
                            ready.insert(dependent.clone());
                        }
                    }
                }
            }

            // 2. Schedule everything eligible (sorted — deterministic).
            if self.is_aborted() {
                // Not-yet-started modules stop being scheduled and remain
                // Pending.
                ready.clear();
            } else {
                let eligible: Vec<String> = std::mem::take(&mut ready).into_iter().collect();
                for name in eligible {
                    if let Some(failed_dep) = self.first_failed_dependency(order, &name) {
                        tracing::warn!(
                            module = %name,
                            dependency = %failed_dep,
                            "dependency failed, module will not activate"
                        );
                        self.mark_failed(
                            &name,
                            ActivationError::DependencyFailed {
                                dependency: failed_dep,
                            },
                        );
                        completed.push_back(name);
                        continue;
                    }

                    let manifest = by_name.get(&name).cloned().ok_or_else(|| {
                        OrchestratorError::Internal(format!("no manifest for `{name}`"))
                    })?;
                    self.set_activating(&name);

                    let inner = Arc::clone(&self.inner);
                    let permits = Arc::clone(&semaphore);
                    let task = join_set.spawn(async move {
                        let _permit = permits.acquire_owned().await.ok();
                        let name = manifest.name.clone();
                        let outcome = activate_module(&inner, &manifest).await;
                        (name, outcome)
                    });
                    task_names.insert(task.id(), name);
                }
            }

            // New verdicts from step 2 cascade before anything blocks.
            if !completed.is_empty() {
                continue;
            }

            // 3. Wait for one in-flight activation.
            match join_set.join_next().await {
                None => break,
                Some(Ok((name, outcome))) => {
                    task_names.retain(|_, v| v != &name);
                    self.apply_outcome(&name, outcome);
                    completed.push_back(name);
                }
                Some(Err(join_error)) => {
                    if let Some(name) = task_names.remove(&join_error.id()) {
                        self.mark_failed(
                            &name,
                            ActivationError::Exec {
                                reason: format!("activation task panicked: {join_error}"),
                            },
                        );
                        completed.push_back(name);
                    } else {
                        tracing::error!(error = %join_error, "activation task failed without a name");
                    }
                }
            }
        }

        Ok(())
    }

    // -- Record bookkeeping -------------------------------------------------

    fn state_of(&self, name: &str) -> ModuleState {
        self.inner
            .records
            .get(name)
            .map(|r| r.state)
            .unwrap_or(ModuleState::Unresolved)
    }

    fn set_activating(&self, name: &str) {
        if let Some(mut record) = self.inner.records.get_mut(name) {
            record.state = ModuleState::Activating;
            record.started_at = Some(Utc::now());
        }
    }

    fn mark_failed(&self, name: &str, error: ActivationError) {
        if let Some(mut record) = self.inner.records.get_mut(name) {
            record.state = ModuleState::Failed;
            record.error = Some(error);
            record.finished_at = Some(Utc::now());
        }
    }

    fn apply_outcome(&self, name: &str, outcome: TaskOutcome) {
        let Some(mut record) = self.inner.records.get_mut(name) else {
            return;
        };
        record.finished_at = Some(Utc::now());
        match outcome {
            TaskOutcome::Active { refs } => {
                record.state = ModuleState::Active;
                record.credential_refs = refs;
                record.error = None;
                tracing::info!(module = %name, "module active");
            }
            TaskOutcome::Failed { error, refs } => {
                record.state = ModuleState::Failed;
                record.credential_refs = refs;
                tracing::error!(module = %name, error = %error, "module failed");
                record.error = Some(error);
            }
            TaskOutcome::AbortedBeforeStart { refs } => {
                record.state = ModuleState::Deactivated;
                record.credential_refs = refs;
                tracing::info!(module = %name, "module aborted before start");
            }
        }
    }

    /// The first (by name) direct dependency in `Failed` state, if any.
    fn first_failed_dependency(&self, order: &ActivationOrder, name: &str) -> Option<String> {
        order
            .dependencies_of(name)
            .iter()
            .find(|dep| self.state_of(dep) == ModuleState::Failed)
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Activation task
// ---------------------------------------------------------------------------

/// Fetch every declared credential, then start the module.  Runs inside a
/// spawned task under the concurrency semaphore.
async fn activate_module(inner: &Inner, manifest: &ModuleManifest) -> TaskOutcome {
    let mut env = CredentialEnv::new();
    let mut refs: Vec<RecordId> = Vec::new();

    for auth in &manifest.depends.auth {
        let timeout_secs = inner
            .token_manager
            .providers()
            .get(&auth.provider)
            .map(|spec| spec.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let fetch = inner.token_manager.ensure_fresh(
            &manifest.name,
            &auth.provider,
            &auth.profile,
            &auth.scopes,
        );

        match tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), fetch).await {
            Err(_) => {
                return TaskOutcome::Failed {
                    error: ActivationError::Credential {
                        provider: auth.provider.clone(),
                        profile: auth.profile.clone(),
                        reason: format!("credential fetch timed out after {timeout_secs}s"),
                    },
                    refs,
                };
            }
            Ok(Err(e)) => {
                return TaskOutcome::Failed {
                    error: ActivationError::Credential {
                        provider: auth.provider.clone(),
                        profile: auth.profile.clone(),
                        reason: e.to_string(),
                    },
                    refs,
                };
            }
            Ok(Ok(credential)) => {
                refs.push(credential.record_id);
                env.insert(&auth.provider, &auth.profile, credential.secret);
            }
        }
    }

    // Abort lands between the credential fetch and the process start: the
    // fetch completed (the vault stays consistent), the module never runs.
    if inner.abort.load(Ordering::Acquire) {
        tracing::info!(module = %manifest.name, "activation aborted after credential fetch");
        return TaskOutcome::AbortedBeforeStart { refs };
    }

    match inner.runner.start(manifest, &env).await {
        Ok(handle) => {
            inner.handles.lock().await.push(handle);
            TaskOutcome::Active { refs }
        }
        Err(e) => TaskOutcome::Failed {
            error: ActivationError::Exec {
                reason: e.to_string(),
            },
            refs,
        },
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Requested modules plus their transitive module dependencies, cloned out
/// of the registry.  Explicitly requested names must be loaded; dangling
/// transitive references are left for graph resolution to report with full
/// context.
fn select_manifests(
    registry: &ManifestRegistry,
    requested: &[String],
) -> Result<Vec<ModuleManifest>> {
    let roots: Vec<String> = if requested.is_empty() {
        registry.all().iter().map(|m| m.name.clone()).collect()
    } else {
        for name in requested {
            if registry.get(name).is_none() {
                return Err(OrchestratorError::ModuleNotLoaded { name: name.clone() });
            }
        }
        requested.to_vec()
    };

    let mut seen: BTreeSet<String> = roots.iter().cloned().collect();
    let mut queue: VecDeque<String> = roots.into();
    let mut selected = Vec::new();

    while let Some(name) = queue.pop_front() {
        let Some(manifest) = registry.get(&name) else {
            continue;
        };
        selected.push(manifest.clone());
        for dep in &manifest.depends.modules {
            if seen.insert(dep.clone()) {
                queue.push_back(dep.clone());
            }
        }
    }

    selected.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(selected)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
