//! Manifest registry.
//!
//! Loads module manifests, enforces cross-manifest invariants (unique
//! module names, unique capability providers), and serves them to the
//! resolver.  A validation failure is fatal for that one manifest only;
//! [`ManifestRegistry::load_dir`] keeps going and reports per-file errors
//! alongside the manifests that did load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{ManifestError, Result};
use crate::manifest::{MANIFEST_FILE, ModuleManifest};

/// Outcome of a directory scan: what loaded and what did not.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Names of manifests that loaded and registered.
    pub loaded: Vec<String>,

    /// Manifests that failed, with the path that failed and why.
    pub errors: Vec<(PathBuf, ManifestError)>,
}

/// In-memory collection of validated manifests.
#[derive(Debug, Default)]
pub struct ManifestRegistry {
    manifests: Vec<ModuleManifest>,
    by_name: HashMap<String, usize>,
    /// Capability name → providing module, resolved at load time.
    capabilities: HashMap<String, String>,
}

impl ManifestRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse, validate, and register a manifest from TOML text.
    pub fn load_str(&mut self, content: &str, source: &Path) -> Result<&ModuleManifest> {
        let manifest = ModuleManifest::from_toml_str(content, source)?;
        self.register(manifest)
    }

    /// Load a manifest from a `module.toml` file.
    pub fn load_file(&mut self, path: &Path) -> Result<&ModuleManifest> {
        let manifest = ModuleManifest::from_file(path)?;
        self.register(manifest)
    }

    /// Scan `dir` for `<module>/module.toml` entries and load each one.
    ///
    /// A bad manifest never aborts the scan: it lands in
    /// [`LoadReport::errors`] and the remaining manifests keep loading.
    pub fn load_dir(&mut self, dir: &Path) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir() && path.join(MANIFEST_FILE).is_file())
            .collect();
        entries.sort();

        for module_dir in entries {
            let manifest_path = module_dir.join(MANIFEST_FILE);
            match self.load_file(&manifest_path) {
                Ok(manifest) => report.loaded.push(manifest.name.clone()),
                Err(e) => {
                    tracing::warn!(
                        path = %manifest_path.display(),
                        error = %e,
                        "skipping manifest that failed to load"
                    );
                    report.errors.push((manifest_path, e));
                }
            }
        }

        tracing::info!(
            loaded = report.loaded.len(),
            failed = report.errors.len(),
            dir = %dir.display(),
            "manifest directory scanned"
        );
        Ok(report)
    }

    /// Register an already-parsed manifest, enforcing name uniqueness and
    /// capability-provider uniqueness against everything loaded so far.
    pub fn register(&mut self, manifest: ModuleManifest) -> Result<&ModuleManifest> {
        if self.by_name.contains_key(&manifest.name) {
            return Err(ManifestError::DuplicateModule {
                name: manifest.name,
            });
        }

        for capability in &manifest.capabilities {
            if let Some(claimed_by) = self.capabilities.get(capability) {
                return Err(ManifestError::CapabilityCollision {
                    capability: capability.clone(),
                    module: manifest.name.clone(),
                    claimed_by: claimed_by.clone(),
                });
            }
        }

        for capability in &manifest.capabilities {
            self.capabilities
                .insert(capability.clone(), manifest.name.clone());
        }

        tracing::debug!(
            module = %manifest.name,
            version = %manifest.version,
            capabilities = ?manifest.capabilities,
            "manifest registered"
        );

        let index = self.manifests.len();
        self.by_name.insert(manifest.name.clone(), index);
        self.manifests.push(manifest);
        Ok(&self.manifests[index])
    }

    /// All loaded manifests, in load order.
    pub fn all(&self) -> &[ModuleManifest] {
        &self.manifests
    }

    /// Look up a manifest by module name.
    pub fn get(&self, name: &str) -> Option<&ModuleManifest> {
        self.by_name.get(name).map(|&i| &self.manifests[i])
    }

    /// The module providing a capability, if any.
    pub fn capability_provider(&self, capability: &str) -> Option<&str> {
        self.capabilities.get(capability).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
