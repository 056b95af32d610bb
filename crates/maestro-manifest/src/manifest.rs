//! Module manifest types and parsing.
//!
//! Each module ships a `module.toml` describing its identity, the
//! capabilities it offers, and what it needs before it can run:
//!
//! ```toml
//! name = "invoicing"
//! version = "0.3.1"
//! capabilities = ["billing"]
//!
//! [depends]
//! modules = ["crm"]
//!
//! [[depends.auth]]
//! provider = "google"
//! profile = "work"
//! scopes = ["calendar.readonly"]
//!
//! [exec]
//! command = "./bin/invoicing"
//! args = ["--serve"]
//! wait_for_ready = true
//! ready_timeout_secs = 10
//! ```
//!
//! A manifest is immutable once loaded for a given activation run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ManifestError, Result};

/// File name a module's manifest lives under.
pub const MANIFEST_FILE: &str = "module.toml";

/// Default ready-signal wait for spawned module processes.
fn default_ready_timeout() -> u64 {
    10
}

/// The default credential profile.
pub fn default_profile() -> String {
    "default".to_string()
}

/// A credential requirement declared by a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDependency {
    /// The provider whose credential is required.
    pub provider: String,

    /// The profile to use; defaults to `"default"`.
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Minimum scopes the injected credential must carry.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// What a module depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies {
    /// Names of modules that must be active first.
    #[serde(default)]
    pub modules: Vec<String>,

    /// Credentials that must be obtainable at activation time.
    #[serde(default)]
    pub auth: Vec<AuthDependency>,
}

/// How to start the module process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSpec {
    /// The executable to spawn, relative to the module directory.
    pub command: String,

    /// Arguments passed to the executable.  Credentials are never passed
    /// here — they travel via process environment only.
    #[serde(default)]
    pub args: Vec<String>,

    /// Wait for the process to print a line on stdout before considering it
    /// active.
    #[serde(default)]
    pub wait_for_ready: bool,

    /// How long to wait for the ready signal.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

/// Static description of a module: identity, offered capabilities, and
/// declared dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Unique module name (e.g. `invoicing`, `crm-sync`).
    pub name: String,

    /// Version identifier (e.g. `0.3.1`).
    pub version: String,

    /// Capabilities this module offers to other modules.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// What must hold before this module can activate.
    #[serde(default)]
    pub depends: Dependencies,

    /// How to run the module.  Absent for declaration-only manifests
    /// (dry runs, tests).
    pub exec: Option<ExecSpec>,

    /// Where this manifest was loaded from.
    #[serde(skip)]
    pub source: PathBuf,
}

impl ModuleManifest {
    /// Parse and validate a manifest from TOML text.
    pub fn from_toml_str(content: &str, source: &Path) -> Result<Self> {
        let mut manifest: ModuleManifest =
            toml::from_str(content).map_err(|e| ManifestError::InvalidFormat {
                path: source.to_path_buf(),
                reason: e.to_string(),
            })?;
        manifest.source = source.to_path_buf();
        manifest.validate(source)?;
        Ok(manifest)
    }

    /// Load and validate a manifest from a `module.toml` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content, path)
    }

    /// Structural validation: non-empty identity fields, a well-formed
    /// name, and no self-dependency.
    fn validate(&self, source: &Path) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ManifestError::MissingField {
                path: source.to_path_buf(),
                field: "name".into(),
            });
        }
        if self.version.trim().is_empty() {
            return Err(ManifestError::MissingField {
                path: source.to_path_buf(),
                field: "version".into(),
            });
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ManifestError::InvalidName {
                name: self.name.clone(),
                reason: "only ASCII alphanumerics, '-' and '_' are allowed".into(),
            });
        }
        if self.depends.modules.iter().any(|dep| dep == &self.name) {
            return Err(ManifestError::SelfDependency {
                name: self.name.clone(),
            });
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

    fn parse(content: &str) -> Result<ModuleManifest> {
        ModuleManifest::from_toml_str(content, Path::new("test/module.toml"))
    }

    #[test]
    fn full_manifest_parses() {
        let manifest = parse(
            r#"
            name = "invoicing"
            version = "0.3.1"
            capabilities = ["billing"]

            [depends]
            modules = ["crm"]

            [[depends.auth]]
            provider = "google"
            profile = "work"
            scopes = ["calendar.readonly"]

            [exec]
            command = "./bin/invoicing"
            args = ["--serve"]
            wait_for_ready = true
            "#,
        )
        .unwrap();

        assert_eq!(manifest.name, "invoicing");
        assert_eq!(manifest.version, "0.3.1");
        assert_eq!(manifest.capabilities, vec!["billing"]);
        assert_eq!(manifest.depends.modules, vec!["crm"]);
        assert_eq!(manifest.depends.auth.len(), 1);
        assert_eq!(manifest.depends.auth[0].provider, "google");
        assert_eq!(manifest.depends.auth[0].profile, "work");

        let exec = manifest.exec.unwrap();
        assert_eq!(exec.command, "./bin/invoicing");
        assert!(exec.wait_for_ready);
        assert_eq!(exec.ready_timeout_secs, 10);
    }

    #[test]
    fn minimal_manifest_parses() {
        let manifest = parse("name = \"crm\"\nversion = \"1.0.0\"\n").unwrap();
        assert_eq!(manifest.name, "crm");
        assert!(manifest.capabilities.is_empty());
        assert!(manifest.depends.modules.is_empty());
        assert!(manifest.depends.auth.is_empty());
        assert!(manifest.exec.is_none());
    }

    #[test]
    fn auth_dependency_profile_defaults() {
        let manifest = parse(
            r#"
            name = "trading"
            version = "2.0.0"

            [[depends.auth]]
            provider = "broker"
            "#,
        )
        .unwrap();
        assert_eq!(manifest.depends.auth[0].profile, "default");
        assert!(manifest.depends.auth[0].scopes.is_empty());
    }

    #[test]
    fn missing_name_is_invalid_format() {
        let result = parse("version = \"1.0.0\"\n");
        assert!(matches!(result, Err(ManifestError::InvalidFormat { .. })));
    }

    #[test]
    fn empty_name_is_missing_field() {
        let result = parse("name = \"\"\nversion = \"1.0.0\"\n");
        match result {
            Err(ManifestError::MissingField { field, .. }) => assert_eq!(field, "name"),
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn empty_version_is_missing_field() {
        let result = parse("name = \"crm\"\nversion = \" \"\n");
        match result {
            Err(ManifestError::MissingField { field, .. }) => assert_eq!(field, "version"),
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn bad_characters_in_name_rejected() {
        let result = parse("name = \"no spaces allowed\"\nversion = \"1.0.0\"\n");
        assert!(matches!(result, Err(ManifestError::InvalidName { .. })));
    }

    #[test]
    fn self_dependency_rejected() {
        let result = parse(
            r#"
            name = "ouroboros"
            version = "1.0.0"

            [depends]
            modules = ["ouroboros"]
            "#,
        );
        match result {
            Err(ManifestError::SelfDependency { name }) => assert_eq!(name, "ouroboros"),
            other => panic!("expected SelfDependency, got {other:?}"),
        }
    }

    #[test]
    fn garbage_toml_is_invalid_format() {
        let result = parse("this is not toml {{{");
        assert!(matches!(result, Err(ManifestError::InvalidFormat { .. })));
    }
}
