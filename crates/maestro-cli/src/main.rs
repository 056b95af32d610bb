//! CLI entry point for Maestro.
//!
//! This binary provides the `maestro` command: `auth` subcommands for the
//! credential vault and token manager, and `orchestrate` subcommands for
//! module activation.
//!
//! Orchestration exit codes: 0 — every requested module Active; 1 — one or
//! more modules Failed; 2 — resolution error (cycle or missing
//! dependency), nothing activated.

mod config;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use maestro_auth::{AuthMethod, ProviderRegistry, TokenManager};
use maestro_manifest::ManifestRegistry;
use maestro_orchestrator::{
    ActivationRecord, ModuleState, ModuleRunner, NoopRunner, Orchestrator, OrchestratorError,
    ProcessRunner, RunReport,
};
use maestro_vault::{AuditLog, MasterKey, MasterKeyFile, Secret, Vault};

use config::Config;

/// Actor name recorded in the audit log for CLI-initiated accesses.
const CLI_ACTOR: &str = "cli";

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Maestro — credential vault and module orchestrator.
#[derive(Parser)]
#[command(
    name = "maestro",
    version,
    about = "Credential vault and module orchestrator",
    long_about = "Stores provider credentials encrypted at rest and activates dependent \
                  modules in resolved order with scoped credentials injected at start."
)]
struct Cli {
    /// Directory holding the vault database, master key, provider
    /// configuration, and run state.
    #[arg(long, global = true, default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Credential vault and token operations.
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },

    /// Module activation and status.
    Orchestrate {
        #[command(subcommand)]
        command: OrchestrateCommands,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Authenticate a provider and store the credential in the vault.
    ///
    /// API-key providers read the key from stdin; OAuth providers run the
    /// browser flow (or the device flow with --device).
    Add {
        provider: String,

        #[arg(long, default_value = "default")]
        profile: String,

        /// Scope to request; repeatable.  Empty means the provider's
        /// default scopes.
        #[arg(long = "scope")]
        scopes: Vec<String>,

        /// Use the RFC 8628 device flow instead of the browser redirect.
        #[arg(long)]
        device: bool,
    },

    /// Print a currently valid access token to stdout.
    GetToken {
        provider: String,

        #[arg(long, default_value = "default")]
        profile: String,
    },

    /// Show credential health for one provider or all of them.
    Health { provider: Option<String> },

    /// Revoke the stored credential for a provider profile.
    Revoke {
        provider: String,

        #[arg(long, default_value = "default")]
        profile: String,
    },

    /// Re-encrypt every record under a freshly generated master key.
    RotateKey,

    /// Show recent credential accesses from the audit log.
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum OrchestrateCommands {
    /// Activate the named modules (all loaded modules when none given).
    Activate {
        modules: Vec<String>,

        /// Directory scanned for `<module>/module.toml` manifests.
        #[arg(long, default_value = "modules")]
        modules_dir: PathBuf,

        /// Resolve and fetch credentials but start no processes.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show every module's state from the last activation run.
    Status {
        #[arg(long, default_value = "modules")]
        modules_dir: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Auth { command } => cmd_auth(&cli.data_dir, command).await,
        Commands::Orchestrate { command } => cmd_orchestrate(&cli.data_dir, command).await,
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

/// Unlock (or bootstrap) the master key and open the vault.
fn open_vault(config: &Config) -> anyhow::Result<Arc<Vault>> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    let keyfile = MasterKeyFile::new(MasterKeyFile::default_path(&config.data_dir));
    let passphrase = std::env::var("MAESTRO_PASSPHRASE").ok();
    let master = keyfile.load_or_init(passphrase.as_deref().map(str::as_bytes))?;

    let vault = Vault::open(config.vault_path(), master)?;
    Ok(Arc::new(vault))
}

fn token_manager(config: &Config, vault: Arc<Vault>) -> Arc<TokenManager> {
    let registry = ProviderRegistry::with_providers(config.providers.clone());
    Arc::new(TokenManager::new(vault, registry))
}

// ---------------------------------------------------------------------------
// Subcommand: auth
// ---------------------------------------------------------------------------

async fn cmd_auth(data_dir: &std::path::Path, command: AuthCommands) -> anyhow::Result<i32> {
    let config = Config::load(data_dir)?;
    let vault = open_vault(&config)?;
    let manager = token_manager(&config, Arc::clone(&vault));

    match command {
        AuthCommands::Add {
            provider,
            profile,
            scopes,
            device,
        } => {
            let spec = manager
                .providers()
                .get(&provider)
                .with_context(|| format!("provider `{provider}` is not configured"))?;

            let method = if spec.is_api_key() {
                AuthMethod::ApiKey(read_api_key(&provider)?)
            } else if device {
                AuthMethod::DeviceCode
            } else {
                AuthMethod::AuthorizationCode
            };

            let id = manager
                .authenticate(CLI_ACTOR, &provider, &profile, &scopes, method)
                .await?;
            println!("stored credential {id} for {provider}/{profile}");
            Ok(0)
        }

        AuthCommands::GetToken { provider, profile } => {
            let credential = manager
                .ensure_fresh(CLI_ACTOR, &provider, &profile, &[])
                .await?;
            // Bare token on stdout so the command composes in pipes.
            println!("{}", credential.secret.expose());
            Ok(0)
        }

        AuthCommands::Health { provider } => {
            let providers = match provider {
                Some(name) => vec![name],
                None => vault.providers()?,
            };

            if providers.is_empty() {
                println!("no credentials stored");
                return Ok(0);
            }

            for name in providers {
                for summary in vault.list(&name)? {
                    let health = vault.health(&name, &summary.profile)?;
                    let expiry = match health.expires_in_days {
                        Some(days) => format!("expires in {days}d"),
                        None => "no expiry".to_string(),
                    };
                    let status = if health.valid { "valid" } else { "INVALID" };
                    println!(
                        "  {name}/{} [{}]  {status}, {expiry}",
                        summary.profile, summary.kind
                    );
                }
            }
            Ok(0)
        }

        AuthCommands::Revoke { provider, profile } => {
            manager.revoke(CLI_ACTOR, &provider, &profile)?;
            println!("revoked {provider}/{profile}");
            Ok(0)
        }

        AuthCommands::RotateKey => {
            let new_key = MasterKey::generate()?;
            let count = vault.rotate_master_key(CLI_ACTOR, &new_key)?;

            let keyfile = MasterKeyFile::new(MasterKeyFile::default_path(&config.data_dir));
            let passphrase = std::env::var("MAESTRO_PASSPHRASE").ok();
            keyfile.store(&new_key, passphrase.as_deref().map(str::as_bytes))?;

            println!("re-encrypted {count} records under a new master key");
            Ok(0)
        }

        AuthCommands::Audit { limit } => {
            for entry in AuditLog::new(&vault).recent(limit)? {
                println!(
                    "  {}  {:<12} {:<12} {}/{} -> {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.actor,
                    entry.operation,
                    entry.provider,
                    entry.profile,
                    entry.outcome,
                );
            }
            Ok(0)
        }
    }
}

/// Read an API key from stdin without echoing it into argv or logs.
fn read_api_key(provider: &str) -> anyhow::Result<Secret> {
    eprintln!("paste the API key for `{provider}` and press enter:");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading API key from stdin")?;
    let key = line.trim();
    anyhow::ensure!(!key.is_empty(), "empty API key");
    Ok(Secret::new(key))
}

// ---------------------------------------------------------------------------
// Subcommand: orchestrate
// ---------------------------------------------------------------------------

async fn cmd_orchestrate(
    data_dir: &std::path::Path,
    command: OrchestrateCommands,
) -> anyhow::Result<i32> {
    let config = Config::load(data_dir)?;

    match command {
        OrchestrateCommands::Activate {
            modules,
            modules_dir,
            dry_run,
        } => {
            let vault = open_vault(&config)?;
            let manager = token_manager(&config, vault);

            let mut registry = ManifestRegistry::new();
            let load_report = registry.load_dir(&modules_dir)?;
            for (path, error) in &load_report.errors {
                eprintln!("skipping {}: {error}", path.display());
            }

            let runner: Arc<dyn ModuleRunner> = if dry_run {
                Arc::new(NoopRunner::new())
            } else {
                Arc::new(ProcessRunner)
            };

            let orchestrator =
                Orchestrator::with_options(manager, runner, config.orchestrator.clone());

            // Ctrl-C aborts the run: pending modules stay unstarted,
            // in-flight ones finish their credential fetch and deactivate.
            let abort_handle = orchestrator.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    abort_handle.abort();
                }
            });

            match orchestrator.activate(&registry, &modules).await {
                Ok(report) => {
                    print_report(&report);
                    save_state(&config, &report)?;
                    Ok(report.exit_code())
                }
                Err(e @ OrchestratorError::Resolve(_))
                | Err(e @ OrchestratorError::ModuleNotLoaded { .. }) => {
                    eprintln!("resolution error: {e}");
                    eprintln!("no modules were activated");
                    Ok(2)
                }
                Err(e) => Err(e.into()),
            }
        }

        OrchestrateCommands::Status { modules_dir } => {
            let mut registry = ManifestRegistry::new();
            if modules_dir.is_dir() {
                let _ = registry.load_dir(&modules_dir)?;
            }

            let report = load_state(&config)?;
            print_status(&registry, report.as_ref());
            Ok(0)
        }
    }
}

fn print_report(report: &RunReport) {
    println!();
    for record in &report.records {
        print_record(record, report);
    }
    println!();
    if report.aborted {
        println!("  run aborted");
    }
}

fn print_status(registry: &ManifestRegistry, report: Option<&RunReport>) {
    println!();
    if registry.is_empty() && report.is_none() {
        println!("  no modules loaded and no previous run");
        return;
    }

    // Every module the registry knows, falling back to the last run for
    // modules whose manifests have since disappeared.
    let mut seen: Vec<&ActivationRecord> = Vec::new();
    let unresolved: Vec<ActivationRecord> = registry
        .all()
        .iter()
        .filter(|m| report.and_then(|r| r.get(&m.name)).is_none())
        .map(|m| ActivationRecord::new(m.name.clone(), ModuleState::Unresolved))
        .collect();

    if let Some(report) = report {
        seen.extend(report.records.iter());
    }

    for record in seen {
        print_record(record, report.expect("records come from the report"));
    }
    for record in &unresolved {
        println!("  {:<20} {}", record.module, record.state);
    }
    println!();
}

fn print_record(record: &ActivationRecord, report: &RunReport) {
    match (&record.state, &record.error) {
        (ModuleState::Failed, Some(error)) => {
            println!("  {:<20} {}  ({error})", record.module, record.state);
            if let Some((root, root_error)) = report.root_cause(&record.module)
                && root != record.module
            {
                println!("  {:<20}   root cause: {root}: {root_error}", "");
            }
        }
        _ => println!("  {:<20} {}", record.module, record.state),
    }
}

fn save_state(config: &Config, report: &RunReport) -> anyhow::Result<()> {
    let path = config.state_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(report)?)
        .with_context(|| format!("writing {}", path.display()))?;
    tracing::debug!(path = %path.display(), "saved activation state");
    Ok(())
}

fn load_state(config: &Config) -> anyhow::Result<Option<RunReport>> {
    let path = config.state_path();
    if !path.is_file() {
        return Ok(None);
    }
    let content =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let report =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(report))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn state_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();

        let report = RunReport {
            records: vec![ActivationRecord::new("crm", ModuleState::Active)],
            aborted: false,
            completed_at: chrono::Utc::now(),
        };

        save_state(&config, &report).unwrap();
        let loaded = load_state(&config).unwrap().unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].module, "crm");
        assert_eq!(loaded.records[0].state, ModuleState::Active);
    }

    #[test]
    fn missing_state_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert!(load_state(&config).unwrap().is_none());
    }
}
