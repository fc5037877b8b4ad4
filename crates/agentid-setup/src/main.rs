use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use agentid_core::ProvisionManifest;
use agentid_setup::config::GraphCredentials;
use agentid_setup::directory::graph::GraphDirectoryClient;
use agentid_setup::engine::{run_provisioning, WorkflowOptions};
use agentid_setup::render::{self, OutputFormat};
use agentid_setup::status;

/// Provisions the agent-identity demo environment in an Entra ID tenant:
/// application registrations, exposed scopes and app roles, delegated
/// grants with tenant-wide consent, inheritable permissions, and the agent
/// identities spawned from the blueprint. Safe to re-run; existing objects
/// are reused.
#[derive(Debug, Parser)]
#[command(name = "agentid-setup", version)]
struct Cli {
    /// Tenant to provision. Defaults to AGENTID_TENANT_ID.
    #[arg(long, env = "AGENTID_TENANT_ID")]
    tenant: Option<String>,

    /// Prefix applied to every display name, so parallel instances can
    /// share a tenant.
    #[arg(long, default_value = "CustomerServiceSample-")]
    prefix: String,

    /// Manifest file (.json or .toml) describing what to provision.
    /// Omitted, the built-in sample environment is used.
    #[arg(long)]
    manifest: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Skip the preview agent-identity endpoints entirely.
    #[arg(long)]
    skip_agent_identities: bool,

    /// Service-account UPN to bind a user agent identity to.
    #[arg(long)]
    service_account_upn: Option<String>,

    /// Directory the manifest's config-file paths are resolved against
    /// when --output update-files is used.
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            status::error(&format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let manifest = match &cli.manifest {
        Some(path) => ProvisionManifest::load(path)
            .with_context(|| format!("could not load manifest {}", path.display()))?,
        None => ProvisionManifest::sample(),
    };

    let credentials = GraphCredentials::from_env(cli.tenant.as_deref())
        .context("directory credentials are not configured")?;
    let dir = GraphDirectoryClient::new(credentials)
        .context("could not initialize the directory session")?;

    let opts = WorkflowOptions {
        prefix: cli.prefix.clone(),
        skip_agent_identities: cli.skip_agent_identities,
        service_account_upn: cli.service_account_upn.clone(),
        ..WorkflowOptions::default()
    };

    status::info(&format!("provisioning with prefix `{}`", opts.prefix));
    let outcome = run_provisioning(&dir, &manifest, &opts)?;

    match cli.output {
        OutputFormat::Text => print!("{}", render::render_text(&outcome)),
        OutputFormat::Json => println!("{}", render::render_json(&outcome)?),
        OutputFormat::Env => print!("{}", render::render_env(&outcome)),
        OutputFormat::UpdateFiles => {
            let touched = render::update_config_files(&outcome, &manifest, &cli.config_dir)?;
            for path in &touched {
                status::success(&format!("updated {}", path.display()));
            }
            if touched.is_empty() {
                status::warn("manifest names no config files; nothing to update");
            }
        }
    }
    status::warnings_section(&outcome.warnings);
    Ok(())
}
