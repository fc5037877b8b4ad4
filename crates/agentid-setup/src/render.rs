use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::ValueEnum;
use colored::Colorize;
use serde_json::{json, Map, Value};

use agentid_core::{AgentIdentityKind, ConfigFileTarget, ProvisionManifest, ProvisionOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary.
    Text,
    /// The full outcome as a JSON document.
    Json,
    /// Shell `export` lines for sourcing into a deployment environment.
    Env,
    /// Merge identifiers into the manifest's configuration files.
    UpdateFiles,
}

pub fn render_text(outcome: &ProvisionOutcome) -> String {
    let mut out = String::new();
    out.push_str(&format!("{} {}\n", "tenant".bold(), outcome.tenant_id));

    if let Some(blueprint) = &outcome.blueprint {
        out.push_str(&format!("\n{}\n", "blueprint".bold().underline()));
        out.push_str(&format!("  {}\n", blueprint.display_name));
        out.push_str(&format!("    client id  {}\n", blueprint.client_id));
        out.push_str(&format!("    object id  {}\n", blueprint.object_id));
        if let Some(secret) = &blueprint.secret {
            out.push_str(&format!(
                "    secret     {} (expires {})\n",
                secret.value,
                secret.expires_at
            ));
        }
    }

    if !outcome.producers.is_empty() {
        out.push_str(&format!("\n{}\n", "producers".bold().underline()));
        for producer in &outcome.producers {
            out.push_str(&format!("  {}\n", producer.display_name));
            out.push_str(&format!("    client id  {}\n", producer.client_id));
            for uri in &producer.scope_uris {
                out.push_str(&format!("    scope      {uri}\n"));
            }
        }
    }

    if !outcome.agent_identities.is_empty() {
        out.push_str(&format!("\n{}\n", "agent identities".bold().underline()));
        for identity in &outcome.agent_identities {
            let kind = match identity.kind {
                AgentIdentityKind::Autonomous => "autonomous",
                AgentIdentityKind::User => "user",
            };
            out.push_str(&format!(
                "  {} ({kind}) {}\n",
                identity.display_name, identity.object_id
            ));
        }
    }

    if let Some(sponsor) = &outcome.sponsor_user_id {
        out.push_str(&format!("\n{} {sponsor}\n", "sponsor".bold()));
    }

    out.push_str(&format!(
        "\n{} created, {} updated, {} already in place\n",
        outcome.created.len().to_string().green(),
        outcome.updated.len().to_string().cyan(),
        outcome.skipped.len()
    ));
    out
}

pub fn render_json(outcome: &ProvisionOutcome) -> anyhow::Result<String> {
    serde_json::to_string_pretty(outcome).context("could not serialize the outcome")
}

/// `export` lines, one identifier per variable. Producer names are upper
/// snake-cased (`OrdersApi` becomes `ORDERS_API`).
pub fn render_env(outcome: &ProvisionOutcome) -> String {
    let mut out = String::new();
    out.push_str(&format!("export AGENTID_TENANT_ID={}\n", outcome.tenant_id));
    if let Some(blueprint) = &outcome.blueprint {
        out.push_str(&format!(
            "export AGENTID_BLUEPRINT_CLIENT_ID={}\n",
            blueprint.client_id
        ));
        if let Some(secret) = &blueprint.secret {
            out.push_str(&format!(
                "export AGENTID_BLUEPRINT_CLIENT_SECRET='{}'\n",
                secret.value.replace('\'', r"'\''")
            ));
        }
    }
    for producer in &outcome.producers {
        let key = env_key(&producer.name);
        out.push_str(&format!(
            "export AGENTID_{key}_CLIENT_ID={}\n",
            producer.client_id
        ));
        if !producer.scope_uris.is_empty() {
            out.push_str(&format!(
                "export AGENTID_{key}_SCOPES='{}'\n",
                producer.scope_uris.join(" ")
            ));
        }
    }
    for identity in &outcome.agent_identities {
        match identity.kind {
            AgentIdentityKind::Autonomous => out.push_str(&format!(
                "export AGENTID_AGENT_ID={}\n",
                identity.object_id
            )),
            AgentIdentityKind::User => out.push_str(&format!(
                "export AGENTID_AGENT_USER_ID={}\n",
                identity.object_id
            )),
        }
    }
    if let Some(sponsor) = &outcome.sponsor_user_id {
        out.push_str(&format!("export AGENTID_SPONSOR_USER_ID={sponsor}\n"));
    }
    out
}

/// Merges this run's identifiers into the manifest's configuration files,
/// resolved relative to `config_dir`. Files are read, patched at specific
/// paths, and written back; keys the workflow does not own are preserved
/// byte-for-byte at the value level. A missing file starts from an empty
/// document.
pub fn update_config_files(
    outcome: &ProvisionOutcome,
    manifest: &ProvisionManifest,
    config_dir: &Path,
) -> anyhow::Result<Vec<PathBuf>> {
    let mut touched = Vec::new();
    for target in &manifest.config_files {
        let path = config_dir.join(&target.path);
        let mut doc = read_json_or_empty(&path)?;
        apply_target(outcome, target, &mut doc)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("could not create {}", parent.display()))?;
        }
        let rendered = serde_json::to_string_pretty(&doc)?;
        fs::write(&path, rendered + "\n")
            .with_context(|| format!("could not write {}", path.display()))?;
        touched.push(path);
    }
    Ok(touched)
}

fn apply_target(
    outcome: &ProvisionOutcome,
    target: &ConfigFileTarget,
    doc: &mut Value,
) -> anyhow::Result<()> {
    match &target.producer {
        Some(name) => {
            let producer = outcome
                .producer(name)
                .with_context(|| format!("no provisioned producer named `{name}`"))?;
            set_path(doc, &["AzureAd", "TenantId"], json!(outcome.tenant_id));
            set_path(doc, &["AzureAd", "ClientId"], json!(producer.client_id));
        }
        None => {
            let blueprint = outcome
                .blueprint
                .as_ref()
                .context("run produced no blueprint to write")?;
            set_path(doc, &["AzureAd", "TenantId"], json!(outcome.tenant_id));
            set_path(doc, &["AzureAd", "ClientId"], json!(blueprint.client_id));
            if let Some(secret) = &blueprint.secret {
                set_path(doc, &["AzureAd", "ClientSecret"], json!(secret.value));
            }
            for producer in &outcome.producers {
                set_path(
                    doc,
                    &["DownstreamApis", &producer.name, "Scopes"],
                    json!(producer.scope_uris),
                );
            }
            set_path(
                doc,
                &["AgentIdentity", "BlueprintClientId"],
                json!(blueprint.client_id),
            );
            for identity in &outcome.agent_identities {
                let key = match identity.kind {
                    AgentIdentityKind::Autonomous => "AutonomousAgentId",
                    AgentIdentityKind::User => "AgentUserId",
                };
                set_path(doc, &["AgentIdentity", key], json!(identity.object_id));
            }
            if let Some(sponsor) = &outcome.sponsor_user_id {
                set_path(doc, &["AgentIdentity", "SponsorUserId"], json!(sponsor));
            }
        }
    }
    Ok(())
}

fn read_json_or_empty(path: &Path) -> anyhow::Result<Value> {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents)
            .with_context(|| format!("{} is not valid JSON", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Ok(Value::Object(Map::new()))
        }
        Err(err) => Err(err).with_context(|| format!("could not read {}", path.display())),
    }
}

/// Sets one leaf under a chain of object keys, creating intermediate objects
/// as needed. Sibling keys at every level are left untouched, which is what
/// makes re-running safe against hand-edited files.
fn set_path(doc: &mut Value, path: &[&str], value: Value) {
    let (leaf, parents) = match path.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut node = doc;
    for key in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = node
            .as_object_mut()
            .expect("just ensured an object")
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    node.as_object_mut()
        .expect("just ensured an object")
        .insert(leaf.to_string(), value);
}

fn env_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() && i > 0 {
            let prev_lower = name
                .chars()
                .nth(i - 1)
                .is_some_and(|p| p.is_ascii_lowercase());
            if prev_lower {
                key.push('_');
            }
        }
        if ch.is_ascii_alphanumeric() {
            key.push(ch.to_ascii_uppercase());
        } else {
            key.push('_');
        }
    }
    key
}
