pub mod blueprint;
pub mod consent;
pub mod grants;
pub mod resolver;
pub mod scopes;

use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use agentid_core::{
    AppRegistration, ProducerSpec, ProvisionManifest, ProvisionOutcome, ProvisionedApp,
    SecretOutput,
};

use crate::directory::{Backoff, DirectoryClient};

/// Run-level knobs the CLI maps its flags onto.
#[derive(Clone, Debug)]
pub struct WorkflowOptions {
    /// Prepended to every display name so multiple instances can share a
    /// tenant without colliding.
    pub prefix: String,
    pub skip_agent_identities: bool,
    pub service_account_upn: Option<String>,
    /// Schedule for polling newly created objects into visibility.
    pub visibility: Backoff,
    /// Schedule for retrying the replication-prone agent-user creation.
    pub spawn_retry: Backoff,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            prefix: "CustomerServiceSample-".into(),
            skip_agent_identities: false,
            service_account_upn: None,
            visibility: Backoff::visibility(),
            spawn_retry: Backoff::fixed(5, Duration::from_secs(10)),
        }
    }
}

impl WorkflowOptions {
    pub fn display_name(&self, base: &str) -> String {
        format!("{}{base}", self.prefix)
    }
}

/// Runs the whole provisioning workflow against one directory tenant.
///
/// Every step is ensure-shaped, so re-running after a partial failure
/// completes the remainder without disturbing what already exists. The only
/// exception is the blueprint credential, which is issued fresh each run
/// because secret values cannot be read back.
pub fn run_provisioning(
    dir: &dyn DirectoryClient,
    manifest: &ProvisionManifest,
    opts: &WorkflowOptions,
) -> anyhow::Result<ProvisionOutcome> {
    let tenant_id = dir
        .tenant_id()
        .context("could not establish the target tenant")?;
    info!(%tenant_id, prefix = %opts.prefix, "starting provisioning run");
    let mut outcome = ProvisionOutcome::new(&tenant_id);

    // Producers first so their generated scope ids exist before the
    // blueprint's requirements reference them.
    let mut producer_apps: Vec<AppRegistration> = Vec::with_capacity(manifest.producers.len());
    for spec in &manifest.producers {
        let app = ensure_producer(dir, spec, opts, &mut outcome)?;
        outcome.producers.push(provisioned(spec.name.clone(), &app, spec));
        producer_apps.push(app);
    }

    let blueprint_name = opts.display_name(&manifest.blueprint.name);
    let resolved = resolver::resolve_or_create(dir, &blueprint_name, &opts.visibility)
        .with_context(|| format!("could not ensure blueprint `{blueprint_name}`"))?;
    note_resolution(&mut outcome, &resolved, &blueprint_name);
    let mut blueprint_app = resolved.app;

    let secret = blueprint::attach_credential(
        dir,
        &blueprint_app,
        &manifest.blueprint.credential_display_name,
    )
    .context("could not issue the blueprint credential")?;
    outcome.note_created(format!("{blueprint_name}: client secret"));

    for (spec, app) in manifest.producers.iter().zip(&producer_apps) {
        if spec.delegated_grants.is_empty() && spec.role_grants.is_empty() {
            continue;
        }
        let (updated, wrote) = grants::grant(
            dir,
            &blueprint_app,
            app,
            &spec.delegated_grants,
            &spec.role_grants,
        )
        .with_context(|| format!("could not record requirements on `{}`", app.display_name))?;
        blueprint_app = updated;
        if wrote {
            outcome.note_updated(format!(
                "{blueprint_name}: requires {} permission(s) of {}",
                spec.delegated_grants.len() + spec.role_grants.len(),
                app.display_name
            ));
        }
    }

    let consented = consent::grant_tenant_consent(dir, &blueprint_app, &producer_apps);
    for pair in &consented.granted {
        outcome.note_created(format!("consent: {pair}"));
    }
    for pair in &consented.skipped {
        outcome.note_skipped(format!("consent: {pair}"));
    }
    outcome.warnings.extend(consented.warnings);

    let inheritable: Vec<(AppRegistration, Vec<String>)> = manifest
        .producers
        .iter()
        .zip(&producer_apps)
        .filter(|(spec, _)| !spec.inheritable.is_empty())
        .map(|(spec, app)| (app.clone(), spec.inheritable.clone()))
        .collect();
    if !inheritable.is_empty() {
        let inherited = blueprint::propagate_inheritable(dir, &blueprint_app, &inheritable);
        for name in &inherited.propagated {
            outcome.note_updated(format!("{blueprint_name}: inheritable permissions for {name}"));
        }
        outcome.warnings.extend(inherited.warnings);
    }

    if opts.skip_agent_identities {
        outcome.note_skipped(format!("{blueprint_name}: agent identities (disabled)"));
    } else {
        let spawned = blueprint::spawn_agent_identities(
            dir,
            &blueprint_app,
            &format!("{blueprint_name} Agent"),
            opts.service_account_upn.as_deref(),
            &opts.spawn_retry,
        )
        .context("could not spawn agent identities")?;
        for identity in &spawned.identities {
            outcome.note_created(format!("agent identity: {}", identity.display_name));
        }
        outcome.warnings.extend(spawned.warnings);
        outcome.agent_identities = spawned.identities;
    }

    match dir.current_user_id() {
        Ok(sponsor) => outcome.sponsor_user_id = sponsor,
        Err(err) => {
            warn!(error = %err, "could not resolve the sponsoring user");
            outcome.warn(format!("sponsor lookup failed: {err}"));
        }
    }

    outcome.blueprint = Some(ProvisionedApp {
        name: manifest.blueprint.name.clone(),
        display_name: blueprint_app.display_name.clone(),
        object_id: blueprint_app.object_id.clone(),
        client_id: blueprint_app.client_id.clone(),
        scope_uris: Vec::new(),
        secret: Some(SecretOutput {
            value: secret.secret_text,
            expires_at: secret.expires_at,
        }),
    });

    info!(
        created = outcome.created.len(),
        updated = outcome.updated.len(),
        skipped = outcome.skipped.len(),
        warnings = outcome.warnings.len(),
        "provisioning run complete"
    );
    Ok(outcome)
}

fn ensure_producer(
    dir: &dyn DirectoryClient,
    spec: &ProducerSpec,
    opts: &WorkflowOptions,
    outcome: &mut ProvisionOutcome,
) -> anyhow::Result<AppRegistration> {
    let display_name = opts.display_name(&spec.name);
    let resolved = resolver::resolve_or_create(dir, &display_name, &opts.visibility)
        .with_context(|| format!("could not ensure producer `{display_name}`"))?;
    note_resolution(outcome, &resolved, &display_name);
    let app = resolved.app;

    let (app, added_scopes) = scopes::ensure_scopes(dir, &app, &spec.scopes, &opts.visibility)
        .with_context(|| format!("could not configure scopes on `{display_name}`"))?;
    for value in &added_scopes {
        outcome.note_updated(format!("{display_name}: scope {value}"));
    }

    let (app, added_roles) = scopes::ensure_app_roles(dir, &app, &spec.app_roles)
        .with_context(|| format!("could not configure app roles on `{display_name}`"))?;
    for value in &added_roles {
        outcome.note_updated(format!("{display_name}: app role {value}"));
    }

    let (app, uri_set) = scopes::ensure_identifier_uri(dir, &app)
        .with_context(|| format!("could not set the application id uri on `{display_name}`"))?;
    if uri_set {
        outcome.note_updated(format!("{display_name}: application id uri"));
    }

    Ok(app)
}

fn provisioned(name: String, app: &AppRegistration, spec: &ProducerSpec) -> ProvisionedApp {
    ProvisionedApp {
        name,
        display_name: app.display_name.clone(),
        object_id: app.object_id.clone(),
        client_id: app.client_id.clone(),
        scope_uris: spec.scopes.iter().map(|s| app.scope_uri(&s.value)).collect(),
        secret: None,
    }
}

fn note_resolution(outcome: &mut ProvisionOutcome, resolved: &resolver::Resolved, name: &str) {
    if resolved.created {
        outcome.note_created(name.to_string());
    } else {
        outcome.note_skipped(format!("{name} (exists)"));
    }
    if resolved.duplicate_matches > 0 {
        outcome.warn(format!(
            "{name}: {} other registration(s) share this display name",
            resolved.duplicate_matches
        ));
    }
}
