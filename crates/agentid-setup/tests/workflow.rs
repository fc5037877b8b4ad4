use std::collections::BTreeSet;
use std::time::Duration;

use agentid_core::{AccessType, ProvisionManifest};
use agentid_setup::directory::mock::MockDirectory;
use agentid_setup::directory::Backoff;
use agentid_setup::engine::{run_provisioning, WorkflowOptions};

fn opts() -> WorkflowOptions {
    WorkflowOptions {
        prefix: "Demo-".into(),
        skip_agent_identities: false,
        service_account_upn: None,
        visibility: Backoff::new(4, Duration::from_millis(1), Duration::from_millis(2)),
        spawn_retry: Backoff::fixed(4, Duration::from_millis(1)),
    }
}

#[test]
fn full_sample_run_provisions_everything() {
    let dir = MockDirectory::new().with_current_user("sponsor-1");
    let manifest = ProvisionManifest::sample();
    let mut opts = opts();
    opts.service_account_upn = Some("agent-svc@contoso.example".into());

    let outcome = run_provisioning(&dir, &manifest, &opts).unwrap();

    // One blueprint and three producers.
    assert_eq!(dir.application_count(), 4);
    let blueprint = outcome.blueprint.as_ref().unwrap();
    assert_eq!(blueprint.display_name, "Demo-Orchestrator");
    assert!(blueprint.secret.is_some());

    let orders = outcome.producer("OrdersApi").unwrap();
    assert_eq!(orders.scope_uris.len(), 2);
    assert!(orders.scope_uris[0].starts_with("api://"));

    // Consent edges exist for every producer with delegated grants.
    assert_eq!(dir.grants().len(), 3);

    // Autonomous agent plus the user-bound identity.
    assert_eq!(outcome.agent_identities.len(), 2);
    assert_eq!(outcome.sponsor_user_id.as_deref(), Some("sponsor-1"));
    assert!(outcome.warnings.is_empty());
}

#[test]
fn second_run_changes_nothing_but_the_credential() {
    let dir = MockDirectory::new();
    let manifest = ProvisionManifest::sample();
    let opts = opts();

    let first = run_provisioning(&dir, &manifest, &opts).unwrap();
    let apps_after_first = dir.application_count();
    let grants_after_first = dir.grants().len();
    let blueprint_id = first.blueprint.as_ref().unwrap().object_id.clone();
    assert_eq!(dir.credential_count(&blueprint_id), 1);

    let second = run_provisioning(&dir, &manifest, &opts).unwrap();

    assert_eq!(dir.application_count(), apps_after_first);
    assert_eq!(dir.grants().len(), grants_after_first);
    // Secrets cannot be read back, so each run issues exactly one more.
    assert_eq!(dir.credential_count(&blueprint_id), 2);
    // Nothing new besides the credential and (idempotent) agent identities.
    assert!(second
        .created
        .iter()
        .all(|c| c.contains("client secret") || c.contains("agent identity")));
    // Inheritable sets are re-asserted every run; everything else no-ops.
    assert!(second.updated.iter().all(|u| u.contains("inheritable")));
}

#[test]
fn scope_ids_survive_re_runs_and_additions() {
    let dir = MockDirectory::new();
    let mut manifest = ProvisionManifest::sample();
    let opts = opts();

    run_provisioning(&dir, &manifest, &opts).unwrap();
    let before = dir.applications_named("Demo-OrdersApi");
    let orders_read_id = before[0].scope_by_value("Orders.Read").unwrap().id;

    // Extend the producer's scope list and run again.
    manifest.producers[0].scopes.push(agentid_core::ScopeSpec {
        value: "Orders.Export".into(),
        display_name: "Export orders".into(),
        description: "Allows exporting order history".into(),
    });
    run_provisioning(&dir, &manifest, &opts).unwrap();

    let after = dir.applications_named("Demo-OrdersApi");
    assert_eq!(after[0].scope_by_value("Orders.Read").unwrap().id, orders_read_id);
    assert!(after[0].scope_by_value("Orders.Export").is_some());
    assert!(after[0].oauth2_permission_scopes.iter().all(|s| s.is_enabled));
}

#[test]
fn adding_a_producer_keeps_existing_requirements() {
    let dir = MockDirectory::new();
    let full = ProvisionManifest::sample();
    let opts = opts();

    let mut reduced = full.clone();
    reduced.producers.truncate(1);
    reduced.config_files.clear();
    run_provisioning(&dir, &reduced, &opts).unwrap();

    run_provisioning(&dir, &full, &opts).unwrap();

    let blueprint = &dir.applications_named("Demo-Orchestrator")[0];
    let required: BTreeSet<&str> = blueprint
        .required_resource_access
        .iter()
        .map(|entry| entry.resource_app_id.as_str())
        .collect();
    assert_eq!(required.len(), 3);
    for entry in &blueprint.required_resource_access {
        assert!(entry
            .resource_access
            .iter()
            .all(|access| access.access_type == AccessType::Scope));
    }
}

#[test]
fn role_grants_land_as_role_entries_and_stay_idempotent() {
    let dir = MockDirectory::new();
    let mut manifest = ProvisionManifest::sample();
    manifest.producers[0].role_grants = vec!["Orders.Read.All".into()];
    manifest.validate().unwrap();

    run_provisioning(&dir, &manifest, &opts()).unwrap();

    let blueprint = &dir.applications_named("Demo-Orchestrator")[0];
    let orders = &dir.applications_named("Demo-OrdersApi")[0];
    let entry = blueprint
        .required_resource_access
        .iter()
        .find(|e| e.resource_app_id == orders.client_id)
        .unwrap();
    let role_id = orders.role_by_value("Orders.Read.All").unwrap().id;
    assert!(entry
        .resource_access
        .iter()
        .any(|a| a.access_type == AccessType::Role && a.id == role_id));

    // Unchanged manifest means no requirements write on the next run.
    let second = run_provisioning(&dir, &manifest, &opts()).unwrap();
    assert!(second.updated.iter().all(|u| u.contains("inheritable")));
}

#[test]
fn inheritance_is_recorded_per_producer() {
    let dir = MockDirectory::new();
    let manifest = ProvisionManifest::sample();
    run_provisioning(&dir, &manifest, &opts()).unwrap();

    let blueprint = &dir.applications_named("Demo-Orchestrator")[0];
    let orders = &dir.applications_named("Demo-OrdersApi")[0];
    let email = &dir.applications_named("Demo-EmailApi")[0];
    assert_eq!(
        dir.inheritable_for(&blueprint.object_id, &orders.client_id),
        vec!["Orders.Read".to_string()]
    );
    assert_eq!(
        dir.inheritable_for(&blueprint.object_id, &email.client_id),
        vec!["Email.Send".to_string()]
    );
}

#[test]
fn denied_consent_degrades_to_a_warning() {
    use agentid_setup::directory::DirectoryClient;

    // Create the producer up front so its app id is known, then deny it.
    let dir = MockDirectory::new();
    let orders = dir.create_application("Demo-OrdersApi").unwrap();
    let dir = dir.with_consent_denied_for(orders.client_id);

    let outcome = run_provisioning(&dir, &ProvisionManifest::sample(), &opts()).unwrap();
    assert!(outcome
        .warnings
        .iter()
        .any(|w| w.contains("Demo-OrdersApi")));
    // The other producers' consent still landed.
    assert_eq!(dir.grants().len(), 2);
}

#[test]
fn unavailable_preview_endpoints_do_not_abort_the_run() {
    let dir = MockDirectory::new()
        .with_agent_endpoint_unavailable()
        .with_inheritable_unavailable();
    let outcome = run_provisioning(&dir, &ProvisionManifest::sample(), &opts()).unwrap();

    assert!(outcome.agent_identities.is_empty());
    assert!(outcome.blueprint.is_some());
    // One warning for the inheritance endpoint, one for the agent endpoint.
    assert_eq!(outcome.warnings.len(), 2);
}

#[test]
fn agent_user_creation_retries_through_replication_lag() {
    let dir = MockDirectory::new().with_agent_user_transient_failures(2);
    let mut opts = opts();
    opts.service_account_upn = Some("agent-svc@contoso.example".into());

    let outcome = run_provisioning(&dir, &ProvisionManifest::sample(), &opts).unwrap();
    assert_eq!(outcome.agent_identities.len(), 2);
}

#[test]
fn agent_user_retry_exhaustion_fails_the_run() {
    let dir = MockDirectory::new().with_agent_user_transient_failures(20);
    let mut opts = opts();
    opts.service_account_upn = Some("agent-svc@contoso.example".into());

    assert!(run_provisioning(&dir, &ProvisionManifest::sample(), &opts).is_err());
}

#[test]
fn skipping_agent_identities_leaves_the_preview_api_untouched() {
    let dir = MockDirectory::new().with_agent_endpoint_unavailable();
    let mut opts = opts();
    opts.skip_agent_identities = true;

    let outcome = run_provisioning(&dir, &ProvisionManifest::sample(), &opts).unwrap();
    assert!(outcome.agent_identities.is_empty());
    // No warning either: the endpoint was never called.
    assert!(outcome.warnings.is_empty());
    assert!(outcome.skipped.iter().any(|s| s.contains("agent identities")));
}
