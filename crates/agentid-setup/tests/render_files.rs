use std::fs;

use serde_json::{json, Value};

use agentid_core::ProvisionManifest;
use agentid_setup::directory::mock::MockDirectory;
use agentid_setup::directory::Backoff;
use agentid_setup::engine::{run_provisioning, WorkflowOptions};
use agentid_setup::render::update_config_files;

fn run_sample(dir: &MockDirectory) -> (agentid_core::ProvisionOutcome, ProvisionManifest) {
    let manifest = ProvisionManifest::sample();
    let opts = WorkflowOptions {
        prefix: "Demo-".into(),
        visibility: Backoff::new(4, std::time::Duration::from_millis(1), std::time::Duration::from_millis(2)),
        spawn_retry: Backoff::fixed(4, std::time::Duration::from_millis(1)),
        ..WorkflowOptions::default()
    };
    let outcome = run_provisioning(dir, &manifest, &opts).unwrap();
    (outcome, manifest)
}

#[test]
fn updates_merge_without_replacing_unrelated_keys() {
    let dir = MockDirectory::new();
    let (outcome, manifest) = run_sample(&dir);
    let root = tempfile::tempdir().unwrap();

    // Pre-seed the orders file the way a developer would have left it.
    let orders_dir = root.path().join("orders");
    fs::create_dir_all(&orders_dir).unwrap();
    fs::write(
        orders_dir.join("appsettings.json"),
        serde_json::to_string_pretty(&json!({
            "Logging": {"LogLevel": {"Default": "Information"}},
            "AzureAd": {"Instance": "https://login.microsoftonline.com/"}
        }))
        .unwrap(),
    )
    .unwrap();

    let touched = update_config_files(&outcome, &manifest, root.path()).unwrap();
    assert_eq!(touched.len(), manifest.config_files.len());

    let orders: Value =
        serde_json::from_str(&fs::read_to_string(orders_dir.join("appsettings.json")).unwrap())
            .unwrap();
    // Hand-maintained keys survive.
    assert_eq!(orders["Logging"]["LogLevel"]["Default"], "Information");
    assert_eq!(
        orders["AzureAd"]["Instance"],
        "https://login.microsoftonline.com/"
    );
    // Provisioned identifiers landed next to them.
    assert_eq!(orders["AzureAd"]["TenantId"], outcome.tenant_id);
    assert_eq!(
        orders["AzureAd"]["ClientId"],
        outcome.producer("OrdersApi").unwrap().client_id
    );
}

#[test]
fn missing_files_are_created_with_full_content() {
    let dir = MockDirectory::new().with_current_user("sponsor-1");
    let (outcome, manifest) = run_sample(&dir);
    let root = tempfile::tempdir().unwrap();

    update_config_files(&outcome, &manifest, root.path()).unwrap();

    let orchestrator: Value = serde_json::from_str(
        &fs::read_to_string(root.path().join("orchestrator/appsettings.json")).unwrap(),
    )
    .unwrap();
    let blueprint = outcome.blueprint.as_ref().unwrap();
    assert_eq!(orchestrator["AzureAd"]["ClientId"], blueprint.client_id);
    assert_eq!(
        orchestrator["AzureAd"]["ClientSecret"],
        blueprint.secret.as_ref().unwrap().value
    );
    assert_eq!(
        orchestrator["DownstreamApis"]["OrdersApi"]["Scopes"]
            .as_array()
            .unwrap()
            .len(),
        2
    );
    assert_eq!(
        orchestrator["AgentIdentity"]["BlueprintClientId"],
        blueprint.client_id
    );
    assert_eq!(orchestrator["AgentIdentity"]["SponsorUserId"], "sponsor-1");
    assert!(orchestrator["AgentIdentity"]["AutonomousAgentId"].is_string());
}

#[test]
fn rerunning_the_update_is_stable() {
    let dir = MockDirectory::new();
    let (outcome, manifest) = run_sample(&dir);
    let root = tempfile::tempdir().unwrap();

    update_config_files(&outcome, &manifest, root.path()).unwrap();
    let first = fs::read_to_string(root.path().join("orders/appsettings.json")).unwrap();
    update_config_files(&outcome, &manifest, root.path()).unwrap();
    let second = fs::read_to_string(root.path().join("orders/appsettings.json")).unwrap();
    assert_eq!(first, second);
}
