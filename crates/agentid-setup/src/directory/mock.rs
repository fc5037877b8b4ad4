use std::collections::BTreeMap;
use std::sync::Mutex;

use rand::distr::{Alphanumeric, SampleString};
use time::{Duration as TimeDuration, OffsetDateTime};
use uuid::Uuid;

use agentid_core::{
    AgentIdentity, AgentIdentityKind, AppRegistration, AppRole, CredentialSecret, PermissionGrant,
    PermissionScope, RequiredResourceAccess, ServicePrincipal,
};

use crate::directory::{DirectoryClient, DirectoryError};

/// In-memory directory. Immediately consistent by default; the fault knobs
/// let tests exercise the replication-lag, throttling-adjacent, and
/// preview-capability-missing paths the engine has to handle.
#[derive(Default)]
pub struct MockDirectory {
    state: Mutex<MockState>,
    tenant: String,
    current_user: Option<String>,
    /// Newly created applications stay invisible to `get_application` for
    /// this many reads, mimicking the directory's replication window.
    replication_lag_reads: u32,
    /// Producer app ids for which consent creation is denied (403).
    deny_consent_for: Vec<String>,
    agent_endpoint_unavailable: bool,
    inheritable_unavailable: bool,
}

#[derive(Default)]
struct MockState {
    apps: BTreeMap<String, AppRegistration>,
    credentials: BTreeMap<String, Vec<CredentialSecret>>,
    service_principals: BTreeMap<String, ServicePrincipal>,
    grants: Vec<PermissionGrant>,
    inheritable: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    agent_identities: Vec<AgentIdentity>,
    hidden_reads: BTreeMap<String, u32>,
    agent_user_failures_remaining: u32,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self {
            tenant: "00000000-0000-0000-0000-00000000t3st".into(),
            ..Self::default()
        }
    }

    pub fn with_current_user(mut self, object_id: impl Into<String>) -> Self {
        self.current_user = Some(object_id.into());
        self
    }

    pub fn with_replication_lag(mut self, reads: u32) -> Self {
        self.replication_lag_reads = reads;
        self
    }

    pub fn with_consent_denied_for(mut self, producer_app_id: impl Into<String>) -> Self {
        self.deny_consent_for.push(producer_app_id.into());
        self
    }

    pub fn with_agent_endpoint_unavailable(mut self) -> Self {
        self.agent_endpoint_unavailable = true;
        self
    }

    pub fn with_inheritable_unavailable(mut self) -> Self {
        self.inheritable_unavailable = true;
        self
    }

    /// The first `count` agent-user-identity creations fail as if the parent
    /// identity had not replicated yet.
    pub fn with_agent_user_transient_failures(self, count: u32) -> Self {
        self.state
            .lock()
            .expect("mock state poisoned")
            .agent_user_failures_remaining = count;
        self
    }

    // Assertion helpers for the test suite.

    pub fn application_count(&self) -> usize {
        self.state.lock().expect("mock state poisoned").apps.len()
    }

    pub fn applications_named(&self, display_name: &str) -> Vec<AppRegistration> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .apps
            .values()
            .filter(|app| app.display_name == display_name)
            .cloned()
            .collect()
    }

    pub fn credential_count(&self, object_id: &str) -> usize {
        self.state
            .lock()
            .expect("mock state poisoned")
            .credentials
            .get(object_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn service_principal_count(&self) -> usize {
        self.state
            .lock()
            .expect("mock state poisoned")
            .service_principals
            .len()
    }

    pub fn grants(&self) -> Vec<PermissionGrant> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .grants
            .clone()
    }

    pub fn inheritable_for(&self, blueprint_object_id: &str, resource_app_id: &str) -> Vec<String> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .inheritable
            .get(blueprint_object_id)
            .and_then(|per_resource| per_resource.get(resource_app_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn agent_identities(&self) -> Vec<AgentIdentity> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .agent_identities
            .clone()
    }

    fn not_found(what: &str) -> DirectoryError {
        DirectoryError::Http {
            status: 404,
            body: format!("{what} not found"),
            retry_after: None,
        }
    }
}

impl DirectoryClient for MockDirectory {
    fn tenant_id(&self) -> Result<String, DirectoryError> {
        Ok(self.tenant.clone())
    }

    fn current_user_id(&self) -> Result<Option<String>, DirectoryError> {
        Ok(self.current_user.clone())
    }

    fn find_applications_by_name(
        &self,
        display_name: &str,
    ) -> Result<Vec<AppRegistration>, DirectoryError> {
        let state = self.state.lock().expect("mock state poisoned");
        Ok(state
            .apps
            .values()
            .filter(|app| app.display_name == display_name)
            .cloned()
            .collect())
    }

    fn get_application(&self, object_id: &str) -> Result<Option<AppRegistration>, DirectoryError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        if let Some(remaining) = state.hidden_reads.get_mut(object_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(None);
            }
        }
        Ok(state.apps.get(object_id).cloned())
    }

    fn create_application(&self, display_name: &str) -> Result<AppRegistration, DirectoryError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        let app = AppRegistration {
            object_id: Uuid::new_v4().to_string(),
            client_id: Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
            identifier_uris: Vec::new(),
            oauth2_permission_scopes: Vec::new(),
            app_roles: Vec::new(),
            required_resource_access: Vec::new(),
        };
        if self.replication_lag_reads > 0 {
            state
                .hidden_reads
                .insert(app.object_id.clone(), self.replication_lag_reads);
        }
        state.apps.insert(app.object_id.clone(), app.clone());
        Ok(app)
    }

    fn set_identifier_uris(&self, object_id: &str, uris: &[String]) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        let app = state
            .apps
            .get_mut(object_id)
            .ok_or_else(|| Self::not_found("application"))?;
        app.identifier_uris = uris.to_vec();
        Ok(())
    }

    fn set_permission_scopes(
        &self,
        object_id: &str,
        scopes: &[PermissionScope],
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        let app = state
            .apps
            .get_mut(object_id)
            .ok_or_else(|| Self::not_found("application"))?;
        // The real directory rejects a write that both keeps an enabled
        // entry and introduces a new one; enforcing that here keeps the
        // two-phase configurator honest.
        let enabled_existing: Vec<&PermissionScope> = app
            .oauth2_permission_scopes
            .iter()
            .filter(|s| s.is_enabled)
            .collect();
        let adds_new = scopes
            .iter()
            .any(|s| !app.oauth2_permission_scopes.iter().any(|e| e.id == s.id));
        if adds_new && !enabled_existing.is_empty() {
            return Err(DirectoryError::Http {
                status: 400,
                body: "cannot add scopes while existing scopes are enabled".into(),
                retry_after: None,
            });
        }
        app.oauth2_permission_scopes = scopes.to_vec();
        Ok(())
    }

    fn set_app_roles(&self, object_id: &str, roles: &[AppRole]) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        let app = state
            .apps
            .get_mut(object_id)
            .ok_or_else(|| Self::not_found("application"))?;
        app.app_roles = roles.to_vec();
        Ok(())
    }

    fn set_required_resource_access(
        &self,
        object_id: &str,
        entries: &[RequiredResourceAccess],
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        let app = state
            .apps
            .get_mut(object_id)
            .ok_or_else(|| Self::not_found("application"))?;
        app.required_resource_access = entries.to_vec();
        Ok(())
    }

    fn add_password(
        &self,
        object_id: &str,
        display_name: &str,
    ) -> Result<CredentialSecret, DirectoryError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        if !state.apps.contains_key(object_id) {
            return Err(Self::not_found("application"));
        }
        let secret = CredentialSecret {
            key_id: Uuid::new_v4(),
            display_name: display_name.to_string(),
            secret_text: Alphanumeric.sample_string(&mut rand::rng(), 40),
            expires_at: OffsetDateTime::now_utc() + TimeDuration::days(180),
        };
        state
            .credentials
            .entry(object_id.to_string())
            .or_default()
            .push(secret.clone());
        Ok(secret)
    }

    fn find_service_principal(
        &self,
        app_id: &str,
    ) -> Result<Option<ServicePrincipal>, DirectoryError> {
        let state = self.state.lock().expect("mock state poisoned");
        Ok(state
            .service_principals
            .values()
            .find(|sp| sp.app_id == app_id)
            .cloned())
    }

    fn create_service_principal(&self, app_id: &str) -> Result<ServicePrincipal, DirectoryError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        let display_name = state
            .apps
            .values()
            .find(|app| app.client_id == app_id)
            .map(|app| app.display_name.clone())
            .unwrap_or_default();
        let sp = ServicePrincipal {
            object_id: Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
            display_name,
        };
        state
            .service_principals
            .insert(sp.object_id.clone(), sp.clone());
        Ok(sp)
    }

    fn find_permission_grant(
        &self,
        client_sp: &str,
        resource_sp: &str,
    ) -> Result<Option<PermissionGrant>, DirectoryError> {
        let state = self.state.lock().expect("mock state poisoned");
        Ok(state
            .grants
            .iter()
            .find(|g| g.client_id == client_sp && g.resource_id == resource_sp)
            .cloned())
    }

    fn create_permission_grant(
        &self,
        client_sp: &str,
        resource_sp: &str,
        scope: &str,
    ) -> Result<PermissionGrant, DirectoryError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        let resource_app_id = state
            .service_principals
            .get(resource_sp)
            .map(|sp| sp.app_id.clone())
            .unwrap_or_default();
        if self.deny_consent_for.contains(&resource_app_id) {
            return Err(DirectoryError::Http {
                status: 403,
                body: "insufficient privileges to grant consent".into(),
                retry_after: None,
            });
        }
        let grant = PermissionGrant {
            id: format!("grant-{}", Uuid::new_v4()),
            client_id: client_sp.to_string(),
            resource_id: resource_sp.to_string(),
            consent_type: "AllPrincipals".into(),
            scope: scope.to_string(),
        };
        state.grants.push(grant.clone());
        Ok(grant)
    }

    fn update_permission_grant_scope(
        &self,
        grant_id: &str,
        scope: &str,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        let grant = state
            .grants
            .iter_mut()
            .find(|g| g.id == grant_id)
            .ok_or_else(|| Self::not_found("permission grant"))?;
        grant.scope = scope.to_string();
        Ok(())
    }

    fn set_inheritable_permissions(
        &self,
        blueprint_object_id: &str,
        resource_app_id: &str,
        scope_values: &[String],
    ) -> Result<(), DirectoryError> {
        if self.inheritable_unavailable {
            return Err(DirectoryError::CapabilityUnavailable(
                "inheritable-permission endpoint not available in this tenant".into(),
            ));
        }
        let mut state = self.state.lock().expect("mock state poisoned");
        if !state.apps.contains_key(blueprint_object_id) {
            return Err(Self::not_found("application"));
        }
        state
            .inheritable
            .entry(blueprint_object_id.to_string())
            .or_default()
            .insert(resource_app_id.to_string(), scope_values.to_vec());
        Ok(())
    }

    fn create_agent_identity(
        &self,
        blueprint_app_id: &str,
        display_name: &str,
    ) -> Result<AgentIdentity, DirectoryError> {
        if self.agent_endpoint_unavailable {
            return Err(DirectoryError::CapabilityUnavailable(
                "agent-identity endpoint not available in this tenant".into(),
            ));
        }
        let mut state = self.state.lock().expect("mock state poisoned");
        if !state
            .apps
            .values()
            .any(|app| app.client_id == blueprint_app_id)
        {
            return Err(Self::not_found("blueprint application"));
        }
        if let Some(existing) = state
            .agent_identities
            .iter()
            .find(|ai| ai.display_name == display_name && ai.kind == AgentIdentityKind::Autonomous)
        {
            return Ok(existing.clone());
        }
        let identity = AgentIdentity {
            object_id: Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
            kind: AgentIdentityKind::Autonomous,
            user_principal_name: None,
        };
        state.agent_identities.push(identity.clone());
        Ok(identity)
    }

    fn create_agent_user_identity(
        &self,
        agent_object_id: &str,
        user_principal_name: &str,
    ) -> Result<AgentIdentity, DirectoryError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        if state.agent_user_failures_remaining > 0 {
            state.agent_user_failures_remaining -= 1;
            return Err(Self::not_found("agent identity (not yet replicated)"));
        }
        let parent = state
            .agent_identities
            .iter()
            .find(|ai| ai.object_id == agent_object_id)
            .cloned()
            .ok_or_else(|| Self::not_found("agent identity"))?;
        if let Some(existing) = state.agent_identities.iter().find(|ai| {
            ai.kind == AgentIdentityKind::User
                && ai.user_principal_name.as_deref() == Some(user_principal_name)
        }) {
            return Ok(existing.clone());
        }
        let identity = AgentIdentity {
            object_id: Uuid::new_v4().to_string(),
            display_name: format!("{} ({user_principal_name})", parent.display_name),
            kind: AgentIdentityKind::User,
            user_principal_name: Some(user_principal_name.to_string()),
        };
        state.agent_identities.push(identity.clone());
        Ok(identity)
    }
}
