pub mod graph;
pub mod mock;

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use agentid_core::{
    AgentIdentity, AppRegistration, AppRole, CredentialSecret, PermissionGrant, PermissionScope,
    RequiredResourceAccess, ServicePrincipal,
};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory API error {status}: {body}")]
    Http {
        status: u16,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("directory transport failure: {0}")]
    Transport(String),
    #[error("token acquisition failed: {0}")]
    Token(String),
    #[error("{kind} `{id}` not visible after {attempts} read attempts")]
    NotReplicated {
        kind: &'static str,
        id: String,
        attempts: u32,
    },
    #[error("directory capability unavailable: {0}")]
    CapabilityUnavailable(String),
    #[error("unexpected directory response: {0}")]
    Malformed(String),
}

impl DirectoryError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for responses worth retrying with backoff.
    pub fn is_throttle(&self) -> bool {
        matches!(self, Self::Http { status, .. } if *status == 429 || (500..600).contains(status))
            || matches!(self, Self::Transport(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Http { status: 404, .. })
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Http { status, .. } if *status == 401 || *status == 403)
    }
}

/// Seam between the engine and the directory service. The live
/// implementation talks Graph over HTTPS; the mock backs the test suite.
/// Calls are blocking and issued strictly sequentially by the engine.
pub trait DirectoryClient: Send + Sync {
    fn tenant_id(&self) -> Result<String, DirectoryError>;

    /// Object id of the authenticated caller, when the session has a user
    /// context. App-only sessions return `None`.
    fn current_user_id(&self) -> Result<Option<String>, DirectoryError>;

    fn find_applications_by_name(
        &self,
        display_name: &str,
    ) -> Result<Vec<AppRegistration>, DirectoryError>;
    fn get_application(&self, object_id: &str) -> Result<Option<AppRegistration>, DirectoryError>;
    fn create_application(&self, display_name: &str) -> Result<AppRegistration, DirectoryError>;
    fn set_identifier_uris(&self, object_id: &str, uris: &[String]) -> Result<(), DirectoryError>;
    fn set_permission_scopes(
        &self,
        object_id: &str,
        scopes: &[PermissionScope],
    ) -> Result<(), DirectoryError>;
    fn set_app_roles(&self, object_id: &str, roles: &[AppRole]) -> Result<(), DirectoryError>;
    fn set_required_resource_access(
        &self,
        object_id: &str,
        entries: &[RequiredResourceAccess],
    ) -> Result<(), DirectoryError>;
    /// Adds a credential. Non-destructive: previously issued secrets stay
    /// valid until their own expiry.
    fn add_password(
        &self,
        object_id: &str,
        display_name: &str,
    ) -> Result<CredentialSecret, DirectoryError>;

    fn find_service_principal(
        &self,
        app_id: &str,
    ) -> Result<Option<ServicePrincipal>, DirectoryError>;
    fn create_service_principal(&self, app_id: &str) -> Result<ServicePrincipal, DirectoryError>;

    fn find_permission_grant(
        &self,
        client_sp: &str,
        resource_sp: &str,
    ) -> Result<Option<PermissionGrant>, DirectoryError>;
    fn create_permission_grant(
        &self,
        client_sp: &str,
        resource_sp: &str,
        scope: &str,
    ) -> Result<PermissionGrant, DirectoryError>;
    fn update_permission_grant_scope(
        &self,
        grant_id: &str,
        scope: &str,
    ) -> Result<(), DirectoryError>;

    /// Declares which of a producer's scope values identities spawned from
    /// the blueprint inherit. One call per producer; calls for different
    /// producers never overwrite each other.
    fn set_inheritable_permissions(
        &self,
        blueprint_object_id: &str,
        resource_app_id: &str,
        scope_values: &[String],
    ) -> Result<(), DirectoryError>;

    fn create_agent_identity(
        &self,
        blueprint_app_id: &str,
        display_name: &str,
    ) -> Result<AgentIdentity, DirectoryError>;
    fn create_agent_user_identity(
        &self,
        agent_object_id: &str,
        user_principal_name: &str,
    ) -> Result<AgentIdentity, DirectoryError>;
}

impl std::fmt::Debug for dyn DirectoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryClient").finish()
    }
}

/// Bounded exponential backoff schedule. Used both for visibility polls
/// after a mutating call (replacing the source script's fixed sleeps) and
/// for the fixed-delay agent-identity creation retries (`base == cap`).
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            attempts,
            base,
            cap,
        }
    }

    /// Schedule for waiting out the directory's eventual-consistency window.
    pub fn visibility() -> Self {
        Self::new(6, Duration::from_millis(500), Duration::from_secs(8))
    }

    /// Fixed-delay schedule for the replication-lag-prone agent-identity
    /// creation path.
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self::new(attempts, delay, delay)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Polls an application until `ready` accepts it, backing off between reads.
/// Exhausting the schedule is a fatal `NotReplicated` error; re-running the
/// workflow is the recovery mechanism.
pub fn wait_for_application(
    dir: &dyn DirectoryClient,
    object_id: &str,
    backoff: &Backoff,
    what: &'static str,
    ready: impl Fn(&AppRegistration) -> bool,
) -> Result<AppRegistration, DirectoryError> {
    for attempt in 0..backoff.attempts {
        if let Some(app) = dir.get_application(object_id)? {
            if ready(&app) {
                return Ok(app);
            }
        }
        let delay = backoff.delay(attempt);
        debug!(
            object_id,
            what,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "application not yet visible; backing off"
        );
        thread::sleep(delay);
    }
    Err(DirectoryError::NotReplicated {
        kind: what,
        id: object_id.to_string(),
        attempts: backoff.attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff::new(5, Duration::from_millis(100), Duration::from_millis(300));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(300));
        assert_eq!(backoff.delay(10), Duration::from_millis(300));
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let backoff = Backoff::fixed(3, Duration::from_millis(50));
        assert_eq!(backoff.delay(0), Duration::from_millis(50));
        assert_eq!(backoff.delay(2), Duration::from_millis(50));
    }

    #[test]
    fn throttle_classification() {
        let throttled = DirectoryError::Http {
            status: 429,
            body: "busy".into(),
            retry_after: Some(1),
        };
        assert!(throttled.is_throttle());
        let denied = DirectoryError::Http {
            status: 403,
            body: "no".into(),
            retry_after: None,
        };
        assert!(!denied.is_throttle());
        assert!(denied.is_permission_denied());
    }
}
