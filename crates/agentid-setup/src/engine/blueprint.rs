use std::thread;

use tracing::{info, warn};

use agentid_core::{AgentIdentity, AppRegistration, CredentialSecret};

use crate::directory::{Backoff, DirectoryClient, DirectoryError};
use crate::engine::consent::ensure_service_principal;

/// Issues a fresh client secret on the blueprint registration. Always adds,
/// never rotates: secrets issued by earlier runs keep working until their
/// own expiry, so a re-run cannot break a deployed orchestrator.
pub fn attach_credential(
    dir: &dyn DirectoryClient,
    blueprint: &AppRegistration,
    display_name: &str,
) -> Result<CredentialSecret, DirectoryError> {
    let secret = dir.add_password(&blueprint.object_id, display_name)?;
    info!(
        app = %blueprint.display_name,
        key_id = %secret.key_id,
        expires_at = %secret.expires_at,
        "issued client secret"
    );
    Ok(secret)
}

/// What the inheritance pass managed to record.
#[derive(Clone, Debug, Default)]
pub struct InheritanceResult {
    /// Producer display names whose inheritable set was written.
    pub propagated: Vec<String>,
    pub warnings: Vec<String>,
}

/// Declares, per producer, which scope values identities spawned from the
/// blueprint inherit. The endpoint is preview-only; any failure here leaves
/// the rest of the run intact.
pub fn propagate_inheritable(
    dir: &dyn DirectoryClient,
    blueprint: &AppRegistration,
    entries: &[(AppRegistration, Vec<String>)],
) -> InheritanceResult {
    let mut result = InheritanceResult::default();
    for (producer, scope_values) in entries {
        if scope_values.is_empty() {
            continue;
        }
        // The directory resolves the inheritable set against the producer's
        // service principal, which must exist before the write.
        if let Err(err) = ensure_service_principal(dir, &producer.client_id) {
            result.warnings.push(format!(
                "inheritance for `{}` skipped; service principal unavailable: {err}",
                producer.display_name
            ));
            continue;
        }
        match dir.set_inheritable_permissions(
            &blueprint.object_id,
            &producer.client_id,
            scope_values,
        ) {
            Ok(()) => {
                info!(
                    producer = %producer.display_name,
                    scopes = scope_values.len(),
                    "recorded inheritable permissions"
                );
                result.propagated.push(producer.display_name.clone());
            }
            Err(err @ DirectoryError::CapabilityUnavailable(_)) => {
                result.warnings.push(format!("{err}"));
                // One missing endpoint means all remaining writes would fail
                // the same way.
                break;
            }
            Err(err) => {
                warn!(
                    producer = %producer.display_name,
                    error = %err,
                    "inheritable-permission write failed; continuing"
                );
                result.warnings.push(format!(
                    "inheritance for `{}` failed: {err}",
                    producer.display_name
                ));
            }
        }
    }
    result
}

#[derive(Clone, Debug, Default)]
pub struct SpawnResult {
    pub identities: Vec<AgentIdentity>,
    pub warnings: Vec<String>,
}

/// Spawns the autonomous agent identity from the blueprint and, when a
/// service-account UPN is supplied, the user-bound identity under it.
///
/// A tenant without the preview endpoint degrades to a warning. The
/// user-bound creation races the directory's replication of the autonomous
/// identity, so not-found responses are retried on a fixed schedule;
/// exhausting it is fatal because the caller asked for that identity by name.
pub fn spawn_agent_identities(
    dir: &dyn DirectoryClient,
    blueprint: &AppRegistration,
    display_name: &str,
    service_account_upn: Option<&str>,
    retry: &Backoff,
) -> Result<SpawnResult, DirectoryError> {
    let mut result = SpawnResult::default();

    let agent = match dir.create_agent_identity(&blueprint.client_id, display_name) {
        Ok(agent) => agent,
        Err(err @ DirectoryError::CapabilityUnavailable(_)) => {
            result.warnings.push(format!("{err}"));
            return Ok(result);
        }
        Err(err) => return Err(err),
    };
    info!(
        display_name,
        object_id = %agent.object_id,
        "agent identity ready"
    );
    let agent_object_id = agent.object_id.clone();
    result.identities.push(agent);

    if let Some(upn) = service_account_upn {
        let user = create_agent_user_with_retry(dir, &agent_object_id, upn, retry)?;
        info!(upn, object_id = %user.object_id, "agent user identity ready");
        result.identities.push(user);
    }

    Ok(result)
}

fn create_agent_user_with_retry(
    dir: &dyn DirectoryClient,
    agent_object_id: &str,
    upn: &str,
    retry: &Backoff,
) -> Result<AgentIdentity, DirectoryError> {
    for attempt in 0..retry.attempts {
        match dir.create_agent_user_identity(agent_object_id, upn) {
            Ok(identity) => return Ok(identity),
            // Sleep only when another attempt follows; the last failure is
            // returned as-is.
            Err(err)
                if (err.is_not_found() || err.is_throttle())
                    && attempt + 1 < retry.attempts =>
            {
                let delay = retry.delay(attempt);
                warn!(
                    upn,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "agent user creation not ready; retrying"
                );
                thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
    Err(DirectoryError::NotReplicated {
        kind: "agent user identity",
        id: upn.to_string(),
        attempts: retry.attempts,
    })
}
