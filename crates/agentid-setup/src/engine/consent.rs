use tracing::{info, warn};

use agentid_core::{AccessType, AppRegistration, ServicePrincipal};

use crate::directory::{DirectoryClient, DirectoryError};

/// Outcome of the consent pass. Failures never abort the run: partial
/// consent is common when the operator lacks directory privilege for some
/// resources, and can be completed manually.
#[derive(Clone, Debug, Default)]
pub struct ConsentResult {
    /// `"{producer}/{scope}"` pairs newly consented this run.
    pub granted: Vec<String>,
    /// Pairs that already had a consent record.
    pub skipped: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn ensure_service_principal(
    dir: &dyn DirectoryClient,
    app_id: &str,
) -> Result<ServicePrincipal, DirectoryError> {
    if let Some(existing) = dir.find_service_principal(app_id)? {
        return Ok(existing);
    }
    dir.create_service_principal(app_id)
}

/// Walks the consumer's declared-requirements list and ensures a tenant-wide
/// consent record exists for every delegated scope, per producer pair.
/// A producer's consent record is a single edge carrying the space-separated
/// scope list; missing values are merged in, never overwritten away.
pub fn grant_tenant_consent(
    dir: &dyn DirectoryClient,
    consumer: &AppRegistration,
    producers: &[AppRegistration],
) -> ConsentResult {
    let mut result = ConsentResult::default();

    let consumer_sp = match ensure_service_principal(dir, &consumer.client_id) {
        Ok(sp) => sp,
        Err(err) => {
            result.warnings.push(format!(
                "could not ensure service principal for `{}`: {err}",
                consumer.display_name
            ));
            return result;
        }
    };

    for entry in &consumer.required_resource_access {
        let Some(producer) = producers
            .iter()
            .find(|p| p.client_id == entry.resource_app_id)
        else {
            // Requirements on resources outside this run (e.g. Graph itself)
            // are not ours to consent.
            continue;
        };
        let scope_values: Vec<String> = entry
            .resource_access
            .iter()
            .filter(|access| access.access_type == AccessType::Scope)
            .filter_map(|access| {
                producer
                    .oauth2_permission_scopes
                    .iter()
                    .find(|scope| scope.id == access.id)
                    .map(|scope| scope.value.clone())
            })
            .collect();
        if scope_values.is_empty() {
            continue;
        }

        if let Err(err) = consent_for_producer(
            dir,
            &consumer_sp,
            producer,
            &scope_values,
            &mut result,
        ) {
            warn!(
                producer = %producer.display_name,
                error = %err,
                "consent grant failed; continuing"
            );
            result.warnings.push(format!(
                "consent for `{}` failed: {err}",
                producer.display_name
            ));
        }
    }

    result
}

fn consent_for_producer(
    dir: &dyn DirectoryClient,
    consumer_sp: &ServicePrincipal,
    producer: &AppRegistration,
    scope_values: &[String],
    result: &mut ConsentResult,
) -> Result<(), DirectoryError> {
    let producer_sp = ensure_service_principal(dir, &producer.client_id)?;
    let existing = dir.find_permission_grant(&consumer_sp.object_id, &producer_sp.object_id)?;

    match existing {
        None => {
            let scope = scope_values.join(" ");
            dir.create_permission_grant(&consumer_sp.object_id, &producer_sp.object_id, &scope)?;
            info!(producer = %producer.display_name, %scope, "granted tenant-wide consent");
            for value in scope_values {
                result.granted.push(format!("{}/{value}", producer.display_name));
            }
        }
        Some(grant) => {
            let mut merged: Vec<String> =
                grant.scope_values().iter().map(|s| s.to_string()).collect();
            let mut missing = Vec::new();
            for value in scope_values {
                if grant.covers(value) {
                    result.skipped.push(format!("{}/{value}", producer.display_name));
                } else {
                    merged.push(value.clone());
                    missing.push(value.clone());
                }
            }
            if !missing.is_empty() {
                dir.update_permission_grant_scope(&grant.id, &merged.join(" "))?;
                info!(
                    producer = %producer.display_name,
                    added = missing.len(),
                    "extended existing consent record"
                );
                for value in missing {
                    result.granted.push(format!("{}/{value}", producer.display_name));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::mock::MockDirectory;
    use crate::directory::Backoff;
    use crate::engine::{grants, resolver, scopes};
    use agentid_core::ScopeSpec;
    use std::time::Duration;

    fn fast() -> Backoff {
        Backoff::new(4, Duration::from_millis(1), Duration::from_millis(2))
    }

    fn scope(value: &str) -> ScopeSpec {
        ScopeSpec {
            value: value.into(),
            display_name: value.into(),
            description: value.into(),
        }
    }

    fn provision_pair(dir: &MockDirectory) -> (agentid_core::AppRegistration, agentid_core::AppRegistration) {
        let consumer = resolver::resolve_or_create(dir, "Consumer", &fast()).unwrap().app;
        let producer = resolver::resolve_or_create(dir, "Producer", &fast()).unwrap().app;
        let (producer, _) =
            scopes::ensure_scopes(dir, &producer, &[scope("Orders.Read")], &fast()).unwrap();
        let (consumer, _) = grants::grant(
            dir,
            &consumer,
            &producer,
            &["Orders.Read".to_string()],
            &[],
        )
        .unwrap();
        (consumer, producer)
    }

    #[test]
    fn grants_then_skips_on_rerun() {
        let dir = MockDirectory::new();
        let (consumer, producer) = provision_pair(&dir);

        let first = grant_tenant_consent(&dir, &consumer, std::slice::from_ref(&producer));
        assert_eq!(first.granted, vec!["Producer/Orders.Read".to_string()]);
        assert!(first.warnings.is_empty());

        let second = grant_tenant_consent(&dir, &consumer, std::slice::from_ref(&producer));
        assert!(second.granted.is_empty());
        assert_eq!(second.skipped, vec!["Producer/Orders.Read".to_string()]);
        assert_eq!(dir.grants().len(), 1);
    }

    #[test]
    fn denied_consent_becomes_warning_not_error() {
        let dir = MockDirectory::new();
        let (consumer, producer) = provision_pair(&dir);
        let dir = dir.with_consent_denied_for(producer.client_id.clone());

        let result = grant_tenant_consent(&dir, &consumer, std::slice::from_ref(&producer));
        assert!(result.granted.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("Producer"));
    }
}
