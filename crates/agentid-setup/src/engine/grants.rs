use tracing::info;

use agentid_core::{AccessType, AppRegistration, RequiredResourceAccess, ResourceAccess};

use crate::directory::{DirectoryClient, DirectoryError};

/// Replaces the consumer's entry for `producer_app_id` with `access` in
/// place, leaving entries for every other producer untouched. Re-granting an
/// unchanged set therefore produces an identical list and no write.
pub fn merge_required_access(
    existing: &[RequiredResourceAccess],
    producer_app_id: &str,
    access: Vec<ResourceAccess>,
) -> Vec<RequiredResourceAccess> {
    let mut merged = existing.to_vec();
    match merged
        .iter_mut()
        .find(|entry| entry.resource_app_id == producer_app_id)
    {
        Some(entry) => entry.resource_access = access,
        None => merged.push(RequiredResourceAccess {
            resource_app_id: producer_app_id.to_string(),
            resource_access: access,
        }),
    }
    merged
}

/// Records the consumer's requirement for the named scopes and roles of one
/// producer. Names are resolved to the producer's generated identifiers;
/// an unresolvable name is fatal because it means the producer's declared
/// set diverged from the manifest mid-run.
///
/// The returned flag is true only when the requirements list actually
/// changed and a write was issued; re-running with an unchanged manifest
/// reports no update.
pub fn grant(
    dir: &dyn DirectoryClient,
    consumer: &AppRegistration,
    producer: &AppRegistration,
    scope_names: &[String],
    role_names: &[String],
) -> Result<(AppRegistration, bool), DirectoryError> {
    let mut access = Vec::with_capacity(scope_names.len() + role_names.len());
    for name in scope_names {
        let scope = producer.scope_by_value(name).ok_or_else(|| {
            DirectoryError::Malformed(format!(
                "producer `{}` does not declare scope `{name}`",
                producer.display_name
            ))
        })?;
        access.push(ResourceAccess {
            id: scope.id,
            access_type: AccessType::Scope,
        });
    }
    for name in role_names {
        let role = producer.role_by_value(name).ok_or_else(|| {
            DirectoryError::Malformed(format!(
                "producer `{}` does not declare app role `{name}`",
                producer.display_name
            ))
        })?;
        access.push(ResourceAccess {
            id: role.id,
            access_type: AccessType::Role,
        });
    }

    let merged = merge_required_access(
        &consumer.required_resource_access,
        &producer.client_id,
        access,
    );
    if merged == consumer.required_resource_access {
        return Ok((consumer.clone(), false));
    }
    dir.set_required_resource_access(&consumer.object_id, &merged)?;
    info!(
        consumer = %consumer.display_name,
        producer = %producer.display_name,
        scopes = scope_names.len(),
        roles = role_names.len(),
        "recorded permission requirements"
    );
    let mut updated = consumer.clone();
    updated.required_resource_access = merged;
    Ok((updated, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::mock::MockDirectory;
    use crate::directory::Backoff;
    use crate::engine::scopes;
    use agentid_core::{RoleSpec, ScopeSpec};
    use std::time::Duration;
    use uuid::Uuid;

    fn fast() -> Backoff {
        Backoff::new(4, Duration::from_millis(1), Duration::from_millis(2))
    }

    fn producer_with_permissions(dir: &MockDirectory) -> AppRegistration {
        let app = dir.create_application("Producer").unwrap();
        let scope = ScopeSpec {
            value: "Orders.Read".into(),
            display_name: "Read orders".into(),
            description: "Read orders".into(),
        };
        let (app, _) = scopes::ensure_scopes(dir, &app, &[scope], &fast()).unwrap();
        let role = RoleSpec {
            value: "Orders.Read.All".into(),
            display_name: "Read all orders".into(),
            description: "Read all orders".into(),
        };
        let (app, _) = scopes::ensure_app_roles(dir, &app, &[role]).unwrap();
        app
    }

    fn entry(producer: &str, ids: &[Uuid]) -> RequiredResourceAccess {
        RequiredResourceAccess {
            resource_app_id: producer.into(),
            resource_access: ids
                .iter()
                .map(|id| ResourceAccess {
                    id: *id,
                    access_type: AccessType::Scope,
                })
                .collect(),
        }
    }

    #[test]
    fn merge_preserves_other_producers() {
        let a_id = Uuid::new_v4();
        let b_id = Uuid::new_v4();
        let existing = vec![entry("producer-a", &[a_id])];
        let merged = merge_required_access(
            &existing,
            "producer-b",
            vec![ResourceAccess {
                id: b_id,
                access_type: AccessType::Scope,
            }],
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], existing[0]);
    }

    #[test]
    fn merge_replaces_same_producer() {
        let old_id = Uuid::new_v4();
        let new_id = Uuid::new_v4();
        let existing = vec![entry("producer-a", &[old_id])];
        let merged = merge_required_access(
            &existing,
            "producer-a",
            vec![ResourceAccess {
                id: new_id,
                access_type: AccessType::Scope,
            }],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].resource_access[0].id, new_id);
    }

    #[test]
    fn regranting_an_identical_set_reports_no_write() {
        let dir = MockDirectory::new();
        let consumer = dir.create_application("Consumer").unwrap();
        let producer = producer_with_permissions(&dir);

        let (consumer, wrote) =
            grant(&dir, &consumer, &producer, &["Orders.Read".to_string()], &[]).unwrap();
        assert!(wrote);
        let (_, wrote_again) =
            grant(&dir, &consumer, &producer, &["Orders.Read".to_string()], &[]).unwrap();
        assert!(!wrote_again);
    }

    #[test]
    fn role_names_resolve_to_role_entries() {
        let dir = MockDirectory::new();
        let consumer = dir.create_application("Consumer").unwrap();
        let producer = producer_with_permissions(&dir);

        let (consumer, wrote) = grant(
            &dir,
            &consumer,
            &producer,
            &[],
            &["Orders.Read.All".to_string()],
        )
        .unwrap();
        assert!(wrote);
        let entry = &consumer.required_resource_access[0];
        assert_eq!(entry.resource_app_id, producer.client_id);
        assert_eq!(entry.resource_access[0].access_type, AccessType::Role);
        assert_eq!(
            entry.resource_access[0].id,
            producer.role_by_value("Orders.Read.All").unwrap().id
        );
    }

    #[test]
    fn unknown_role_name_is_fatal() {
        let dir = MockDirectory::new();
        let consumer = dir.create_application("Consumer").unwrap();
        let producer = producer_with_permissions(&dir);

        let err = grant(
            &dir,
            &consumer,
            &producer,
            &[],
            &["Orders.Delete.All".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, DirectoryError::Malformed(_)));
        assert!(err.to_string().contains("Orders.Delete.All"));
    }
}
