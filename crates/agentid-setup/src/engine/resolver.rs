use tracing::{info, warn};

use agentid_core::AppRegistration;

use crate::directory::{wait_for_application, Backoff, DirectoryClient, DirectoryError};

/// Result of resolving one display name to a registration.
#[derive(Clone, Debug)]
pub struct Resolved {
    pub app: AppRegistration,
    pub created: bool,
    /// Extra registrations sharing the display name. More than zero means a
    /// prior run was not idempotent; the first match is used unchanged and
    /// no reconciliation is attempted.
    pub duplicate_matches: usize,
}

/// The idempotence primitive: exact display-name lookup, create on miss,
/// then poll until the new registration is visible to dependent reads.
///
/// The read-then-create step has no concurrency control; two operators
/// racing on the same prefix can both create. Single-operator use is
/// assumed (see DESIGN.md).
pub fn resolve_or_create(
    dir: &dyn DirectoryClient,
    display_name: &str,
    visibility: &Backoff,
) -> Result<Resolved, DirectoryError> {
    let matches = dir.find_applications_by_name(display_name)?;
    if let Some(first) = matches.first() {
        let duplicate_matches = matches.len() - 1;
        if duplicate_matches > 0 {
            warn!(
                display_name,
                matches = matches.len(),
                "multiple registrations share this display name; using the first"
            );
        }
        return Ok(Resolved {
            app: first.clone(),
            created: false,
            duplicate_matches,
        });
    }

    let created = dir.create_application(display_name)?;
    info!(
        display_name,
        object_id = %created.object_id,
        "created application registration"
    );
    let app = wait_for_application(dir, &created.object_id, visibility, "application", |_| true)?;
    Ok(Resolved {
        app,
        created: true,
        duplicate_matches: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::mock::MockDirectory;
    use std::time::Duration;

    fn fast() -> Backoff {
        Backoff::new(4, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn second_resolve_returns_same_object() {
        let dir = MockDirectory::new();
        let first = resolve_or_create(&dir, "Sample-App", &fast()).unwrap();
        assert!(first.created);
        let second = resolve_or_create(&dir, "Sample-App", &fast()).unwrap();
        assert!(!second.created);
        assert_eq!(second.app.object_id, first.app.object_id);
        assert_eq!(dir.application_count(), 1);
    }

    #[test]
    fn waits_out_replication_lag() {
        let dir = MockDirectory::new().with_replication_lag(2);
        let resolved = resolve_or_create(&dir, "Lagged-App", &fast()).unwrap();
        assert!(resolved.created);
        assert_eq!(dir.applications_named("Lagged-App").len(), 1);
    }

    #[test]
    fn exhausted_visibility_poll_is_fatal() {
        let dir = MockDirectory::new().with_replication_lag(10);
        let err = resolve_or_create(&dir, "Never-Visible", &fast()).unwrap_err();
        assert!(matches!(err, DirectoryError::NotReplicated { .. }));
    }

    #[test]
    fn duplicate_display_names_are_noted_not_repaired() {
        let dir = MockDirectory::new();
        dir.create_application("Dup-App").unwrap();
        dir.create_application("Dup-App").unwrap();
        let resolved = resolve_or_create(&dir, "Dup-App", &fast()).unwrap();
        assert!(!resolved.created);
        assert_eq!(resolved.duplicate_matches, 1);
        assert_eq!(dir.application_count(), 2);
    }
}
