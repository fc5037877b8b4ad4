use uuid::Uuid;

use crate::manifest::ScopeSpec;
use crate::types::PermissionScope;

/// Ordered writes that bring an application's delegated scope list to the
/// desired state.
///
/// The directory rejects a single write that adds entries to a scope list
/// containing enabled scopes, so additions have to walk the list through
/// Enabled -> Disabling -> Disabled -> Re-enabling -> Enabled. Computing the
/// phases as a pure plan keeps that transition testable without a live
/// directory; the configurator just replays the phases in order, waiting for
/// each write to become visible before issuing the next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeUpdatePlan {
    pub phases: Vec<ScopePhase>,
    /// Values of the scopes the final phase introduces.
    pub added: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopePhase {
    pub kind: ScopePhaseKind,
    pub scopes: Vec<PermissionScope>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopePhaseKind {
    /// Push the current list with every entry disabled.
    DisableExisting,
    /// Push the final list with every entry enabled.
    WriteFinal,
}

impl ScopeUpdatePlan {
    pub fn is_noop(&self) -> bool {
        self.phases.is_empty()
    }
}

/// Computes the writes needed to ensure `desired` on top of `existing`.
///
/// Existing entries whose value matches a desired scope are kept exactly as
/// they are; their generated identifiers must survive because issued grants
/// reference them. Entries the desired set does not mention are preserved
/// too: this step only ever adds. `new_id` supplies identifiers for
/// synthesized entries so tests can make them deterministic.
pub fn plan_scope_update(
    existing: &[PermissionScope],
    desired: &[ScopeSpec],
    mut new_id: impl FnMut() -> Uuid,
) -> ScopeUpdatePlan {
    let mut final_scopes: Vec<PermissionScope> = existing.to_vec();
    let mut added = Vec::new();

    for spec in desired {
        match final_scopes.iter_mut().find(|s| s.value == spec.value) {
            Some(scope) => {
                scope.is_enabled = true;
            }
            None => {
                final_scopes.push(PermissionScope {
                    id: new_id(),
                    value: spec.value.clone(),
                    consent_type: "Admin".into(),
                    is_enabled: true,
                    admin_consent_display_name: spec.display_name.clone(),
                    admin_consent_description: spec.description.clone(),
                });
                added.push(spec.value.clone());
            }
        }
    }

    if added.is_empty() && final_scopes == existing {
        return ScopeUpdatePlan {
            phases: Vec::new(),
            added,
        };
    }

    let mut phases = Vec::new();
    let any_enabled_existing = existing.iter().any(|s| s.is_enabled);
    if !added.is_empty() && any_enabled_existing {
        let disabled: Vec<PermissionScope> = existing
            .iter()
            .cloned()
            .map(|mut scope| {
                scope.is_enabled = false;
                scope
            })
            .collect();
        phases.push(ScopePhase {
            kind: ScopePhaseKind::DisableExisting,
            scopes: disabled,
        });
    }
    phases.push(ScopePhase {
        kind: ScopePhaseKind::WriteFinal,
        scopes: final_scopes,
    });

    ScopeUpdatePlan { phases, added }
}
