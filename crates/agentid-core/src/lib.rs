pub mod manifest;
pub mod report;
pub mod scope_plan;
pub mod types;

pub use manifest::{
    BlueprintSpec, ConfigFileTarget, ManifestError, ProducerSpec, ProvisionManifest, RoleSpec,
    ScopeSpec,
};
pub use report::{ProvisionOutcome, ProvisionedApp, SecretOutput};
pub use scope_plan::{plan_scope_update, ScopePhase, ScopePhaseKind, ScopeUpdatePlan};
pub use types::{
    AccessType, AgentIdentity, AgentIdentityKind, AppRegistration, AppRole, CredentialSecret,
    PermissionGrant, PermissionScope, RequiredResourceAccess, ResourceAccess, ServicePrincipal,
};
