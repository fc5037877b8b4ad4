use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A directory application registration as observed by the workflow.
///
/// The display name is the idempotence key: re-running the workflow with the
/// same instance prefix must resolve to the same `object_id`, never create a
/// second registration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppRegistration {
    /// Directory-assigned object identifier, immutable once created.
    pub object_id: String,
    /// Public client identifier (`appId`), immutable once created.
    pub client_id: String,
    pub display_name: String,
    pub identifier_uris: Vec<String>,
    pub oauth2_permission_scopes: Vec<PermissionScope>,
    pub app_roles: Vec<AppRole>,
    pub required_resource_access: Vec<RequiredResourceAccess>,
}

impl AppRegistration {
    pub fn scope_by_value(&self, value: &str) -> Option<&PermissionScope> {
        self.oauth2_permission_scopes
            .iter()
            .find(|scope| scope.value == value)
    }

    pub fn role_by_value(&self, value: &str) -> Option<&AppRole> {
        self.app_roles.iter().find(|role| role.value == value)
    }

    /// The deterministic Application-ID-URI derived from the client id.
    pub fn default_identifier_uri(&self) -> String {
        format!("api://{}", self.client_id)
    }

    /// Fully qualified scope value, the form consumers put in token requests.
    pub fn scope_uri(&self, value: &str) -> String {
        format!("api://{}/{value}", self.client_id)
    }
}

/// A delegated permission exposed by an application for user-context callers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionScope {
    pub id: Uuid,
    pub value: String,
    /// Consent requirement, `Admin` for every scope this workflow declares.
    #[serde(rename = "type")]
    pub consent_type: String,
    pub is_enabled: bool,
    pub admin_consent_display_name: String,
    pub admin_consent_description: String,
}

/// An application permission exposed for app-only (autonomous) callers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppRole {
    pub id: Uuid,
    pub value: String,
    pub is_enabled: bool,
    pub display_name: String,
    pub description: String,
    pub allowed_member_types: Vec<String>,
}

/// One entry of a consumer's declared-requirements list: which permissions of
/// a single producer application the consumer intends to use.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequiredResourceAccess {
    /// Client id of the producer application.
    pub resource_app_id: String,
    pub resource_access: Vec<ResourceAccess>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceAccess {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub access_type: AccessType,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    Scope,
    Role,
}

/// A client secret returned by the directory; the secret text is visible only
/// in the creation response.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialSecret {
    pub key_id: Uuid,
    pub display_name: String,
    pub secret_text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Runtime representation of an application registration, subject and object
/// of tenant-wide permission grants.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServicePrincipal {
    pub object_id: String,
    pub app_id: String,
    pub display_name: String,
}

/// Tenant-wide consent edge between a consumer and a producer service
/// principal. `scope` is the space-separated list of consented scope values.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionGrant {
    pub id: String,
    pub client_id: String,
    pub resource_id: String,
    pub consent_type: String,
    pub scope: String,
}

impl PermissionGrant {
    pub fn scope_values(&self) -> Vec<&str> {
        self.scope.split_whitespace().collect()
    }

    pub fn covers(&self, value: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == value)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentIdentityKind {
    Autonomous,
    User,
}

/// An identity spawned from the blueprint registration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentIdentity {
    pub object_id: String,
    pub display_name: String,
    pub kind: AgentIdentityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_principal_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_serializes_with_wire_names() {
        let scope = PermissionScope {
            id: Uuid::nil(),
            value: "Orders.Read".into(),
            consent_type: "Admin".into(),
            is_enabled: true,
            admin_consent_display_name: "Read orders".into(),
            admin_consent_description: "Allows reading orders".into(),
        };
        let json = serde_json::to_value(&scope).unwrap();
        assert_eq!(json["isEnabled"], serde_json::json!(true));
        assert_eq!(json["type"], serde_json::json!("Admin"));
        assert_eq!(json["adminConsentDisplayName"], serde_json::json!("Read orders"));
    }

    #[test]
    fn grant_scope_membership() {
        let grant = PermissionGrant {
            id: "g1".into(),
            client_id: "sp-consumer".into(),
            resource_id: "sp-producer".into(),
            consent_type: "AllPrincipals".into(),
            scope: "Orders.Read Orders.Manage".into(),
        };
        assert!(grant.covers("Orders.Read"));
        assert!(!grant.covers("Orders"));
        assert_eq!(grant.scope_values().len(), 2);
    }
}
