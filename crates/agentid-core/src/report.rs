use serde::Serialize;
use time::OffsetDateTime;

use crate::types::AgentIdentity;

/// Everything one provisioning run produced, assembled step by step by the
/// orchestrator and handed to the renderer at the end. Steps return their
/// own result values; nothing writes into this behind the orchestrator's
/// back.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProvisionOutcome {
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blueprint: Option<ProvisionedApp>,
    pub producers: Vec<ProvisionedApp>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub agent_identities: Vec<AgentIdentity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sponsor_user_id: Option<String>,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub skipped: Vec<String>,
    pub warnings: Vec<String>,
}

impl ProvisionOutcome {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Self::default()
        }
    }

    pub fn note_created(&mut self, what: impl Into<String>) {
        self.created.push(what.into());
    }

    pub fn note_updated(&mut self, what: impl Into<String>) {
        self.updated.push(what.into());
    }

    pub fn note_skipped(&mut self, what: impl Into<String>) {
        self.skipped.push(what.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn producer(&self, name: &str) -> Option<&ProvisionedApp> {
        self.producers.iter().find(|p| p.name == name)
    }
}

/// Identifiers of one ensured application, in the shape the renderers need.
#[derive(Clone, Debug, Serialize)]
pub struct ProvisionedApp {
    /// Manifest name, without the instance prefix.
    pub name: String,
    pub display_name: String,
    pub object_id: String,
    pub client_id: String,
    /// Fully qualified scope values (`api://{client_id}/{value}`).
    pub scope_uris: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretOutput>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SecretOutput {
    pub value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}
