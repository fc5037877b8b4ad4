use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declarative description of everything one provisioning run should ensure:
/// the blueprint registration, the downstream producer registrations with
/// their exposed permissions, the delegated grants the blueprint requires,
/// the permissions spawned identities inherit, and the configuration files
/// the `update-files` renderer may touch.
///
/// The manifest replaces the hardcoded service lists of earlier script
/// generations; the built-in [`ProvisionManifest::sample`] reproduces the
/// orders/shipping/email demo environment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionManifest {
    pub blueprint: BlueprintSpec,
    pub producers: Vec<ProducerSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_files: Vec<ConfigFileTarget>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlueprintSpec {
    /// Appended to the instance prefix to form the display name.
    pub name: String,
    #[serde(default = "default_credential_name")]
    pub credential_display_name: String,
}

fn default_credential_name() -> String {
    "provisioning secret".into()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProducerSpec {
    /// Appended to the instance prefix to form the display name; also the
    /// key under which the producer appears in rendered output.
    pub name: String,
    /// Scope values the blueprint declares on its requirements list and for
    /// which tenant-wide consent is granted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegated_grants: Vec<String>,
    /// Scope values identities spawned from the blueprint inherit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inheritable: Vec<String>,
    /// App-role values the blueprint declares on its requirements list for
    /// app-only access. No consent record is created for these; app-role
    /// assignment is a separate directory operation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub role_grants: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<ScopeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_roles: Vec<RoleSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeSpec {
    pub value: String,
    pub display_name: String,
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleSpec {
    pub value: String,
    pub display_name: String,
    pub description: String,
}

/// A JSON configuration file touched by the `update-files` renderer.
/// `producer: None` marks the orchestrator file, which additionally receives
/// the blueprint credential, per-service scope lists, and agent-identity ids.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigFileTarget {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse JSON manifest at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse TOML manifest at {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid manifest: {0}")]
    Invalid(String),
}

impl ProvisionManifest {
    /// Loads a manifest from JSON or TOML, selected by file extension the
    /// same way the CLI loads its config overrides.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let display = path.display().to_string();
        let contents = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: display.clone(),
            source,
        })?;
        let manifest: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&contents).map_err(|source| ManifestError::Toml {
                path: display,
                source,
            })?,
            _ => serde_json::from_str(&contents).map_err(|source| ManifestError::Json {
                path: display,
                source,
            })?,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Every grant and inheritance entry must reference a scope the producer
    /// actually declares; catching that here keeps the failure out of the
    /// middle of a half-finished directory run.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.blueprint.name.trim().is_empty() {
            return Err(ManifestError::Invalid("blueprint name must not be empty".into()));
        }
        let mut seen = BTreeSet::new();
        for producer in &self.producers {
            if producer.name.trim().is_empty() {
                return Err(ManifestError::Invalid("producer name must not be empty".into()));
            }
            if !seen.insert(producer.name.as_str()) {
                return Err(ManifestError::Invalid(format!(
                    "duplicate producer name `{}`",
                    producer.name
                )));
            }
            let declared: BTreeSet<&str> =
                producer.scopes.iter().map(|s| s.value.as_str()).collect();
            for value in producer.delegated_grants.iter().chain(&producer.inheritable) {
                if !declared.contains(value.as_str()) {
                    return Err(ManifestError::Invalid(format!(
                        "producer `{}` references undeclared scope `{value}`",
                        producer.name
                    )));
                }
            }
            let declared_roles: BTreeSet<&str> =
                producer.app_roles.iter().map(|r| r.value.as_str()).collect();
            for value in &producer.role_grants {
                if !declared_roles.contains(value.as_str()) {
                    return Err(ManifestError::Invalid(format!(
                        "producer `{}` references undeclared app role `{value}`",
                        producer.name
                    )));
                }
            }
        }
        for target in &self.config_files {
            if let Some(name) = &target.producer {
                if !self.producers.iter().any(|p| &p.name == name) {
                    return Err(ManifestError::Invalid(format!(
                        "config file `{}` references unknown producer `{name}`",
                        target.path
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn producer(&self, name: &str) -> Option<&ProducerSpec> {
        self.producers.iter().find(|p| p.name == name)
    }

    /// The built-in demo environment: an orchestrator blueprint chaining
    /// three downstream APIs.
    pub fn sample() -> Self {
        Self {
            blueprint: BlueprintSpec {
                name: "Orchestrator".into(),
                credential_display_name: default_credential_name(),
            },
            producers: vec![
                ProducerSpec {
                    name: "OrdersApi".into(),
                    scopes: vec![
                        ScopeSpec {
                            value: "Orders.Read".into(),
                            display_name: "Read orders".into(),
                            description: "Allows the agent to read customer orders".into(),
                        },
                        ScopeSpec {
                            value: "Orders.Manage".into(),
                            display_name: "Manage orders".into(),
                            description: "Allows the agent to update customer orders".into(),
                        },
                    ],
                    app_roles: vec![RoleSpec {
                        value: "Orders.Read.All".into(),
                        display_name: "Read all orders".into(),
                        description: "Allows app-only access to every order".into(),
                    }],
                    delegated_grants: vec!["Orders.Read".into(), "Orders.Manage".into()],
                    inheritable: vec!["Orders.Read".into()],
                    role_grants: Vec::new(),
                },
                ProducerSpec {
                    name: "ShippingApi".into(),
                    scopes: vec![ScopeSpec {
                        value: "Shipping.Read".into(),
                        display_name: "Read shipments".into(),
                        description: "Allows the agent to read shipment status".into(),
                    }],
                    app_roles: vec![RoleSpec {
                        value: "Shipping.Read.All".into(),
                        display_name: "Read all shipments".into(),
                        description: "Allows app-only access to every shipment".into(),
                    }],
                    delegated_grants: vec!["Shipping.Read".into()],
                    inheritable: vec!["Shipping.Read".into()],
                    role_grants: Vec::new(),
                },
                ProducerSpec {
                    name: "EmailApi".into(),
                    scopes: vec![ScopeSpec {
                        value: "Email.Send".into(),
                        display_name: "Send email".into(),
                        description: "Allows the agent to send customer notifications".into(),
                    }],
                    app_roles: Vec::new(),
                    delegated_grants: vec!["Email.Send".into()],
                    inheritable: vec!["Email.Send".into()],
                    role_grants: Vec::new(),
                },
            ],
            config_files: vec![
                ConfigFileTarget {
                    path: "orchestrator/appsettings.json".into(),
                    producer: None,
                },
                ConfigFileTarget {
                    path: "orders/appsettings.json".into(),
                    producer: Some("OrdersApi".into()),
                },
                ConfigFileTarget {
                    path: "shipping/appsettings.json".into(),
                    producer: Some("ShippingApi".into()),
                },
                ConfigFileTarget {
                    path: "email/appsettings.json".into(),
                    producer: Some("EmailApi".into()),
                },
            ],
        }
    }
}
