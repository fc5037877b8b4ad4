use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use agentid_core::{
    AgentIdentity, AgentIdentityKind, AppRegistration, AppRole, CredentialSecret, PermissionGrant,
    PermissionScope, RequiredResourceAccess, ServicePrincipal,
};

use crate::config::GraphCredentials;
use crate::directory::{DirectoryClient, DirectoryError};

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const GRAPH_BETA: &str = "https://graph.microsoft.com/beta";
const LOGIN_BASE: &str = "https://login.microsoftonline.com";
const MAX_RETRIES: u32 = 5;

/// Live directory client. Client-credentials token acquisition with an
/// in-process cache, and `Retry-After`-aware exponential backoff on
/// throttling and transient transport failures.
pub struct GraphDirectoryClient {
    http: HttpClient,
    credentials: GraphCredentials,
    token: Mutex<Option<AccessToken>>,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl GraphDirectoryClient {
    pub fn new(credentials: GraphCredentials) -> Result<Self, DirectoryError> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|err| DirectoryError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            credentials,
            token: Mutex::new(None),
        })
    }

    fn access_token(&self) -> Result<String, DirectoryError> {
        {
            let guard = self.token.lock().expect("graph token lock poisoned");
            if let Some(token) = guard.as_ref() {
                if token.expires_at > Instant::now() + Duration::from_secs(30) {
                    return Ok(token.value.clone());
                }
            }
        }

        let token_url = format!(
            "{LOGIN_BASE}/{}/oauth2/v2.0/token",
            self.credentials.tenant_id
        );
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("scope", "https://graph.microsoft.com/.default"),
        ];
        let response = self
            .http
            .post(token_url)
            .form(&form)
            .send()
            .map_err(|err| DirectoryError::Token(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(DirectoryError::Token(format!(
                "token request failed {status}: {body}"
            )));
        }
        let payload: Value = response
            .json()
            .map_err(|err| DirectoryError::Token(err.to_string()))?;
        let access_token = payload
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| DirectoryError::Token("response missing access_token".into()))?
            .to_string();
        let expires_in = payload
            .get("expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(3600);
        *self.token.lock().expect("graph token lock poisoned") = Some(AccessToken {
            value: access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in.max(0) as u64),
        });
        Ok(access_token)
    }

    fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, DirectoryError> {
        let response = builder
            .bearer_auth(self.access_token()?)
            .header("Accept", "application/json")
            .send()
            .map_err(|err| DirectoryError::Transport(err.to_string()))?;
        if response.status().is_success() {
            response
                .json::<T>()
                .map_err(|err| DirectoryError::Malformed(err.to_string()))
        } else {
            Err(Self::http_error(response))
        }
    }

    fn send_no_content(&self, builder: RequestBuilder) -> Result<(), DirectoryError> {
        let response = builder
            .bearer_auth(self.access_token()?)
            .send()
            .map_err(|err| DirectoryError::Transport(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::http_error(response))
        }
    }

    fn http_error(response: reqwest::blocking::Response) -> DirectoryError {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let body = response.text().unwrap_or_default();
        DirectoryError::Http {
            status,
            body,
            retry_after,
        }
    }

    fn retry_throttled<T>(
        &self,
        operation: &str,
        mut call: impl FnMut() -> Result<T, DirectoryError>,
    ) -> Result<T, DirectoryError> {
        let mut attempt = 0;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_throttle() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    let delay = match &err {
                        DirectoryError::Http {
                            retry_after: Some(seconds),
                            ..
                        } => Duration::from_secs(*seconds),
                        _ => Duration::from_secs(2_u64.saturating_pow(attempt.min(5))),
                    };
                    warn!(
                        operation,
                        attempt,
                        delay_s = delay.as_secs(),
                        error = %err,
                        "directory call throttled; retrying"
                    );
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn value_to_application(value: &Value) -> Result<AppRegistration, DirectoryError> {
        let object_id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DirectoryError::Malformed("application missing id".into()))?
            .to_string();
        let client_id = value
            .get("appId")
            .and_then(Value::as_str)
            .ok_or_else(|| DirectoryError::Malformed("application missing appId".into()))?
            .to_string();
        let display_name = value
            .get("displayName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let identifier_uris = value
            .get("identifierUris")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| item.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let oauth2_permission_scopes: Vec<PermissionScope> = value
            .pointer("/api/oauth2PermissionScopes")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| DirectoryError::Malformed(format!("bad scope list: {err}")))?
            .unwrap_or_default();
        let app_roles: Vec<AppRole> = value
            .get("appRoles")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| DirectoryError::Malformed(format!("bad app role list: {err}")))?
            .unwrap_or_default();
        let required_resource_access: Vec<RequiredResourceAccess> = value
            .get("requiredResourceAccess")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| {
                DirectoryError::Malformed(format!("bad required resource access: {err}"))
            })?
            .unwrap_or_default();
        Ok(AppRegistration {
            object_id,
            client_id,
            display_name,
            identifier_uris,
            oauth2_permission_scopes,
            app_roles,
            required_resource_access,
        })
    }

    fn value_to_service_principal(value: &Value) -> Result<ServicePrincipal, DirectoryError> {
        Ok(ServicePrincipal {
            object_id: value
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| DirectoryError::Malformed("service principal missing id".into()))?
                .to_string(),
            app_id: value
                .get("appId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            display_name: value
                .get("displayName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    fn value_to_grant(value: &Value) -> Result<PermissionGrant, DirectoryError> {
        Ok(PermissionGrant {
            id: value
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| DirectoryError::Malformed("permission grant missing id".into()))?
                .to_string(),
            client_id: value
                .get("clientId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            resource_id: value
                .get("resourceId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            consent_type: value
                .get("consentType")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            scope: value
                .get("scope")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string(),
        })
    }

    fn value_to_agent_identity(
        value: &Value,
        kind: AgentIdentityKind,
    ) -> Result<AgentIdentity, DirectoryError> {
        Ok(AgentIdentity {
            object_id: value
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| DirectoryError::Malformed("agent identity missing id".into()))?
                .to_string(),
            display_name: value
                .get("displayName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            kind,
            user_principal_name: value
                .get("userPrincipalName")
                .and_then(Value::as_str)
                .map(String::from),
        })
    }

    fn escape_filter_literal(value: &str) -> String {
        value.replace('\'', "''")
    }

    /// Collection URL with an OData `$filter`, percent-encoded up front so
    /// filter values containing spaces or quotes survive the round trip.
    fn filter_url(collection: &str, filter: &str) -> Result<Url, DirectoryError> {
        let mut url = Url::parse(&format!("{GRAPH_BASE}/{collection}"))
            .map_err(|err| DirectoryError::Malformed(err.to_string()))?;
        url.query_pairs_mut().append_pair("$filter", filter);
        Ok(url)
    }
}

impl DirectoryClient for GraphDirectoryClient {
    fn tenant_id(&self) -> Result<String, DirectoryError> {
        // Forces a token round-trip, so connectivity and credential problems
        // surface here instead of mid-run.
        self.access_token()?;
        Ok(self.credentials.tenant_id.clone())
    }

    fn current_user_id(&self) -> Result<Option<String>, DirectoryError> {
        let url = format!("{GRAPH_BASE}/me");
        match self.send_json::<Value>(self.http.get(url)) {
            Ok(value) => Ok(value.get("id").and_then(Value::as_str).map(String::from)),
            // App-only sessions have no /me; the sponsor stays unset.
            Err(DirectoryError::Http { status, .. }) if (400..500).contains(&status) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn find_applications_by_name(
        &self,
        display_name: &str,
    ) -> Result<Vec<AppRegistration>, DirectoryError> {
        let escaped = Self::escape_filter_literal(display_name);
        let url = Self::filter_url("applications", &format!("displayName eq '{escaped}'"))?;
        let response: Value = self.retry_throttled("applications.find", || {
            self.send_json(self.http.get(url.clone()))
        })?;
        response
            .get("value")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().map(Self::value_to_application).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn get_application(&self, object_id: &str) -> Result<Option<AppRegistration>, DirectoryError> {
        let url = format!("{GRAPH_BASE}/applications/{object_id}");
        match self.retry_throttled("applications.get", || {
            self.send_json::<Value>(self.http.get(&url))
        }) {
            Ok(value) => Ok(Some(Self::value_to_application(&value)?)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn create_application(&self, display_name: &str) -> Result<AppRegistration, DirectoryError> {
        let payload = json!({
            "displayName": display_name,
            "signInAudience": "AzureADMyOrg",
        });
        let url = format!("{GRAPH_BASE}/applications");
        let value: Value = self.retry_throttled("applications.create", || {
            self.send_json(self.http.post(&url).json(&payload))
        })?;
        Self::value_to_application(&value)
    }

    fn set_identifier_uris(&self, object_id: &str, uris: &[String]) -> Result<(), DirectoryError> {
        let url = format!("{GRAPH_BASE}/applications/{object_id}");
        let payload = json!({ "identifierUris": uris });
        self.retry_throttled("applications.set_identifier_uris", || {
            self.send_no_content(self.http.patch(&url).json(&payload))
        })
    }

    fn set_permission_scopes(
        &self,
        object_id: &str,
        scopes: &[PermissionScope],
    ) -> Result<(), DirectoryError> {
        let url = format!("{GRAPH_BASE}/applications/{object_id}");
        let payload = json!({ "api": { "oauth2PermissionScopes": scopes } });
        self.retry_throttled("applications.set_scopes", || {
            self.send_no_content(self.http.patch(&url).json(&payload))
        })
    }

    fn set_app_roles(&self, object_id: &str, roles: &[AppRole]) -> Result<(), DirectoryError> {
        let url = format!("{GRAPH_BASE}/applications/{object_id}");
        let payload = json!({ "appRoles": roles });
        self.retry_throttled("applications.set_app_roles", || {
            self.send_no_content(self.http.patch(&url).json(&payload))
        })
    }

    fn set_required_resource_access(
        &self,
        object_id: &str,
        entries: &[RequiredResourceAccess],
    ) -> Result<(), DirectoryError> {
        let url = format!("{GRAPH_BASE}/applications/{object_id}");
        let payload = json!({ "requiredResourceAccess": entries });
        self.retry_throttled("applications.set_required_access", || {
            self.send_no_content(self.http.patch(&url).json(&payload))
        })
    }

    fn add_password(
        &self,
        object_id: &str,
        display_name: &str,
    ) -> Result<CredentialSecret, DirectoryError> {
        let url = format!("{GRAPH_BASE}/applications/{object_id}/addPassword");
        let payload = json!({ "passwordCredential": { "displayName": display_name } });
        let value: Value = self.retry_throttled("applications.add_password", || {
            self.send_json(self.http.post(&url).json(&payload))
        })?;
        let key_id = value
            .get("keyId")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| DirectoryError::Malformed("password credential missing keyId".into()))?;
        let secret_text = value
            .get("secretText")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DirectoryError::Malformed("password credential missing secretText".into())
            })?
            .to_string();
        let expires_at = value
            .get("endDateTime")
            .and_then(Value::as_str)
            .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
            .unwrap_or_else(|| OffsetDateTime::now_utc() + time::Duration::days(180));
        Ok(CredentialSecret {
            key_id,
            display_name: display_name.to_string(),
            secret_text,
            expires_at,
        })
    }

    fn find_service_principal(
        &self,
        app_id: &str,
    ) -> Result<Option<ServicePrincipal>, DirectoryError> {
        let escaped = Self::escape_filter_literal(app_id);
        let url = Self::filter_url("servicePrincipals", &format!("appId eq '{escaped}'"))?;
        let response: Value = self.retry_throttled("service_principals.find", || {
            self.send_json(self.http.get(url.clone()))
        })?;
        match response
            .get("value")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
        {
            Some(value) => Ok(Some(Self::value_to_service_principal(value)?)),
            None => Ok(None),
        }
    }

    fn create_service_principal(&self, app_id: &str) -> Result<ServicePrincipal, DirectoryError> {
        let url = format!("{GRAPH_BASE}/servicePrincipals");
        let payload = json!({ "appId": app_id });
        let value: Value = self.retry_throttled("service_principals.create", || {
            self.send_json(self.http.post(&url).json(&payload))
        })?;
        Self::value_to_service_principal(&value)
    }

    fn find_permission_grant(
        &self,
        client_sp: &str,
        resource_sp: &str,
    ) -> Result<Option<PermissionGrant>, DirectoryError> {
        let url = Self::filter_url(
            "oauth2PermissionGrants",
            &format!(
                "clientId eq '{}' and resourceId eq '{}'",
                Self::escape_filter_literal(client_sp),
                Self::escape_filter_literal(resource_sp),
            ),
        )?;
        let response: Value = self.retry_throttled("grants.find", || {
            self.send_json(self.http.get(url.clone()))
        })?;
        match response
            .get("value")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
        {
            Some(value) => Ok(Some(Self::value_to_grant(value)?)),
            None => Ok(None),
        }
    }

    fn create_permission_grant(
        &self,
        client_sp: &str,
        resource_sp: &str,
        scope: &str,
    ) -> Result<PermissionGrant, DirectoryError> {
        let url = format!("{GRAPH_BASE}/oauth2PermissionGrants");
        let payload = json!({
            "clientId": client_sp,
            "consentType": "AllPrincipals",
            "resourceId": resource_sp,
            "scope": scope,
        });
        let value: Value = self.retry_throttled("grants.create", || {
            self.send_json(self.http.post(&url).json(&payload))
        })?;
        Self::value_to_grant(&value)
    }

    fn update_permission_grant_scope(
        &self,
        grant_id: &str,
        scope: &str,
    ) -> Result<(), DirectoryError> {
        let url = format!("{GRAPH_BASE}/oauth2PermissionGrants/{grant_id}");
        let payload = json!({ "scope": scope });
        self.retry_throttled("grants.update", || {
            self.send_no_content(self.http.patch(&url).json(&payload))
        })
    }

    fn set_inheritable_permissions(
        &self,
        blueprint_object_id: &str,
        resource_app_id: &str,
        scope_values: &[String],
    ) -> Result<(), DirectoryError> {
        let url = format!("{GRAPH_BETA}/applications/{blueprint_object_id}/inheritablePermissions");
        let payload = json!({
            "resourceAppId": resource_app_id,
            "permissions": scope_values,
        });
        match self.retry_throttled("blueprint.inheritable", || {
            self.send_no_content(self.http.post(&url).json(&payload))
        }) {
            Err(err) if err.is_not_found() => Err(DirectoryError::CapabilityUnavailable(
                "inheritable-permission endpoint not available in this tenant".into(),
            )),
            other => other,
        }
    }

    fn create_agent_identity(
        &self,
        blueprint_app_id: &str,
        display_name: &str,
    ) -> Result<AgentIdentity, DirectoryError> {
        let url = format!("{GRAPH_BETA}/agentIdentities");
        let payload = json!({
            "displayName": display_name,
            "blueprintAppId": blueprint_app_id,
        });
        match self.retry_throttled("agent_identities.create", || {
            self.send_json::<Value>(self.http.post(&url).json(&payload))
        }) {
            Ok(value) => Self::value_to_agent_identity(&value, AgentIdentityKind::Autonomous),
            Err(err) if err.is_not_found() => Err(DirectoryError::CapabilityUnavailable(
                "agent-identity endpoint not available in this tenant".into(),
            )),
            Err(err) => Err(err),
        }
    }

    fn create_agent_user_identity(
        &self,
        agent_object_id: &str,
        user_principal_name: &str,
    ) -> Result<AgentIdentity, DirectoryError> {
        let url = format!("{GRAPH_BETA}/agentIdentities/{agent_object_id}/userAssociations");
        let payload = json!({ "userPrincipalName": user_principal_name });
        let value: Value = self.retry_throttled("agent_identities.create_user", || {
            self.send_json(self.http.post(&url).json(&payload))
        })?;
        Self::value_to_agent_identity(&value, AgentIdentityKind::User)
    }
}
