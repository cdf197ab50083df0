//! REST implementation of [`TargetApi`].

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::api::TargetApi;
use crate::error::TargetError;
use crate::types::{CreatedUser, Membership, NewUser, Organization, Permission, Role};

/// HTTP target configuration (plain data).
#[derive(Debug, Clone)]
pub struct HttpTargetConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
}

/// Error body the target returns on non-success statuses. Unknown shapes
/// degrade to the raw body text.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpTarget {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpTarget {
    pub fn new(config: HttpTargetConfig) -> Result<Self, TargetError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| TargetError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response, TargetError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "target request");
        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_key);
        if let Some(body) = body {
            request = request.json(&body);
        }
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                TargetError::Timeout
            } else {
                TargetError::Transport(e.to_string())
            }
        })
    }

    /// Turn a non-success response into a `TargetError::Api`, preserving
    /// status, vendor code, request id, message and Retry-After.
    async fn api_error(response: Response) -> TargetError {
        let status = response.status().as_u16();
        let request_id = header_string(&response, "x-request-id");
        let retry_after =
            header_string(&response, "retry-after").and_then(|v| v.parse::<u64>().ok());
        let raw = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ApiErrorBody>(&raw) {
            Ok(body) => {
                let message = body
                    .message
                    .or(body.error)
                    .unwrap_or_else(|| raw.clone());
                (body.code, message)
            }
            Err(_) => (None, raw),
        };
        TargetError::Api {
            status,
            code,
            request_id,
            message,
            retry_after,
        }
    }

    async fn expect_json<T: DeserializeOwned>(
        &self,
        response: Response,
    ) -> Result<T, TargetError> {
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| TargetError::Transport(format!("invalid response body: {e}")))
    }

    /// As `expect_json`, but 404 maps to `Ok(None)`.
    async fn expect_optional<T: DeserializeOwned>(
        &self,
        response: Response,
    ) -> Result<Option<T>, TargetError> {
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.expect_json(response).await.map(Some)
    }

    async fn expect_empty(&self, response: Response) -> Result<(), TargetError> {
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(())
    }
}

fn header_string(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

#[async_trait]
impl TargetApi for HttpTarget {
    async fn get_org(&self, org_id: &str) -> Result<Option<Organization>, TargetError> {
        let response = self
            .send(Method::GET, &format!("/organizations/{org_id}"), None)
            .await?;
        self.expect_optional(response).await
    }

    async fn get_org_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Organization>, TargetError> {
        let path = format!(
            "/organizations/by-external-id/{}",
            urlencode(external_id)
        );
        let response = self.send(Method::GET, &path, None).await?;
        self.expect_optional(response).await
    }

    async fn create_org(
        &self,
        name: &str,
        external_id: Option<&str>,
    ) -> Result<Organization, TargetError> {
        let mut body = json!({ "name": name });
        if let Some(external_id) = external_id {
            body["externalId"] = json!(external_id);
        }
        let response = self.send(Method::POST, "/organizations", Some(body)).await?;
        self.expect_json(response).await
    }

    async fn create_user(&self, user: &NewUser) -> Result<CreatedUser, TargetError> {
        let body = serde_json::to_value(user)
            .map_err(|e| TargetError::Transport(format!("unserializable user payload: {e}")))?;
        let response = self.send(Method::POST, "/users", Some(body)).await?;
        self.expect_json(response).await
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), TargetError> {
        let response = self
            .send(Method::DELETE, &format!("/users/{user_id}"), None)
            .await?;
        self.expect_empty(response).await
    }

    async fn create_membership(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> Result<Membership, TargetError> {
        let body = json!({ "userId": user_id, "organizationId": org_id });
        let response = self
            .send(Method::POST, "/organization-memberships", Some(body))
            .await?;
        self.expect_json(response).await
    }

    async fn list_org_roles(&self, org_id: &str) -> Result<Vec<Role>, TargetError> {
        #[derive(Deserialize)]
        struct RoleList {
            data: Vec<Role>,
        }
        let response = self
            .send(Method::GET, &format!("/organizations/{org_id}/roles"), None)
            .await?;
        let list: RoleList = self.expect_json(response).await?;
        Ok(list.data)
    }

    async fn create_environment_role(&self, slug: &str, name: &str) -> Result<Role, TargetError> {
        let body = json!({ "slug": slug, "name": name });
        let response = self.send(Method::POST, "/roles", Some(body)).await?;
        self.expect_json(response).await
    }

    async fn create_org_role(
        &self,
        org_id: &str,
        slug: &str,
        name: &str,
    ) -> Result<Role, TargetError> {
        let body = json!({ "slug": slug, "name": name });
        let response = self
            .send(
                Method::POST,
                &format!("/organizations/{org_id}/roles"),
                Some(body),
            )
            .await?;
        self.expect_json(response).await
    }

    async fn create_permission(&self, slug: &str, name: &str) -> Result<Permission, TargetError> {
        let body = json!({ "slug": slug, "name": name });
        let response = self.send(Method::POST, "/permissions", Some(body)).await?;
        self.expect_json(response).await
    }

    async fn assign_permissions_to_role(
        &self,
        role_id: &str,
        permission_slugs: &[String],
    ) -> Result<(), TargetError> {
        let body = json!({ "permissionSlugs": permission_slugs });
        let response = self
            .send(
                Method::POST,
                &format!("/roles/{role_id}/permissions"),
                Some(body),
            )
            .await?;
        self.expect_empty(response).await
    }

    async fn assign_role_to_membership(
        &self,
        membership_id: &str,
        role_id: &str,
    ) -> Result<(), TargetError> {
        let body = json!({ "roleId": role_id });
        let response = self
            .send(
                Method::POST,
                &format!("/organization-memberships/{membership_id}/roles"),
                Some(body),
            )
            .await?;
        self.expect_empty(response).await
    }
}

/// Minimal percent-encoding for path segments built from user data.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
