//! Wire types for the target API.

use cohort_protocol::RoleKind;
use serde::{Deserialize, Serialize};

/// Payload for user creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Response of user creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedUser {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub id: String,
    pub user_id: String,
    pub organization_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(rename = "type")]
    pub kind: RoleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: String,
    pub slug: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_user_omits_unset_fields() {
        let user = NewUser {
            email: "alice@example.com".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&user).unwrap();
        assert_eq!(json, r#"{"email":"alice@example.com"}"#);
    }

    #[test]
    fn test_role_kind_wire_names() {
        let role = Role {
            id: "role_1".to_string(),
            slug: "admin".to_string(),
            name: "Admin".to_string(),
            permissions: vec!["users:read".to_string()],
            kind: RoleKind::Organization,
            org_id: Some("org_1".to_string()),
        };
        let json = serde_json::to_string(&role).unwrap();
        assert!(json.contains(r#""type":"OrganizationRole""#));
    }
}
