//! No-I/O target for dry runs.
//!
//! Fabricated ids carry a `_dryrun_` marker so they are recognizable in
//! logs and summaries. Lookups by id echo the id back; nothing is stored.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cohort_protocol::RoleKind;

use crate::api::TargetApi;
use crate::error::TargetError;
use crate::types::{CreatedUser, Membership, NewUser, Organization, Permission, Role};

#[derive(Default)]
pub struct DryRunTarget {
    counter: AtomicU64,
}

impl DryRunTarget {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl TargetApi for DryRunTarget {
    async fn get_org(&self, org_id: &str) -> Result<Option<Organization>, TargetError> {
        Ok(Some(Organization {
            id: org_id.to_string(),
            name: None,
            external_id: None,
        }))
    }

    async fn get_org_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Organization>, TargetError> {
        Ok(Some(Organization {
            id: format!("org_dryrun_{external_id}"),
            name: None,
            external_id: Some(external_id.to_string()),
        }))
    }

    async fn create_org(
        &self,
        name: &str,
        external_id: Option<&str>,
    ) -> Result<Organization, TargetError> {
        let id = match external_id {
            Some(external_id) => format!("org_dryrun_{external_id}"),
            None => format!("org_dryrun_{}", self.next()),
        };
        Ok(Organization {
            id,
            name: Some(name.to_string()),
            external_id: external_id.map(|s| s.to_string()),
        })
    }

    async fn create_user(&self, _user: &NewUser) -> Result<CreatedUser, TargetError> {
        Ok(CreatedUser {
            user_id: format!("user_dryrun_{}", self.next()),
        })
    }

    async fn delete_user(&self, _user_id: &str) -> Result<(), TargetError> {
        Ok(())
    }

    async fn create_membership(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> Result<Membership, TargetError> {
        Ok(Membership {
            id: format!("om_dryrun_{}", self.next()),
            user_id: user_id.to_string(),
            organization_id: org_id.to_string(),
        })
    }

    async fn list_org_roles(&self, _org_id: &str) -> Result<Vec<Role>, TargetError> {
        Ok(Vec::new())
    }

    async fn create_environment_role(&self, slug: &str, name: &str) -> Result<Role, TargetError> {
        Ok(Role {
            id: format!("role_dryrun_{slug}"),
            slug: slug.to_string(),
            name: name.to_string(),
            permissions: Vec::new(),
            kind: RoleKind::Environment,
            org_id: None,
        })
    }

    async fn create_org_role(
        &self,
        org_id: &str,
        slug: &str,
        name: &str,
    ) -> Result<Role, TargetError> {
        Ok(Role {
            id: format!("role_dryrun_{slug}"),
            slug: slug.to_string(),
            name: name.to_string(),
            permissions: Vec::new(),
            kind: RoleKind::Organization,
            org_id: Some(org_id.to_string()),
        })
    }

    async fn create_permission(&self, slug: &str, name: &str) -> Result<Permission, TargetError> {
        Ok(Permission {
            id: format!("perm_dryrun_{slug}"),
            slug: slug.to_string(),
            name: name.to_string(),
        })
    }

    async fn assign_permissions_to_role(
        &self,
        _role_id: &str,
        _permission_slugs: &[String],
    ) -> Result<(), TargetError> {
        Ok(())
    }

    async fn assign_role_to_membership(
        &self,
        _membership_id: &str,
        _role_id: &str,
    ) -> Result<(), TargetError> {
        Ok(())
    }
}
