//! The abstract target API consumed by the engine.

use async_trait::async_trait;

use crate::error::TargetError;
use crate::types::{CreatedUser, Membership, NewUser, Organization, Permission, Role};

/// Every operation the import engine performs against the target.
///
/// Implementations must be cheap to share behind an `Arc`; each worker gets
/// an injected handle rather than reaching for a global client.
#[async_trait]
pub trait TargetApi: Send + Sync {
    /// `None` when no organization has that id.
    async fn get_org(&self, org_id: &str) -> Result<Option<Organization>, TargetError>;

    /// `None` when no organization carries that external id.
    async fn get_org_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Organization>, TargetError>;

    async fn create_org(
        &self,
        name: &str,
        external_id: Option<&str>,
    ) -> Result<Organization, TargetError>;

    async fn create_user(&self, user: &NewUser) -> Result<CreatedUser, TargetError>;

    /// Best-effort cleanup of a just-created user.
    async fn delete_user(&self, user_id: &str) -> Result<(), TargetError>;

    async fn create_membership(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> Result<Membership, TargetError>;

    async fn list_org_roles(&self, org_id: &str) -> Result<Vec<Role>, TargetError>;

    async fn create_environment_role(&self, slug: &str, name: &str) -> Result<Role, TargetError>;

    async fn create_org_role(
        &self,
        org_id: &str,
        slug: &str,
        name: &str,
    ) -> Result<Role, TargetError>;

    async fn create_permission(&self, slug: &str, name: &str) -> Result<Permission, TargetError>;

    async fn assign_permissions_to_role(
        &self,
        role_id: &str,
        permission_slugs: &[String],
    ) -> Result<(), TargetError>;

    async fn assign_role_to_membership(
        &self,
        membership_id: &str,
        role_id: &str,
    ) -> Result<(), TargetError>;
}
