//! Scriptable in-memory target for tests.
//!
//! Behaves like a tiny identity service: duplicate emails, duplicate
//! memberships and external-id conflicts answer 409 the way a real endpoint
//! would. Tests can additionally inject one-shot failures per operation and
//! read back invocation counts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cohort_protocol::RoleKind;

use crate::api::TargetApi;
use crate::error::TargetError;
use crate::types::{CreatedUser, Membership, NewUser, Organization, Permission, Role};

#[derive(Default)]
struct MockState {
    orgs: HashMap<String, Organization>,
    orgs_by_ext: HashMap<String, String>,
    users: HashMap<String, NewUser>,
    users_by_email: HashMap<String, String>,
    /// membership id -> (user id, org id)
    memberships: HashMap<String, (String, String)>,
    membership_keys: HashMap<(String, String), String>,
    roles: HashMap<String, Role>,
    permissions: HashMap<String, Permission>,
    /// (membership id, role id)
    membership_roles: Vec<(String, String)>,
    calls: HashMap<&'static str, u64>,
    failures: HashMap<&'static str, VecDeque<TargetError>>,
    next_id: u64,
}

impl MockState {
    /// Count the call and pop an injected failure, if one is queued.
    fn begin(&mut self, op: &'static str) -> Result<(), TargetError> {
        *self.calls.entry(op).or_insert(0) += 1;
        if let Some(queue) = self.failures.get_mut(op) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }
        Ok(())
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{:08}", prefix, self.next_id)
    }
}

#[derive(Default)]
pub struct MockTarget {
    state: Mutex<MockState>,
    latency_ms: AtomicU64,
}

impl MockTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation, so tests can overlap in-flight calls.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    /// Queue a one-shot failure for the named operation.
    pub fn fail_next(&self, op: &'static str, error: TargetError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// How many times the named operation was invoked.
    pub fn calls(&self, op: &str) -> u64 {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn seed_org(&self, id: &str, name: &str, external_id: Option<&str>) {
        let mut state = self.lock();
        if let Some(external_id) = external_id {
            state
                .orgs_by_ext
                .insert(external_id.to_string(), id.to_string());
        }
        state.orgs.insert(
            id.to_string(),
            Organization {
                id: id.to_string(),
                name: Some(name.to_string()),
                external_id: external_id.map(|s| s.to_string()),
            },
        );
    }

    pub fn seed_org_role(&self, org_id: &str, slug: &str, permissions: &[&str]) {
        let mut state = self.lock();
        let id = state.next_id("role");
        state.roles.insert(
            id.clone(),
            Role {
                id,
                slug: slug.to_string(),
                name: slug.to_string(),
                permissions: permissions.iter().map(|s| s.to_string()).collect(),
                kind: RoleKind::Organization,
                org_id: Some(org_id.to_string()),
            },
        );
    }

    pub fn org_count(&self) -> usize {
        self.lock().orgs.len()
    }

    pub fn user_count(&self) -> usize {
        self.lock().users.len()
    }

    pub fn membership_count(&self) -> usize {
        self.lock().memberships.len()
    }

    pub fn memberships_for_org(&self, org_id: &str) -> usize {
        self.lock()
            .memberships
            .values()
            .filter(|(_, org)| org == org_id)
            .count()
    }

    pub fn assigned_role_count(&self) -> usize {
        self.lock().membership_roles.len()
    }

    pub fn permission_slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.lock().permissions.keys().cloned().collect();
        slugs.sort();
        slugs
    }
}

#[async_trait]
impl TargetApi for MockTarget {
    async fn get_org(&self, org_id: &str) -> Result<Option<Organization>, TargetError> {
        self.delay().await;
        let mut state = self.lock();
        state.begin("get_org")?;
        Ok(state.orgs.get(org_id).cloned())
    }

    async fn get_org_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Organization>, TargetError> {
        self.delay().await;
        let mut state = self.lock();
        state.begin("get_org_by_external_id")?;
        let id = state.orgs_by_ext.get(external_id).cloned();
        Ok(id.and_then(|id| state.orgs.get(&id).cloned()))
    }

    async fn create_org(
        &self,
        name: &str,
        external_id: Option<&str>,
    ) -> Result<Organization, TargetError> {
        self.delay().await;
        let mut state = self.lock();
        state.begin("create_org")?;
        if let Some(external_id) = external_id {
            if state.orgs_by_ext.contains_key(external_id) {
                return Err(TargetError::api_with_code(
                    409,
                    "external_id_already_assigned",
                    "external_id already assigned to another organization",
                ));
            }
        }
        let id = state.next_id("org");
        let org = Organization {
            id: id.clone(),
            name: Some(name.to_string()),
            external_id: external_id.map(|s| s.to_string()),
        };
        if let Some(external_id) = external_id {
            state.orgs_by_ext.insert(external_id.to_string(), id.clone());
        }
        state.orgs.insert(id, org.clone());
        Ok(org)
    }

    async fn create_user(&self, user: &NewUser) -> Result<CreatedUser, TargetError> {
        self.delay().await;
        let mut state = self.lock();
        state.begin("create_user")?;
        let email_key = user.email.to_lowercase();
        if state.users_by_email.contains_key(&email_key) {
            return Err(TargetError::api_with_code(
                409,
                "user_already_exists",
                "A user with this email already exists",
            ));
        }
        let id = state.next_id("user");
        state.users_by_email.insert(email_key, id.clone());
        state.users.insert(id.clone(), user.clone());
        Ok(CreatedUser { user_id: id })
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), TargetError> {
        self.delay().await;
        let mut state = self.lock();
        state.begin("delete_user")?;
        match state.users.remove(user_id) {
            Some(user) => {
                state.users_by_email.remove(&user.email.to_lowercase());
                Ok(())
            }
            None => Err(TargetError::api(404, "User not found")),
        }
    }

    async fn create_membership(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> Result<Membership, TargetError> {
        self.delay().await;
        let mut state = self.lock();
        state.begin("create_membership")?;
        if !state.users.contains_key(user_id) {
            return Err(TargetError::api(404, "User not found"));
        }
        if !state.orgs.contains_key(org_id) {
            return Err(TargetError::api(404, "Organization not found"));
        }
        let key = (user_id.to_string(), org_id.to_string());
        if state.membership_keys.contains_key(&key) {
            return Err(TargetError::api_with_code(
                409,
                "organization_membership_already_exists",
                "Membership already exists",
            ));
        }
        let id = state.next_id("om");
        state.membership_keys.insert(key.clone(), id.clone());
        state.memberships.insert(id.clone(), key);
        Ok(Membership {
            id,
            user_id: user_id.to_string(),
            organization_id: org_id.to_string(),
        })
    }

    async fn list_org_roles(&self, org_id: &str) -> Result<Vec<Role>, TargetError> {
        self.delay().await;
        let mut state = self.lock();
        state.begin("list_org_roles")?;
        Ok(state
            .roles
            .values()
            .filter(|role| role.org_id.as_deref() == Some(org_id))
            .cloned()
            .collect())
    }

    async fn create_environment_role(&self, slug: &str, name: &str) -> Result<Role, TargetError> {
        self.delay().await;
        let mut state = self.lock();
        state.begin("create_environment_role")?;
        let exists = state
            .roles
            .values()
            .any(|role| role.kind == RoleKind::Environment && role.slug == slug);
        if exists {
            return Err(TargetError::api_with_code(
                409,
                "role_already_exists",
                "Role already exists",
            ));
        }
        let id = state.next_id("role");
        let role = Role {
            id: id.clone(),
            slug: slug.to_string(),
            name: name.to_string(),
            permissions: Vec::new(),
            kind: RoleKind::Environment,
            org_id: None,
        };
        state.roles.insert(id, role.clone());
        Ok(role)
    }

    async fn create_org_role(
        &self,
        org_id: &str,
        slug: &str,
        name: &str,
    ) -> Result<Role, TargetError> {
        self.delay().await;
        let mut state = self.lock();
        state.begin("create_org_role")?;
        let exists = state
            .roles
            .values()
            .any(|role| role.org_id.as_deref() == Some(org_id) && role.slug == slug);
        if exists {
            return Err(TargetError::api_with_code(
                409,
                "role_already_exists",
                "Role already exists",
            ));
        }
        let id = state.next_id("role");
        let role = Role {
            id: id.clone(),
            slug: slug.to_string(),
            name: name.to_string(),
            permissions: Vec::new(),
            kind: RoleKind::Organization,
            org_id: Some(org_id.to_string()),
        };
        state.roles.insert(id, role.clone());
        Ok(role)
    }

    async fn create_permission(&self, slug: &str, name: &str) -> Result<Permission, TargetError> {
        self.delay().await;
        let mut state = self.lock();
        state.begin("create_permission")?;
        if state.permissions.contains_key(slug) {
            return Err(TargetError::api_with_code(
                409,
                "permission_already_exists",
                "Permission already exists",
            ));
        }
        let id = state.next_id("perm");
        let permission = Permission {
            id,
            slug: slug.to_string(),
            name: name.to_string(),
        };
        state.permissions.insert(slug.to_string(), permission.clone());
        Ok(permission)
    }

    async fn assign_permissions_to_role(
        &self,
        role_id: &str,
        permission_slugs: &[String],
    ) -> Result<(), TargetError> {
        self.delay().await;
        let mut state = self.lock();
        state.begin("assign_permissions_to_role")?;
        if !state.roles.contains_key(role_id) {
            return Err(TargetError::api(404, "Role not found"));
        }
        if let Some(role) = state.roles.get_mut(role_id) {
            for slug in permission_slugs {
                if !role.permissions.contains(slug) {
                    role.permissions.push(slug.clone());
                }
            }
        }
        Ok(())
    }

    async fn assign_role_to_membership(
        &self,
        membership_id: &str,
        role_id: &str,
    ) -> Result<(), TargetError> {
        self.delay().await;
        let mut state = self.lock();
        state.begin("assign_role_to_membership")?;
        if !state.memberships.contains_key(membership_id) {
            return Err(TargetError::api(404, "Membership not found"));
        }
        if !state.roles.contains_key(role_id) {
            return Err(TargetError::api(404, "Role not found"));
        }
        state
            .membership_roles
            .push((membership_id.to_string(), role_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_duplicate_user_answers_409() {
        let target = MockTarget::new();
        target.create_user(&user("a@b.co")).await.unwrap();
        let err = target.create_user(&user("A@B.CO")).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(target.calls("create_user"), 2);
    }

    #[tokio::test]
    async fn test_external_id_conflict_on_second_create() {
        let target = MockTarget::new();
        target.create_org("Acme", Some("ext_1")).await.unwrap();
        let err = target.create_org("Acme", Some("ext_1")).await.unwrap_err();
        assert!(err.is_external_id_conflict());
        // The losing caller can recover through the lookup path.
        let org = target.get_org_by_external_id("ext_1").await.unwrap();
        assert!(org.is_some());
    }

    #[tokio::test]
    async fn test_fail_next_is_one_shot() {
        let target = MockTarget::new();
        target.fail_next("create_user", TargetError::api(500, "boom"));
        assert!(target.create_user(&user("a@b.co")).await.is_err());
        assert!(target.create_user(&user("b@b.co")).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_membership() {
        let target = MockTarget::new();
        target.seed_org("org_1", "Acme", None);
        let created = target.create_user(&user("a@b.co")).await.unwrap();
        target
            .create_membership(&created.user_id, "org_1")
            .await
            .unwrap();
        let err = target
            .create_membership(&created.user_id, "org_1")
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }
}
