//! Row processor: one CSV row end to end.
//!
//! Every failure here is recovered locally: it becomes an error record plus
//! counter increments, and the row completes. Only cancellation escapes, by
//! marking the outcome so the chunk can stop without logging phantom errors.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use cohort_protocol::{ErrorRecord, ErrorType, ImportMode, UserRow};
use cohort_target::{NewUser, RateLimiterHandle, TargetApi, TargetError};
use tracing::{debug, warn};

use crate::csv_stream::{parse_boolish, parse_role_slugs};
use crate::org_cache::{OrgCache, OrgLookup, ResolveError, ResolveFailure};
use crate::retry::with_rate_limit_retry;
use crate::role_cache::RoleCache;

/// Everything a row processor needs, injected per worker.
pub struct RowContext {
    pub mode: ImportMode,
    /// Fixed organization for single-org mode.
    pub org_id: Option<String>,
    pub require_membership: bool,
    pub create_missing_orgs: bool,
    pub target: Arc<dyn TargetApi>,
    pub limiter: RateLimiterHandle,
    pub orgs: Arc<OrgCache>,
    pub roles: Arc<RoleCache>,
    /// external_id -> role slugs, merged into each row's own slugs.
    pub user_roles: Arc<HashMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowStatus {
    #[default]
    Success,
    Failed,
    /// The job is shutting down; the row recorded nothing and will be
    /// re-attempted when its chunk is retried.
    Cancelled,
}

#[derive(Debug, Default)]
pub struct RowOutcome {
    pub status: RowStatus,
    pub users_created: u64,
    pub memberships_created: u64,
    pub duplicate_users: u64,
    pub duplicate_memberships: u64,
    pub roles_assigned: u64,
    pub errors: Vec<ErrorRecord>,
    pub warnings: Vec<String>,
}

impl RowOutcome {
    fn fail(mut self, record: ErrorRecord) -> Self {
        self.errors.push(record);
        self.status = RowStatus::Failed;
        self
    }

    fn cancelled(mut self) -> Self {
        self.status = RowStatus::Cancelled;
        self
    }
}

/// Run the full pipeline for one parsed row: payload, org, user, membership,
/// roles.
pub async fn process_row(ctx: &RowContext, row: &UserRow) -> RowOutcome {
    let mut outcome = RowOutcome::default();

    let role_slugs = merged_role_slugs(ctx, row);

    // 1. Build the payload.
    let payload = match build_payload(row) {
        Ok(payload) => payload,
        Err(message) => {
            return outcome.fail(record(row, ErrorType::UserCreate, message, None, None, &role_slugs));
        }
    };

    // A multi-org row naming the org two ways is ambiguous; fail it before
    // any API call.
    if ctx.mode == ImportMode::MultiOrg && row.org_id.is_some() && row.org_external_id.is_some() {
        return outcome.fail(record(
            row,
            ErrorType::OrgResolution,
            "Both org_id and org_external_id provided".to_string(),
            None,
            None,
            &role_slugs,
        ));
    }

    // 2. Resolve the organization.
    let org_id = match resolve_org(ctx, row).await {
        Ok(org_id) => org_id,
        Err(ResolveError::Cancelled) => return outcome.cancelled(),
        Err(ResolveError::InvalidArgument(message)) => {
            return outcome.fail(record(row, ErrorType::OrgResolution, message, None, None, &role_slugs));
        }
        Err(ResolveError::Failed(failure)) => {
            return outcome.fail(record(
                row,
                ErrorType::OrgResolution,
                failure.message.clone(),
                Some(&failure),
                None,
                &role_slugs,
            ));
        }
    };

    // 3. Create the user.
    let target = Arc::clone(&ctx.target);
    let created = with_rate_limit_retry(&ctx.limiter, || {
        let target = Arc::clone(&target);
        let payload = payload.clone();
        async move { target.create_user(&payload).await }
    })
    .await;
    let user_id = match created {
        Ok(created) => {
            outcome.users_created += 1;
            created.user_id
        }
        Err(TargetError::Cancelled) => return outcome.cancelled(),
        Err(error) if error.is_already_exists() => {
            debug!(record = row.record_number, "user already exists");
            outcome.duplicate_users += 1;
            outcome.warnings.push(format!(
                "row {}: user already exists; membership and roles skipped",
                row.record_number
            ));
            return outcome;
        }
        Err(error) => {
            let failure = ResolveFailure::from_target(&error);
            return outcome.fail(record(
                row,
                ErrorType::UserCreate,
                failure.message.clone(),
                Some(&failure),
                None,
                &role_slugs,
            ));
        }
    };

    // 4. Create the membership.
    let membership_id = match &org_id {
        None => None,
        Some(org) => {
            let target = Arc::clone(&ctx.target);
            let membership = with_rate_limit_retry(&ctx.limiter, || {
                let target = Arc::clone(&target);
                let user_id = user_id.clone();
                let org = org.clone();
                async move { target.create_membership(&user_id, &org).await }
            })
            .await;
            match membership {
                Ok(membership) => {
                    outcome.memberships_created += 1;
                    Some(membership.id)
                }
                Err(TargetError::Cancelled) => return outcome.cancelled(),
                Err(error) if error.is_already_exists() => {
                    outcome.duplicate_memberships += 1;
                    outcome.warnings.push(format!(
                        "row {}: membership already exists; roles skipped",
                        row.record_number
                    ));
                    None
                }
                Err(error) => {
                    if ctx.require_membership {
                        let deleted = cleanup_user(ctx, &user_id).await;
                        let failure = ResolveFailure::from_target(&error);
                        let kept_user_id = if deleted {
                            outcome.users_created -= 1;
                            None
                        } else {
                            outcome.warnings.push(format!(
                                "row {}: failed to clean up user {} after membership failure",
                                row.record_number, user_id
                            ));
                            Some(user_id.clone())
                        };
                        return outcome.fail(record(
                            row,
                            ErrorType::MembershipCreate,
                            failure.message.clone(),
                            Some(&failure),
                            kept_user_id,
                            &role_slugs,
                        ));
                    }
                    outcome.warnings.push(format!(
                        "row {}: membership creation failed: {}",
                        row.record_number, error
                    ));
                    None
                }
            }
        }
    };

    // 5. Assign roles. Soft failures: the user and membership are kept.
    if !role_slugs.is_empty() {
        match membership_id {
            Some(membership_id) => {
                for slug in &role_slugs {
                    match assign_role(
                        ctx,
                        row,
                        org_id.as_deref(),
                        &user_id,
                        &membership_id,
                        slug,
                        &role_slugs,
                    )
                    .await
                    {
                        RoleStep::Assigned => outcome.roles_assigned += 1,
                        RoleStep::Recorded(error_record) => outcome.errors.push(error_record),
                        RoleStep::Cancelled => return outcome.cancelled(),
                    }
                }
            }
            None => {
                outcome.warnings.push(format!(
                    "row {}: role slugs present but no membership; roles skipped",
                    row.record_number
                ));
            }
        }
    }

    outcome
}

enum RoleStep {
    Assigned,
    Recorded(ErrorRecord),
    Cancelled,
}

async fn assign_role(
    ctx: &RowContext,
    row: &UserRow,
    org_id: Option<&str>,
    user_id: &str,
    membership_id: &str,
    slug: &str,
    merged_slugs: &[String],
) -> RoleStep {
    let resolved = ctx.roles.resolve(slug, org_id).await;
    let entry = match resolved {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            return RoleStep::Recorded(record(
                row,
                ErrorType::RoleAssignment,
                format!("Role not found: {slug}"),
                None,
                Some(user_id.to_string()),
                merged_slugs,
            ));
        }
        Err(ResolveError::Cancelled) => return RoleStep::Cancelled,
        Err(ResolveError::InvalidArgument(message)) => {
            return RoleStep::Recorded(record(
                row,
                ErrorType::RoleAssignment,
                message,
                None,
                Some(user_id.to_string()),
                merged_slugs,
            ));
        }
        Err(ResolveError::Failed(failure)) => {
            return RoleStep::Recorded(record(
                row,
                ErrorType::RoleAssignment,
                failure.message.clone(),
                Some(&failure),
                Some(user_id.to_string()),
                merged_slugs,
            ));
        }
    };

    let target = Arc::clone(&ctx.target);
    let assigned = with_rate_limit_retry(&ctx.limiter, || {
        let target = Arc::clone(&target);
        let membership_id = membership_id.to_string();
        let role_id = entry.id.clone();
        async move { target.assign_role_to_membership(&membership_id, &role_id).await }
    })
    .await;
    match assigned {
        Ok(()) => RoleStep::Assigned,
        Err(TargetError::Cancelled) => RoleStep::Cancelled,
        Err(error) => {
            let failure = ResolveFailure::from_target(&error);
            RoleStep::Recorded(record(
                row,
                ErrorType::RoleAssignment,
                failure.message.clone(),
                Some(&failure),
                Some(user_id.to_string()),
                merged_slugs,
            ))
        }
    }
}

async fn resolve_org(ctx: &RowContext, row: &UserRow) -> Result<Option<String>, ResolveError> {
    match ctx.mode {
        ImportMode::SingleOrg => Ok(ctx.org_id.clone()),
        ImportMode::UserOnly => Ok(None),
        ImportMode::MultiOrg => {
            if row.org_id.is_none() && row.org_external_id.is_none() {
                return Ok(None);
            }
            let create_if_missing = ctx.create_missing_orgs && row.org_name.is_some();
            let resolved = ctx
                .orgs
                .resolve(OrgLookup {
                    org_id: row.org_id.as_deref(),
                    org_external_id: row.org_external_id.as_deref(),
                    create_if_missing,
                    org_name: row.org_name.as_deref(),
                })
                .await?;
            match resolved {
                Some(org_id) => Ok(Some(org_id)),
                None => Err(ResolveError::Failed(ResolveFailure {
                    message: "Organization not found".to_string(),
                    status: None,
                    code: None,
                    request_id: None,
                })),
            }
        }
    }
}

/// Best-effort: delete a just-created user after a membership failure.
async fn cleanup_user(ctx: &RowContext, user_id: &str) -> bool {
    let target = Arc::clone(&ctx.target);
    let deleted = with_rate_limit_retry(&ctx.limiter, || {
        let target = Arc::clone(&target);
        let user_id = user_id.to_string();
        async move { target.delete_user(&user_id).await }
    })
    .await;
    match deleted {
        Ok(()) => true,
        Err(error) => {
            warn!(user_id, %error, "failed to delete user during cleanup");
            false
        }
    }
}

/// Trim and type the row into a create-user payload.
fn build_payload(row: &UserRow) -> Result<NewUser, String> {
    let email = row
        .email
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| "Missing required email".to_string())?;

    let metadata = match row.metadata.as_deref() {
        None => None,
        Some(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) if value.is_object() => Some(value),
            _ => return Err("Invalid JSON in metadata".to_string()),
        },
    };

    Ok(NewUser {
        email: email.to_string(),
        first_name: row.first_name.clone(),
        last_name: row.last_name.clone(),
        password: row.password.clone(),
        password_hash: row.password_hash.clone(),
        password_hash_type: row.password_hash_type.clone(),
        email_verified: row.email_verified.as_deref().and_then(parse_boolish),
        external_id: row.external_id.clone(),
        metadata,
    })
}

/// Union of the row's `role_slugs` column and the external mapping,
/// deduplicated, order preserved.
fn merged_role_slugs(ctx: &RowContext, row: &UserRow) -> Vec<String> {
    let mut slugs = parse_role_slugs(row.role_slugs.as_deref().unwrap_or(""));
    if let Some(external_id) = &row.external_id {
        if let Some(mapped) = ctx.user_roles.get(external_id) {
            for slug in mapped {
                if !slugs.contains(slug) {
                    slugs.push(slug.clone());
                }
            }
        }
    }
    let mut seen = std::collections::HashSet::new();
    slugs.retain(|slug| seen.insert(slug.clone()));
    slugs
}

fn record(
    row: &UserRow,
    error_type: ErrorType,
    message: String,
    failure: Option<&ResolveFailure>,
    user_id: Option<String>,
    role_slugs: &[String],
) -> ErrorRecord {
    ErrorRecord {
        record_number: row.record_number,
        email: row.email.clone(),
        user_id,
        error_type,
        error_message: message,
        http_status: failure.and_then(|f| f.status),
        code: failure.and_then(|f| f.code.clone()),
        request_id: failure.and_then(|f| f.request_id.clone()),
        timestamp: Utc::now(),
        raw_row: row.to_column_map(),
        org_id: row.org_id.clone(),
        org_external_id: row.org_external_id.clone(),
        role_slugs: if role_slugs.is_empty() {
            None
        } else {
            Some(role_slugs.to_vec())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::org_cache::OrgCacheConfig;
    use cohort_target::mock::MockTarget;
    use cohort_target::RateLimiter;

    fn context(target: Arc<MockTarget>, mode: ImportMode, org_id: Option<&str>) -> RowContext {
        let limiter = RateLimiter::spawn(10_000, Some(10_000));
        let orgs = Arc::new(OrgCache::new(
            Arc::clone(&target) as Arc<dyn TargetApi>,
            limiter.clone(),
            OrgCacheConfig::default(),
        ));
        let roles = Arc::new(RoleCache::new(
            Arc::clone(&target) as Arc<dyn TargetApi>,
            limiter.clone(),
            false,
        ));
        RowContext {
            mode,
            org_id: org_id.map(|s| s.to_string()),
            require_membership: false,
            create_missing_orgs: true,
            target,
            limiter,
            orgs,
            roles,
            user_roles: Arc::new(HashMap::new()),
        }
    }

    fn row(email: Option<&str>) -> UserRow {
        UserRow {
            record_number: 1,
            email: email.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_missing_email_is_a_validation_failure() {
        let target = Arc::new(MockTarget::new());
        let ctx = context(Arc::clone(&target), ImportMode::UserOnly, None);
        let outcome = process_row(&ctx, &row(None)).await;

        assert_eq!(outcome.status, RowStatus::Failed);
        assert_eq!(outcome.errors.len(), 1);
        let record = &outcome.errors[0];
        assert_eq!(record.error_type, ErrorType::UserCreate);
        assert_eq!(record.error_message, "Missing required email");
        assert_eq!(record.record_number, 1);
        assert_eq!(target.calls("create_user"), 0);
    }

    #[tokio::test]
    async fn test_invalid_metadata_fails_row() {
        let target = Arc::new(MockTarget::new());
        let ctx = context(Arc::clone(&target), ImportMode::UserOnly, None);
        let mut user_row = row(Some("a@b.co"));
        user_row.metadata = Some("{not json".to_string());
        let outcome = process_row(&ctx, &user_row).await;
        assert_eq!(outcome.status, RowStatus::Failed);
        assert_eq!(outcome.errors[0].error_message, "Invalid JSON in metadata");
    }

    #[tokio::test]
    async fn test_single_org_happy_path() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_A", "Acme", None);
        let ctx = context(Arc::clone(&target), ImportMode::SingleOrg, Some("org_A"));
        let outcome = process_row(&ctx, &row(Some("alice@example.com"))).await;

        assert_eq!(outcome.status, RowStatus::Success);
        assert_eq!(outcome.users_created, 1);
        assert_eq!(outcome.memberships_created, 1);
        assert!(outcome.errors.is_empty());
        assert_eq!(target.memberships_for_org("org_A"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_create_retries_once_then_succeeds() {
        let target = Arc::new(MockTarget::new());
        target.fail_next(
            "create_user",
            TargetError::Api {
                status: 429,
                code: None,
                request_id: None,
                message: "Too Many Requests".to_string(),
                retry_after: Some(1),
            },
        );
        let ctx = context(Arc::clone(&target), ImportMode::UserOnly, None);
        let outcome = process_row(&ctx, &row(Some("alice@example.com"))).await;

        assert_eq!(outcome.status, RowStatus::Success);
        assert!(outcome.errors.is_empty());
        assert_eq!(target.calls("create_user"), 2);
        assert_eq!(target.user_count(), 1);
    }

    #[tokio::test]
    async fn test_both_org_references_fail_the_row() {
        let target = Arc::new(MockTarget::new());
        let ctx = context(Arc::clone(&target), ImportMode::MultiOrg, None);
        let mut user_row = row(Some("a@b.co"));
        user_row.org_id = Some("org_1".to_string());
        user_row.org_external_id = Some("ext_1".to_string());
        let outcome = process_row(&ctx, &user_row).await;

        assert_eq!(outcome.status, RowStatus::Failed);
        assert_eq!(outcome.errors[0].error_type, ErrorType::OrgResolution);
        assert_eq!(target.calls("create_user"), 0);
    }

    #[tokio::test]
    async fn test_org_not_found_stops_the_row() {
        let target = Arc::new(MockTarget::new());
        let ctx = context(Arc::clone(&target), ImportMode::MultiOrg, None);
        let mut user_row = row(Some("a@b.co"));
        user_row.org_id = Some("org_missing".to_string());
        let outcome = process_row(&ctx, &user_row).await;

        assert_eq!(outcome.status, RowStatus::Failed);
        let record = &outcome.errors[0];
        assert_eq!(record.error_type, ErrorType::OrgResolution);
        assert!(record.error_message.contains("not found"));
        assert_eq!(target.calls("create_user"), 0);
    }

    #[tokio::test]
    async fn test_multi_org_creates_named_org() {
        let target = Arc::new(MockTarget::new());
        let ctx = context(Arc::clone(&target), ImportMode::MultiOrg, None);
        let mut user_row = row(Some("a@b.co"));
        user_row.org_external_id = Some("ext_1".to_string());
        user_row.org_name = Some("Acme".to_string());
        let outcome = process_row(&ctx, &user_row).await;

        assert_eq!(outcome.status, RowStatus::Success);
        assert_eq!(outcome.memberships_created, 1);
        assert_eq!(target.org_count(), 1);
    }

    #[tokio::test]
    async fn test_membership_failure_without_require_membership_is_a_warning() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_A", "Acme", None);
        target.fail_next("create_membership", TargetError::api(500, "boom"));
        let ctx = context(Arc::clone(&target), ImportMode::SingleOrg, Some("org_A"));
        let outcome = process_row(&ctx, &row(Some("a@b.co"))).await;

        assert_eq!(outcome.status, RowStatus::Success);
        assert_eq!(outcome.users_created, 1);
        assert_eq!(outcome.memberships_created, 0);
        assert!(outcome.errors.is_empty());
        assert!(!outcome.warnings.is_empty());
        assert_eq!(target.user_count(), 1);
    }

    #[tokio::test]
    async fn test_membership_failure_with_require_membership_deletes_user() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_A", "Acme", None);
        target.fail_next("create_membership", TargetError::api(500, "boom"));
        let mut ctx = context(Arc::clone(&target), ImportMode::SingleOrg, Some("org_A"));
        ctx.require_membership = true;
        let outcome = process_row(&ctx, &row(Some("a@b.co"))).await;

        assert_eq!(outcome.status, RowStatus::Failed);
        assert_eq!(outcome.users_created, 0);
        let record = &outcome.errors[0];
        assert_eq!(record.error_type, ErrorType::MembershipCreate);
        assert_eq!(record.http_status, Some(500));
        assert!(record.user_id.is_none());
        assert_eq!(target.user_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_user_counts_in_its_own_bucket() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_A", "Acme", None);
        let ctx = context(Arc::clone(&target), ImportMode::SingleOrg, Some("org_A"));
        process_row(&ctx, &row(Some("a@b.co"))).await;
        let outcome = process_row(&ctx, &row(Some("a@b.co"))).await;

        assert_eq!(outcome.status, RowStatus::Success);
        assert_eq!(outcome.duplicate_users, 1);
        assert_eq!(outcome.users_created, 0);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn test_role_assignment() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_A", "Acme", None);
        target.seed_org_role("org_A", "admin", &[]);
        let ctx = context(Arc::clone(&target), ImportMode::SingleOrg, Some("org_A"));
        let mut user_row = row(Some("a@b.co"));
        user_row.role_slugs = Some("admin".to_string());
        let outcome = process_row(&ctx, &user_row).await;

        assert_eq!(outcome.status, RowStatus::Success);
        assert_eq!(outcome.roles_assigned, 1);
        assert_eq!(target.assigned_role_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_role_is_a_soft_failure() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_A", "Acme", None);
        let ctx = context(Arc::clone(&target), ImportMode::SingleOrg, Some("org_A"));
        let mut user_row = row(Some("a@b.co"));
        user_row.role_slugs = Some("ghost".to_string());
        let outcome = process_row(&ctx, &user_row).await;

        // Row still succeeds; the miss is recorded for the analyzer.
        assert_eq!(outcome.status, RowStatus::Success);
        assert_eq!(outcome.memberships_created, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].error_type, ErrorType::RoleAssignment);
    }

    #[tokio::test]
    async fn test_user_role_mapping_merges_with_column() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_A", "Acme", None);
        target.seed_org_role("org_A", "admin", &[]);
        target.seed_org_role("org_A", "member", &[]);
        let mut ctx = context(Arc::clone(&target), ImportMode::SingleOrg, Some("org_A"));
        let mut mapping = HashMap::new();
        mapping.insert("emp_7".to_string(), vec!["member".to_string(), "admin".to_string()]);
        ctx.user_roles = Arc::new(mapping);

        let mut user_row = row(Some("a@b.co"));
        user_row.external_id = Some("emp_7".to_string());
        user_row.role_slugs = Some("admin".to_string());
        let outcome = process_row(&ctx, &user_row).await;

        // "admin" deduplicated across column and mapping.
        assert_eq!(outcome.roles_assigned, 2);
    }
}
