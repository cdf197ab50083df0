//! Role definitions processor: a one-shot pre-import pass that creates
//! permissions and roles in the target from a definitions CSV.
//!
//! Existing roles are never overwritten. When a role exists with a
//! different permission set, the row is reported as `exists` with a
//! permission-mismatch warning carrying the diffs.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use cohort_protocol::RoleKind;
use cohort_target::{RateLimiterHandle, TargetApi, TargetError};
use cohort_worker::csv_stream::parse_role_slugs;
use cohort_worker::{OrgCache, OrgLookup, RoleCache};
use tracing::{info, warn};

/// One parsed definitions row.
#[derive(Debug, Clone)]
pub struct RoleDefinition {
    pub row_number: u64,
    pub role_slug: String,
    pub role_name: String,
    pub kind: RoleKind,
    pub permissions: Vec<String>,
    pub org_id: Option<String>,
    pub org_external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoleOutcomeKind {
    Created,
    Exists,
    /// Exists with a different permission set; left untouched.
    PermissionMismatch {
        missing: Vec<String>,
        extra: Vec<String>,
    },
    Skipped {
        reason: String,
    },
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct RoleDefinitionOutcome {
    pub role_slug: String,
    pub kind: RoleOutcomeKind,
}

#[derive(Debug, Default)]
pub struct RoleDefinitionsReport {
    pub outcomes: Vec<RoleDefinitionOutcome>,
    pub permissions_created: u64,
}

impl RoleDefinitionsReport {
    pub fn created(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.kind == RoleOutcomeKind::Created)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.kind, RoleOutcomeKind::Failed { .. }))
            .count()
    }
}

/// Run the definitions CSV against the target.
pub async fn process_role_definitions(
    path: &Path,
    target: Arc<dyn TargetApi>,
    limiter: RateLimiterHandle,
    orgs: &OrgCache,
    roles: &RoleCache,
) -> Result<RoleDefinitionsReport> {
    let definitions = parse_definitions(path)?;
    info!(count = definitions.len(), "processing role definitions");

    let mut report = RoleDefinitionsReport::default();
    let mut known_permissions: HashSet<String> = HashSet::new();

    for definition in definitions {
        // 1. Ensure referenced permissions exist.
        for slug in &definition.permissions {
            if known_permissions.contains(slug) {
                continue;
            }
            match ensure_permission(&target, &limiter, slug).await {
                Ok(created) => {
                    if created {
                        report.permissions_created += 1;
                    }
                    known_permissions.insert(slug.clone());
                }
                Err(error) => {
                    warn!(permission = %slug, %error, "failed to ensure permission");
                }
            }
        }

        // 2. Process the role itself.
        let outcome = match definition.kind {
            RoleKind::Organization => {
                process_org_role(&definition, &target, &limiter, orgs, roles).await
            }
            RoleKind::Environment => process_env_role(&definition, &target, &limiter).await,
        };
        if let RoleOutcomeKind::PermissionMismatch { missing, extra } = &outcome {
            warn!(
                role = %definition.role_slug,
                ?missing,
                ?extra,
                "role exists with different permissions; not overwriting"
            );
        }
        report.outcomes.push(RoleDefinitionOutcome {
            role_slug: definition.role_slug,
            kind: outcome,
        });
    }

    Ok(report)
}

async fn process_org_role(
    definition: &RoleDefinition,
    target: &Arc<dyn TargetApi>,
    limiter: &RateLimiterHandle,
    orgs: &OrgCache,
    roles: &RoleCache,
) -> RoleOutcomeKind {
    // Org-scoped roles need an org reference.
    if definition.org_id.is_none() && definition.org_external_id.is_none() {
        return RoleOutcomeKind::Skipped {
            reason: "organization role without org_id or org_external_id".to_string(),
        };
    }
    let resolved = orgs
        .resolve(OrgLookup {
            org_id: definition.org_id.as_deref(),
            org_external_id: definition.org_external_id.as_deref(),
            ..Default::default()
        })
        .await;
    let org_id = match resolved {
        Ok(Some(org_id)) => org_id,
        Ok(None) => {
            return RoleOutcomeKind::Failed {
                message: "organization not found".to_string(),
            }
        }
        Err(error) => {
            return RoleOutcomeKind::Failed {
                message: error.to_string(),
            }
        }
    };

    match roles.resolve(&definition.role_slug, Some(&org_id)).await {
        Ok(Some(existing)) => diff_or_exists(definition, &existing.permissions),
        Ok(None) => {
            create_role(definition, target, limiter, Some(&org_id)).await
        }
        Err(error) => RoleOutcomeKind::Failed {
            message: error.to_string(),
        },
    }
}

async fn process_env_role(
    definition: &RoleDefinition,
    target: &Arc<dyn TargetApi>,
    limiter: &RateLimiterHandle,
) -> RoleOutcomeKind {
    // Environment roles cannot be listed; creation doubles as the
    // existence check.
    create_role(definition, target, limiter, None).await
}

fn diff_or_exists(definition: &RoleDefinition, existing: &[String]) -> RoleOutcomeKind {
    let wanted: HashSet<&String> = definition.permissions.iter().collect();
    let current: HashSet<&String> = existing.iter().collect();
    if wanted == current {
        return RoleOutcomeKind::Exists;
    }
    let mut missing: Vec<String> = wanted.difference(&current).map(|s| (*s).clone()).collect();
    let mut extra: Vec<String> = current.difference(&wanted).map(|s| (*s).clone()).collect();
    missing.sort();
    extra.sort();
    RoleOutcomeKind::PermissionMismatch { missing, extra }
}

async fn create_role(
    definition: &RoleDefinition,
    target: &Arc<dyn TargetApi>,
    limiter: &RateLimiterHandle,
    org_id: Option<&str>,
) -> RoleOutcomeKind {
    let created = {
        let target = Arc::clone(target);
        let slug = definition.role_slug.clone();
        let name = definition.role_name.clone();
        let org_id = org_id.map(|s| s.to_string());
        cohort_worker::retry::with_rate_limit_retry(limiter, move || {
            let target = Arc::clone(&target);
            let slug = slug.clone();
            let name = name.clone();
            let org_id = org_id.clone();
            async move {
                match org_id {
                    Some(org_id) => target.create_org_role(&org_id, &slug, &name).await,
                    None => target.create_environment_role(&slug, &name).await,
                }
            }
        })
        .await
    };

    let role = match created {
        Ok(role) => role,
        Err(error) if error.is_already_exists() => return RoleOutcomeKind::Exists,
        Err(error) => {
            return RoleOutcomeKind::Failed {
                message: error.to_string(),
            }
        }
    };

    if !definition.permissions.is_empty() {
        let assign = {
            let target = Arc::clone(target);
            let role_id = role.id.clone();
            let permissions = definition.permissions.clone();
            cohort_worker::retry::with_rate_limit_retry(limiter, move || {
                let target = Arc::clone(&target);
                let role_id = role_id.clone();
                let permissions = permissions.clone();
                async move {
                    target
                        .assign_permissions_to_role(&role_id, &permissions)
                        .await
                }
            })
            .await
        };
        if let Err(error) = assign {
            return RoleOutcomeKind::Failed {
                message: format!("role created but permissions not assigned: {error}"),
            };
        }
    }
    RoleOutcomeKind::Created
}

/// Create a permission, treating "already exists" as success. Returns
/// whether a new permission was created.
async fn ensure_permission(
    target: &Arc<dyn TargetApi>,
    limiter: &RateLimiterHandle,
    slug: &str,
) -> Result<bool, TargetError> {
    let target_ref = Arc::clone(target);
    let slug_owned = slug.to_string();
    let created = cohort_worker::retry::with_rate_limit_retry(limiter, move || {
        let target = Arc::clone(&target_ref);
        let slug = slug_owned.clone();
        async move { target.create_permission(&slug, &slug).await }
    })
    .await;
    match created {
        Ok(_) => Ok(true),
        Err(error) if error.is_already_exists() => Ok(false),
        Err(error) => Err(error),
    }
}

/// Parse the definitions CSV.
pub fn parse_definitions(path: &Path) -> Result<Vec<RoleDefinition>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open role definitions: {}", path.display()))?;
    let headers = reader.headers().context("Failed to read header")?.clone();
    let index = |name: &str| headers.iter().position(|h| h.trim() == name);

    let slug_idx = index("role_slug").context("missing 'role_slug' column")?;
    let name_idx = index("role_name");
    let type_idx = index("role_type").context("missing 'role_type' column")?;
    let permissions_idx = index("permissions");
    let org_id_idx = index("org_id");
    let org_ext_idx = index("org_external_id");

    let mut definitions = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.context("role definitions CSV parse error")?;
        let field = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
        };
        let Some(role_slug) = field(Some(slug_idx)) else {
            continue;
        };
        let kind = match field(Some(type_idx)).as_deref() {
            Some("environment") => RoleKind::Environment,
            Some("organization") => RoleKind::Organization,
            other => {
                anyhow::bail!(
                    "row {}: invalid role_type {:?} (expected environment or organization)",
                    row + 1,
                    other
                );
            }
        };
        definitions.push(RoleDefinition {
            row_number: row as u64 + 1,
            role_name: field(name_idx).unwrap_or_else(|| role_slug.clone()),
            role_slug,
            kind,
            permissions: field(permissions_idx)
                .map(|raw| parse_role_slugs(&raw))
                .unwrap_or_default(),
            org_id: field(org_id_idx),
            org_external_id: field(org_ext_idx),
        });
    }
    Ok(definitions)
}
