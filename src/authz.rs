//! Authorization engine — resolves effective permissions for a subject and
//! evaluates a (possibly resource-scoped) check against role permissions,
//! direct grants, and resource grants, with wildcard inheritance.
//!
//! Decisions are always taken against the live persistence layer rather
//! than a token's mint-time roles snapshot: role assignments carry their
//! own `expiresAt`, so a role granted after mint (or revoked before the
//! token expires) must still be reflected immediately — the same
//! always-check-the-authoritative-store posture the token service takes
//! toward revocation (§9, §7).

use crate::db::Db;
use serde::Serialize;

/// A single effective permission entry (§4.5.1).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EffectivePermission {
    pub code: String,
    pub source: String,
    pub scope: String,
    pub scope_value: Option<String>,
}

/// The outcome of a single check (§4.5.2).
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
}

/// Input to a single check.
pub struct CheckRequest<'a> {
    pub permission: &'a str,
    pub resource_type: Option<&'a str>,
    pub resource_id: Option<&'a str>,
}

/// Whether stored permission code `stored` covers requested code
/// `requested`, per §4.5.3: exact match, or `stored` ends with `:*` and its
/// prefix is a segment-boundary prefix of `requested`.
pub fn wildcard_matches(stored: &str, requested: &str) -> bool {
    if stored == requested {
        return true;
    }
    if let Some(prefix) = stored.strip_suffix(":*") {
        return requested == prefix || requested.starts_with(&format!("{prefix}:"));
    }
    false
}

pub struct AuthzEngine<'a> {
    db: &'a Db,
}

impl<'a> AuthzEngine<'a> {
    pub fn new(db: &'a Db) -> Self {
        AuthzEngine { db }
    }

    /// Evaluate a single check, in the ordered fashion of §4.5.2.
    pub fn check(&self, user_id: &str, req: &CheckRequest) -> Result<Decision, rusqlite::Error> {
        // 1. Resource grant pass.
        if let (Some(resource_type), Some(resource_id)) = (req.resource_type, req.resource_id) {
            if self
                .db
                .find_resource_grant(user_id, resource_type, resource_id, req.permission)?
                .is_some()
            {
                return Ok(Decision {
                    allowed: true,
                    reason: format!("resource-grant for {resource_type}/{resource_id}"),
                });
            }
        }

        // 2. Direct grant pass.
        for (grant, code) in self.db.get_user_permission_grants(user_id)? {
            if !wildcard_matches(&code, req.permission) {
                continue;
            }
            let scope_ok = match grant.scope_type {
                crate::db::ScopeType::All => true,
                crate::db::ScopeType::Record => {
                    req.resource_id.is_some() && grant.scope_value.as_deref() == req.resource_id
                }
                crate::db::ScopeType::Query => false,
            };
            if scope_ok {
                return Ok(Decision {
                    allowed: true,
                    reason: format!("direct grant: {code}"),
                });
            }
        }

        // 3. Role permission pass (first matching role-permission in
        // deterministic order wins).
        for role_perm in self.db.get_role_permissions_for_user(user_id)? {
            if wildcard_matches(&role_perm.code, req.permission) {
                return Ok(Decision {
                    allowed: true,
                    reason: format!("role:{} grants {}", role_perm.role_name, role_perm.code),
                });
            }
        }

        // 4. Deny. Never leaks grant-store structure (§7).
        Ok(Decision {
            allowed: false,
            reason: "no matching permission".to_string(),
        })
    }

    /// Bulk evaluate; preserves input order; no short-circuiting (§4.5.4).
    pub fn evaluate_bulk(
        &self,
        user_id: &str,
        checks: &[CheckRequest],
    ) -> Result<Vec<Decision>, rusqlite::Error> {
        checks.iter().map(|c| self.check(user_id, c)).collect()
    }

    /// The full effective permission set for a subject (§4.5.1, §4.5.5).
    /// Duplicates by `code` are kept only if `source` or `scope` differ.
    pub fn effective_permissions(&self, user_id: &str) -> Result<Vec<EffectivePermission>, rusqlite::Error> {
        let mut out: Vec<EffectivePermission> = Vec::new();

        for role_perm in self.db.get_role_permissions_for_user(user_id)? {
            out.push(EffectivePermission {
                code: role_perm.code,
                source: format!("role:{}", role_perm.role_name),
                scope: "all".to_string(),
                scope_value: None,
            });
        }

        for (grant, code) in self.db.get_user_permission_grants(user_id)? {
            out.push(EffectivePermission {
                code,
                source: "direct-grant".to_string(),
                scope: match grant.scope_type {
                    crate::db::ScopeType::All => "all",
                    crate::db::ScopeType::Record => "record",
                    crate::db::ScopeType::Query => "query",
                }
                .to_string(),
                scope_value: grant.scope_value,
            });
        }

        for (grant, code) in self.db.get_resource_grants_for_user(user_id)? {
            out.push(EffectivePermission {
                code,
                source: "resource-grant".to_string(),
                scope: "record".to_string(),
                scope_value: Some(grant.resource_id),
            });
        }

        let mut deduped: Vec<EffectivePermission> = Vec::new();
        for entry in out {
            if !deduped.contains(&entry) {
                deduped.push(entry);
            }
        }
        Ok(deduped)
    }
}
