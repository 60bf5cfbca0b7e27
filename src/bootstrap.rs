//! Bootstrapper (§4.7) — seeds the default roles, permissions, and
//! role-permission edges on first start. Idempotent: every write goes
//! through the persistence layer's upsert/link methods, so re-running
//! against an already-seeded store is a no-op.

use crate::db::Db;

const ADMIN_ROLE: &str = "admin";
const USER_ROLE: &str = "user";

const ADMIN_WILDCARD: &str = "admin:*";
const USER_PROFILE: &str = "user:profile";
const USER_CREDENTIALS: &str = "user:credentials";

/// Seed default roles, permissions, and their edges. Safe to call on
/// every startup.
pub fn seed(db: &Db) -> Result<(), rusqlite::Error> {
    let admin_role = db.upsert_role(&uuid::Uuid::new_v4().to_string(), ADMIN_ROLE, true, Some("System administrator"))?;
    let user_role = db.upsert_role(&uuid::Uuid::new_v4().to_string(), USER_ROLE, true, Some("Default authenticated user"))?;

    let admin_wildcard = db.upsert_permission(
        &uuid::Uuid::new_v4().to_string(),
        ADMIN_WILDCARD,
        "admin",
        "*",
        Some("Unrestricted administrative access"),
    )?;
    let user_profile = db.upsert_permission(
        &uuid::Uuid::new_v4().to_string(),
        USER_PROFILE,
        "user",
        "profile",
        Some("Read and update own profile"),
    )?;
    let user_credentials = db.upsert_permission(
        &uuid::Uuid::new_v4().to_string(),
        USER_CREDENTIALS,
        "user",
        "credentials",
        Some("Manage own passkeys"),
    )?;

    db.link_role_permission(&admin_role.id, &admin_wildcard.id)?;
    db.link_role_permission(&user_role.id, &user_profile.id)?;
    db.link_role_permission(&user_role.id, &user_credentials.id)?;

    tracing::info!("bootstrap complete: roles and default permissions seeded");
    Ok(())
}
