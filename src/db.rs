//! Persistence layer — typed access to users, credentials, roles,
//! permissions, role-permission edges, user-role edges, user-permission
//! grants, resource grants, sessions, and challenges.
//!
//! Mirrors the teacher's `PolicyStore`: a `rusqlite::Connection` behind a
//! `parking_lot::Mutex`, WAL mode, one `migrate()` pass, and typed methods
//! that take explicit parameter lists rather than a query-builder.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub user_id: String,
    pub public_key: Vec<u8>,
    pub sign_count: i64,
    pub aaguid: Option<String>,
    pub transports: Option<Vec<String>>,
    pub attestation_format: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub device_name: Option<String>,
    pub backup_eligible: bool,
    pub backed_up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeKind {
    Registration,
    Authentication,
}

impl ChallengeKind {
    fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::Registration => "registration",
            ChallengeKind::Authentication => "authentication",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "registration" => Some(ChallengeKind::Registration),
            "authentication" => Some(ChallengeKind::Authentication),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: String,
    pub user_id: Option<String>,
    pub nonce: Vec<u8>,
    pub kind: ChallengeKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub credential_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub parent_role_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub id: String,
    pub code: String,
    pub resource_type: String,
    pub action: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserRoleEdge {
    pub user_id: String,
    pub role_id: String,
    pub granted_at: DateTime<Utc>,
    pub granted_by: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    All,
    Record,
    Query,
}

impl ScopeType {
    fn as_str(&self) -> &'static str {
        match self {
            ScopeType::All => "all",
            ScopeType::Record => "record",
            ScopeType::Query => "query",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "all" => Some(ScopeType::All),
            "record" => Some(ScopeType::Record),
            "query" => Some(ScopeType::Query),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserPermissionGrant {
    pub id: String,
    pub user_id: String,
    pub permission_id: String,
    pub scope_type: ScopeType,
    pub scope_value: Option<String>,
    pub granted_at: DateTime<Utc>,
    pub granted_by: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResourceGrant {
    pub id: String,
    pub user_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub permission_id: String,
    pub granted_at: DateTime<Utc>,
    pub granted_by: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A role permission together with the role it came from, as needed by the
/// authorization engine's role-permission pass (§4.5.2 step 3).
#[derive(Debug, Clone)]
pub struct RolePermission {
    pub role_name: String,
    pub code: String,
}

pub struct Db {
    conn: Mutex<Connection>,
}

fn now_ms() -> DateTime<Utc> {
    Utc::now()
}

fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

impl Db {
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        let db = Db { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    pub fn open_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let db = Db { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                email TEXT UNIQUE,
                created_at INTEGER NOT NULL,
                last_login_at INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1,
                metadata_json TEXT
            );

            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                public_key BLOB NOT NULL,
                sign_count INTEGER NOT NULL DEFAULT 0,
                aaguid TEXT,
                transports_json TEXT,
                attestation_format TEXT,
                created_at INTEGER NOT NULL,
                last_used_at INTEGER,
                device_name TEXT,
                backup_eligible INTEGER NOT NULL DEFAULT 0,
                backed_up INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_credentials_user ON credentials(user_id);

            CREATE TABLE IF NOT EXISTS challenges (
                id TEXT PRIMARY KEY,
                user_id TEXT REFERENCES users(id) ON DELETE CASCADE,
                nonce BLOB NOT NULL,
                kind TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_challenges_expires ON challenges(expires_at);

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                credential_id TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                last_activity_at INTEGER NOT NULL,
                ip_address TEXT,
                user_agent TEXT,
                revoked INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);

            CREATE TABLE IF NOT EXISTS roles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                is_system INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                parent_role_id TEXT REFERENCES roles(id)
            );

            CREATE TABLE IF NOT EXISTS permissions (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                resource_type TEXT NOT NULL,
                action TEXT NOT NULL,
                description TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS role_permissions (
                role_id TEXT NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
                permission_id TEXT NOT NULL REFERENCES permissions(id) ON DELETE CASCADE,
                granted_at INTEGER NOT NULL,
                PRIMARY KEY (role_id, permission_id)
            );

            CREATE TABLE IF NOT EXISTS user_roles (
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                role_id TEXT NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
                granted_at INTEGER NOT NULL,
                granted_by TEXT,
                expires_at INTEGER,
                PRIMARY KEY (user_id, role_id)
            );

            CREATE TABLE IF NOT EXISTS user_permission_grants (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                permission_id TEXT NOT NULL REFERENCES permissions(id) ON DELETE CASCADE,
                scope_type TEXT NOT NULL,
                scope_value TEXT,
                granted_at INTEGER NOT NULL,
                granted_by TEXT,
                expires_at INTEGER,
                reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_upg_user ON user_permission_grants(user_id);

            CREATE TABLE IF NOT EXISTS resource_grants (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                permission_id TEXT NOT NULL REFERENCES permissions(id) ON DELETE CASCADE,
                granted_at INTEGER NOT NULL,
                granted_by TEXT,
                expires_at INTEGER,
                UNIQUE(user_id, resource_type, resource_id, permission_id)
            );
            CREATE INDEX IF NOT EXISTS idx_rg_user ON resource_grants(user_id);
            ",
        )?;

        // Idempotent migrations for schema evolution, following the
        // teacher's "ALTER TABLE ... ignore duplicate column" pattern.
        let migrations = [
            "ALTER TABLE users ADD COLUMN metadata_json TEXT",
        ];
        for sql in migrations {
            let _ = conn.execute(sql, []);
        }

        Ok(())
    }

    // ─── Users ─────────────────────────────────────────────────────────

    pub fn create_user(
        &self,
        id: &str,
        display_name: &str,
        email: Option<&str>,
    ) -> Result<User, rusqlite::Error> {
        let conn = self.conn.lock();
        let created_at = now_ms();
        conn.execute(
            "INSERT INTO users (id, display_name, email, created_at, is_active)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![id, display_name, email, to_millis(&created_at)],
        )?;
        Ok(User {
            id: id.to_string(),
            display_name: display_name.to_string(),
            email: email.map(String::from),
            created_at,
            last_login_at: None,
            is_active: true,
            metadata: None,
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, display_name, email, created_at, last_login_at, is_active, metadata_json
             FROM users WHERE email = ?1",
            params![email],
            map_user,
        )
        .optional()
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, display_name, email, created_at, last_login_at, is_active, metadata_json
             FROM users WHERE id = ?1",
            params![id],
            map_user,
        )
        .optional()
    }

    pub fn touch_user_login(&self, id: &str) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
            params![to_millis(&now_ms()), id],
        )?;
        Ok(())
    }

    /// Soft-deactivate or reactivate a user (§3 User lifecycle: never
    /// hard-deleted while credentials or audit refs exist). Deactivating a
    /// user does not revoke their existing sessions directly — G4 ("a
    /// session is valid only if its user is active") is enforced at token
    /// validation time instead, so deactivation takes effect immediately
    /// without walking every outstanding session row.
    pub fn set_user_active(&self, id: &str, is_active: bool) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET is_active = ?1 WHERE id = ?2",
            params![is_active as i64, id],
        )?;
        Ok(())
    }

    // ─── Credentials ───────────────────────────────────────────────────

    pub fn insert_credential(&self, cred: &Credential) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        let transports_json = cred
            .transports
            .as_ref()
            .map(|t| serde_json::to_string(t).unwrap_or_default());
        conn.execute(
            "INSERT INTO credentials
                (id, user_id, public_key, sign_count, aaguid, transports_json,
                 attestation_format, created_at, last_used_at, device_name,
                 backup_eligible, backed_up)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                cred.id,
                cred.user_id,
                cred.public_key,
                cred.sign_count,
                cred.aaguid,
                transports_json,
                cred.attestation_format,
                to_millis(&cred.created_at),
                cred.last_used_at.as_ref().map(to_millis),
                cred.device_name,
                cred.backup_eligible as i64,
                cred.backed_up as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_credential(&self, id: &str) -> Result<Option<Credential>, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, user_id, public_key, sign_count, aaguid, transports_json,
                    attestation_format, created_at, last_used_at, device_name,
                    backup_eligible, backed_up
             FROM credentials WHERE id = ?1",
            params![id],
            map_credential,
        )
        .optional()
    }

    /// Atomically verify-and-advance the sign counter. `verify` is called
    /// with the stored count; if it returns `Ok(new_count)` the row is
    /// updated in the same critical section, making the read-verify-CAS
    /// sequence atomic with respect to other completions for this
    /// credential (§5 sign-count update).
    pub fn compare_and_swap_sign_count<F>(
        &self,
        credential_id: &str,
        verify: F,
    ) -> Result<(), rusqlite::Error>
    where
        F: FnOnce(i64) -> Result<i64, rusqlite::Error>,
    {
        let conn = self.conn.lock();
        let stored: i64 = conn.query_row(
            "SELECT sign_count FROM credentials WHERE id = ?1",
            params![credential_id],
            |row| row.get(0),
        )?;
        let new_count = verify(stored)?;
        conn.execute(
            "UPDATE credentials SET sign_count = ?1, last_used_at = ?2 WHERE id = ?3",
            params![new_count, to_millis(&now_ms()), credential_id],
        )?;
        Ok(())
    }

    // ─── Challenges ────────────────────────────────────────────────────

    pub fn insert_challenge(
        &self,
        id: &str,
        user_id: Option<&str>,
        nonce: &[u8],
        kind: ChallengeKind,
        ttl: chrono::Duration,
    ) -> Result<Challenge, rusqlite::Error> {
        let conn = self.conn.lock();
        let created_at = now_ms();
        let expires_at = created_at + ttl;
        conn.execute(
            "INSERT INTO challenges (id, user_id, nonce, kind, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                user_id,
                nonce,
                kind.as_str(),
                to_millis(&created_at),
                to_millis(&expires_at),
            ],
        )?;
        Ok(Challenge {
            id: id.to_string(),
            user_id: user_id.map(String::from),
            nonce: nonce.to_vec(),
            kind,
            created_at,
            expires_at,
        })
    }

    /// Atomically find-and-delete a non-expired challenge by id. This is
    /// the ceremony's linearization point (§5): at most one concurrent
    /// completion for the same challenge id observes `Some`.
    pub fn take_challenge(&self, id: &str) -> Result<Option<Challenge>, rusqlite::Error> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, user_id, nonce, kind, created_at, expires_at
                 FROM challenges WHERE id = ?1",
                params![id],
                map_challenge,
            )
            .optional()?;
        let Some(challenge) = row else { return Ok(None) };
        let deleted = conn.execute("DELETE FROM challenges WHERE id = ?1", params![id])?;
        if deleted == 0 {
            // Another concurrent completion won the race.
            return Ok(None);
        }
        if challenge.expires_at <= now_ms() {
            return Ok(None);
        }
        Ok(Some(challenge))
    }

    pub fn purge_expired_challenges(&self) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM challenges WHERE expires_at <= ?1",
            params![to_millis(&now_ms())],
        )
    }

    // ─── Sessions ──────────────────────────────────────────────────────

    pub fn insert_session(
        &self,
        id: &str,
        user_id: &str,
        credential_id: Option<&str>,
        ttl: chrono::Duration,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Session, rusqlite::Error> {
        let conn = self.conn.lock();
        let created_at = now_ms();
        let expires_at = created_at + ttl;
        conn.execute(
            "INSERT INTO sessions
                (id, user_id, credential_id, created_at, expires_at, last_activity_at,
                 ip_address, user_agent, revoked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                id,
                user_id,
                credential_id,
                to_millis(&created_at),
                to_millis(&expires_at),
                to_millis(&created_at),
                ip_address,
                user_agent,
            ],
        )?;
        Ok(Session {
            id: id.to_string(),
            user_id: user_id.to_string(),
            credential_id: credential_id.map(String::from),
            created_at,
            expires_at,
            last_activity_at: created_at,
            ip_address: ip_address.map(String::from),
            user_agent: user_agent.map(String::from),
            revoked: false,
        })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, user_id, credential_id, created_at, expires_at, last_activity_at,
                    ip_address, user_agent, revoked
             FROM sessions WHERE id = ?1",
            params![id],
            map_session,
        )
        .optional()
    }

    /// Revoke a session; idempotent; returns `false` if no such row exists
    /// (bootstrap tokens minted before a session row is recorded are
    /// unrevocable by design, §4.2).
    pub fn revoke_session(&self, id: &str) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE sessions SET revoked = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(updated > 0)
    }

    pub fn touch_session_activity(&self, id: &str) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
            params![to_millis(&now_ms()), id],
        )?;
        Ok(())
    }

    pub fn purge_expired_sessions(&self) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1 AND revoked = 0",
            params![to_millis(&now_ms())],
        )
    }

    // ─── Roles & permissions ───────────────────────────────────────────

    pub fn upsert_role(
        &self,
        id: &str,
        name: &str,
        is_system: bool,
        description: Option<&str>,
    ) -> Result<Role, rusqlite::Error> {
        let conn = self.conn.lock();
        let created_at = now_ms();
        conn.execute(
            "INSERT INTO roles (id, name, description, is_system, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO NOTHING",
            params![id, name, description, is_system as i64, to_millis(&created_at)],
        )?;
        conn.query_row(
            "SELECT id, name, description, is_system, created_at, parent_role_id
             FROM roles WHERE name = ?1",
            params![name],
            map_role,
        )
    }

    pub fn get_role_by_name(&self, name: &str) -> Result<Option<Role>, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, description, is_system, created_at, parent_role_id
             FROM roles WHERE name = ?1",
            params![name],
            map_role,
        )
        .optional()
    }

    pub fn upsert_permission(
        &self,
        id: &str,
        code: &str,
        resource_type: &str,
        action: &str,
        description: Option<&str>,
    ) -> Result<Permission, rusqlite::Error> {
        let conn = self.conn.lock();
        let created_at = now_ms();
        conn.execute(
            "INSERT INTO permissions (id, code, resource_type, action, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(code) DO NOTHING",
            params![id, code, resource_type, action, description, to_millis(&created_at)],
        )?;
        conn.query_row(
            "SELECT id, code, resource_type, action, description, created_at
             FROM permissions WHERE code = ?1",
            params![code],
            map_permission,
        )
    }

    pub fn get_permission_by_code(&self, code: &str) -> Result<Option<Permission>, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, code, resource_type, action, description, created_at
             FROM permissions WHERE code = ?1",
            params![code],
            map_permission,
        )
        .optional()
    }

    pub fn link_role_permission(&self, role_id: &str, permission_id: &str) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO role_permissions (role_id, permission_id, granted_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(role_id, permission_id) DO NOTHING",
            params![role_id, permission_id, to_millis(&now_ms())],
        )?;
        Ok(())
    }

    pub fn assign_role(
        &self,
        user_id: &str,
        role_id: &str,
        granted_by: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_roles (user_id, role_id, granted_at, granted_by, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, role_id) DO UPDATE SET
                granted_by = excluded.granted_by,
                expires_at = excluded.expires_at",
            params![
                user_id,
                role_id,
                to_millis(&now_ms()),
                granted_by,
                expires_at.as_ref().map(to_millis),
            ],
        )?;
        Ok(())
    }

    /// The roles currently (non-expired) assigned to a user, in
    /// deterministic (granted_at, role name) order — used both for minting
    /// a token's roles list and for the authorization engine's role pass.
    pub fn get_user_roles(&self, user_id: &str) -> Result<Vec<Role>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.name, r.description, r.is_system, r.created_at, r.parent_role_id
             FROM user_roles ur
             JOIN roles r ON r.id = ur.role_id
             WHERE ur.user_id = ?1 AND (ur.expires_at IS NULL OR ur.expires_at > ?2)
             ORDER BY ur.granted_at ASC, r.name ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id, to_millis(&now_ms())], map_role)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Effective role-permission pairs for a user's currently-assigned
    /// roles, in deterministic order (role grant order, then permission
    /// code) — the iteration order the authorization engine's role pass
    /// relies on for "first matching role-permission wins" (§4.5.2).
    pub fn get_role_permissions_for_user(&self, user_id: &str) -> Result<Vec<RolePermission>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT r.name, p.code
             FROM user_roles ur
             JOIN roles r ON r.id = ur.role_id
             JOIN role_permissions rp ON rp.role_id = r.id
             JOIN permissions p ON p.id = rp.permission_id
             WHERE ur.user_id = ?1 AND (ur.expires_at IS NULL OR ur.expires_at > ?2)
             ORDER BY ur.granted_at ASC, rp.granted_at ASC, p.code ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id, to_millis(&now_ms())], |row| {
                Ok(RolePermission {
                    role_name: row.get(0)?,
                    code: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Direct user-permission grants ─────────────────────────────────

    pub fn insert_user_permission_grant(&self, grant: &UserPermissionGrant) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_permission_grants
                (id, user_id, permission_id, scope_type, scope_value, granted_at,
                 granted_by, expires_at, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                grant.id,
                grant.user_id,
                grant.permission_id,
                grant.scope_type.as_str(),
                grant.scope_value,
                to_millis(&grant.granted_at),
                grant.granted_by,
                grant.expires_at.as_ref().map(to_millis),
                grant.reason,
            ],
        )?;
        Ok(())
    }

    /// Non-expired direct grants for a user, joined with the permission's
    /// code, in deterministic (granted_at) order.
    pub fn get_user_permission_grants(
        &self,
        user_id: &str,
    ) -> Result<Vec<(UserPermissionGrant, String)>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT g.id, g.user_id, g.permission_id, g.scope_type, g.scope_value,
                    g.granted_at, g.granted_by, g.expires_at, g.reason, p.code
             FROM user_permission_grants g
             JOIN permissions p ON p.id = g.permission_id
             WHERE g.user_id = ?1 AND (g.expires_at IS NULL OR g.expires_at > ?2)
             ORDER BY g.granted_at ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id, to_millis(&now_ms())], |row| {
                let grant = UserPermissionGrant {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    permission_id: row.get(2)?,
                    scope_type: ScopeType::from_str(&row.get::<_, String>(3)?)
                        .unwrap_or(ScopeType::All),
                    scope_value: row.get(4)?,
                    granted_at: from_millis(row.get(5)?),
                    granted_by: row.get(6)?,
                    expires_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
                    reason: row.get(8)?,
                };
                let code: String = row.get(9)?;
                Ok((grant, code))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Resource grants ────────────────────────────────────────────────

    pub fn insert_resource_grant(&self, grant: &ResourceGrant) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO resource_grants
                (id, user_id, resource_type, resource_id, permission_id, granted_at,
                 granted_by, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id, resource_type, resource_id, permission_id) DO UPDATE SET
                granted_at = excluded.granted_at,
                granted_by = excluded.granted_by,
                expires_at = excluded.expires_at",
            params![
                grant.id,
                grant.user_id,
                grant.resource_type,
                grant.resource_id,
                grant.permission_id,
                to_millis(&grant.granted_at),
                grant.granted_by,
                grant.expires_at.as_ref().map(to_millis),
            ],
        )?;
        Ok(())
    }

    /// Look up a non-expired resource grant by exact `(user, type, id, permission-by-code)`.
    pub fn find_resource_grant(
        &self,
        user_id: &str,
        resource_type: &str,
        resource_id: &str,
        permission_code: &str,
    ) -> Result<Option<ResourceGrant>, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT g.id, g.user_id, g.resource_type, g.resource_id, g.permission_id,
                    g.granted_at, g.granted_by, g.expires_at
             FROM resource_grants g
             JOIN permissions p ON p.id = g.permission_id
             WHERE g.user_id = ?1 AND g.resource_type = ?2 AND g.resource_id = ?3
               AND p.code = ?4 AND (g.expires_at IS NULL OR g.expires_at > ?5)",
            params![user_id, resource_type, resource_id, permission_code, to_millis(&now_ms())],
            map_resource_grant,
        )
        .optional()
    }

    /// All non-expired resource grants for a user, with their permission
    /// code, for the effective-permission-set listing (§4.5.5).
    pub fn get_resource_grants_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<(ResourceGrant, String)>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT g.id, g.user_id, g.resource_type, g.resource_id, g.permission_id,
                    g.granted_at, g.granted_by, g.expires_at, p.code
             FROM resource_grants g
             JOIN permissions p ON p.id = g.permission_id
             WHERE g.user_id = ?1 AND (g.expires_at IS NULL OR g.expires_at > ?2)
             ORDER BY g.granted_at ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id, to_millis(&now_ms())], |row| {
                let grant = map_resource_grant(row)?;
                let code: String = row.get(8)?;
                Ok((grant, code))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Whether any role exists yet — used by the bootstrapper to detect an
    /// uninitialized store.
    pub fn has_any_role(&self) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM roles", [], |row| row.get(0))?;
        Ok(count > 0)
    }
}

fn map_user(row: &Row) -> rusqlite::Result<User> {
    let metadata_json: Option<String> = row.get(6)?;
    Ok(User {
        id: row.get(0)?,
        display_name: row.get(1)?,
        email: row.get(2)?,
        created_at: from_millis(row.get(3)?),
        last_login_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
        is_active: row.get::<_, i64>(5)? != 0,
        metadata: metadata_json.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn map_credential(row: &Row) -> rusqlite::Result<Credential> {
    let transports_json: Option<String> = row.get(5)?;
    Ok(Credential {
        id: row.get(0)?,
        user_id: row.get(1)?,
        public_key: row.get(2)?,
        sign_count: row.get(3)?,
        aaguid: row.get(4)?,
        transports: transports_json.and_then(|s| serde_json::from_str(&s).ok()),
        attestation_format: row.get(6)?,
        created_at: from_millis(row.get(7)?),
        last_used_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
        device_name: row.get(9)?,
        backup_eligible: row.get::<_, i64>(10)? != 0,
        backed_up: row.get::<_, i64>(11)? != 0,
    })
}

fn map_challenge(row: &Row) -> rusqlite::Result<Challenge> {
    let kind_str: String = row.get(3)?;
    Ok(Challenge {
        id: row.get(0)?,
        user_id: row.get(1)?,
        nonce: row.get(2)?,
        kind: ChallengeKind::from_str(&kind_str).unwrap_or(ChallengeKind::Authentication),
        created_at: from_millis(row.get(4)?),
        expires_at: from_millis(row.get(5)?),
    })
}

fn map_session(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        credential_id: row.get(2)?,
        created_at: from_millis(row.get(3)?),
        expires_at: from_millis(row.get(4)?),
        last_activity_at: from_millis(row.get(5)?),
        ip_address: row.get(6)?,
        user_agent: row.get(7)?,
        revoked: row.get::<_, i64>(8)? != 0,
    })
}

fn map_role(row: &Row) -> rusqlite::Result<Role> {
    Ok(Role {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        is_system: row.get::<_, i64>(3)? != 0,
        created_at: from_millis(row.get(4)?),
        parent_role_id: row.get(5)?,
    })
}

fn map_permission(row: &Row) -> rusqlite::Result<Permission> {
    Ok(Permission {
        id: row.get(0)?,
        code: row.get(1)?,
        resource_type: row.get(2)?,
        action: row.get(3)?,
        description: row.get(4)?,
        created_at: from_millis(row.get(5)?),
    })
}

fn map_resource_grant(row: &Row) -> rusqlite::Result<ResourceGrant> {
    Ok(ResourceGrant {
        id: row.get(0)?,
        user_id: row.get(1)?,
        resource_type: row.get(2)?,
        resource_id: row.get(3)?,
        permission_id: row.get(4)?,
        granted_at: from_millis(row.get(5)?),
        granted_by: row.get(6)?,
        expires_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
    })
}
