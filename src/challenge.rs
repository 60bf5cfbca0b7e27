//! Challenge store — short-lived nonces bound to a ceremony kind, an
//! optional user, and an expiry. A thin, single-use-by-construction layer
//! over the persistence layer's challenge table.

use crate::db::{Challenge, ChallengeKind, Db};
use rand::RngCore;

pub struct ChallengeStore<'a> {
    db: &'a Db,
    ttl: chrono::Duration,
}

impl<'a> ChallengeStore<'a> {
    pub fn new(db: &'a Db, ttl: chrono::Duration) -> Self {
        ChallengeStore { db, ttl }
    }

    /// Generate a 32-byte random nonce and persist a new challenge row.
    /// Returns the challenge (its `id` is what callers hand back to
    /// clients as `challengeId`).
    pub fn begin(&self, user_id: Option<&str>, kind: ChallengeKind) -> Result<Challenge, rusqlite::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.db.insert_challenge(&id, user_id, &nonce, kind, self.ttl)
    }

    /// Atomically consume a challenge by id. Returns `None` in all three
    /// "not found" cases (absent, expired, already consumed) — the lookup
    /// is deliberately indistinguishable to prevent oracles (§4.3).
    pub fn take(&self, id: &str) -> Result<Option<Challenge>, rusqlite::Error> {
        self.db.take_challenge(id)
    }

    pub fn purge_expired(&self) -> Result<usize, rusqlite::Error> {
        self.db.purge_expired_challenges()
    }
}
