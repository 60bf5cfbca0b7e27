//! Background sweeper (§5 "periodic work") — purges expired challenges
//! and expired sessions at a bounded cadence. Best-effort: expired rows
//! are also filtered on read, so a missed or failed sweep tick never
//! causes an incorrect allow/validate decision.

use crate::db::Db;
use std::sync::Arc;
use std::time::Duration;

pub fn spawn(db: Arc<Db>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match db.purge_expired_challenges() {
                Ok(n) if n > 0 => tracing::debug!(count = n, "swept expired challenges"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "challenge sweep failed"),
            }
            match db.purge_expired_sessions() {
                Ok(n) if n > 0 => tracing::debug!(count = n, "swept expired sessions"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "session sweep failed"),
            }
        }
    });
}
