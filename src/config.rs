//! Startup configuration, parsed from CLI flags with environment variable
//! fallbacks via `clap`'s `env` feature — the same `Parser::parse()` idiom
//! the teacher's server binary uses for its own config struct.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "authority-server", about = "Passkey auth and authorization service")]
pub struct Config {
    /// Filesystem path to the SQLite store.
    #[arg(long, env = "AUTHORITY_DB_PATH", default_value = "authority.db")]
    pub db_path: String,

    /// Base64url-encoded 32-byte HMAC signing key.
    #[arg(long, env = "AUTHORITY_SIGNING_KEY")]
    pub signing_key: Option<String>,

    /// Synthesize a zero-filled signing key when none is configured.
    /// Permitted only for test fixtures (§4.7).
    #[arg(long, env = "AUTHORITY_ALLOW_TEST_KEY", default_value_t = false)]
    pub allow_test_key: bool,

    /// Relying-party identifier (Fido2:ServerDomain), e.g. `example.com`.
    #[arg(long, env = "AUTHORITY_SERVER_DOMAIN")]
    pub server_domain: String,

    /// Comma-separated permitted full origins (Fido2:Origins).
    #[arg(long, env = "AUTHORITY_ORIGINS")]
    pub origins: String,

    /// Acceptable ceremony timestamp skew, milliseconds.
    #[arg(long, env = "AUTHORITY_DRIFT_TOLERANCE_MS", default_value_t = 300_000)]
    pub drift_tolerance_ms: i64,

    /// Default session/token lifetime, seconds.
    #[arg(long, env = "AUTHORITY_SESSION_LIFETIME_SECS", default_value_t = 3600)]
    pub session_lifetime_secs: i64,

    /// Challenge TTL, seconds.
    #[arg(long, env = "AUTHORITY_CHALLENGE_LIFETIME_SECS", default_value_t = 300)]
    pub challenge_lifetime_secs: i64,

    /// Address the HTTP server binds to.
    #[arg(long, env = "AUTHORITY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Cadence of the background expired-row sweeper, seconds.
    #[arg(long, env = "AUTHORITY_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn origins(&self) -> Vec<String> {
        self.origins.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
    }

    /// Resolve the 32-byte signing key, applying the test-fixture fallback
    /// only when explicitly permitted.
    pub fn resolve_signing_key(&self) -> anyhow::Result<[u8; 32]> {
        match &self.signing_key {
            Some(encoded) => {
                let bytes = crate::codec::decode(encoded)
                    .map_err(|e| anyhow::anyhow!("invalid signing key encoding: {e}"))?;
                if bytes.len() != 32 {
                    anyhow::bail!("signing key must decode to exactly 32 bytes, got {}", bytes.len());
                }
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                Ok(key)
            }
            None if self.allow_test_key => {
                tracing::warn!("no signing key configured; using zero-filled test key");
                Ok([0u8; 32])
            }
            None => anyhow::bail!(
                "no signing key configured; set --signing-key / AUTHORITY_SIGNING_KEY, or pass \
                 --allow-test-key for local test fixtures"
            ),
        }
    }

    pub fn session_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_lifetime_secs)
    }

    pub fn challenge_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.challenge_lifetime_secs)
    }
}
