use anyhow::Result;
use authority_server::config::Config;
use authority_server::db::Db;
use authority_server::gateway::{self, AppState};
use authority_server::token::TokenService;
use authority_server::webauthn::RelyingParty;
use authority_server::{bootstrap, sweeper};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("AUTHORITY_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("authority_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = Config::parse();
    let signing_key = config.resolve_signing_key()?;

    let db = Arc::new(Db::open(&config.db_path)?);
    if !db.has_any_role()? {
        tracing::info!("uninitialized store detected, seeding default roles and permissions");
    }
    bootstrap::seed(&db)?;

    let state = AppState {
        db: db.clone(),
        tokens: Arc::new(TokenService::new(signing_key)),
        rp: Arc::new(RelyingParty { server_domain: config.server_domain.clone(), origins: config.origins() }),
        session_lifetime: config.session_lifetime(),
        challenge_lifetime: config.challenge_lifetime(),
    };

    sweeper::spawn(db.clone(), std::time::Duration::from_secs(config.sweep_interval_secs));

    tracing::info!(addr = %config.listen_addr, "starting authority server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, gateway::router(state)).await?;
    Ok(())
}
