//! Standalone bootstrap binary — seeds default roles and permissions
//! against a store without starting the HTTP gateway. Useful for
//! provisioning a fresh deployment ahead of the first `authority-server`
//! start.

use authority_server::bootstrap;
use authority_server::db::Db;
use clap::Parser;

#[derive(Parser)]
#[command(name = "authority-bootstrap", about = "Seed default roles and permissions")]
struct Args {
    /// Filesystem path to the SQLite store.
    #[arg(long, env = "AUTHORITY_DB_PATH", default_value = "authority.db")]
    db_path: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let db = Db::open(&args.db_path)?;
    bootstrap::seed(&db)?;
    tracing::info!(db_path = %args.db_path, "bootstrap seed complete");
    Ok(())
}
