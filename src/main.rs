use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use haulage::config::Config;
use haulage::daemon::Daemon;
use haulage::storage::mysql::Gateway;

#[derive(Parser, Debug)]
#[command(name = "haulage")]
#[command(about = "A small-scale traffic monitor and policy enforcer")]
struct Args {
    /// The path of the configuration file
    #[arg(short, long, default_value = "/etc/haulage/config.yml")]
    config: PathBuf,

    /// Run pending schema migrations against the configured database
    #[arg(long)]
    db_upgrade: bool,

    /// The directory containing database migration files
    #[arg(long, default_value = "/usr/share/haulage/migrations")]
    db_migration_directory: PathBuf,

    /// Show debug log information
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "haulage=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = Config::load(&args.config)?;
    tracing::debug!(?config, "configuration loaded");

    if args.db_upgrade {
        tracing::warn!("running database migrations, this cannot be easily undone");
        let gateway = Gateway::connect(
            &config.custom.db_location,
            &config.custom.db_user,
            &config.custom.db_pass,
        )
        .await
        .context("unable to connect to the backing database")?;
        gateway.migrate(&args.db_migration_directory).await?;
        tracing::info!("migrations complete, exiting");
        return Ok(());
    }

    Daemon::new(config).run().await
}
