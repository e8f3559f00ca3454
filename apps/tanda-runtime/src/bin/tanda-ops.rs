use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tanda_runtime::{
    Stores, assemble_state, clock, config::Config, db::TandaDb, notifications::LogNotifier,
    server::AppState,
};

#[derive(Parser)]
#[command(name = "tanda-ops")]
#[command(about = "Maintenance commands for the tanda runtime database")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(name = "invitations:cleanup")]
    InvitationsCleanup,
    #[command(name = "mfa:reset-lockout")]
    MfaResetLockout(MfaResetLockoutArgs),
    #[command(name = "db:migrate")]
    DbMigrate,
}

#[derive(Args)]
struct MfaResetLockoutArgs {
    #[arg(long)]
    email: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("load tanda config")?;
    let db = connect(&config).await?;
    match cli.command {
        Commands::InvitationsCleanup => run_invitations_cleanup(config, db).await,
        Commands::MfaResetLockout(args) => run_mfa_reset_lockout(config, db, args).await,
        Commands::DbMigrate => db.migrate().await,
    }
}

async fn connect(config: &Config) -> Result<Arc<TandaDb>> {
    let url = config
        .db_url
        .as_deref()
        .ok_or_else(|| anyhow!("DB_URL must be set for tanda-ops"))?;
    Ok(Arc::new(TandaDb::connect(url).await?))
}

fn state(config: Config, db: Arc<TandaDb>) -> AppState {
    assemble_state(
        config,
        Stores::postgres(db),
        clock::system(),
        Arc::new(LogNotifier),
    )
}

async fn run_invitations_cleanup(config: Config, db: Arc<TandaDb>) -> Result<()> {
    let report = state(config, db)
        .invitations()
        .cleanup_expired()
        .await
        .context("sweep expired invitations")?;
    println!("expired {} invitation(s)", report.expired);
    Ok(())
}

async fn run_mfa_reset_lockout(
    config: Config,
    db: Arc<TandaDb>,
    args: MfaResetLockoutArgs,
) -> Result<()> {
    let user_id = state(config, db)
        .accounts()
        .reset_mfa_lockout(&args.email)
        .await
        .with_context(|| format!("reset mfa lockout for {}", args.email))?;
    println!("cleared mfa lockout for {user_id}");
    Ok(())
}
