use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{ConfigCommand, ContentCommand, SettingsCommand, StatusCommand, UserCommand};
use dualsync::config::Config;
use dualsync::{DualStoreSync, StoreContext, Subscription};

#[derive(Parser)]
#[command(name = "dualsync")]
#[command(version)]
#[command(
    about = "Read and write records kept in both the document store and the tree store",
    long_about = None
)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage users
    User(UserCommand),

    /// Read and write system settings
    Settings(SettingsCommand),

    /// Manage chapter content and links
    Content(ContentCommand),

    /// Check that both stores are reachable
    Status(StatusCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dualsync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::User(cmd)) => {
            let (sync, _token_refresh) = connect(&config).await?;
            cmd.run(&sync).await?;
        }
        Some(Commands::Settings(cmd)) => {
            let (sync, _token_refresh) = connect(&config).await?;
            cmd.run(&sync).await?;
        }
        Some(Commands::Content(cmd)) => {
            let (sync, _token_refresh) = connect(&config).await?;
            cmd.run(&sync).await?;
        }
        Some(Commands::Status(cmd)) => {
            let (sync, _token_refresh) = connect(&config).await?;
            cmd.run(&sync).await?;
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(&config)?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}

/// Builds the REST-backed sync layer and signs in when credentials are set.
///
/// When signed in, the returned handle keeps the ID token refreshed until it
/// is dropped.
async fn connect(
    config: &Config,
) -> Result<(DualStoreSync, Option<Subscription>), Box<dyn std::error::Error>> {
    let backend = config.active_backend();
    let (context, identity) = StoreContext::remote(
        &backend,
        Duration::from_millis(config.watch_interval_ms.value),
    );

    let token_refresh =
        if let (Some(email), Some(password)) = (&config.auth.email, &config.auth.password) {
            identity.sign_in_with_password(email, password).await?;
            Some(identity.keep_fresh())
        } else {
            tracing::debug!("No credentials configured, continuing unauthenticated");
            None
        };

    Ok((DualStoreSync::new(context), token_refresh))
}
