mod config;
mod server;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use conductor_core::settings::Settings;
use conductor_db::pool;

use config::ConductorConfig;

/// Exit code for configuration errors.
const EXIT_CONFIG: u8 = 1;
/// Exit code when the store is unreachable at startup.
const EXIT_STORE: u8 = 2;

#[derive(Parser)]
#[command(
    name = "conductor",
    about = "Control plane for a fleet of autonomous agent pods"
)]
struct Cli {
    /// Database URL (overrides CONDUCTOR_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a conductor config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/conductor")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create and migrate the conductor database
    DbInit,
    /// Run the orchestrator: HTTP API plus background scheduler
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

/// Startup failure, split by the exit code it maps to.
enum FatalError {
    /// Bad configuration: exit 1.
    Config(anyhow::Error),
    /// Store unreachable at startup: exit 2.
    Store(anyhow::Error),
    /// Any other runtime failure: exit 1.
    Runtime(anyhow::Error),
}

/// Execute the `conductor init` command: write the config file.
fn cmd_init(db_url: &str, force: bool) -> Result<(), FatalError> {
    let path = config::config_path();

    if path.exists() && !force {
        return Err(FatalError::Config(anyhow::anyhow!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        )));
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
    };
    config::save_config(&cfg).map_err(FatalError::Config)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `conductor db-init` to create and migrate the database.");
    Ok(())
}

/// Execute the `conductor db-init` command: create database, run
/// migrations, print table counts.
async fn cmd_db_init(cli_db_url: Option<&str>) -> Result<(), FatalError> {
    let resolved = ConductorConfig::resolve(cli_db_url).map_err(FatalError::Config)?;

    println!("Initializing conductor database...");

    pool::ensure_database_exists(&resolved.db_config)
        .await
        .map_err(FatalError::Store)?;

    let db_pool = pool::create_pool(&resolved.db_config)
        .await
        .map_err(FatalError::Store)?;

    pool::run_migrations(&db_pool, pool::default_migrations_path())
        .await
        .map_err(FatalError::Store)?;

    let counts = pool::table_counts(&db_pool)
        .await
        .map_err(FatalError::Store)?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("conductor db-init complete.");
    Ok(())
}

/// Execute the `conductor serve` command.
async fn cmd_serve(cli_db_url: Option<&str>, bind: &str, port: u16) -> Result<(), FatalError> {
    let resolved = ConductorConfig::resolve(cli_db_url).map_err(FatalError::Config)?;
    let settings = Arc::new(Settings::from_env().map_err(FatalError::Config)?);

    let db_pool = pool::create_pool(&resolved.db_config)
        .await
        .map_err(FatalError::Store)?;
    pool::ping(&db_pool).await.map_err(FatalError::Store)?;
    pool::run_migrations(&db_pool, pool::default_migrations_path())
        .await
        .map_err(FatalError::Store)?;

    let result = server::run_serve(db_pool.clone(), settings, bind, port)
        .await
        .map_err(FatalError::Runtime);
    db_pool.close().await;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init { ref db_url, force } => cmd_init(db_url, force),
        Commands::DbInit => cmd_db_init(cli.database_url.as_deref()).await,
        Commands::Serve { ref bind, port } => {
            cmd_serve(cli.database_url.as_deref(), bind, port).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(FatalError::Config(err)) => {
            eprintln!("configuration error: {err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(FatalError::Store(err)) => {
            eprintln!("store unreachable: {err:#}");
            ExitCode::from(EXIT_STORE)
        }
        Err(FatalError::Runtime(err)) => {
            eprintln!("{err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}
