mod backends;
mod config;
mod serve_cmd;
mod status_cmd;
mod submit_cmd;
mod tail_cmd;

#[cfg(test)]
mod test_util;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use verdict_core::event::Cursor;
use verdict_db::pool;

use backends::Backends;
use config::VerdictConfig;
use submit_cmd::Input;

#[derive(Parser)]
#[command(name = "verdict", about = "Job event relay for fact-check verification")]
struct Cli {
    /// Database URL (overrides VERDICT_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a verdict config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/verdict")]
        db_url: String,
        /// Agent executable that verifies a text
        #[arg(long)]
        agent_command: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the verdict database (requires config file or env vars)
    DbInit,
    /// Serve the HTTP and SSE API
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 3000)]
        port: u16,
        /// Replay this JSONL transcript instead of running the agent
        #[arg(long)]
        replay: Option<PathBuf>,
    },
    /// Verify a text in this process and follow its events
    Submit {
        /// Text to verify (reads --file or stdin when omitted)
        text: Option<String>,
        /// Read the text from a file
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,
        /// Check ID (a random UUID when omitted)
        #[arg(long)]
        check_id: Option<String>,
        /// Owner recorded on the check
        #[arg(long)]
        owner: Option<String>,
        /// Replay this JSONL transcript instead of running the agent
        #[arg(long)]
        replay: Option<PathBuf>,
    },
    /// Follow a check's event stream
    Tail {
        /// Check ID to follow
        check_id: String,
        /// Resume after this event seq
        #[arg(long)]
        cursor: Option<i64>,
    },
    /// Show a check's record (omit check_id to list checks)
    Status {
        /// Check ID to show (omit to list)
        check_id: Option<String>,
        /// Only list checks of this owner
        #[arg(long)]
        owner: Option<String>,
    },
    /// Delete expired event logs
    Purge,
}

/// Execute the `verdict init` command: write config file.
fn cmd_init(db_url: &str, agent_command: Option<String>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
            max_connections: None,
        },
        agent: config::AgentSection {
            command: agent_command,
            ..config::AgentSection::default()
        },
        relay: config::RelaySection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    match &cfg.agent.command {
        Some(command) => println!("  agent.command = {command}"),
        None => println!("  agent.command is unset; use --replay or set VERDICT_AGENT_COMMAND"),
    }
    println!();
    println!("Next: run `verdict db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `verdict db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = VerdictConfig::resolve(cli_db_url)?;

    println!("Initializing verdict database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("verdict db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            db_url,
            agent_command,
            force,
        } => {
            cmd_init(&db_url, agent_command, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port, replay } => {
            let resolved = VerdictConfig::resolve(cli.database_url.as_deref())?;
            let runner = backends::agent_runner(&resolved, replay.as_deref())?;
            let backends = Backends::connect(&resolved).await?;
            let result = serve_cmd::run_serve(backends.service(runner), &bind, port).await;
            backends.close().await;
            result?;
        }
        Commands::Submit {
            text,
            file,
            check_id,
            owner,
            replay,
        } => {
            let resolved = VerdictConfig::resolve(cli.database_url.as_deref())?;
            let runner = backends::agent_runner(&resolved, replay.as_deref())?;
            let input = match (&text, &file) {
                (Some(text), _) => Input::Text(text),
                (None, Some(path)) => Input::File(path),
                (None, None) => Input::Stdin,
            };
            let backends = Backends::connect(&resolved).await?;
            let result =
                submit_cmd::run_submit(&backends.service(runner), input, check_id, owner).await;
            backends.close().await;
            result?;
        }
        Commands::Tail { check_id, cursor } => {
            let resolved = VerdictConfig::resolve(cli.database_url.as_deref())?;
            let backends = Backends::connect(&resolved).await?;
            let cursor = match cursor {
                Some(seq) if seq > 0 => Cursor::After(seq),
                _ => Cursor::Start,
            };
            let result = tail_cmd::run_tail(&backends, &check_id, cursor).await;
            backends.close().await;
            result?;
        }
        Commands::Status { check_id, owner } => {
            let resolved = VerdictConfig::resolve(cli.database_url.as_deref())?;
            let backends = Backends::connect(&resolved).await?;
            let result = status_cmd::run_status(
                backends.store.as_ref(),
                check_id.as_deref(),
                owner.as_deref(),
            )
            .await;
            backends.close().await;
            result?;
        }
        Commands::Purge => {
            let resolved = VerdictConfig::resolve(cli.database_url.as_deref())?;
            let backends = Backends::connect(&resolved).await?;
            let result = backends.log.purge_expired().await;
            backends.close().await;
            println!("Purged {} expired event log(s).", result?);
        }
    }

    Ok(())
}
