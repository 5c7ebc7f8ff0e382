//! DAX 1-minute scalper for the IG REST dealing API.
//!
//! Opens one small position at a time inside fixed Berlin-time session
//! windows, aims for a fixed euro amount per trade, and stops for the day
//! once the daily target estimate is reached.

mod api;
mod bot;
mod indicators;
mod models;
mod trading;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::api::IgCredentials;
use crate::bot::{Bot, BotConfig};
use crate::trading::{SessionConfig, SignalKind, StrategyConfig, TradingConfig};

/// DAX scalper CLI.
#[derive(Parser)]
#[command(name = "dax-scalper")]
#[command(about = "Session-windowed DAX scalper on the IG REST API", long_about = None)]
struct Cli {
    /// IG API key
    #[arg(long, env = "IG_API_KEY", hide_env_values = true)]
    api_key: String,

    /// IG username
    #[arg(long, env = "IG_USERNAME")]
    username: String,

    /// IG password
    #[arg(long, env = "IG_PASSWORD", hide_env_values = true)]
    password: String,

    /// IG account to trade on (defaults to the login's current account)
    #[arg(long, env = "IG_ACCOUNT_ID")]
    account_id: Option<String>,

    /// Trade the live environment instead of demo
    #[arg(long, env = "IG_LIVE")]
    live: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading session
    Run {
        /// Epic to trade; discovered by market search when omitted
        #[arg(long, env = "IG_EPIC")]
        epic: Option<String>,

        /// Direction signal (micro_momentum, moving_average, rsi,
        /// stochastic, parabolic_sar)
        #[arg(long, default_value = "micro_momentum")]
        signal: String,

        /// Session windows as comma-separated HH:MM-HH:MM, Berlin time
        #[arg(long)]
        windows: Option<String>,

        /// Log intents without placing deals
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the effective configuration
    Config,

    /// Close every open position on the account, then exit
    CloseAll,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let credentials = IgCredentials {
        api_key: cli.api_key.clone(),
        username: cli.username.clone(),
        password: cli.password.clone(),
        account_id: cli.account_id.clone(),
        demo: !cli.live,
    };

    match cli.command {
        Commands::Run {
            epic,
            signal,
            windows,
            dry_run,
        } => {
            let session = match windows.as_deref() {
                Some(spec) => SessionConfig::from_spec(spec)?,
                None => SessionConfig::default(),
            };
            let config = BotConfig {
                epic,
                dry_run,
                trading: TradingConfig::default(),
                signal: SignalKind::from_str(&signal),
                strategy: StrategyConfig::default(),
                session,
            };
            let mut bot = Bot::new(config, credentials)?;
            bot.run().await?;
        }

        Commands::Config => {
            let trading = TradingConfig::default();
            let session = SessionConfig::default();
            println!("{}", serde_json::to_string_pretty(&trading)?);
            println!("session windows (Berlin): {}", session.describe());
        }

        Commands::CloseAll => {
            let bot = Bot::new(BotConfig::default(), credentials)?;
            let closed = bot.run_close_all().await?;
            println!("Closed {} position(s)", closed);
        }
    }

    Ok(())
}
