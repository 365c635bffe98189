use chrono::{Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use log::info;

mod classifier;
mod config;
mod database;
mod error;
mod models;
mod pipeline;
mod report;
mod telegram;
mod text;

use crate::classifier::{Classifier, RiskDetector, TRAINING_SAMPLE};
use crate::config::{Config, TelegramConfig};
use crate::database::MessageFilter;
use crate::models::{NewChannel, Sentiment};
use crate::telegram::TelegramSource;

/// Collects public Telegram channel history and flags risky content.
#[derive(Parser, Debug)]
#[command(name = "telegram-observatory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch new messages from every active channel
    Collect,
    /// Classify messages that have not been analyzed yet
    Analyze,
    /// Print dashboard statistics
    Report,
    /// List monitored channels
    Channels,
    /// List collected messages, newest first
    Messages {
        /// Only messages from this channel (local id)
        #[arg(long)]
        channel: Option<i64>,
        /// Only risky (true) or non-risky (false) messages
        #[arg(long)]
        risk: Option<bool>,
        /// positive, neutral or negative
        #[arg(long)]
        sentiment: Option<Sentiment>,
        /// Only messages published within this period
        #[arg(long, value_enum)]
        period: Option<Period>,
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
    /// Register a public channel for monitoring
    AddChannel {
        #[arg(long)]
        name: String,
        /// Numeric channel id used by the Telegram API
        #[arg(long)]
        telegram_id: i64,
        /// Public @handle
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        invite_link: Option<String>,
    },
    /// Stop collecting from a channel
    Pause { channel: i64 },
    /// Resume collecting from a channel
    Resume { channel: i64 },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Period {
    #[value(name = "7d")]
    Week,
    #[value(name = "30d")]
    Month,
}

impl Period {
    fn days(self) -> i64 {
        match self {
            Period::Week => 7,
            Period::Month => 30,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    simple_logger::SimpleLogger::new()
        .with_level(config.log_level)
        .init()?;

    let conn = database::init_db(&config.db_path)?;

    match cli.command {
        Command::Collect => {
            let telegram_config = TelegramConfig::from_env()?;
            let client = telegram::connect(&telegram_config).await?;
            let source = TelegramSource::new(client);
            let summary = pipeline::run_collection(&source, &conn, &config.collect).await?;
            info!(
                "Collection finished: {} channels, {} failed, {} messages stored.",
                summary.channels, summary.channels_failed, summary.stored
            );
        }
        Command::Analyze => {
            let classifier = Classifier::new(RiskDetector::train(TRAINING_SAMPLE));
            pipeline::run_analysis(&conn, &classifier, config.analyze_batch_size)?;
        }
        Command::Report => report::print_dashboard(&conn)?,
        Command::Channels => report::print_channels(&conn)?,
        Command::Messages {
            channel,
            risk,
            sentiment,
            period,
            page,
        } => {
            let filter = MessageFilter {
                channel_id: channel,
                is_risk: risk,
                sentiment,
                since: period.map(|p| Utc::now() - Duration::days(p.days())),
            };
            report::print_messages(&conn, &filter, page)?;
        }
        Command::AddChannel {
            name,
            telegram_id,
            username,
            invite_link,
        } => {
            let channel = NewChannel {
                name,
                telegram_id,
                username: username.map(|u| u.trim_start_matches('@').to_string()),
                invite_link,
            };
            let id = database::add_channel(&conn, &channel)?;
            info!("Channel \"{}\" registered with id {}.", channel.name, id);
        }
        Command::Pause { channel } => set_active(&conn, channel, false)?,
        Command::Resume { channel } => set_active(&conn, channel, true)?,
    }

    Ok(())
}

fn set_active(conn: &rusqlite::Connection, channel: i64, active: bool) -> anyhow::Result<()> {
    if !database::set_channel_active(conn, channel, active)? {
        anyhow::bail!("No channel with id {}", channel);
    }
    info!(
        "Channel {} {}.",
        channel,
        if active { "resumed" } else { "paused" }
    );
    Ok(())
}
