use anyhow::Result;
use clap::{Parser, Subcommand};

pub mod ask;
pub mod chat;

use crate::core::AppConfig;

#[derive(Subcommand)]
enum Command {
    /// Start an interactive chat session (the default)
    Chat {
        /// Override the system prompt for this session
        #[arg(long)]
        system_prompt: Option<String>,
    },
    /// Send a single message and stream the response to stdout
    Ask {
        message: String,

        /// Override the system prompt for this message
        #[arg(long)]
        system_prompt: Option<String>,
    },
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

pub async fn run() -> Result<()> {
    let args = Cli::parse();
    let config = AppConfig::from_env()?;

    match args.command {
        Some(Command::Chat { system_prompt }) => {
            chat::run(config, system_prompt).await?;
        }
        Some(Command::Ask {
            message,
            system_prompt,
        }) => {
            ask::run(config, &message, system_prompt).await?;
        }
        None => {
            chat::run(config, None).await?;
        }
    }

    Ok(())
}
