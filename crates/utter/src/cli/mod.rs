//! Utter app cli definition and entrypoint.
mod ask;
mod chat;
mod speak;
pub mod ux;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use utter_core::config::{Config, get_config};

use crate::log::setup_logging;

/// Utter - chat with a language model, one sentence at a time.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose logs.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the default one.
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask a question and print the whole reply.
    Ask {
        /// Question to ask.
        text: Vec<String>,
        /// Backend to use, must be defined in the config.
        #[arg(short, long)]
        backend: Option<String>,
    },
    /// Ask a question and print the reply sentence by sentence.
    Speak {
        /// Question to ask.
        text: Vec<String>,
        /// Backend to use, must be defined in the config.
        #[arg(short, long)]
        backend: Option<String>,
    },
    /// Chat with a backend, replies stream sentence by sentence.
    Chat {
        /// Backend to use, must be defined in the config.
        #[arg(short, long)]
        backend: Option<String>,
    },
}

/// Runs the main CLI application.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        setup_logging().context("Failed to set up logging")?;
    }

    let config = get_config(cli.config).context("Failed to load configuration")?;

    match cli.command {
        Commands::Ask { text, backend } => {
            let config = with_backend(config, backend.as_deref())?;
            ask::execute(&text.join(" "), &config).await
        }
        Commands::Speak { text, backend } => {
            let config = with_backend(config, backend.as_deref())?;
            speak::execute(&text.join(" "), &config).await
        }
        Commands::Chat { backend } => {
            let config = with_backend(config, backend.as_deref())?;
            chat::execute(&config).await
        }
    }
}

/// Replaces the chat backend with the one named on the command line.
fn with_backend(mut config: Config, backend: Option<&str>) -> Result<Config> {
    if let Some(name) = backend {
        config.chat.backend = config
            .backend(name)
            .with_context(|| format!("Backend '{name}' not found in config."))?;
    }
    Ok(config)
}

/// Rejects empty questions before any backend is created.
fn require_text(text: &str) -> Result<&str> {
    let text = text.trim();
    anyhow::ensure!(!text.is_empty(), "Nothing to ask, provide some text.");
    Ok(text)
}
