//! studio: command-line client for a local OpenAI-compatible model server

mod commands;
mod repl;
mod tools;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use studio_core::{Config, StudioError};
use tracing_subscriber::EnvFilter;

use crate::commands::{BOLD, RED, RESET, YELLOW};

#[derive(Debug, Parser)]
#[command(name = "studio")]
#[command(about = "Chat with models served by a local OpenAI-compatible server", version)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to studio.toml (searched for when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server base URL, e.g. http://localhost:1234/v1
    #[arg(long, global = true, env = "STUDIO_BASE_URL")]
    base_url: Option<String>,

    /// API key sent as bearer token
    #[arg(long, global = true, env = "STUDIO_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model to use (overrides config)
    #[arg(short, long, global = true, env = "STUDIO_MODEL")]
    model: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show server status and loaded models
    Status,

    /// List loaded models
    Models {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// One-shot query (non-interactive)
    Ask {
        /// The prompt to send
        #[arg(required = true)]
        prompt: Vec<String>,

        /// Constrain the answer to the JSON schema in this file
        #[arg(long, value_name = "FILE", conflicts_with = "stream")]
        json_schema: Option<PathBuf>,

        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,

        /// System prompt
        #[arg(short, long)]
        system: Option<String>,
    },

    /// Start interactive chat REPL
    Chat {
        /// System prompt
        #[arg(short, long)]
        system: Option<String>,

        /// Load a saved conversation
        #[arg(long)]
        load: Option<String>,
    },

    /// Run a task with the built-in tools
    Agent {
        /// The task to perform
        #[arg(required = true)]
        task: Vec<String>,

        /// Only use structured tool calls; never parse them out of the reply text
        #[arg(long)]
        no_fallback: bool,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Load the config file and apply command-line overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match cli.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load().context("Failed to load studio.toml")?,
    };

    if let Some(ref url) = cli.base_url {
        config.server.base_url = url.clone();
    }
    if let Some(ref key) = cli.api_key {
        config.server.api_key = key.clone();
    }
    if let Some(ref model) = cli.model {
        config.server.default_model = Some(model.clone());
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Some(Commands::Status) => commands::status(&config).await,
        Some(Commands::Models { json }) => commands::models(&config, json).await,
        Some(Commands::Ask {
            prompt,
            json_schema,
            stream,
            system,
        }) => {
            let prompt_text = prompt.join(" ");
            commands::ask(&config, &prompt_text, json_schema, stream, system).await
        }
        Some(Commands::Chat { system, load }) => repl::run(&config, system, load).await,
        Some(Commands::Agent {
            task,
            no_fallback,
            json,
        }) => commands::agent(&config, &task.join(" "), !no_fallback, json).await,
        None => {
            // Default to chat REPL when no command specified
            repl::run(&config, None, None).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}Error:{} {:#}", RED, RESET, e);
            if let Some(hint) = e.downcast_ref::<StudioError>().and_then(StudioError::suggestion) {
                eprintln!("{}{}Hint:{} {}", BOLD, YELLOW, RESET, hint);
            }
            ExitCode::FAILURE
        }
    }
}
