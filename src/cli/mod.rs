//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the
//! appropriate commands.

pub mod model_list;
pub mod session_list;

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::api::models::fetch_models;
use crate::core::config::Config;
use crate::core::constants::CONNECT_TIMEOUT;
use crate::store::SessionStore;
use crate::ui::{run_chat, ChatSetup};

#[derive(Parser)]
#[command(name = "brazier")]
#[command(about = "A terminal chat client for locally hosted LLM runtimes")]
#[command(
    long_about = "Brazier is a line-oriented terminal chat client for locally hosted LLM \
runtimes such as Ollama. It streams replies as they are generated and keeps \
conversation history in a local SQLite file.\n\n\
Configuration:\n\
  brazier set base-url http://localhost:11434\n\
  brazier set default-model llama3.2\n\n\
Chat commands:\n\
  /stop             Stop the streaming reply\n\
  /copy             Copy the last reply to the clipboard\n\
  /new              Start a new session\n\
  /sessions         List stored sessions\n\
  /open <id>        Switch to a stored session\n\
  /rename <id> <t>  Rename a session\n\
  /delete <id>      Delete a session\n\
  /quit             Leave"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Model to use for chat (defaults to the configured default-model,
    /// then to the runtime's most recently installed model)
    #[arg(short, long, global = true, value_name = "MODEL")]
    pub model: Option<String>,

    /// Base URL of the model runtime
    #[arg(short, long, global = true, value_name = "URL")]
    pub base_url: Option<String>,

    /// Path to the history database
    #[arg(long, global = true, value_name = "FILE")]
    pub history: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the chat interface (default)
    Chat,
    /// List models installed on the runtime
    Models,
    /// List stored chat sessions
    Sessions,
    /// Set configuration values
    Set {
        /// Configuration key to set
        key: String,
        /// Value to set for the key
        value: String,
    },
    /// Unset configuration values
    Unset {
        /// Configuration key to unset
        key: String,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()
        .unwrap()
        .block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load()?;

    match args.command {
        Some(Commands::Set { ref key, ref value }) => set_config_value(key, value),
        Some(Commands::Unset { ref key }) => unset_config_value(key),
        Some(Commands::Models) => {
            let client = build_client()?;
            let base_url = resolve_base_url(&args, &config);
            model_list::list_models(&client, &base_url).await
        }
        Some(Commands::Sessions) => {
            let store = open_store(&args, &config).await?;
            session_list::list_sessions(&store).await
        }
        Some(Commands::Chat) | None => {
            let client = build_client()?;
            let base_url = resolve_base_url(&args, &config);
            let model = resolve_model(&args, &config, &client, &base_url).await?;
            let store = open_store(&args, &config).await?;
            run_chat(ChatSetup {
                client,
                base_url,
                model,
                options: config.generation.to_options(),
                store,
            })
            .await
        }
    }
}

fn build_client() -> Result<reqwest::Client, Box<dyn Error>> {
    Ok(reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?)
}

fn resolve_base_url(args: &Args, config: &Config) -> String {
    args.base_url
        .clone()
        .unwrap_or_else(|| config.base_url().to_string())
}

/// Model precedence: command line, then config, then whatever the runtime
/// lists first (its most recently installed model).
async fn resolve_model(
    args: &Args,
    config: &Config,
    client: &reqwest::Client,
    base_url: &str,
) -> Result<String, Box<dyn Error>> {
    if let Some(model) = &args.model {
        return Ok(model.clone());
    }
    if let Some(model) = &config.default_model {
        return Ok(model.clone());
    }

    let models = fetch_models(client, base_url).await.map_err(|e| {
        format!("no model configured, and the runtime could not be asked for one: {e}")
    })?;
    models
        .first()
        .map(|model| model.name.clone())
        .ok_or_else(|| "no models installed on the runtime; pull one first or pass --model".into())
}

async fn open_store(args: &Args, config: &Config) -> Result<SessionStore, Box<dyn Error>> {
    let path = args.history.clone().unwrap_or_else(|| config.history_path());
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SessionStore::open(&path).await?)
}

fn set_config_value(key: &str, value: &str) -> Result<(), Box<dyn Error>> {
    let mut config = Config::load()?;
    match key {
        "base-url" => config.base_url = Some(value.to_string()),
        "default-model" => config.default_model = Some(value.to_string()),
        "history-path" => config.history_path = Some(PathBuf::from(value)),
        _ => {
            eprintln!("⚠️  Unknown config key: {key}");
            config.print_all();
            return Ok(());
        }
    }
    config.save()?;
    println!("✅ Set {key} to: {value}");
    Ok(())
}

fn unset_config_value(key: &str) -> Result<(), Box<dyn Error>> {
    let mut config = Config::load()?;
    match key {
        "base-url" => config.base_url = None,
        "default-model" => config.default_model = None,
        "history-path" => config.history_path = None,
        _ => {
            eprintln!("⚠️  Unknown config key: {key}");
            config.print_all();
            return Ok(());
        }
    }
    config.save()?;
    println!("✅ Unset {key}");
    Ok(())
}
