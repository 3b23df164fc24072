mod sim;
mod tracing_setup;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use teamspace_core::SyncConfig;

use crate::sim::SimOptions;

#[derive(Parser)]
#[command(name = "teamspace-cli")]
#[command(about = "Run optimistic mutations against an in-process teamspace backend")]
struct Cli {
    /// Pretty-print JSON output
    #[arg(long, short)]
    pretty: bool,

    /// Path to JSON sync config file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Sync config as an inline JSON string
    #[arg(long, hide = true)]
    config_json: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a chat message and show the chat before and after confirmation
    SendMessage {
        /// Message content
        content: String,
        /// Project the message belongs to
        #[arg(long, default_value = "proj_1")]
        project: String,
        /// Have the backend reject the write
        #[arg(long)]
        reject: bool,
        /// Backend latency before the write is handled
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
    },

    /// Drag a task card to another status column
    MoveTask {
        /// Task ID (seeded tasks are task_4, task_5 and task_6)
        task_id: String,
        /// Target status ID
        to: String,
        #[arg(long, default_value = "proj_1")]
        project: String,
        #[arg(long)]
        reject: bool,
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
    },

    /// Print the effective sync config
    ShowConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = tracing_setup::init_tracing() {
        eprintln!("Warning: Failed to initialize logging: {:#}", e);
    }

    let config = load_config(&cli);

    let result = match cli.command {
        Some(Commands::SendMessage {
            content,
            project,
            reject,
            latency_ms,
        }) => {
            let options = SimOptions {
                project,
                reject,
                latency: Duration::from_millis(latency_ms),
            };
            sim::send_message(config, &content, &options).await
        }
        Some(Commands::MoveTask {
            task_id,
            to,
            project,
            reject,
            latency_ms,
        }) => {
            let options = SimOptions {
                project,
                reject,
                latency: Duration::from_millis(latency_ms),
            };
            sim::move_task(config, &task_id, &to, &options).await
        }
        Some(Commands::ShowConfig) => serde_json::to_value(&config).map_err(Into::into),
        None => {
            eprintln!("No command specified. Use --help for usage.");
            std::process::exit(1);
        }
    };

    match result {
        Ok(report) => print_json(&report, cli.pretty),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn print_json(value: &Value, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match rendered {
        Ok(text) => println!("{}", text),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Load configuration from file or JSON string, falling back to defaults
fn load_config(cli: &Cli) -> SyncConfig {
    // Priority: --config-json > --config (file)
    if let Some(ref json) = cli.config_json {
        match SyncConfig::from_json(json) {
            Ok(config) => return config,
            Err(e) => {
                eprintln!("Warning: Failed to parse config JSON: {:#}", e);
            }
        }
    }

    if let Some(ref path) = cli.config {
        match SyncConfig::load(path) {
            Ok(config) => return config,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    SyncConfig::default()
}
