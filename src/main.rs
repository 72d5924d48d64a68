//! Spark Advisory — advisory engine CLI for AI coding assistant hooks.
//!
//! The binary is installed into the host's hook configuration: the three
//! `hook` subcommands read the hook payload JSON from stdin and drive the
//! engine; the remaining subcommands are operator tools.

use clap::{Parser, Subcommand};
use spark_advisory::api::{self, ApiConfig};
use spark_advisory::cli;
use spark_advisory::home::SparkHome;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

/// Spark Advisory CLI arguments
#[derive(Parser)]
#[command(name = "spark-advisory")]
#[command(about = "File-backed advisory engine for AI coding assistants", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Spark home directory (overrides SPARK_HOME and ~/.spark)
    #[arg(long)]
    home: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Host hook entry points (payload JSON on stdin)
    Hook {
        #[command(subcommand)]
        event: HookEvent,
    },

    /// Show engine status
    Status,

    /// Prefetch worker controls
    Prefetch {
        #[command(subcommand)]
        action: PrefetchAction,
    },

    /// Serve the localhost status API
    Serve {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: String,

        /// Accept POSTs from non-loopback peers
        #[arg(long)]
        allow_remote_write: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum HookEvent {
    /// UserPromptSubmit hook
    UserPrompt,
    /// PreToolUse hook — emits the advisory on stdout when one fires
    PreTool,
    /// PostToolUse hook
    PostTool,
}

#[derive(Subcommand)]
enum PrefetchAction {
    /// Process pending queue jobs now
    Run,
    /// Pause the worker
    Pause {
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Resume the worker
    Resume,
    /// Show worker status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective tuneables document
    Show,
    /// Set advisory preferences (memory mode + guidance style)
    SetPreferences {
        #[arg(long, default_value = "standard")]
        memory_mode: String,
        #[arg(long, default_value = "balanced")]
        guidance_style: String,
    },
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    // Hooks own stdout; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let home = match &args.home {
        Some(path) => SparkHome::at(path),
        None => SparkHome::resolve(),
    };

    match args.command {
        Commands::Hook { event } => match event {
            HookEvent::UserPrompt => cli::run_user_prompt_hook(home).await,
            HookEvent::PreTool => cli::run_pre_tool_hook(home).await,
            HookEvent::PostTool => cli::run_post_tool_hook(home).await,
        },
        Commands::Status => cli::run_status(home),
        Commands::Prefetch { action } => match action {
            PrefetchAction::Run => cli::run_prefetch(home, "run", ""),
            PrefetchAction::Pause { reason } => cli::run_prefetch(home, "pause", &reason),
            PrefetchAction::Resume => cli::run_prefetch(home, "resume", ""),
            PrefetchAction::Status => cli::run_prefetch(home, "status", ""),
        },
        Commands::Serve { addr, allow_remote_write } => {
            let addr: SocketAddr = match addr.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    eprintln!("invalid listen address {addr}: {e}");
                    std::process::exit(2);
                }
            };
            if let Err(e) = api::serve(home, ApiConfig { addr, allow_remote_write }).await {
                eprintln!("status API failed: {e}");
                std::process::exit(1);
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => cli::run_config_show(home),
            ConfigAction::SetPreferences { memory_mode, guidance_style } => {
                cli::run_set_preferences(home, &memory_mode, &guidance_style)
            }
        },
    }
}
