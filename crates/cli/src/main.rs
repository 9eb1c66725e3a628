//! chatweave CLI: the main entry point.
//!
//! Commands:
//! - `pack`      Pack a chat file under the token ceiling and print it
//! - `normalize` Clean model output read from stdin
//! - `generate`  Stream one reply from the configured backend
//! - `config`    Print the default or effective configuration

use std::path::PathBuf;

use chatweave_core::event::GenerationType;
use clap::{Parser, Subcommand, ValueEnum};

mod commands;

#[derive(Parser)]
#[command(
    name = "chatweave",
    about = "chatweave: prompt packing and streaming generation for character chat",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a chat file and print the prompt
    Pack {
        /// Chat file (JSON)
        chat: PathBuf,

        /// What the prompt is for
        #[arg(short = 't', long = "type", value_enum, default_value_t = Mode::Normal)]
        mode: Mode,

        /// Print packing metadata as JSON instead of the prompt
        #[arg(long)]
        json: bool,
    },

    /// Normalize model output read from stdin
    Normalize {
        /// Also trim to the last complete sentence, as on commit
        #[arg(long = "final")]
        final_pass: bool,

        /// Treat the text as written on the user's behalf
        #[arg(long)]
        impersonate: bool,

        /// Extra stop string (`\n` is accepted); repeatable
        #[arg(short, long = "stop")]
        stops: Vec<String>,
    },

    /// Stream one reply for a chat file
    Generate {
        /// Chat file (JSON)
        chat: PathBuf,

        #[arg(short = 't', long = "type", value_enum, default_value_t = Mode::Normal)]
        mode: Mode,

        /// Replay chunks from a JSON file instead of calling the backend
        #[arg(long)]
        script: Option<PathBuf>,

        /// Print the written message as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration, or the effective one with --show
    Config {
        #[arg(long)]
        show: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Normal,
    Continue,
    Swipe,
    Regenerate,
    Impersonate,
    Quiet,
}

impl From<Mode> for GenerationType {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Normal => Self::Normal,
            Mode::Continue => Self::Continue,
            Mode::Swipe => Self::Swipe,
            Mode::Regenerate => Self::Regenerate,
            Mode::Impersonate => Self::Impersonate,
            Mode::Quiet => Self::Quiet,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Pack { chat, mode, json } => commands::pack::run(&chat, mode.into(), json).await?,
        Commands::Normalize {
            final_pass,
            impersonate,
            stops,
        } => {
            commands::normalize::run(commands::normalize::NormalizeArgs {
                final_pass,
                impersonate,
                stops,
            })
            .await?
        }
        Commands::Generate {
            chat,
            mode,
            script,
            json,
        } => {
            commands::generate::run(commands::generate::GenerateArgs {
                chat,
                generation_type: mode.into(),
                script,
                json,
            })
            .await?
        }
        Commands::Config { show } => {
            if show {
                commands::config_cmd::show().await?
            } else {
                commands::config_cmd::defaults().await?
            }
        }
    }

    Ok(())
}
