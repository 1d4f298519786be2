//! Luna Villa CLI — the main entry point.
//!
//! Commands:
//! - `onboard`  — Write a default config and persona
//! - `serve`    — Start the HTTP gateway
//! - `chat`     — Talk to Luna in the terminal (single message or interactive)
//! - `status`   — Show affinity, rank and message counts
//! - `forget`   — Clear the conversation history (memos are kept)

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "lunavilla",
    about = "Luna Villa — a companion that remembers, streams, and grows closer",
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
    /// Initialize configuration and the persona file
    Onboard,

    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the bind address
        #[arg(long)]
        host: Option<String>,
    },

    /// Chat with Luna
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Attach an image file (single message mode)
        #[arg(short, long, requires = "message")]
        image: Vec<std::path::PathBuf>,

        /// Pretend it is this hour (0-23)
        #[arg(long, value_parser = clap::value_parser!(u32).range(0..24))]
        hour: Option<u32>,
    },

    /// Show affinity and conversation statistics
    Status,

    /// Clear the conversation history
    Forget {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
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
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Onboard => commands::onboard::run().await?,
        Commands::Serve { port, host } => commands::serve::run(port, host).await?,
        Commands::Chat {
            message,
            image,
            hour,
        } => commands::chat::run(message, image, hour).await?,
        Commands::Status => commands::status::run().await?,
        Commands::Forget { yes } => commands::forget::run(yes).await?,
    }

    Ok(())
}
