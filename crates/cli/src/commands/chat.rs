//! `lunavilla chat` — Talk to Luna in the terminal.
//!
//! Replies stream in as they are generated. Ctrl+C while Luna is talking
//! cuts the reply short (whatever arrived is kept); Ctrl+C at the prompt
//! quits.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lunavilla_agent::{ChatEvent, TurnOrchestrator, TurnOutcome, TurnRequest};
use lunavilla_config::AppConfig;
use lunavilla_core::event::EventBus;
use lunavilla_core::message::{Attachment, UserInput};

use super::load_config;

pub async fn run(
    message: Option<String>,
    images: Vec<PathBuf>,
    hour: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;

    if !config.has_api_key() && config.default_provider == "gemini" {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    GEMINI_API_KEY=...      (Google AI Studio)");
        eprintln!("    LUNAVILLA_API_KEY=...   (any provider)");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let event_bus = Arc::new(EventBus::default());
    let orchestrator = lunavilla_gateway::build_orchestrator(&config, event_bus).await?;

    if let Some(msg) = message {
        // Single message mode
        let mut input = UserInput::text(msg);
        for path in &images {
            input = input.with_attachment(read_image(path)?);
        }

        let mut request = TurnRequest::new(input);
        if let Some(h) = hour {
            request = request.with_hour(h);
        }

        send_turn(&orchestrator, request).await?;
        return Ok(());
    }

    // Interactive mode
    println!();
    println!("  ╔══════════════════════════════════════════════╗");
    println!("  ║         🌙 Luna Villa — Interactive          ║");
    println!("  ╚══════════════════════════════════════════════╝");
    println!();
    println!("  Provider:  {}", config.default_provider);
    println!("  Model:     {}", config.default_model);
    println!("  Persona:   {}", config.persona_path().display());
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' or Ctrl+C to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "exit" || text == "quit" {
            break;
        }

        let mut request = TurnRequest::new(UserInput::text(text));
        if let Some(h) = hour {
            request = request.with_hour(h);
        }

        if let Err(e) = send_turn(&orchestrator, request).await {
            eprintln!("  [Error] {e}");
            println!();
        }
    }

    println!();
    println!("  See you soon! 🌙");
    println!();

    Ok(())
}

/// Run one turn, printing fragments as they arrive.
async fn send_turn(
    orchestrator: &TurnOrchestrator,
    request: TurnRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    let pending = orchestrator.begin(request).await?;

    let (tx, mut rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(pending.stream(tx, cancel.clone()));

    print!("\n  Luna > ");
    std::io::stdout().flush()?;

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(ChatEvent::Delta { content, .. }) => {
                    print!("{content}");
                    std::io::stdout().flush()?;
                }
                Some(ChatEvent::Error { error }) => {
                    println!();
                    eprintln!("  [Error] {error}");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                cancel.cancel();
            }
        }
    }
    println!("\n");

    match task.await? {
        TurnOutcome::Completed {
            partial, affinity, ..
        } => {
            if partial {
                println!("  (reply cut short)");
            }
            if let Some(update) = affinity {
                if update.leveled_up {
                    println!(
                        "  💖 Affinity up! Level {} → {} ({})",
                        update.previous.level,
                        update.state.level,
                        update.state.rank().label()
                    );
                } else if update.penalized {
                    println!("  💔 Luna is hurt. Affinity level {}", update.state.level);
                }
            }
        }
        TurnOutcome::Failed { reason } => {
            tracing::debug!(reason = %reason, "Turn failed");
        }
    }

    Ok(())
}

/// Read an image file, guessing the mime type from its extension.
fn read_image(path: &Path) -> Result<Attachment, Box<dyn std::error::Error>> {
    let data = std::fs::read(path)
        .map_err(|e| format!("Failed to read image {}: {e}", path.display()))?;
    Ok(Attachment::new(image_mime(path), data))
}

fn image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}
