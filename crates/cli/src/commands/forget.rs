//! `lunavilla forget` — Clear the conversation history.
//!
//! Turns flagged as memos survive, and affinity is left untouched.

use std::io::Write;

use lunavilla_core::store::HistoryStore;

use super::load_config;

pub async fn run(yes: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;

    if !yes {
        print!("Clear the conversation history at {}? Type 'yes' to confirm: ", config.db_path().display());
        std::io::stdout().flush()?;

        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if answer.trim() != "yes" {
            println!("Aborted.");
            return Ok(());
        }
    }

    let store = lunavilla_gateway::open_store(&config).await?;
    let removed = store.clear().await?;
    tracing::info!(removed, "History cleared");
    println!("🧹 Removed {removed} messages.");

    Ok(())
}
