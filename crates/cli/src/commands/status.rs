//! `lunavilla status` — Show affinity and conversation statistics.

use lunavilla_agent::{AffinityTracker, stats};
use lunavilla_config::AppConfig;

use super::load_config;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let store = lunavilla_gateway::open_store(&config).await?;
    let tracker = AffinityTracker::new(store.clone());
    let stats = stats::collect(store.as_ref(), &tracker).await?;

    println!("🌙 Luna Villa Status");
    println!("====================");
    println!("  Config dir:   {}", AppConfig::config_dir().display());
    println!("  Database:     {}", config.db_path().display());
    println!("  Provider:     {}", config.default_provider);
    println!("  Model:        {}", config.default_model);
    println!("  API key:      {}", if config.has_api_key() { "set" } else { "missing" });
    println!();
    println!("  Affinity:     level {} ({} / 100 exp)", stats.affinity.level, stats.affinity.exp);
    println!("  Rank:         {}", stats.affinity.rank);
    println!(
        "  Messages:     {} total ({} from you, {} from Luna)",
        stats.total_messages, stats.user_messages, stats.luna_messages
    );

    Ok(())
}
