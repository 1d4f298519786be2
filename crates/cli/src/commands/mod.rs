pub mod chat;
pub mod forget;
pub mod onboard;
pub mod serve;
pub mod status;

use lunavilla_config::AppConfig;

/// Load config with a readable error.
pub fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}
