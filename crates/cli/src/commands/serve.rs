//! `lunavilla serve` — Start the HTTP API server.

use super::load_config;

pub async fn run(
    port_override: Option<u16>,
    host_override: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config()?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }
    if let Some(host) = host_override {
        config.gateway.host = host;
    }

    println!("🌙 Luna Villa Gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Provider:  {} ({})", config.default_provider, config.default_model);
    println!("   Database:  {}", config.db_path().display());

    lunavilla_gateway::start(config).await?;

    Ok(())
}
