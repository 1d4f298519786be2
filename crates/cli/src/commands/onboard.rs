//! `lunavilla onboard` — First-time setup.

use lunavilla_config::{AppConfig, DEFAULT_PERSONA};

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("🌙 Luna Villa — First-Time Setup");
    println!("================================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("✅ Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    let config = if config_path.exists() {
        println!("⚠️  Config already exists at: {}", config_path.display());
        AppConfig::load_from(&config_path)?
    } else {
        std::fs::write(&config_path, AppConfig::default_toml())?;
        println!("✅ Created config.toml at: {}", config_path.display());
        AppConfig::default()
    };

    let persona_path = config.persona_path();
    if persona_path.exists() {
        println!("  Persona exists: {}", persona_path.display());
    } else {
        if let Some(parent) = persona_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&persona_path, format!("{DEFAULT_PERSONA}\n"))?;
        println!("✅ Created persona at: {}", persona_path.display());
    }

    println!("\n📝 Next steps:");
    println!("   1. Set GEMINI_API_KEY (or api_key in {})", config_path.display());
    println!("   2. Edit {} to shape Luna's character", persona_path.display());
    println!("   3. Run: lunavilla chat\n");

    Ok(())
}
