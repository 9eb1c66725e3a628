//! `chatweave config`: Configuration commands.

use chatweave_config::AppConfig;

/// Print the built-in defaults as TOML.
pub async fn defaults() -> Result<(), Box<dyn std::error::Error>> {
    println!("# {}", AppConfig::config_dir().join("config.toml").display());
    println!("{}", AppConfig::default_toml());
    Ok(())
}

/// Print the effective configuration, env overrides applied.
pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if config.backend.api_key.is_some() {
        config.backend.api_key = Some("[REDACTED]".into());
    }
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    println!("# ceiling = {} tokens", config.context.ceiling());
    Ok(())
}
