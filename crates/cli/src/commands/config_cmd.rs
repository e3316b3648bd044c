//! `stockchat config`: print the effective configuration.

use stockchat_config::AppConfig;

pub fn show(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", config.redacted().to_toml()?);
    if !config.has_api_key() {
        eprintln!("⚠️  No model API key set (STOCKCHAT_API_KEY or DOUBAO_API_KEY)");
    }
    Ok(())
}
