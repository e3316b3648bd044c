//! `stockchat serve`: start the HTTP API server.

use stockchat_config::AppConfig;

pub async fn run(
    mut config: AppConfig,
    host_override: Option<String>,
    port_override: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(host) = host_override {
        config.gateway.host = host;
    }
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    if !config.has_api_key() {
        return Err("No model API key configured. Set STOCKCHAT_API_KEY or DOUBAO_API_KEY.".into());
    }

    println!("📈 stockchat gateway");
    println!("   Listening:   {}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:       {}", config.provider.model);
    println!("   Database:    {}", config.database.url);
    println!("   Environment: {}", config.environment);

    stockchat_gateway::start(config).await?;

    Ok(())
}
