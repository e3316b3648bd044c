//! `stockchat tools`: list the tools offered to the model.

use stockchat_config::AppConfig;

pub fn run(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = stockchat_tools::default_registry(&config.tools)?;

    println!("🔧 {} tools available", registry.len());
    for definition in registry.definitions() {
        println!();
        println!("   {}", definition.name);
        println!("   {}", definition.description);
        println!("   {}", serde_json::to_string(&definition.json_schema())?);
    }

    if config.tools.xueqiu_token.is_none() {
        println!();
        println!("   ⚠️  XQ_A_TOKEN is not set; get_stock_info will fail until it is.");
    }

    Ok(())
}
