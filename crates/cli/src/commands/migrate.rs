//! `stockchat migrate`: connect to the database and create the schema.

use stockchat_config::AppConfig;

pub async fn run(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔄 Migrating {}", config.database.url);

    let store = stockchat_store::connect(&config.database.url, config.database.max_connections).await?;
    if !store.health_check().await? {
        return Err(format!("{} store is not healthy after migration", store.name()).into());
    }

    let conversations = store.count_conversations(None).await?;
    println!("   ✅ {} schema ready ({conversations} conversations)", store.name());
    Ok(())
}
