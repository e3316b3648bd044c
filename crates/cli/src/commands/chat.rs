//! `stockchat chat`: run one turn in the terminal, without the HTTP layer.

use std::io::Write;
use std::sync::Arc;

use tokio::sync::mpsc;

use stockchat_agent::TurnEvent;
use stockchat_config::AppConfig;
use stockchat_core::provider::Provider;
use stockchat_providers::ResponsesProvider;
use stockchat_tools::ToolClients;

pub async fn run(
    config: AppConfig,
    message: String,
    conversation: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    STOCKCHAT_API_KEY=...");
        eprintln!("    DOUBAO_API_KEY=...");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let store = stockchat_store::connect(&config.database.url, config.database.max_connections).await?;
    let provider: Arc<dyn Provider> = Arc::new(ResponsesProvider::from_config(&config.provider)?);
    let clients = ToolClients::from_config(&config.tools)?;
    let state = stockchat_gateway::build_state(config, provider, clients, store)?;

    let handle = state.sessions.get_or_create(conversation.as_deref()).await?;
    let session = handle.try_begin_turn()?;
    let rx = state.agent.spawn_turn(session, message);

    let mut stdout = std::io::stdout();
    let conversation_id = print_turn(rx, &mut stdout).await?;
    eprintln!();
    eprintln!("  Conversation: {conversation_id}");
    Ok(())
}

/// Write chunks as they arrive. Returns the conversation id from `done`,
/// or the error message from `error`.
pub async fn print_turn(
    mut rx: mpsc::Receiver<TurnEvent>,
    out: &mut impl Write,
) -> Result<String, Box<dyn std::error::Error>> {
    while let Some(event) = rx.recv().await {
        match event {
            TurnEvent::Chunk { content } => {
                write!(out, "{content}")?;
                out.flush()?;
            }
            TurnEvent::Done { conversation_id, .. } => {
                writeln!(out)?;
                return Ok(conversation_id);
            }
            TurnEvent::Error { message } => {
                writeln!(out)?;
                return Err(message.into());
            }
        }
    }
    Err("turn ended without a result".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prints_chunks_until_done() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(TurnEvent::chunk("Hello")).await.unwrap();
        tx.send(TurnEvent::chunk(", world")).await.unwrap();
        tx.send(TurnEvent::Done {
            conversation_id: "conv-1".into(),
            tool_rounds: 0,
        })
        .await
        .unwrap();

        let mut out = Vec::new();
        let id = print_turn(rx, &mut out).await.unwrap();
        assert_eq!(id, "conv-1");
        assert_eq!(String::from_utf8(out).unwrap(), "Hello, world\n");
    }

    #[tokio::test]
    async fn error_event_becomes_error() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(TurnEvent::Error {
            message: "provider unavailable".into(),
        })
        .await
        .unwrap();

        let err = print_turn(rx, &mut Vec::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "provider unavailable");
    }

    #[tokio::test]
    async fn closed_channel_is_an_error() {
        let (tx, rx) = mpsc::channel::<TurnEvent>(1);
        drop(tx);
        assert!(print_turn(rx, &mut Vec::new()).await.is_err());
    }
}
