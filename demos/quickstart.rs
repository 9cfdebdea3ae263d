use anyhow::Result;
use cua_graph::agent::DiskScreenshotStore;
use cua_graph::{
    Agent, AgentConfig, CuaClient, CuaConfig, Environment, Message, RunConfig, ScrapybaraConnector,
    SessionState, StreamEvent, StreamWriter,
};
use futures::StreamExt;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let model = CuaClient::new(CuaConfig::default())?;
    let shots_dir = std::env::temp_dir().join("cua_graph_runs");
    let agent = Agent::new(model, ScrapybaraConnector::default(), AgentConfig { max_steps: 40 })
        .with_screenshot_store(Arc::new(DiskScreenshotStore::new(&shots_dir)));

    let (writer, mut events) = StreamWriter::channel();
    tokio::spawn(async move {
        while let Some(StreamEvent::StreamUrl { stream_url }) = events.next().await {
            info!("watch the session live at {}", stream_url);
        }
    });

    let state = SessionState::new(Environment::Web).with_messages([
        Message::system(
            "You're an advanced AI computer use assistant. The browser you are using \
             is already initialized, and visiting google.com.",
        ),
        Message::user(
            "Find the LangGraph repository on GitHub and summarize its open pull requests.",
        ),
    ]);

    let state = agent.invoke(state, &RunConfig::default(), &writer).await?;
    if let Some(turn) = state.last_message().and_then(Message::as_assistant) {
        println!("{}", turn.text.as_deref().unwrap_or("(no reply)"));
    }
    println!("screenshots in {}", shots_dir.display());
    Ok(())
}
