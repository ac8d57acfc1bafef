use std::path::PathBuf;

use voicelink::{ClientConfig, SessionEvent, SessionManager};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = match std::env::args().nth(1) {
        Some(path) => match ClientConfig::load(&PathBuf::from(&path)) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("{}", e);
                std::process::exit(1);
            }
        },
        None => ClientConfig::default(),
    };

    let (manager, mut events) = SessionManager::new(config);
    manager.connect();

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged(state) => tracing::info!("State: {:?}", state),
                SessionEvent::StatusChanged(status) => tracing::info!("Agent: {:?}", status),
                SessionEvent::Greeting(text) => tracing::info!("Greeting: {}", text),
                SessionEvent::InterimTranscript(text) => tracing::debug!("~ {}", text),
                SessionEvent::FinalTranscript(text) => tracing::info!("You: {}", text),
                SessionEvent::AgentResponse(text) => tracing::info!("Agent: {}", text),
                SessionEvent::Stats(stats) => tracing::debug!(
                    "Network: {:.0}ms latency, {:.0}ms jitter, {:.1}% loss, depth {}",
                    stats.average_latency_ms,
                    stats.jitter_ms,
                    stats.packet_loss_pct,
                    stats.buffer_depth
                ),
                SessionEvent::SessionError(text) => tracing::warn!("Session error: {}", text),
            }
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    tracing::info!("Shutting down");
    manager.disconnect().await;
    event_task.abort();
}
