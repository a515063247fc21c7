//! relink echo demo
//!
//! The server echoes every message back on the same channel; the client sends
//! numbered lines and prints the echoes. Kill and restart the network path
//! (or the client's link) with reconnect enabled to watch delivery resume.
//!
//! Environment variables:
//! - RELINK_MODE: "server" or "client"
//! - RELINK_ADDR: server address (default 127.0.0.1:9510)
//! - RELINK_COUNT: messages the client sends (default 10)
//! - RELINK_RECONNECT: "1" to keep links alive across drops
//! - RELINK_LOG_LEVEL: trace|debug|info|warn|error

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relink::client::ClientStack;
use relink::prelude::*;
use relink::server::Server;

#[derive(Debug, Error)]
enum EchoError {
    #[error("unknown mode {0:?}, expected \"server\" or \"client\"")]
    Mode(String),

    #[error("invalid address {0:?}")]
    Addr(String),

    #[error(transparent)]
    Stack(#[from] StackError),
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn reconnect_config() -> ReconnectConfig {
    ReconnectConfig::builder()
        .enabled(env_or("RELINK_RECONNECT", "0") == "1")
        .timeout(Duration::from_secs(30))
        .build()
}

async fn run_server(addr: SocketAddr) -> Result<(), EchoError> {
    let (server, mut accepted) = Server::builder()
        .bind_addr(addr)
        .reconnect(reconnect_config())
        .bind()
        .await?;
    info!(addr = %server.local_addr(), "echo server ready");

    while let Some(mut peer) = accepted.recv().await {
        tokio::spawn(async move {
            while let Some(event) = peer.events.recv().await {
                match event {
                    ChannelEvent::Message(body) => {
                        if let Err(e) = peer.channel.send(body) {
                            warn!(error = %e, "echo failed");
                        }
                    }
                    ChannelEvent::Transport { id, event } => {
                        info!(%id, ?event, "peer event");
                        if event == TransportEvent::Closed {
                            break;
                        }
                    }
                }
            }
        });
    }
    Ok(())
}

async fn run_client(addr: SocketAddr) -> Result<(), EchoError> {
    let count: usize = env_or("RELINK_COUNT", "10").parse().unwrap_or(10);
    let (client, mut events) = ClientStack::builder()
        .server_addr(addr.to_string())
        .reconnect(reconnect_config())
        .build()?;
    let id = client.connect().await?;
    info!(%id, "connected");

    for i in 0..count {
        client.send(format!("line {i}"))?;
    }

    let mut echoed = 0;
    while echoed < count {
        match events.recv().await {
            Some(ChannelEvent::Message(body)) => {
                echoed += 1;
                println!("{}", String::from_utf8_lossy(&body));
            }
            Some(ChannelEvent::Transport { event, .. }) => info!(?event, "link event"),
            None => break,
        }
    }
    client.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), EchoError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_or("RELINK_LOG_LEVEL", "info")))
        .init();

    let raw = env_or("RELINK_ADDR", "127.0.0.1:9510");
    let addr: SocketAddr = raw.parse().map_err(|_| EchoError::Addr(raw.clone()))?;
    match env_or("RELINK_MODE", "server").as_str() {
        "server" => run_server(addr).await,
        "client" => run_client(addr).await,
        other => Err(EchoError::Mode(other.to_string())),
    }
}
