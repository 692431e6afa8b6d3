use std::sync::Arc;

use browserchannel::{
    diagnostics::TracingDiagnostics,
    socket::{BcSocket, SocketHandler, SocketOptions},
    transport::ReqwestTransport,
    BcError, ChannelConfig, ErrorCode, QueuedMap, Result,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

struct PrintHandler;

impl SocketHandler for PrintHandler {
    fn on_open(&mut self) {
        tracing::info!("Connected");
    }

    fn on_message(&mut self, message: Value) {
        println!("{message}");
    }

    fn on_error(&mut self, message: &str, code: ErrorCode) {
        tracing::warn!(%code, "Channel error: {message}");
    }

    fn on_close(&mut self, message: &str, pending: Vec<QueuedMap>, undelivered: Vec<QueuedMap>) {
        tracing::info!(
            pending = pending.len(),
            undelivered = undelivered.len(),
            "Closed: {message}"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::args()
        .nth(1)
        .ok_or_else(|| BcError::BadConfig("usage: browserchannel <channel url>".to_string()))?;
    let config = ChannelConfig::new(&url)?;
    let options = SocketOptions {
        reconnect: true,
        ..Default::default()
    };
    let socket = BcSocket::open_with_diagnostics(
        config,
        options,
        Arc::new(ReqwestTransport::new()),
        Arc::new(TracingDiagnostics),
        PrintHandler,
    )?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let message = match serde_json::from_str::<Value>(&line) {
                        Ok(value) => socket.send(value).await,
                        Err(_) => socket.send(line).await,
                    };
                    if let Err(e) = message {
                        tracing::warn!(error = %e, "Send failed");
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(BcError::Other(e.to_string())),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    socket.close().await?;
    if let Some(session) = socket.session() {
        session.closed().await;
    }
    Ok(())
}
