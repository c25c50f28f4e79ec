//! Shared utilities for integration tests.
//!
//! Starts log servers on ephemeral ports and connects viewers with a real
//! WebSocket client.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(dead_code)]

use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use websocket_logger::{LogServer, LogServerBuilder};

/// WebSocket client used as a viewer.
pub type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(10);

/// Builder for a log server on an OS-assigned localhost port.
pub fn builder() -> LogServerBuilder {
    LogServer::builder().port(0)
}

/// Starts a log server with default settings on an ephemeral port.
pub async fn start_server() -> Result<LogServer> {
    Ok(builder().start().await?)
}

/// Connects a viewer and waits until the server treats it as upgraded.
///
/// The server answers a ping only after it has registered the upgrade, so
/// a pong proves the viewer will receive the next broadcast.
pub async fn connect_viewer(server: &LogServer) -> Result<Viewer> {
    let (mut viewer, response) = timeout(WAIT, connect_async(server.ws_url()))
        .await
        .context("connect timed out")??;
    if response.status().as_u16() != 101 {
        bail!("unexpected handshake status {}", response.status());
    }

    viewer.send(Message::Ping(b"ready".to_vec().into())).await?;
    match next_message(&mut viewer).await? {
        Message::Pong(_) => Ok(viewer),
        other => bail!("expected pong, got {other:?}"),
    }
}

/// Reads the next message from a viewer.
pub async fn next_message(viewer: &mut Viewer) -> Result<Message> {
    match timeout(WAIT, viewer.next()).await.context("read timed out")? {
        Some(message) => Ok(message?),
        None => bail!("viewer stream ended"),
    }
}

/// Reads the next text message as JSON.
pub async fn next_record(viewer: &mut Viewer) -> Result<serde_json::Value> {
    loop {
        match next_message(viewer).await? {
            Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
            Message::Ping(_) | Message::Pong(_) => {}
            other => bail!("expected text, got {other:?}"),
        }
    }
}

/// Sends a raw HTTP request and returns the full response.
pub async fn http_request(server: &LogServer, request: &str) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(server.local_addr()).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut response))
        .await
        .context("response timed out")??;
    Ok(response)
}

/// Polls `condition` until it holds or [`WAIT`] elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
