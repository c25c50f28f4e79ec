//! `tracing` events reaching browser viewers through the broadcast layer.

mod common;

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use common::{connect_viewer, next_record, start_server};

#[tokio::test]
async fn test_tracing_events_stream_to_viewers() -> Result<()> {
    let server = start_server().await?;
    let mut viewer = connect_viewer(&server).await?;

    let subscriber = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer().with_filter(EnvFilter::new("debug")))
        .with(server.layer());
    let guard = tracing::subscriber::set_default(subscriber);

    tracing::info!(tag = "boot", "ready");
    tracing::error!(attempt = 3, "upstream unreachable");
    tracing::trace!("fine grained");

    let record = next_record(&mut viewer).await?;
    assert_eq!(record["levelName"], "info");
    assert_eq!(record["message"], "[boot] ready");
    assert_eq!(record["file"], "tracing_layer.rs");
    assert_eq!(record["function"], "tracing_layer");

    let record = next_record(&mut viewer).await?;
    assert_eq!(record["level"], 1);
    assert_eq!(record["message"], "upstream unreachable attempt=3");

    // The fmt filter does not apply to the broadcast layer.
    let record = next_record(&mut viewer).await?;
    assert_eq!(record["levelName"], "verbose");
    assert_eq!(record["message"], "fine grained");

    drop(guard);
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_own_events_are_not_rebroadcast() -> Result<()> {
    let server = start_server().await?;
    let mut viewer = connect_viewer(&server).await?;

    let subscriber = tracing_subscriber::registry().with(server.layer());
    let guard = tracing::subscriber::set_default(subscriber);

    tracing::debug!(target: "websocket_logger::transport", "internal chatter");
    tracing::debug!(target: "websocket_logger_companion", "neighbour crate");

    let record = next_record(&mut viewer).await?;
    assert_eq!(record["message"], "neighbour crate");

    drop(guard);
    server.stop().await;
    Ok(())
}
