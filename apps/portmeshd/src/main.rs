use std::ops::ControlFlow;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use portmesh::prelude::*;
use portmesh::protocol::ArrayMethod;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;

const STEP: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "portmeshd")]
#[command(about = "portmesh protocol demo daemon")]
struct Cli {
    /// Clients joining the broadcast bus.
    #[arg(long, default_value_t = 2)]
    clients: usize,
    /// Handshake level: 0 none, 1 open, 2 open and close.
    #[arg(long, default_value_t = 2)]
    handshake: u8,
    #[arg(long)]
    auto_close: bool,
    /// tracing-subscriber env filter.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log.as_str())
        .compact()
        .init();

    let options = PortOptions::from_level(cli.handshake, cli.auto_close)?;
    run_broadcast(&options, cli.clients).await?;
    run_live(&options).await?;
    run_relay().await?;
    Ok(())
}

/// One server and `clients` clients sharing a bus; each client issues a request.
async fn run_broadcast(options: &PortOptions, clients: usize) -> Result<()> {
    let bus = BroadcastBus::new("demo", 256);
    let server = Port::new(bus.join(), options.clone().role(Role::Server))?;
    server.add_request_listener("status", |event: MessageEvent| async move {
        json!({ "ok": true, "echo": event.data() })
    })?;
    server.start();

    let mut connected = Vec::with_capacity(clients);
    for index in 0..clients {
        let client = Port::new(bus.join(), options.clone().role(Role::Client))?;
        client.start();
        timeout(STEP, client.ready_state_change(ReadyStateQuery::Open))
            .await
            .context("client never opened")?;
        let request = RequestOptions {
            send: SendOptions::typed("status"),
            signal: None,
        };
        let reply = timeout(STEP, client.post_request(json!({ "client": index }), request))
            .await
            .context("request timed out")??;
        info!(client = client.client_id().unwrap_or("-"), %reply, "request answered");
        connected.push(client);
    }
    info!(
        clients = ?server.clients(),
        participants = bus.participants(),
        "server roster"
    );

    for client in &connected {
        client.close();
    }
    if clients > 0 && options.auto_close && options.handshake == HandshakeLevel::Full {
        timeout(STEP, server.ready_state_change(ReadyStateQuery::Closed))
            .await
            .context("server stayed open after its clients left")?;
        info!("server closed after its last client left");
    } else {
        server.close();
    }
    Ok(())
}

/// Replicate a live value across a text-framed link.
async fn run_live(options: &PortOptions) -> Result<()> {
    let (left, right) = framed_pair();
    let publisher = Port::new(left, options.clone())?;
    let subscriber = Port::new(right, options.clone())?;

    let (sender, mut mirrors) = mpsc::unbounded_channel();
    subscriber.add_event_listener("board", ListenerOptions::default(), move |event| {
        if let Some(mirror) = event.live() {
            let _ = sender.send(mirror.clone());
        }
    })?;

    let board = LiveValue::new(json!({ "title": "draft", "items": [] }));
    publisher.send_live(&board, SendOptions::typed("board"))?;
    let mirror = timeout(STEP, mirrors.recv())
        .await?
        .context("subscriber closed before the board arrived")?;

    let (changed, mut changes) = mpsc::unbounded_channel();
    let observer = mirror.observe(move |batch| {
        let _ = changed.send(batch.len());
        ControlFlow::Continue(())
    });
    board.transaction(|tx| {
        tx.set("/title", json!("final"))
            .call("/items", ArrayMethod::Push, vec![json!("a"), json!("b")]);
    })?;
    let records = timeout(STEP, changes.recv())
        .await?
        .context("mirror never changed")?;
    info!(records, mirror = %mirror.snapshot(), "mirror converged");

    observer.dispose();
    publisher.close();
    subscriber.close();
    Ok(())
}

/// Bridge two point-to-point links through a relay namespaced `mesh`.
async fn run_relay() -> Result<()> {
    let relay = Relay::new(
        RelayNamespace::shared("mesh")?,
        PortOptions::new(HandshakeLevel::None, true),
    )?;
    let member = PortOptions::new(HandshakeLevel::None, false);
    let (west, west_edge) = Port::pair(member.clone())?;
    let (east, east_edge) = Port::pair(member)?;

    let (sender, mut received) = mpsc::unbounded_channel();
    east_edge.add_event_listener("mesh:message", ListenerOptions::default(), move |event| {
        let _ = sender.send(event.data().clone());
    })?;
    relay.add_port(&east, RelayMemberOptions::default())?;
    relay.add_port(&west, RelayMemberOptions::default())?;
    west_edge.send(json!({ "hello": "east" }), SendOptions::typed("mesh:message"))?;

    // The join announcement for `west`, then its message.
    for _ in 0..2 {
        let payload = timeout(STEP, received.recv())
            .await?
            .context("relay stopped delivering")?;
        info!(%payload, "east received");
    }

    west.close();
    east.close();
    timeout(STEP, relay.ready_state_change(ReadyStateQuery::Closed))
        .await
        .context("relay stayed open without members")?;
    info!(members = relay.len(), "relay closed with its last member");
    Ok(())
}
