//! Demo front end: drives a [`mesh_core::ConnectionCoordinator`] over real
//! loopback TCP, either as the group owner (`--listen`) or a joining client
//! (`--connect`). Line-oriented stdin becomes outbound `Text` messages;
//! everything else is printed from the coordinator's event stream.

use anyhow::{bail, Context, Result};
use clap::Parser;
use mesh_core::config::{PING_INTERVAL, ROSTER_HEARTBEAT_INTERVAL};
use mesh_core::coordinator::{CoordinatorEvent, OutboundAction, Role};
use mesh_core::handshake::HandshakeFields;
use mesh_core::identity::DeviceId;
use mesh_core::message::{Frame, Message, MessageKind};
use mesh_core::socket::{self, FramedReader, FramedWriter};
use mesh_core::{quality, roster, ConnectionCoordinator, Error, MeshConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mesh-cli", about = "Demo front end for the offline mesh coordinator")]
struct Cli {
    /// Display name advertised to the rest of the group.
    #[arg(long, default_value = "anon")]
    name: String,

    /// Run as group owner, bound to this address.
    #[arg(long, conflicts_with = "connect")]
    listen: Option<SocketAddr>,

    /// Join the group owner at this address.
    #[arg(long, conflicts_with = "listen")]
    connect: Option<SocketAddr>,
}

type Shared = Arc<Mutex<ConnectionCoordinator>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let local_id = DeviceId::new_random();
    info!(%local_id, name = %cli.name, "starting mesh-cli");

    let (coordinator, events) = ConnectionCoordinator::new(local_id, cli.name.clone(), MeshConfig::normal());
    let coordinator: Shared = Arc::new(Mutex::new(coordinator));

    let _event_printer = scoped_task::spawn(print_events(events));
    let _stdin_task = scoped_task::spawn(stdin_send_loop(coordinator.clone()));

    match (cli.listen, cli.connect) {
        (Some(bind_addr), None) => run_host(coordinator, bind_addr, cli.name).await,
        (None, Some(owner_addr)) => run_client(coordinator, owner_addr, cli.name).await,
        _ => bail!("pass exactly one of --listen or --connect"),
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

async fn print_events(mut events: mpsc::UnboundedReceiver<CoordinatorEvent>) {
    while let Some(event) = events.recv().await {
        info!(?event, "coordinator event");
    }
}

/// Reads lines from stdin and broadcasts each as a `Text` message. Silently
/// drops a line typed before any neighbour has joined, the same way a UI
/// would show a toast rather than crash (`Error::NotConnected`).
async fn stdin_send_loop(coordinator: Shared) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => {
                let display_name = {
                    let c = coordinator.lock().await;
                    c.local_id().to_string()
                };
                let outcome = {
                    let mut c = coordinator.lock().await;
                    c.originate(display_name, None, MessageKind::Text, line.into_bytes(), None, None, now_millis())
                };
                match outcome {
                    Ok((_msg, actions)) => dispatch(&coordinator, actions).await,
                    Err(e) => warn!(error = %e, "could not send"),
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        }
    }
}

/// Executes outbound actions the coordinator decided on, by looking up the
/// live per-peer channels in its stream table (§4.2).
async fn dispatch(coordinator: &Shared, actions: Vec<OutboundAction>) {
    let c = coordinator.lock().await;
    for action in actions {
        match action {
            OutboundAction::SendTo(target, frame) => {
                if let Err(e) = c.streams().send(&target, frame) {
                    warn!(%target, error = %e, "send failed");
                }
            }
            OutboundAction::BroadcastExcept(frame, exclude) => {
                c.streams().broadcast(frame, &exclude);
            }
        }
    }
}

async fn run_host(coordinator: Shared, bind_addr: SocketAddr, display_name: String) -> Result<()> {
    {
        let mut c = coordinator.lock().await;
        c.transition(Role::Discovering)?;
        c.transition(Role::Hosting)?;
    }

    let listener: TcpListener = socket::start_server(bind_addr).await.context("binding group-owner socket")?;
    {
        let mut c = coordinator.lock().await;
        c.transition(Role::SocketUp)?;
    }
    info!(%bind_addr, "hosting, waiting for neighbours");

    let _roster_heartbeat = scoped_task::spawn(roster_heartbeat_loop(coordinator.clone()));

    let mut connections = Vec::new();
    loop {
        let (stream, peer_addr) = socket::accept_raw(&listener).await.context("accept failed")?;
        info!(%peer_addr, "accepted connection");
        let coordinator = coordinator.clone();
        let display_name = display_name.clone();
        connections.push(scoped_task::spawn(async move {
            if let Err(e) = run_connection(coordinator, stream, display_name, false).await {
                warn!(error = %e, "connection ended");
            }
        }));
    }
}

async fn run_client(coordinator: Shared, owner_addr: SocketAddr, display_name: String) -> Result<()> {
    {
        let mut c = coordinator.lock().await;
        c.transition(Role::Discovering)?;
        c.transition(Role::Joining)?;
    }

    let connect_timeout = { coordinator.lock().await.config().timeouts.connect };
    let stream = socket::connect_raw(owner_addr, connect_timeout).await.context("connecting to group owner")?;
    {
        let mut c = coordinator.lock().await;
        c.transition(Role::SocketUp)?;
    }

    run_connection(coordinator, stream, display_name, true).await
}

/// Drives one neighbour's stream end to end: splits it into a reader and a
/// writer task (§5), performs the handshake, then forwards every frame
/// through the coordinator until the stream closes.
async fn run_connection(
    coordinator: Shared,
    stream: tokio::net::TcpStream,
    display_name: String,
    initiate_handshake: bool,
) -> Result<()> {
    let (mut reader, writer) = socket::into_split(stream);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let _writer_task = scoped_task::spawn(writer_loop(writer, outbound_rx));

    let local_id = { coordinator.lock().await.local_id().clone() };
    let my_fields = HandshakeFields {
        device_id: local_id.clone(),
        display_name: display_name.clone(),
        device_name: "mesh-cli".to_string(),
        protocol_version: 1,
    };

    let peer_id = if initiate_handshake {
        let request = my_fields.to_message(MessageKind::Handshake, format!("{local_id}_hs"), now_millis());
        outbound_tx.send(request.to_frame()).ok();

        let frame = socket::read_frame(&mut reader)
            .await?
            .context("connection closed during handshake")?;
        let msg = Message::from_frame(frame)?;
        if msg.kind != MessageKind::HandshakeAck {
            bail!("expected handshake ack, got {:?}", msg.kind);
        }
        let ack = HandshakeFields::from_message(&msg)?;

        let mut c = coordinator.lock().await;
        c.register_stream(ack.device_id.clone(), outbound_tx.clone());
        c.transition(Role::Handshaken).ok();
        c.transition(Role::Operational).ok();
        ack.device_id
    } else {
        let frame = socket::read_frame(&mut reader)
            .await?
            .context("connection closed during handshake")?;
        let msg = Message::from_frame(frame)?;
        if msg.kind != MessageKind::Handshake {
            bail!("expected handshake, got {:?}", msg.kind);
        }
        let fields = HandshakeFields::from_message(&msg)?;

        let ack_fields = {
            let mut c = coordinator.lock().await;
            // Plain TCP exposes no link-layer address; a real wireless
            // driver would thread one through from its `IncomingStream`.
            let result = c.on_handshake_received(fields.clone(), None, tokio::time::Instant::now())?;
            c.register_stream(fields.device_id.clone(), outbound_tx.clone());
            c.transition(Role::Handshaken).ok();
            c.transition(Role::Operational).ok();
            result
        };

        let ack = ack_fields.to_message(MessageKind::HandshakeAck, format!("{local_id}_hsack"), now_millis());
        outbound_tx.send(ack.to_frame()).ok();

        // Broadcast the roster to every connected neighbour, the new one
        // included, rather than unicasting it back down this one stream
        // (§4.4: "broadcasts a Roster frame to all direct neighbours").
        let roster_action = {
            let mut c = coordinator.lock().await;
            c.roster_broadcast_now(now_millis())
        };
        if let Some(action) = roster_action {
            dispatch(&coordinator, vec![action]).await;
        }

        fields.device_id
    };

    info!(%peer_id, "handshake complete");

    let _ping_task = scoped_task::spawn(ping_loop(coordinator.clone(), peer_id.clone(), outbound_tx.clone()));

    let result = reader_loop(coordinator.clone(), &mut reader, peer_id.clone()).await;

    let lost_actions = {
        let mut c = coordinator.lock().await;
        c.on_neighbour_lost(&peer_id, now_millis())
    };
    dispatch(&coordinator, lost_actions).await;

    result
}

async fn writer_loop(mut writer: FramedWriter, mut outbound_rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(e) = socket::write_frame(&mut writer, &frame).await {
            warn!(error = %e, "write failed, dropping connection");
            break;
        }
    }
}

/// Host-only roster heartbeat (§4.4 trigger (c)): re-broadcasts the current
/// roster every `ROSTER_HEARTBEAT_INTERVAL` so a client that missed an
/// earlier broadcast still converges. A no-op tick whenever we are not the
/// host (`roster_broadcast_now` returns `None`).
async fn roster_heartbeat_loop(coordinator: Shared) {
    let mut ticker = tokio::time::interval(ROSTER_HEARTBEAT_INTERVAL);
    loop {
        ticker.tick().await;
        let action = {
            let mut c = coordinator.lock().await;
            c.roster_broadcast_now(now_millis())
        };
        if let Some(action) = action {
            dispatch(&coordinator, vec![action]).await;
        }
    }
}

async fn ping_loop(coordinator: Shared, peer_id: DeviceId, outbound_tx: mpsc::UnboundedSender<Frame>) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    loop {
        ticker.tick().await;
        let (local_id, sequence) = {
            let mut c = coordinator.lock().await;
            let local_id = c.local_id().clone();
            let sequence = c.quality_tracker(&peer_id).record_ping_sent(tokio::time::Instant::now());
            (local_id, sequence)
        };
        let ping = quality::sequenced_message(MessageKind::Ping, &local_id, sequence, now_millis());
        if outbound_tx.send(ping.to_frame()).is_err() {
            break;
        }
    }
}

/// Forwards frames read from one neighbour into the coordinator, replying
/// to control frames (`Ping`/`Pong`/`Roster`/`Ack`) inline and routing
/// everything else through `deliver_and_relay` (§4.6).
async fn reader_loop(coordinator: Shared, reader: &mut FramedReader, peer_id: DeviceId) -> Result<()> {
    loop {
        let frame = match socket::read_frame(reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            // An oversized or JSON-malformed line: drop this one frame and
            // keep reading, don't tear down the whole neighbour connection.
            Err(Error::Malformed(reason)) => {
                warn!(%peer_id, reason, "dropping oversized or malformed frame");
                coordinator.lock().await.stats().record_malformed();
                continue;
            }
            Err(e) => {
                warn!(%peer_id, error = %e, "read failed");
                return Ok(());
            }
        };

        let frame_len = serde_json::to_string(&frame).map(|s| s.len()).unwrap_or(0);
        let msg = match Message::from_frame(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%peer_id, error = %e, "dropping malformed frame");
                coordinator.lock().await.stats().record_malformed();
                continue;
            }
        };

        match msg.kind {
            MessageKind::Ping => {
                let local_id = { coordinator.lock().await.local_id().clone() };
                let seq = quality::sequence_of(&msg).unwrap_or(0);
                let pong = quality::sequenced_message(MessageKind::Pong, &local_id, seq, now_millis());
                let c = coordinator.lock().await;
                let _ = c.streams().send(&peer_id, pong.to_frame());
            }
            MessageKind::Pong => {
                let mut c = coordinator.lock().await;
                if let Ok(seq) = quality::sequence_of(&msg) {
                    let tracker = c.quality_tracker(&peer_id);
                    tracker.record_pong(seq, tokio::time::Instant::now());
                    if tracker.check_degraded() {
                        c.on_quality_degraded(peer_id.clone());
                    }
                }
            }
            MessageKind::Roster => {
                if let Ok(entries) = roster::from_message(&msg) {
                    coordinator.lock().await.apply_roster(entries, tokio::time::Instant::now());
                }
            }
            MessageKind::Ack => {
                coordinator.lock().await.on_ack_received(&msg.message_id);
            }
            MessageKind::Handshake | MessageKind::HandshakeAck => {
                warn!(%peer_id, "unexpected handshake frame after handshake completed");
            }
            MessageKind::Text | MessageKind::Emergency | MessageKind::Sos | MessageKind::Location => {
                let actions = {
                    let mut c = coordinator.lock().await;
                    c.deliver_and_relay(msg, frame_len, tokio::time::Instant::now())
                };
                dispatch(&coordinator, actions).await;
            }
        }
    }
}
