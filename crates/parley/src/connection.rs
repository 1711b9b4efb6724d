//! Per-connection actor: a receive loop and a send loop.
//!
//! Each accepted connection gets its own Tokio task running
//! [`handle_connection`]. The flow is:
//!   1. Register a [`ClientHandle`] with the hub
//!   2. Spawn the send loop, which owns the outbound queue
//!   3. Loop: receive frames, decode, dispatch to the hub
//!   4. On any exit, disconnect exactly once

use std::sync::Arc;
use std::time::Duration;

use parley_protocol::{ClientId, Codec, Envelope, ProtocolError};
use parley_room::{ClientHandle, ClientQueue, Frame};
use parley_transport::{Connection, TransportError, WebSocketConnection};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::ParleyError;
use crate::hub::Hub;

/// Frames within one flush are separated by a newline.
const FRAME_SEPARATOR: u8 = b'\n';

/// Per-connection settings derived from the server configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionSettings {
    pub(crate) heartbeat_interval: Duration,
    pub(crate) send_queue_capacity: usize,
}

/// Why the receive loop stopped.
enum Exit {
    PeerClosed,
    Transport(TransportError),
    Decode(ProtocolError),
    /// The send loop stopped first: write failure or kick.
    WriterStopped,
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<C>(
    conn: WebSocketConnection,
    hub: Hub<C>,
    settings: ConnectionSettings,
) -> Result<(), ParleyError>
where
    C: Codec + Clone,
{
    let conn = Arc::new(conn);
    let client_id = ClientId::from(conn.id().into_inner());
    let (client, queue) = ClientHandle::new(
        client_id,
        conn.display_name(),
        settings.send_queue_capacity,
    );

    hub.register(client.clone()).await;
    let mut writer = tokio::spawn(send_loop(
        Arc::clone(&conn),
        queue,
        settings.heartbeat_interval,
    ));

    let exit = receive_loop(&conn, &hub, client_id, &mut writer).await;

    // Disconnect: leave the hub and every room, then stop the writer,
    // which closes the socket on its way out.
    hub.unregister(client_id).await;
    if !matches!(exit, Exit::WriterStopped) {
        client.kick();
        if let Ok(Err(e)) = writer.await {
            tracing::debug!(%client_id, error = %e, "send loop failed during disconnect");
        }
    }

    match exit {
        Exit::PeerClosed => {
            tracing::info!(%client_id, "connection closed cleanly");
            Ok(())
        }
        Exit::WriterStopped => {
            tracing::info!(%client_id, "send loop stopped, connection dropped");
            Ok(())
        }
        Exit::Transport(e) => {
            tracing::debug!(%client_id, error = %e, "connection lost");
            Err(e.into())
        }
        Exit::Decode(e) => {
            tracing::warn!(%client_id, error = %e, "malformed frame, closing connection");
            Err(e.into())
        }
    }
}

/// Reads one frame at a time and hands each decoded envelope to the hub
/// before reading the next.
async fn receive_loop<C>(
    conn: &WebSocketConnection,
    hub: &Hub<C>,
    client_id: ClientId,
    writer: &mut JoinHandle<Result<(), TransportError>>,
) -> Exit
where
    C: Codec + Clone,
{
    loop {
        let data = tokio::select! {
            received = conn.recv() => match received {
                Ok(Some(data)) => data,
                Ok(None) => return Exit::PeerClosed,
                Err(e) => return Exit::Transport(e),
            },
            finished = &mut *writer => {
                if let Ok(Err(e)) = finished {
                    tracing::debug!(%client_id, error = %e, "send loop failed");
                }
                return Exit::WriterStopped;
            }
        };

        let envelope: Envelope = match hub.codec().decode(&data) {
            Ok(envelope) => envelope,
            Err(e) => return Exit::Decode(e),
        };
        hub.dispatch(client_id, envelope).await;
    }
}

/// Drains the outbound queue into the socket and pings the peer every
/// `heartbeat`. Stops when kicked, when every sender is gone, or on the
/// first failed write, and closes the socket before returning.
async fn send_loop(
    conn: Arc<WebSocketConnection>,
    queue: ClientQueue,
    heartbeat: Duration,
) -> Result<(), TransportError> {
    let ClientQueue { mut frames, kick } = queue;
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(first) = frame else { break Ok(()) };
                let batch = coalesce(first, &mut frames);
                if let Err(e) = conn.send(&batch).await {
                    break Err(e);
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = conn.ping().await {
                    break Err(e);
                }
            }
            _ = kick.notified() => break Ok(()),
        }
    };

    if let Err(e) = conn.close().await {
        tracing::trace!(client_id = %conn.id(), error = %e, "close after send loop");
    }
    outcome
}

/// Joins `first` and everything else already queued into one payload.
fn coalesce(first: Frame, frames: &mut mpsc::Receiver<Frame>) -> Vec<u8> {
    let mut batch = first.to_vec();
    while let Ok(next) = frames.try_recv() {
        batch.push(FRAME_SEPARATOR);
        batch.extend_from_slice(&next);
    }
    batch
}
