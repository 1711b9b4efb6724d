//! Bus subscriber loop.
//!
//! One task per process drains the bus subscription and hands every
//! message to the hub, which relays room traffic to local members and
//! applies remote presence events.

use parley_bus::BusMessage;
use parley_protocol::Codec;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::hub::Hub;

/// Spawns the subscriber loop. It ends when the subscription closes.
pub fn spawn_bridge<C>(hub: Hub<C>, mut messages: mpsc::Receiver<BusMessage>) -> JoinHandle<()>
where
    C: Codec + Clone,
{
    tokio::spawn(async move {
        tracing::info!(instance = %hub.instance_id(), "bus bridge started");
        while let Some(msg) = messages.recv().await {
            hub.handle_bus_message(msg).await;
        }
        tracing::warn!(instance = %hub.instance_id(), "bus subscription closed");
    })
}
