//! The non-owning side of a connection, as seen by rooms and the hub.
//!
//! A connection actor owns its socket and the receiving end of its outbound
//! queue. Everyone else holds a [`ClientHandle`]: an id, a display name, the
//! sending end of that queue and a way to ask the connection to go away.

use std::sync::Arc;

use parley_protocol::{ClientId, User};
use tokio::sync::{Notify, mpsc};

/// An encoded outbound frame, shared by every member it is fanned out to.
pub type Frame = Arc<[u8]>;

/// Why a frame could not be queued for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The client's outbound queue is full. The caller should evict it.
    Saturated,
    /// The client's send loop has already stopped.
    Closed,
}

/// Cloneable handle to a live connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    name: Arc<str>,
    outbound: mpsc::Sender<Frame>,
    kick: Arc<Notify>,
}

/// The receiving half created alongside a [`ClientHandle`]. Owned by the
/// connection's send loop.
#[derive(Debug)]
pub struct ClientQueue {
    /// Frames waiting to be written to the socket.
    pub frames: mpsc::Receiver<Frame>,
    /// Signalled when someone wants this connection torn down.
    pub kick: Arc<Notify>,
}

impl ClientHandle {
    /// Creates a handle with an outbound queue of `capacity` frames.
    pub fn new(id: ClientId, name: impl Into<Arc<str>>, capacity: usize) -> (Self, ClientQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let kick = Arc::new(Notify::new());
        let handle = Self {
            id,
            name: name.into(),
            outbound: tx,
            kick: Arc::clone(&kick),
        };
        (handle, ClientQueue { frames: rx, kick })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The sender stub stamped on envelopes from this client.
    pub fn user(&self) -> User {
        User::new(self.id, &*self.name)
    }

    /// Queues `frame` without waiting.
    pub fn try_deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Saturated,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Queues `frame`, and asks the connection to disconnect if its queue
    /// is full. Returns `false` if the frame was not queued.
    pub fn deliver_or_kick(&self, frame: Frame) -> bool {
        match self.try_deliver(frame) {
            Ok(()) => true,
            Err(DeliveryError::Saturated) => {
                tracing::warn!(client_id = %self.id, "outbound queue full, disconnecting");
                self.kick();
                false
            }
            Err(DeliveryError::Closed) => false,
        }
    }

    /// Asks the connection to disconnect. The request is remembered if the
    /// send loop is not waiting yet.
    pub fn kick(&self) {
        self.kick.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        Arc::from(text.as_bytes())
    }

    #[test]
    fn test_user_stub_carries_id_and_name() {
        let id = ClientId::new();
        let (handle, _queue) = ClientHandle::new(id, "alice", 4);
        let user = handle.user();
        assert_eq!(user.id, Some(id));
        assert_eq!(user.name, "alice");
    }

    #[test]
    fn test_try_deliver_reports_saturation() {
        let (handle, mut queue) = ClientHandle::new(ClientId::new(), "bob", 1);
        assert_eq!(handle.try_deliver(frame("a")), Ok(()));
        assert_eq!(handle.try_deliver(frame("b")), Err(DeliveryError::Saturated));
        assert_eq!(&*queue.frames.try_recv().unwrap(), b"a");
    }

    #[test]
    fn test_try_deliver_reports_closed_queue() {
        let (handle, queue) = ClientHandle::new(ClientId::new(), "carol", 1);
        drop(queue);
        assert_eq!(handle.try_deliver(frame("a")), Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn test_kick_before_wait_is_not_lost() {
        let (handle, queue) = ClientHandle::new(ClientId::new(), "dave", 1);
        handle.kick();
        tokio::time::timeout(std::time::Duration::from_secs(1), queue.kick.notified())
            .await
            .expect("kick should be remembered");
    }

    #[test]
    fn test_deliver_or_kick_kicks_saturated_client() {
        let (handle, _queue) = ClientHandle::new(ClientId::new(), "erin", 1);
        assert!(handle.deliver_or_kick(frame("a")));
        assert!(!handle.deliver_or_kick(frame("b")));
    }
}
