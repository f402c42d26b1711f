use crate::model::ConnectionId;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// One end of a bidirectional channel between the coordinator and a remote
/// frame or popup.
///
/// Inbound traffic does not flow through this trait: the transport task that
/// owns the remote side forwards messages and its single disconnect
/// notification to the coordinator, tagged with [`Peer::id`]. The coordinator
/// stops listening to a peer by dropping its route.
pub trait Peer: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn post(&self, message: Value);

    /// Terminates the connection. Safe to call more than once.
    fn disconnect(&self);
}

pub fn post_event<T: Serialize>(peer: &dyn Peer, event: &T) {
    match serde_json::to_value(event) {
        Ok(message) => peer.post(message),
        Err(err) => tracing::warn!(conn = %peer.id(), error = %err, "failed to encode outbound event"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    Post(Value),
    Close,
}

/// Peer backed by an unbounded queue drained by a transport task.
#[derive(Debug)]
pub struct ChannelPeer {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<PeerCommand>,
}

impl ChannelPeer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PeerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::new(),
                tx,
            },
            rx,
        )
    }
}

impl Peer for ChannelPeer {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn post(&self, message: Value) {
        // A closed queue means the transport already went away; its
        // disconnect event is on its way.
        let _ = self.tx.send(PeerCommand::Post(message));
    }

    fn disconnect(&self) {
        let _ = self.tx.send(PeerCommand::Close);
    }
}
