//! # Avalanche Network Abstraction
//!
//! | Type | Role |
//! |------|------|
//! | `AvalancheNetwork` | async transport used by the event loop |
//! | `NetworkError` | transport failures |
//! | `MemoryHub` | in-process switchboard shared by simulated nodes |
//! | `MemoryNetwork` | one node's endpoint on a `MemoryHub` |
//!
//! Every message crossing a `MemoryHub` is encoded and decoded with the
//! wire codec, so the simulator exercises the same bytes a socket would.
//!
//! ## Links
//!
//! A link carries one nonce per side, drawn by the hub when the link is
//! opened. Each endpoint reports them from its own view:
//!
//! ```text
//!   A ── link ── B
//!   A sees { local: nA, remote: nB }
//!   B sees { local: nB, remote: nA }
//! ```
//!
//! An isolated node keeps its links but every message to or from it is
//! dropped, which is how partitions are simulated.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ava_proto::{CodecError, Message, SessionNonces};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info};

use crate::ids::{ConnectionDirection, NodeId};

// ════════════════════════════════════════════════════════════════════════════
// NETWORK ERROR
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("{0} is not connected")]
    NotConnected(NodeId),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("network has been shut down")]
    Shutdown,
}

// ════════════════════════════════════════════════════════════════════════════
// TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Transport seen by one avalanche node.
#[async_trait]
pub trait AvalancheNetwork: Send + Sync {
    async fn send(&self, to: NodeId, msg: Message) -> Result<(), NetworkError>;

    /// Next inbound message. `Err(Shutdown)` once the transport is closed.
    async fn recv(&self) -> Result<(NodeId, Message), NetworkError>;

    /// Next inbound message if one is queued.
    fn try_recv(&self) -> Result<Option<(NodeId, Message)>, NetworkError>;

    fn disconnect(&self, node: NodeId);

    fn node_addr(&self, node: NodeId) -> Option<SocketAddr>;

    fn connected_nodes(&self) -> Vec<NodeId>;

    fn session_nonces(&self, node: NodeId) -> Option<SessionNonces>;

    /// `Outbound` when this side opened the link to `node`.
    fn direction(&self, node: NodeId) -> Option<ConnectionDirection>;
}

// ════════════════════════════════════════════════════════════════════════════
// MEMORY HUB
// ════════════════════════════════════════════════════════════════════════════

type Frame = (NodeId, Vec<u8>);

struct Endpoint {
    addr: SocketAddr,
    inbox: UnboundedSender<Frame>,
}

#[derive(Default)]
struct HubInner {
    endpoints: HashMap<NodeId, Endpoint>,
    /// `(a, b)` holds a's nonce on the link to b.
    links: HashMap<(NodeId, NodeId), u64>,
    /// `(a, b)` when a opened the link to b.
    opened: HashSet<(NodeId, NodeId)>,
    isolated: HashSet<NodeId>,
    next_nonce: u64,
}

#[derive(Default)]
pub struct MemoryHub {
    inner: RwLock<HubInner>,
}

impl MemoryHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach `node` to the hub.
    pub fn join(self: &Arc<Self>, node: NodeId, addr: SocketAddr) -> MemoryNetwork {
        let (tx, rx) = unbounded_channel();
        self.inner.write().endpoints.insert(node, Endpoint { addr, inbox: tx });
        debug!("{} joined the hub at {}", node, addr);
        MemoryNetwork { id: node, hub: Arc::clone(self), inbox: TokioMutex::new(rx) }
    }

    /// Open a link from `a` to `b`: outbound for `a`, inbound for `b`.
    /// Returns false if either is unknown or the link already exists.
    pub fn connect(&self, a: NodeId, b: NodeId) -> bool {
        let mut inner = self.inner.write();
        if a == b
            || !inner.endpoints.contains_key(&a)
            || !inner.endpoints.contains_key(&b)
            || inner.links.contains_key(&(a, b))
        {
            return false;
        }
        let na = inner.next_nonce;
        let nb = na.wrapping_add(1);
        inner.next_nonce = nb.wrapping_add(1);
        inner.links.insert((a, b), na);
        inner.links.insert((b, a), nb);
        inner.opened.insert((a, b));
        true
    }

    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut inner = self.inner.write();
        inner.links.remove(&(a, b));
        inner.links.remove(&(b, a));
        inner.opened.remove(&(a, b));
        inner.opened.remove(&(b, a));
    }

    pub fn set_isolated(&self, node: NodeId, isolated: bool) {
        let mut inner = self.inner.write();
        if isolated {
            inner.isolated.insert(node);
        } else {
            inner.isolated.remove(&node);
        }
        info!("{} isolation set to {}", node, isolated);
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.inner.read().links.len() / 2
    }

    fn deliver(&self, from: NodeId, to: NodeId, bytes: Vec<u8>) -> Result<(), NetworkError> {
        let inner = self.inner.read();
        if !inner.links.contains_key(&(from, to)) {
            return Err(NetworkError::NotConnected(to));
        }
        if inner.isolated.contains(&from) || inner.isolated.contains(&to) {
            debug!("dropping frame {} -> {}: isolated", from, to);
            return Ok(());
        }
        let endpoint = inner.endpoints.get(&to).ok_or(NetworkError::NotConnected(to))?;
        endpoint.inbox.send((from, bytes)).map_err(|_| NetworkError::NotConnected(to))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MEMORY NETWORK
// ════════════════════════════════════════════════════════════════════════════

pub struct MemoryNetwork {
    id: NodeId,
    hub: Arc<MemoryHub>,
    inbox: TokioMutex<UnboundedReceiver<Frame>>,
}

impl MemoryNetwork {
    #[must_use]
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

#[async_trait]
impl AvalancheNetwork for MemoryNetwork {
    async fn send(&self, to: NodeId, msg: Message) -> Result<(), NetworkError> {
        let bytes = msg.encode()?;
        self.hub.deliver(self.id, to, bytes)
    }

    async fn recv(&self) -> Result<(NodeId, Message), NetworkError> {
        let frame = self.inbox.lock().await.recv().await;
        let (from, bytes) = frame.ok_or(NetworkError::Shutdown)?;
        Ok((from, Message::decode(&bytes)?))
    }

    fn try_recv(&self) -> Result<Option<(NodeId, Message)>, NetworkError> {
        let Ok(mut inbox) = self.inbox.try_lock() else {
            return Ok(None);
        };
        match inbox.try_recv() {
            Ok((from, bytes)) => Ok(Some((from, Message::decode(&bytes)?))),
            Err(tokio::sync::mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected) => Err(NetworkError::Shutdown),
        }
    }

    fn disconnect(&self, node: NodeId) {
        self.hub.disconnect(self.id, node);
    }

    fn node_addr(&self, node: NodeId) -> Option<SocketAddr> {
        self.hub.inner.read().endpoints.get(&node).map(|e| e.addr)
    }

    fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .hub
            .inner
            .read()
            .links
            .keys()
            .filter(|(a, _)| *a == self.id)
            .map(|(_, b)| *b)
            .collect();
        nodes.sort();
        nodes
    }

    fn session_nonces(&self, node: NodeId) -> Option<SessionNonces> {
        let inner = self.hub.inner.read();
        let local = *inner.links.get(&(self.id, node))?;
        let remote = *inner.links.get(&(node, self.id))?;
        Some(SessionNonces { local, remote })
    }

    fn direction(&self, node: NodeId) -> Option<ConnectionDirection> {
        let inner = self.hub.inner.read();
        if !inner.links.contains_key(&(self.id, node)) {
            return None;
        }
        if inner.opened.contains(&(self.id, node)) {
            Some(ConnectionDirection::Outbound)
        } else {
            Some(ConnectionDirection::Inbound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_messages_cross_the_codec() {
        let hub = MemoryHub::new();
        let a = hub.join(NodeId(1), addr(1));
        let b = hub.join(NodeId(2), addr(2));
        assert_eq!(a.send(NodeId(2), Message::GetAvaProofs).await, Err(NetworkError::NotConnected(NodeId(2))));

        assert!(hub.connect(NodeId(1), NodeId(2)));
        assert!(!hub.connect(NodeId(2), NodeId(1)));
        a.send(NodeId(2), Message::AvaProofsReq(vec![1, 2])).await.expect("send");
        let (from, msg) = b.recv().await.expect("recv");
        assert_eq!(from, NodeId(1));
        assert_eq!(msg, Message::AvaProofsReq(vec![1, 2]));
        assert_eq!(b.try_recv(), Ok(None));
        assert_eq!(a.connected_nodes(), vec![NodeId(2)]);
        assert_eq!(b.node_addr(NodeId(1)), Some(addr(1)));
    }

    #[tokio::test]
    async fn test_nonces_are_mirrored() {
        let hub = MemoryHub::new();
        let a = hub.join(NodeId(1), addr(1));
        let b = hub.join(NodeId(2), addr(2));
        hub.connect(NodeId(1), NodeId(2));
        let na = a.session_nonces(NodeId(2)).expect("a view");
        let nb = b.session_nonces(NodeId(1)).expect("b view");
        assert_eq!(na.local, nb.remote);
        assert_eq!(na.remote, nb.local);
        assert_ne!(na.local, na.remote);
        assert_eq!(a.direction(NodeId(2)), Some(ConnectionDirection::Outbound));
        assert_eq!(b.direction(NodeId(1)), Some(ConnectionDirection::Inbound));

        a.disconnect(NodeId(2));
        assert_eq!(b.direction(NodeId(1)), None);
        assert!(b.session_nonces(NodeId(1)).is_none());
        assert_eq!(hub.link_count(), 0);
    }

    #[tokio::test]
    async fn test_isolated_node_loses_traffic() {
        let hub = MemoryHub::new();
        let a = hub.join(NodeId(1), addr(1));
        let b = hub.join(NodeId(2), addr(2));
        hub.connect(NodeId(1), NodeId(2));
        hub.set_isolated(NodeId(2), true);
        a.send(NodeId(2), Message::GetAvaAddr).await.expect("dropped silently");
        assert_eq!(b.try_recv(), Ok(None));

        hub.set_isolated(NodeId(2), false);
        a.send(NodeId(2), Message::GetAvaAddr).await.expect("send");
        assert_eq!(b.try_recv(), Ok(Some((NodeId(1), Message::GetAvaAddr))));
    }
}
