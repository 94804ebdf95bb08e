//! Observed transport surface: a channel and its connections.
//!
//! A backend populates a [`Channel`] with [`Connection`]s as peers dial in or
//! are dialled. The harness only observes: which connections exist, which
//! direction they run in, when the remote side identified itself and when
//! the connection closed.
//!
//! Connections come in pairs ([`Connection::pair`]): one outbound end on the
//! dialling side and one inbound end on the accepting side. Closing either
//! end closes both.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::event::{EventEmitter, Subscription};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which side initiated a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The remote side dialled us.
    In,
    /// We dialled the remote side.
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("in"),
            Direction::Out => f.write_str("out"),
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close.
    Closed,
    /// Closed because of an error.
    Error(String),
}

struct ConnectionInner {
    id: u64,
    direction: Direction,
    identity: watch::Sender<Option<String>>,
    close: Arc<watch::Sender<Option<CloseReason>>>,
}

/// One end of a connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    fn with_close(direction: Direction, close: Arc<watch::Sender<Option<CloseReason>>>) -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                direction,
                identity,
                close,
            }),
        }
    }

    /// A single unpaired connection end.
    pub fn new(direction: Direction) -> Self {
        let (close, _) = watch::channel(None);
        Self::with_close(direction, Arc::new(close))
    }

    /// Create the two ends of one connection: `(outbound, inbound)`.
    ///
    /// Both ends share their close state.
    pub fn pair() -> (Self, Self) {
        let (close, _) = watch::channel(None);
        let close = Arc::new(close);
        (
            Self::with_close(Direction::Out, close.clone()),
            Self::with_close(Direction::In, close),
        )
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Direction of this end.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Host:port the remote side identified as, once identification finished.
    pub fn remote_name(&self) -> Option<String> {
        self.inner.identity.borrow().clone()
    }

    /// Whether identification has completed.
    pub fn is_identified(&self) -> bool {
        self.inner.identity.borrow().is_some()
    }

    /// Whether the connection has closed (orderly or by error).
    pub fn is_closed(&self) -> bool {
        self.inner.close.borrow().is_some()
    }

    /// Complete identification. Only the first call has an effect.
    pub fn identify(&self, remote_name: impl Into<String>) -> bool {
        let remote_name = remote_name.into();
        self.inner.identity.send_if_modified(|identity| {
            if identity.is_some() {
                return false;
            }
            *identity = Some(remote_name);
            true
        })
    }

    /// Close the connection. Only the first close or error has an effect.
    pub fn close(&self) -> bool {
        self.finish(CloseReason::Closed)
    }

    /// Close the connection with an error.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.finish(CloseReason::Error(reason.into()))
    }

    fn finish(&self, reason: CloseReason) -> bool {
        self.inner.close.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason);
            true
        })
    }

    /// Wait for identification. Returns `None` if the connection closed first.
    pub async fn identified(&self) -> Option<String> {
        let mut identity = self.inner.identity.subscribe();
        let mut close = self.inner.close.subscribe();
        tokio::select! {
            biased;
            name = identity.wait_for(Option::is_some) => {
                name.ok().and_then(|name| (*name).clone())
            }
            _ = close.wait_for(Option::is_some) => self.remote_name(),
        }
    }

    /// Wait for the first of close or error.
    pub async fn closed(&self) -> CloseReason {
        let mut close = self.inner.close.subscribe();
        let reason = match close.wait_for(Option::is_some).await {
            Ok(state) => (*state).clone(),
            Err(_) => None,
        };
        reason.unwrap_or(CloseReason::Closed)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("direction", &self.direction())
            .field("remote_name", &self.remote_name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct ChannelInner {
    connections: Mutex<Vec<Connection>>,
    new_connections: EventEmitter<Connection>,
}

/// A node's or endpoint's view of its connections.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                connections: Mutex::new(Vec::new()),
                new_connections: EventEmitter::new(),
            }),
        }
    }

    /// Register a connection and announce it to subscribers.
    pub fn add_connection(&self, connection: Connection) {
        self.inner.connections.lock().push(connection.clone());
        self.inner.new_connections.emit(connection);
    }

    /// Live connections. Closed connections are pruned.
    pub fn connections(&self) -> Vec<Connection> {
        let mut connections = self.inner.connections.lock();
        connections.retain(|c| !c.is_closed());
        connections.clone()
    }

    /// Live, identified connections to `peer` in either direction.
    pub fn connections_to(&self, peer: &str) -> Vec<Connection> {
        self.connections()
            .into_iter()
            .filter(|c| c.remote_name().as_deref() == Some(peer))
            .collect()
    }

    /// Whether a live, identified connection to `peer` runs in `direction`.
    pub fn has_connection(&self, peer: &str, direction: Direction) -> bool {
        self.connections_to(peer)
            .iter()
            .any(|c| c.direction() == direction)
    }

    /// Identified peers with at least one live connection.
    pub fn peers(&self) -> BTreeSet<String> {
        self.connections()
            .iter()
            .filter_map(Connection::remote_name)
            .collect()
    }

    /// Subscribe to connections added from now on.
    pub fn subscribe_connections(&self) -> Subscription<Connection> {
        self.inner.new_connections.subscribe()
    }

    /// Number of live new-connection subscriptions.
    pub fn listener_count(&self) -> usize {
        self.inner.new_connections.listener_count()
    }

    /// Close every connection.
    pub fn close_all(&self) {
        let connections = std::mem::take(&mut *self.inner.connections.lock());
        for connection in connections {
            connection.close();
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("connections", &self.inner.connections.lock().len())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pair_shares_close_state() {
        let (out, inbound) = Connection::pair();
        assert_eq!(out.direction(), Direction::Out);
        assert_eq!(inbound.direction(), Direction::In);
        assert_ne!(out.id(), inbound.id());

        assert!(inbound.close());
        assert!(out.is_closed());
        assert!(!out.fail("late"));
    }

    #[test]
    fn test_identify_once() {
        let conn = Connection::new(Direction::In);
        assert!(conn.identify("127.0.0.1:1"));
        assert!(!conn.identify("127.0.0.1:2"));
        assert_eq!(conn.remote_name().as_deref(), Some("127.0.0.1:1"));
    }

    #[tokio::test]
    async fn test_identified_waits() {
        let conn = Connection::new(Direction::In);
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.identified().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        conn.identify("127.0.0.1:9");
        assert_eq!(waiter.await.unwrap().as_deref(), Some("127.0.0.1:9"));
    }

    #[tokio::test]
    async fn test_identified_resolves_on_close() {
        let conn = Connection::new(Direction::In);
        conn.close();
        assert_eq!(conn.identified().await, None);
    }

    #[tokio::test]
    async fn test_closed_reports_first_reason() {
        let (out, inbound) = Connection::pair();
        out.fail("reset");
        inbound.close();
        assert_eq!(inbound.closed().await, CloseReason::Error("reset".into()));
    }

    #[tokio::test]
    async fn test_channel_prunes_closed_and_announces_new() {
        let channel = Channel::new();
        let mut sub = channel.subscribe_connections();
        assert_eq!(channel.listener_count(), 1);

        let (_out, inbound) = Connection::pair();
        inbound.identify("127.0.0.1:5");
        channel.add_connection(inbound.clone());

        let announced = sub.recv().await.unwrap();
        assert_eq!(announced.id(), inbound.id());
        assert!(channel.has_connection("127.0.0.1:5", Direction::In));
        assert!(!channel.has_connection("127.0.0.1:5", Direction::Out));
        assert_eq!(channel.peers().len(), 1);

        inbound.close();
        assert!(channel.connections().is_empty());

        drop(sub);
        assert_eq!(channel.listener_count(), 0);
    }

    #[test]
    fn test_close_all() {
        let channel = Channel::new();
        let (out, inbound) = Connection::pair();
        channel.add_connection(out);
        channel.close_all();
        assert!(inbound.is_closed());
        assert!(channel.connections().is_empty());
    }
}
