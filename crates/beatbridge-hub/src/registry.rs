//! Connection registry
//!
//! Tracks open client connections in accept order together with each
//! connection's last reported loop position. One lock guards everything;
//! broadcasts work on a snapshot of the open set taken under that lock so a
//! connect or disconnect mid-broadcast cannot disturb the iteration.

use beatbridge_transport::{TransportError, TransportSender};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Connection identifier, unique for the life of the process.
///
/// Identifiers increase with accept order, which is also the registry's
/// iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connected client
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    sender: Arc<dyn TransportSender>,
    pub connected_at: Instant,
}

impl Connection {
    pub fn new(sender: Arc<dyn TransportSender>, addr: SocketAddr) -> Self {
        Self {
            id: ConnectionId::next(),
            addr,
            sender,
            connected_at: Instant::now(),
        }
    }

    /// Queue a text frame for this client
    pub fn send(&self, text: String) -> Result<(), TransportError> {
        self.sender.send(text)
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_connected()
    }

    pub fn close(&self) {
        self.sender.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("open", &self.is_open())
            .finish()
    }
}

struct Entry {
    conn: Arc<Connection>,
    loop_beat: Option<f64>,
}

/// Set of open connections
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<BTreeMap<ConnectionId, Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; returns the new size
    pub fn add(&self, conn: Arc<Connection>) -> usize {
        let mut entries = self.entries.write();
        entries.insert(
            conn.id,
            Entry {
                conn,
                loop_beat: None,
            },
        );
        entries.len()
    }

    /// Register a connection after running `greet` under the registry lock.
    ///
    /// `greet` sees the size including the new connection and the current
    /// loop position; nothing can be broadcast to the connection before it
    /// returns. Returns the new size.
    pub fn admit<F>(&self, conn: Arc<Connection>, greet: F) -> usize
    where
        F: FnOnce(&Connection, usize, Option<f64>),
    {
        let mut entries = self.entries.write();
        let size = entries.len() + usize::from(!entries.contains_key(&conn.id));
        greet(&conn, size, first_open_loop_beat(&entries));
        entries.insert(
            conn.id,
            Entry {
                conn,
                loop_beat: None,
            },
        );
        entries.len()
    }

    /// Unregister a connection, dropping its loop position.
    ///
    /// Returns the new size, or `None` if it was not registered.
    pub fn remove(&self, id: ConnectionId) -> Option<usize> {
        let mut entries = self.entries.write();
        entries.remove(&id).map(|_| entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.read().contains_key(&id)
    }

    /// Store a loop position; ignored for unknown connections
    pub fn set_loop_beat(&self, id: ConnectionId, beat: f64) -> bool {
        match self.entries.write().get_mut(&id) {
            Some(entry) => {
                entry.loop_beat = Some(beat);
                true
            }
            None => false,
        }
    }

    pub fn clear_loop_beat(&self, id: ConnectionId) {
        if let Some(entry) = self.entries.write().get_mut(&id) {
            entry.loop_beat = None;
        }
    }

    pub fn loop_beat(&self, id: ConnectionId) -> Option<f64> {
        self.entries.read().get(&id).and_then(|e| e.loop_beat)
    }

    /// Loop position of the first open connection (in accept order) that has one
    pub fn any_open_loop_beat(&self) -> Option<f64> {
        first_open_loop_beat(&self.entries.read())
    }

    /// Snapshot of the currently open connections
    pub fn open_connections(&self) -> Vec<Arc<Connection>> {
        self.entries
            .read()
            .values()
            .filter(|e| e.conn.is_open())
            .map(|e| e.conn.clone())
            .collect()
    }

    /// Snapshot of the currently open connections other than `except`
    pub fn open_connections_except(&self, except: ConnectionId) -> Vec<Arc<Connection>> {
        self.entries
            .read()
            .values()
            .filter(|e| e.conn.id != except && e.conn.is_open())
            .map(|e| e.conn.clone())
            .collect()
    }

    /// Run `f` on each open connection, outside the registry lock
    pub fn for_each_open<F: FnMut(&Connection)>(&self, mut f: F) {
        for conn in self.open_connections() {
            f(&conn);
        }
    }

    /// Run `f` on each open connection except `except`, outside the registry lock
    pub fn for_each_open_except<F: FnMut(&Connection)>(&self, except: ConnectionId, mut f: F) {
        for conn in self.open_connections_except(except) {
            f(&conn);
        }
    }

    /// Remove every connection, returning them in accept order
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        std::mem::take(&mut *self.entries.write())
            .into_values()
            .map(|e| e.conn)
            .collect()
    }
}

fn first_open_loop_beat(entries: &BTreeMap<ConnectionId, Entry>) -> Option<f64> {
    entries
        .values()
        .filter(|e| e.conn.is_open())
        .find_map(|e| e.loop_beat)
}
