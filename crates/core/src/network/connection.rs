//! Connection-level interfaces consumed by the circuit core.
//!
//! A [`Connection`] is the circuit-facing face of one authenticated link to
//! a peer relay: a writer queue for outbound cells and a registry that
//! demultiplexes inbound cells to per-circuit queues by circuit id. The
//! TLS/TCP machinery, version/NETINFO handshake, and the reader/writer tasks
//! that feed these queues live outside this crate.

use onionrelay_common::{CircId, Fingerprint};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::trace;

use crate::protocol::Cell;

/// Sending half of a circuit's inbound cell queue
pub type CellSender = mpsc::Sender<Cell>;

/// Receiving half of a circuit's inbound cell queue
pub type CellReceiver = mpsc::Receiver<Cell>;

/// How many random draws to try before declaring the id space exhausted
const MAX_ID_ATTEMPTS: usize = 32;

/// Everything an extension request tells us about how to reach the next hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHint {
    /// Candidate TCP addresses, in preference order
    pub addresses: Vec<SocketAddr>,

    /// Identity fingerprint the connection must authenticate to
    pub fingerprint: Fingerprint,

    /// Ed25519 identity, when the requester pinned one
    pub ed_identity: Option<[u8; 32]>,
}

/// One authenticated link to a peer relay, as seen by circuits.
pub struct Connection {
    /// Peer address, for logging
    peer: SocketAddr,

    /// Whether we initiated this connection (decides circuit id parity)
    initiator: bool,

    /// Outbound cell queue drained by the connection's writer task
    writer: CellSender,

    /// Inbound demultiplexer: circuit id to that circuit's cell queue
    circuits: RwLock<HashMap<CircId, CellSender>>,
}

impl Connection {
    pub fn new(peer: SocketAddr, initiator: bool, writer: CellSender) -> Self {
        Self {
            peer,
            initiator,
            writer,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Queue a cell for the peer
    pub async fn send_cell(&self, cell: Cell) -> Result<(), ConnectionError> {
        self.writer
            .send(cell)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Allocate a fresh circuit id on this connection and route its inbound
    /// cells to `sender`.
    ///
    /// The id is a random 31-bit value with the high bit matching our role
    /// on the connection, so both sides draw from disjoint spaces. Each id
    /// is handed out at most once.
    pub async fn add_circuit(&self, sender: CellSender) -> Result<CircId, ConnectionError> {
        let mut circuits = self.circuits.write().await;

        for _ in 0..MAX_ID_ATTEMPTS {
            let mut raw = rand::thread_rng().gen::<u32>() & !CircId::INITIATOR_BIT;
            if self.initiator {
                raw |= CircId::INITIATOR_BIT;
            }
            if raw == 0 {
                continue;
            }

            let id = CircId::new(raw);
            if let std::collections::hash_map::Entry::Vacant(entry) = circuits.entry(id) {
                entry.insert(sender);
                trace!(peer = %self.peer, circ_id = %id, "allocated circuit id");
                return Ok(id);
            }
        }

        Err(ConnectionError::IdExhausted)
    }

    /// Route inbound cells for a peer-chosen circuit id to `sender`.
    ///
    /// Used when the other side allocated the id (a CREATE(2) we accepted).
    pub async fn bind_circuit(
        &self,
        id: CircId,
        sender: CellSender,
    ) -> Result<(), ConnectionError> {
        let mut circuits = self.circuits.write().await;
        match circuits.entry(id) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(ConnectionError::IdInUse(id))
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(sender);
                Ok(())
            }
        }
    }

    /// Drop the routing entry for a circuit id
    pub async fn remove_circuit(&self, id: CircId) {
        self.circuits.write().await.remove(&id);
    }

    /// Hand an inbound cell to the circuit it belongs to.
    ///
    /// Called by the connection's reader task for every framed cell.
    pub async fn deliver(&self, cell: Cell) -> Result<(), ConnectionError> {
        let sender = self
            .circuits
            .read()
            .await
            .get(&cell.circ_id)
            .cloned()
            .ok_or(ConnectionError::UnknownCircuit(cell.circ_id))?;

        sender.send(cell).await.map_err(|_| ConnectionError::Closed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("initiator", &self.initiator)
            .finish()
    }
}

/// Outbound dialer used by circuit extension: resolves a node hint into an
/// established connection, reusing or dialing as it sees fit.
#[async_trait::async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connection(&self, hint: &NodeHint) -> Result<Arc<Connection>, ConnectionError>;
}

/// Connection-level errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("no free circuit id on this connection")]
    IdExhausted,

    #[error("circuit id {0} already in use")]
    IdInUse(CircId),

    #[error("no circuit with id {0} on this connection")]
    UnknownCircuit(CircId),

    #[error("failed to reach next hop: {0}")]
    Dial(String),
}
