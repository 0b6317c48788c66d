//! One leg of a transverse circuit.
//!
//! A link binds a connection, the circuit id the circuit is known by on that
//! connection, and the receiving half of the circuit's inbound cell queue.
//! The sending halves are held by the connection layer's reader tasks; once
//! the circuit tears the link down, producers writing to the queue observe a
//! closed channel instead of blocking.

use onionrelay_common::CircId;
use std::sync::Arc;
use tracing::trace;

use crate::network::{CellReceiver, Connection};
use crate::protocol::{Cell, DestroyReason};

/// Errors on a circuit leg
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("circuit leg closed")]
    Closed,
}

/// Bidirectional handle on one leg of a circuit
pub struct CircuitLink {
    conn: Arc<Connection>,
    circ_id: CircId,
    inbound: CellReceiver,
}

impl CircuitLink {
    pub fn new(conn: Arc<Connection>, circ_id: CircId, inbound: CellReceiver) -> Self {
        Self {
            conn,
            circ_id,
            inbound,
        }
    }

    /// Circuit id on this leg's connection
    pub fn circ_id(&self) -> CircId {
        self.circ_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Send a cell out on this leg, stamping it with this leg's circuit id.
    pub async fn send_cell(&self, mut cell: Cell) -> Result<(), LinkError> {
        cell.circ_id = self.circ_id;
        self.conn.send_cell(cell).await.map_err(|_| LinkError::Closed)
    }

    /// Next inbound cell for this circuit on this leg.
    pub async fn receive_cell(&mut self) -> Result<Cell, LinkError> {
        self.inbound.recv().await.ok_or(LinkError::Closed)
    }

    /// Tear this leg down: stop accepting inbound cells, unregister the
    /// circuit id, and tell the peer why with a DESTROY.
    pub async fn destroy(mut self, reason: DestroyReason) -> Result<(), LinkError> {
        trace!(circ_id = %self.circ_id, %reason, "destroying circuit leg");
        self.inbound.close();
        self.conn.remove_circuit(self.circ_id).await;
        self.conn
            .send_cell(Cell::destroy(self.circ_id, reason))
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Tear this leg down without notifying the peer, for the leg the
    /// peer's own DESTROY arrived on.
    pub async fn shutdown(mut self) {
        self.inbound.close();
        self.conn.remove_circuit(self.circ_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::CellSender;
    use crate::protocol::CellCommand;
    use tokio::sync::mpsc;

    fn link() -> (CircuitLink, CellSender, CellReceiver) {
        let (writer_tx, writer_rx) = mpsc::channel(8);
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let peer = "127.0.0.1:9001".parse().unwrap();
        let conn = Arc::new(Connection::new(peer, true, writer_tx));
        (
            CircuitLink::new(conn, CircId::new(0x8000_0007), inbound_rx),
            inbound_tx,
            writer_rx,
        )
    }

    #[tokio::test]
    async fn test_send_stamps_circ_id() {
        let (link, _inbound, mut writer) = link();

        let cell = Cell::new(CircId::new(1), CellCommand::Relay, &[0xaa]);
        link.send_cell(cell).await.unwrap();

        let sent = writer.recv().await.unwrap();
        assert_eq!(sent.circ_id, CircId::new(0x8000_0007));
    }

    #[tokio::test]
    async fn test_receive_in_order() {
        let (mut link, inbound, _writer) = link();

        for n in 0..3u8 {
            inbound
                .send(Cell::new(link.circ_id(), CellCommand::Relay, &[n]))
                .await
                .unwrap();
        }
        for n in 0..3u8 {
            assert_eq!(link.receive_cell().await.unwrap().payload[0], n);
        }
    }

    #[tokio::test]
    async fn test_destroy_sends_reason_and_closes_queue() {
        let (link, inbound, mut writer) = link();
        let circ_id = link.circ_id();

        link.destroy(DestroyReason::Protocol).await.unwrap();

        let sent = writer.recv().await.unwrap();
        assert_eq!(sent.command, CellCommand::Destroy);
        assert_eq!(sent.circ_id, circ_id);
        assert_eq!(sent.destroy_reason(), DestroyReason::Protocol);

        // Producers now observe the closed queue instead of blocking.
        let cell = Cell::new(circ_id, CellCommand::Relay, &[]);
        assert!(inbound.send(cell).await.is_err());
    }

    #[tokio::test]
    async fn test_receive_after_producers_gone() {
        let (mut link, inbound, _writer) = link();
        drop(inbound);
        assert!(matches!(link.receive_cell().await, Err(LinkError::Closed)));
    }
}
