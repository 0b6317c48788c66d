//! The transverse circuit state machine.
//!
//! A transverse circuit is a circuit seen from the middle: one leg toward
//! the origin (always present) and, once the circuit has been extended
//! through us, one leg toward the next relay. A single worker task pumps
//! cells between the legs, onion-crypting as it goes, answers EXTEND(2)
//! requests by growing the circuit one hop, and propagates DESTROY in both
//! directions exactly once.

use onionrelay_common::{CircId, RelayConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::crypto::CryptoState;
use super::link::{CircuitLink, LinkError};
use crate::network::{CellSender, CellReceiver, Connection, ConnectionProvider, Metrics, NodeHint};
use crate::protocol::{
    Cell, CellCommand, DestroyReason, ExtendRequest, RelayCell, RelayCommand, PAYLOAD_LEN,
    RELAY_DATA_LEN, TAP_S_HANDSHAKE_LEN,
};

/// Why a circuit died, from the worker's point of view
#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("could not reach or use the next hop: {0}")]
    ConnectFailed(String),

    #[error("underlying connection closed")]
    OrConnClosed,

    #[error("circuit worker failed: {0}")]
    Internal(String),
}

impl CircuitError {
    fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    fn connect_failed(msg: impl Into<String>) -> Self {
        Self::ConnectFailed(msg.into())
    }

    /// Reason code this error propagates in DESTROY cells
    pub fn reason(&self) -> DestroyReason {
        match self {
            CircuitError::Protocol(_) => DestroyReason::Protocol,
            CircuitError::ConnectFailed(_) => DestroyReason::ConnectFailed,
            CircuitError::OrConnClosed => DestroyReason::OrConnClosed,
            CircuitError::Internal(_) => DestroyReason::Internal,
        }
    }
}

/// Which leg of the circuit an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Prev,
    Next,
}

/// Single-shot termination gate.
///
/// The first `destroy` records the reason and raises the signal; later calls
/// are no-ops. The reason is written before the signal fires so every
/// observer sees a consistent (terminated, reason) pair.
struct DestroyGate {
    reason: Mutex<Option<DestroyReason>>,
    signal: watch::Sender<bool>,
}

impl DestroyGate {
    fn new() -> Arc<Self> {
        let (signal, _) = watch::channel(false);
        Arc::new(Self {
            reason: Mutex::new(None),
            signal,
        })
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Record the reason and raise the signal; true only for the first call.
    fn destroy(&self, reason: DestroyReason) -> bool {
        let mut slot = match self.reason.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        drop(slot);
        let _ = self.signal.send(true);
        true
    }

    fn reason(&self) -> Option<DestroyReason> {
        match self.reason.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn is_terminated(&self) -> bool {
        self.reason().is_some()
    }
}

/// Handle on a live transverse circuit.
///
/// Owns the worker task; the connection layer delivers inbound cells through
/// the senders and the node layer tears the circuit down through `destroy`
/// or `close`.
pub struct TransverseCircuit {
    circ_id: CircId,
    pch_tx: CellSender,
    nch_tx: CellSender,
    gate: Arc<DestroyGate>,
    worker: JoinHandle<()>,
}

impl TransverseCircuit {
    /// Spawn the worker for a circuit just created on `conn` with id
    /// `circ_id`, using already-derived per-direction crypto state.
    ///
    /// The caller routes inbound cells for `circ_id` to
    /// [`forward_sender`](TransverseCircuit::forward_sender); the circuit
    /// registers [`backward_sender`](TransverseCircuit::backward_sender) on
    /// the next-hop connection itself when it extends.
    pub fn new(
        conn: Arc<Connection>,
        circ_id: CircId,
        forward: CryptoState,
        backward: CryptoState,
        provider: Arc<dyn ConnectionProvider>,
        metrics: Arc<Metrics>,
        config: &RelayConfig,
    ) -> Self {
        let (pch_tx, pch_rx) = mpsc::channel(config.cell_queue_capacity);
        let (nch_tx, nch_rx) = mpsc::channel(config.cell_queue_capacity);
        let gate = DestroyGate::new();

        metrics.circuits.alloc();

        let worker = CircuitWorker {
            prev: CircuitLink::new(conn, circ_id, pch_rx),
            next: None,
            next_inbound: Some(nch_rx),
            nch_tx: nch_tx.clone(),
            forward,
            backward,
            provider,
            metrics,
            gate: gate.clone(),
            shutdown: gate.subscribe(),
            extend_timeout: config.extend_timeout(),
            destroy_received: None,
        };

        debug!(circ_id = %circ_id, "circuit worker starting");
        let worker = tokio::spawn(worker.run());

        Self {
            circ_id,
            pch_tx,
            nch_tx,
            gate,
            worker,
        }
    }

    /// Circuit id on the previous-hop connection
    pub fn circ_id(&self) -> CircId {
        self.circ_id
    }

    /// Sender the connection layer uses to deliver cells from the previous
    /// hop into this circuit
    pub fn forward_sender(&self) -> CellSender {
        self.pch_tx.clone()
    }

    /// Sender that delivers cells from the next hop into this circuit
    pub fn backward_sender(&self) -> CellSender {
        self.nch_tx.clone()
    }

    /// Begin teardown with the given reason. Idempotent: only the first
    /// call's reason is recorded.
    pub fn destroy(&self, reason: DestroyReason) {
        self.gate.destroy(reason);
    }

    /// Reason the circuit is (being) torn down for, if any
    pub fn destroy_reason(&self) -> Option<DestroyReason> {
        self.gate.reason()
    }

    /// Tear the circuit down and wait for the worker to finish cleanup.
    pub async fn close(self) -> Result<(), CircuitError> {
        self.gate.destroy(DestroyReason::OrConnClosed);
        self.worker
            .await
            .map_err(|err| CircuitError::Internal(err.to_string()))
    }
}

/// The per-circuit worker: sole consumer of both legs' inbound queues and
/// sole owner of the circuit's crypto state.
struct CircuitWorker {
    /// Leg toward the origin
    prev: CircuitLink,

    /// Leg toward the next relay, once the circuit has been extended
    next: Option<CircuitLink>,

    /// Receiving half of the next-hop queue, parked here until extension
    /// moves it into the next link
    next_inbound: Option<CellReceiver>,

    /// Sending half of the next-hop queue, registered on the next-hop
    /// connection during extension
    nch_tx: CellSender,

    /// Crypto for cells travelling away from the origin
    forward: CryptoState,

    /// Crypto for cells travelling toward the origin
    backward: CryptoState,

    /// Dialer for next-hop connections
    provider: Arc<dyn ConnectionProvider>,

    metrics: Arc<Metrics>,
    gate: Arc<DestroyGate>,
    shutdown: watch::Receiver<bool>,
    extend_timeout: Duration,

    /// Leg a peer DESTROY arrived on; cleanup never echoes one back there
    destroy_received: Option<Leg>,
}

impl CircuitWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                cell = self.prev.receive_cell() => {
                    self.on_cell(Leg::Prev, cell).await;
                }
                cell = Self::receive_next(&mut self.next), if self.next.is_some() => {
                    self.on_cell(Leg::Next, cell).await;
                }
            }
            if self.gate.is_terminated() {
                break;
            }
        }

        self.cleanup().await;
    }

    async fn receive_next(next: &mut Option<CircuitLink>) -> Result<Cell, LinkError> {
        match next {
            Some(link) => link.receive_cell().await,
            // Disabled by the select precondition; never polled.
            None => std::future::pending().await,
        }
    }

    async fn on_cell(&mut self, leg: Leg, incoming: Result<Cell, LinkError>) {
        let cell = match incoming {
            Ok(cell) => cell,
            Err(LinkError::Closed) => {
                debug!(circ_id = %self.prev.circ_id(), ?leg, "leg closed under the circuit");
                self.gate.destroy(DestroyReason::OrConnClosed);
                return;
            }
        };

        let result = match (leg, cell.command) {
            (Leg::Prev, CellCommand::Relay | CellCommand::RelayEarly) => {
                self.handle_forward_relay(cell).await
            }
            (Leg::Next, CellCommand::Relay) => self.handle_backward_relay(cell).await,
            (_, CellCommand::Destroy) => {
                self.handle_destroy(leg, &cell);
                Ok(())
            }
            (_, command) => Err(CircuitError::protocol(format!(
                "unexpected {:?} cell on established circuit",
                command
            ))),
        };

        if let Err(err) = result {
            warn!(circ_id = %self.prev.circ_id(), error = %err, "tearing circuit down");
            self.gate.destroy(err.reason());
        }
    }

    /// A relay cell moving away from the origin: peel our onion layer, then
    /// either act on it (it terminates here) or pass it down the circuit.
    async fn handle_forward_relay(&mut self, mut cell: Cell) -> Result<(), CircuitError> {
        let digest = self.forward.decrypt_inbound(&mut cell.payload);

        let (recognized, command) = {
            let view = RelayCell::new(&mut cell.payload);
            // Both the recognized field and the digest must check out; a
            // nonzero recognized field means a later hop even if the digest
            // happens to collide.
            (
                view.recognized() == 0 && view.digest() == digest,
                view.command(),
            )
        };

        if !recognized {
            self.forward.rewind_digest();

            let next = self.next.as_ref().ok_or_else(|| {
                CircuitError::protocol("relay cell addressed past the end of the circuit")
            })?;
            next.send_cell(cell)
                .await
                .map_err(|_| CircuitError::connect_failed("forwarding to next hop"))?;
            self.metrics.relay_forward.inc(PAYLOAD_LEN as u64);
            return Ok(());
        }

        match command {
            Some(RelayCommand::Extend) => {
                let data = RelayCell::new(&mut cell.payload).data().to_vec();
                let request = ExtendRequest::parse_extend(&data)
                    .map_err(|err| CircuitError::protocol(err.to_string()))?;
                self.extend_circuit(request).await
            }
            Some(RelayCommand::Extend2) => {
                let data = RelayCell::new(&mut cell.payload).data().to_vec();
                let request = ExtendRequest::parse_extend2(&data)
                    .map_err(|err| CircuitError::protocol(err.to_string()))?;
                self.extend_circuit(request).await
            }
            other => {
                // Recognized but not ours to act on; tolerated.
                debug!(circ_id = %self.prev.circ_id(), command = ?other,
                       "ignoring recognized relay command");
                Ok(())
            }
        }
    }

    /// A relay cell moving toward the origin: add our onion layer and pass
    /// it up. We are not the origin, so the running digest stays untouched.
    async fn handle_backward_relay(&mut self, mut cell: Cell) -> Result<(), CircuitError> {
        self.backward.encrypt(&mut cell.payload);
        self.prev
            .send_cell(cell)
            .await
            .map_err(|_| CircuitError::connect_failed("relaying toward origin"))?;
        self.metrics.relay_backward.inc(PAYLOAD_LEN as u64);
        Ok(())
    }

    /// A peer tore the circuit down. Adopt its reason and terminate; the
    /// DESTROY is propagated to the other leg during cleanup, never echoed
    /// back.
    fn handle_destroy(&mut self, leg: Leg, cell: &Cell) {
        let reason = cell.destroy_reason();
        debug!(circ_id = %self.prev.circ_id(), ?leg, %reason, "peer destroyed circuit");
        self.destroy_received = Some(leg);
        self.gate.destroy(reason);
    }

    /// Grow the circuit by one hop.
    ///
    /// Runs synchronously on the worker: no other cell is pumped until the
    /// exchange finishes or fails. A circuit has at most one outstanding
    /// extension and the next hop cannot send before it exists, so nothing
    /// is starved by this.
    async fn extend_circuit(&mut self, request: ExtendRequest) -> Result<(), CircuitError> {
        if self.next.is_some() {
            return Err(CircuitError::protocol("circuit is already extended"));
        }
        if request.handshake().len() > PAYLOAD_LEN {
            return Err(CircuitError::protocol("handshake exceeds cell payload"));
        }

        let hint = NodeHint {
            addresses: request.addresses(),
            fingerprint: request
                .fingerprint()
                .map_err(|err| CircuitError::protocol(err.to_string()))?,
            ed_identity: request.ed_identity(),
        };
        debug!(circ_id = %self.prev.circ_id(), fingerprint = %hint.fingerprint,
               "extending circuit");

        let conn = self
            .provider
            .connection(&hint)
            .await
            .map_err(|err| CircuitError::connect_failed(err.to_string()))?;

        let next_id = conn
            .add_circuit(self.nch_tx.clone())
            .await
            .map_err(|_| CircuitError::OrConnClosed)?;

        let inbound = self
            .next_inbound
            .take()
            .ok_or_else(|| CircuitError::protocol("circuit is already extended"))?;
        let next = self.next.insert(CircuitLink::new(conn, next_id, inbound));

        next.send_cell(Cell::new(
            next_id,
            request.create_command(),
            request.handshake(),
        ))
        .await
        .map_err(|_| CircuitError::connect_failed("sending handshake to next hop"))?;

        // The worker is parked here, so the next cell on this leg is
        // guaranteed to be the handshake answer.
        let created = tokio::select! {
            answer = tokio::time::timeout(self.extend_timeout, next.receive_cell()) => {
                match answer {
                    Ok(Ok(cell)) => cell,
                    Ok(Err(_)) => {
                        return Err(CircuitError::connect_failed("next hop leg closed"))
                    }
                    Err(_) => {
                        return Err(CircuitError::connect_failed(
                            "timed out waiting for next hop",
                        ))
                    }
                }
            }
            _ = self.shutdown.changed() => return Err(CircuitError::OrConnClosed),
        };

        let answer = Self::created_data(&request, &created)?;

        let mut payload = RelayCell::encode(request.extended_command(), 0, &answer);
        self.backward.encrypt_origin(&mut payload);
        self.prev
            .send_cell(Cell::relay(self.prev.circ_id(), payload))
            .await
            .map_err(|_| CircuitError::connect_failed("answering previous hop"))?;

        debug!(circ_id = %self.prev.circ_id(), next_circ_id = %next_id, "circuit extended");
        Ok(())
    }

    /// Extract the handshake reply that goes back in the EXTENDED(2).
    fn created_data(request: &ExtendRequest, created: &Cell) -> Result<Vec<u8>, CircuitError> {
        match created.command {
            CellCommand::Created if request.created_command() == CellCommand::Created => {
                Ok(created.payload[..TAP_S_HANDSHAKE_LEN].to_vec())
            }
            CellCommand::Created2 if request.created_command() == CellCommand::Created2 => {
                let hlen = u16::from_be_bytes([created.payload[0], created.payload[1]]) as usize;
                let total = 2 + hlen;
                if total > RELAY_DATA_LEN {
                    return Err(CircuitError::protocol("oversized handshake reply"));
                }
                Ok(created.payload[..total].to_vec())
            }
            other => Err(CircuitError::protocol(format!(
                "expected {:?} from next hop, got {:?}",
                request.created_command(),
                other
            ))),
        }
    }

    /// Tear both legs down, skipping a DESTROY echo on the leg the peer's
    /// own DESTROY arrived on. Every leg is attempted even if one fails.
    async fn cleanup(self) {
        let reason = self.gate.reason().unwrap_or(DestroyReason::None);
        let circ_id = self.prev.circ_id();
        let mut failures: Vec<LinkError> = Vec::new();

        if self.destroy_received == Some(Leg::Prev) {
            self.prev.shutdown().await;
        } else if let Err(err) = self.prev.destroy(reason).await {
            failures.push(err);
        }

        if let Some(next) = self.next {
            if self.destroy_received == Some(Leg::Next) {
                next.shutdown().await;
            } else if let Err(err) = next.destroy(reason).await {
                failures.push(err);
            }
        }

        self.metrics.circuits.free();

        if !failures.is_empty() {
            debug!(circ_id = %circ_id, failed_legs = failures.len(),
                   "some legs could not be notified during teardown");
        }
        debug!(circ_id = %circ_id, %reason, "circuit terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConnectionError;
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;

    const KF: [u8; 16] = [0x11; 16];
    const DF: [u8; 20] = [0x22; 20];
    const KB: [u8; 16] = [0x33; 16];
    const DB: [u8; 20] = [0x44; 20];
    const PREV_ID: CircId = CircId(0x0000_0042);
    const NEXT_HOP: &str = "127.0.0.1:9001";

    /// Dialer that always hands out the same prepared connection and
    /// records the hints it was asked for.
    struct StaticProvider {
        conn: Arc<Connection>,
        hints: StdMutex<Vec<NodeHint>>,
    }

    #[async_trait::async_trait]
    impl ConnectionProvider for StaticProvider {
        async fn connection(&self, hint: &NodeHint) -> Result<Arc<Connection>, ConnectionError> {
            self.hints.lock().unwrap().push(hint.clone());
            Ok(self.conn.clone())
        }
    }

    struct RefusingProvider;

    #[async_trait::async_trait]
    impl ConnectionProvider for RefusingProvider {
        async fn connection(&self, _hint: &NodeHint) -> Result<Arc<Connection>, ConnectionError> {
            Err(ConnectionError::Dial("connection refused".into()))
        }
    }

    struct Harness {
        circuit: TransverseCircuit,
        pch: CellSender,
        /// Origin-side mirrors of the relay's two crypto states
        client_forward: CryptoState,
        client_backward: CryptoState,
        /// Cells the relay writes toward the previous hop
        prev_writer: CellReceiver,
        /// Cells the relay writes toward the next hop
        next_writer: CellReceiver,
        next_conn: Arc<Connection>,
        provider: Arc<StaticProvider>,
        metrics: Arc<Metrics>,
    }

    fn harness_with(config: RelayConfig) -> Harness {
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let (prev_tx, prev_writer) = mpsc::channel(32);
        let prev_conn = Arc::new(Connection::new(peer, false, prev_tx));

        let (next_tx, next_writer) = mpsc::channel(32);
        let next_conn = Arc::new(Connection::new(NEXT_HOP.parse().unwrap(), true, next_tx));
        let provider = Arc::new(StaticProvider {
            conn: next_conn.clone(),
            hints: StdMutex::new(Vec::new()),
        });

        let metrics = Metrics::new();
        let circuit = TransverseCircuit::new(
            prev_conn,
            PREV_ID,
            CryptoState::new(&KF, &DF),
            CryptoState::new(&KB, &DB),
            provider.clone(),
            metrics.clone(),
            &config,
        );
        let pch = circuit.forward_sender();

        Harness {
            circuit,
            pch,
            client_forward: CryptoState::new(&KF, &DF),
            client_backward: CryptoState::new(&KB, &DB),
            prev_writer,
            next_writer,
            next_conn,
            provider,
            metrics,
        }
    }

    fn harness() -> Harness {
        harness_with(RelayConfig::default())
    }

    const HANDSHAKE: [u8; 84] = [0xc4; 84];

    fn extend2_payload() -> Vec<u8> {
        let mut data = Vec::new();
        data.push(2);
        data.extend_from_slice(&[0, 6, 127, 0, 0, 1, 0x23, 0x29]);
        data.push(2);
        data.push(20);
        data.extend_from_slice(&[0xab; 20]);
        data.extend_from_slice(&HANDSHAKE);
        data
    }

    /// Send a relay payload from the origin side, onion-encrypted so the
    /// relay under test recognizes it.
    async fn send_recognized(h: &mut Harness, command: RelayCommand, data: &[u8]) {
        let mut payload = RelayCell::encode(command, 0, data);
        h.client_forward.encrypt_origin(&mut payload);
        h.pch
            .send(Cell {
                circ_id: PREV_ID,
                command: CellCommand::RelayEarly,
                payload,
            })
            .await
            .unwrap();
    }

    /// Drive a full successful EXTEND2 exchange; returns the next-hop
    /// circuit id and the CREATED2 payload the mock next hop answered with.
    async fn extend(h: &mut Harness) -> (CircId, Vec<u8>) {
        send_recognized(h, RelayCommand::Extend2, &extend2_payload()).await;

        let create = h.next_writer.recv().await.unwrap();
        assert_eq!(create.command, CellCommand::Create2);
        assert!(create.circ_id.allocated_by_initiator());
        assert_eq!(&create.payload[..HANDSHAKE.len()], &HANDSHAKE);
        assert!(create.payload[HANDSHAKE.len()..].iter().all(|b| *b == 0));

        // 64-byte CREATED2: 2-byte length prefix plus 62 bytes of reply.
        let mut created = Vec::new();
        created.extend_from_slice(&62u16.to_be_bytes());
        created.extend_from_slice(&[0xd6; 62]);
        h.next_conn
            .deliver(Cell::new(create.circ_id, CellCommand::Created2, &created))
            .await
            .unwrap();

        let extended = h.prev_writer.recv().await.unwrap();
        assert_eq!(extended.command, CellCommand::Relay);
        assert_eq!(extended.circ_id, PREV_ID);

        let mut payload = extended.payload;
        let prefix = h.client_backward.decrypt_inbound(&mut payload);
        let cell = RelayCell::new(&mut payload);
        assert_eq!(cell.recognized(), 0);
        assert_eq!(cell.digest(), prefix);
        assert_eq!(cell.command(), Some(RelayCommand::Extended2));
        assert_eq!(cell.data(), &created[..]);

        (create.circ_id, created)
    }

    #[tokio::test]
    async fn test_extend2_success() {
        let mut h = harness();
        extend(&mut h).await;

        let hints = h.provider.hints.lock().unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].addresses, vec![NEXT_HOP.parse::<SocketAddr>().unwrap()]);
        assert_eq!(hints[0].fingerprint.as_bytes(), &[0xab; 20]);
        assert_eq!(hints[0].ed_identity, None);
    }

    #[tokio::test]
    async fn test_forward_passthrough() {
        let mut h = harness();
        let (next_id, _) = extend(&mut h).await;

        // A cell for the hop after us: recognized field is nonzero once we
        // peel our layer.
        let mut payload = RelayCell::encode(RelayCommand::Data, 1, b"for the exit");
        payload[1] = 0xff;
        payload[2] = 0xff;
        let expected = payload;
        h.client_forward.encrypt(&mut payload);
        h.pch
            .send(Cell {
                circ_id: PREV_ID,
                command: CellCommand::Relay,
                payload,
            })
            .await
            .unwrap();

        let forwarded = h.next_writer.recv().await.unwrap();
        assert_eq!(forwarded.circ_id, next_id);
        assert_eq!(forwarded.command, CellCommand::Relay);
        assert_eq!(forwarded.payload, expected);
        assert_eq!(h.metrics.relay_forward.value(), PAYLOAD_LEN as u64);
        assert!(h.circuit.destroy_reason().is_none());
    }

    #[tokio::test]
    async fn test_backward_relay() {
        let mut h = harness();
        let (next_id, _) = extend(&mut h).await;

        let mut inbound = [0u8; PAYLOAD_LEN];
        inbound[..5].copy_from_slice(&[2, 0x10, 0x20, 0, 1]);
        h.next_conn
            .deliver(Cell {
                circ_id: next_id,
                command: CellCommand::Relay,
                payload: inbound,
            })
            .await
            .unwrap();

        let toward_origin = h.prev_writer.recv().await.unwrap();
        assert_eq!(toward_origin.circ_id, PREV_ID);

        // Our layer is exactly one keystream application.
        let mut expected = inbound;
        h.client_backward.encrypt(&mut expected);
        assert_eq!(toward_origin.payload, expected);
        assert_eq!(h.metrics.relay_backward.value(), PAYLOAD_LEN as u64);
    }

    #[tokio::test]
    async fn test_extend_on_extended_circuit() {
        let mut h = harness();
        extend(&mut h).await;

        send_recognized(&mut h, RelayCommand::Extend2, &extend2_payload()).await;

        let to_prev = h.prev_writer.recv().await.unwrap();
        assert_eq!(to_prev.command, CellCommand::Destroy);
        assert_eq!(to_prev.destroy_reason(), DestroyReason::Protocol);

        let to_next = h.next_writer.recv().await.unwrap();
        assert_eq!(to_next.command, CellCommand::Destroy);
        assert_eq!(to_next.destroy_reason(), DestroyReason::Protocol);

        assert_eq!(h.circuit.destroy_reason(), Some(DestroyReason::Protocol));
    }

    #[tokio::test]
    async fn test_peer_destroy_propagates_forward_only() {
        let mut h = harness();
        extend(&mut h).await;

        h.pch
            .send(Cell::destroy(PREV_ID, DestroyReason::ConnectFailed))
            .await
            .unwrap();

        // The reason travels to the next hop untouched...
        let to_next = h.next_writer.recv().await.unwrap();
        assert_eq!(to_next.command, CellCommand::Destroy);
        assert_eq!(to_next.destroy_reason(), DestroyReason::ConnectFailed);
        assert_eq!(
            h.circuit.destroy_reason(),
            Some(DestroyReason::ConnectFailed)
        );

        // ...and is never echoed back where it came from.
        assert!(h.prev_writer.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unrecognized_cell_with_no_next_hop() {
        let mut h = harness();

        let mut payload = RelayCell::encode(RelayCommand::Data, 1, b"nowhere to go");
        payload[1] = 0xff;
        h.client_forward.encrypt(&mut payload);
        h.pch
            .send(Cell {
                circ_id: PREV_ID,
                command: CellCommand::Relay,
                payload,
            })
            .await
            .unwrap();

        let to_prev = h.prev_writer.recv().await.unwrap();
        assert_eq!(to_prev.command, CellCommand::Destroy);
        assert_eq!(to_prev.destroy_reason(), DestroyReason::Protocol);
        assert_eq!(h.circuit.destroy_reason(), Some(DestroyReason::Protocol));
    }

    #[tokio::test]
    async fn test_recognized_non_extend_is_tolerated() {
        let mut h = harness();

        send_recognized(&mut h, RelayCommand::Sendme, &[]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.circuit.destroy_reason().is_none());

        // The circuit keeps working afterwards.
        extend(&mut h).await;
    }

    #[tokio::test]
    async fn test_extend_without_fingerprint() {
        let mut h = harness();

        // NSPEC = 0, no handshake: parses fine, but there is nobody to
        // dial.
        send_recognized(&mut h, RelayCommand::Extend2, &[0]).await;

        let to_prev = h.prev_writer.recv().await.unwrap();
        assert_eq!(to_prev.command, CellCommand::Destroy);
        assert_eq!(to_prev.destroy_reason(), DestroyReason::Protocol);
    }

    #[tokio::test]
    async fn test_extend_dial_failure() {
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let (prev_tx, mut prev_writer) = mpsc::channel(32);
        let prev_conn = Arc::new(Connection::new(peer, false, prev_tx));
        let metrics = Metrics::new();
        let circuit = TransverseCircuit::new(
            prev_conn,
            PREV_ID,
            CryptoState::new(&KF, &DF),
            CryptoState::new(&KB, &DB),
            Arc::new(RefusingProvider),
            metrics,
            &RelayConfig::default(),
        );

        let mut client_forward = CryptoState::new(&KF, &DF);
        let mut payload = RelayCell::encode(RelayCommand::Extend2, 0, &extend2_payload());
        client_forward.encrypt_origin(&mut payload);
        circuit
            .forward_sender()
            .send(Cell {
                circ_id: PREV_ID,
                command: CellCommand::RelayEarly,
                payload,
            })
            .await
            .unwrap();

        let to_prev = prev_writer.recv().await.unwrap();
        assert_eq!(to_prev.command, CellCommand::Destroy);
        assert_eq!(to_prev.destroy_reason(), DestroyReason::ConnectFailed);
    }

    #[tokio::test]
    async fn test_extend_timeout() {
        let mut h = harness_with(RelayConfig::default().with_extend_timeout(0));

        send_recognized(&mut h, RelayCommand::Extend2, &extend2_payload()).await;

        // The handshake goes out, but nobody ever answers.
        let create = h.next_writer.recv().await.unwrap();
        assert_eq!(create.command, CellCommand::Create2);

        let to_prev = h.prev_writer.recv().await.unwrap();
        assert_eq!(to_prev.command, CellCommand::Destroy);
        assert_eq!(to_prev.destroy_reason(), DestroyReason::ConnectFailed);

        // The half-built next leg is torn down too.
        let to_next = h.next_writer.recv().await.unwrap();
        assert_eq!(to_next.command, CellCommand::Destroy);
        assert_eq!(to_next.destroy_reason(), DestroyReason::ConnectFailed);
    }

    #[tokio::test]
    async fn test_destroy_records_first_reason_only() {
        let h = harness();

        h.circuit.destroy(DestroyReason::Requested);
        h.circuit.destroy(DestroyReason::Protocol);
        assert_eq!(h.circuit.destroy_reason(), Some(DestroyReason::Requested));

        let mut prev_writer = h.prev_writer;
        let to_prev = prev_writer.recv().await.unwrap();
        assert_eq!(to_prev.destroy_reason(), DestroyReason::Requested);

        h.circuit.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_destroys_and_joins() {
        let h = harness();
        assert_eq!(h.metrics.circuits.value(), 1);

        let mut prev_writer = h.prev_writer;
        let metrics = h.metrics.clone();
        h.circuit.close().await.unwrap();

        let to_prev = prev_writer.recv().await.unwrap();
        assert_eq!(to_prev.command, CellCommand::Destroy);
        assert_eq!(to_prev.destroy_reason(), DestroyReason::OrConnClosed);
        assert_eq!(metrics.circuits.value(), 0);
    }
}
