//! Circuit relay core for an onion-routing node.
//!
//! Implements the per-circuit state machine of a relay: terminating one leg
//! of a circuit on an incoming connection, maintaining the outgoing leg,
//! onion-crypting relay cells in both directions, and growing circuits one
//! hop at a time via the EXTEND/CREATE/CREATED/EXTENDED exchange. The
//! TLS/TCP layer, handshake key derivation, and directory machinery live
//! outside this crate and are consumed through the `network` interfaces.

pub mod circuit;
pub mod network;
pub mod protocol;

// Re-export circuit types
pub use circuit::{
    CircuitError, CircuitLink, CryptoError, CryptoState, LinkError, TransverseCircuit,
};

// Re-export wire protocol types
pub use protocol::{
    Cell, CellCommand, DestroyReason, ExtendError, ExtendRequest, LinkSpec, RelayCell,
    RelayCommand, PAYLOAD_LEN,
};

// Re-export network interfaces
pub use network::{
    CellReceiver, CellSender, Connection, ConnectionError, ConnectionProvider, Metrics, NodeHint,
};
