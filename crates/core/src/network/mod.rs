//! Interfaces between circuits and the connection layer
//!
//! Circuits see connections as a writer queue plus an inbound demultiplexer;
//! everything below that (TLS, framing, reader/writer tasks, dialing policy)
//! is the connection layer's business.

mod connection;
mod metrics;

pub use connection::{
    CellReceiver, CellSender, Connection, ConnectionError, ConnectionProvider, NodeHint,
};
pub use metrics::{Counter, Gauge, Metrics};
