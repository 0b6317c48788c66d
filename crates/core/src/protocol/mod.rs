//! Wire formats for the onion-routing link protocol
//!
//! Fixed-size cells, the relay-cell header that rides inside RELAY and
//! RELAY_EARLY cells, and the EXTEND/EXTEND2 payloads that request a
//! circuit extension. All multi-byte fields are big-endian.

mod cell;
mod extend;
mod relay_cell;

pub use cell::{Cell, CellCommand, CellError, DestroyReason, CELL_LEN, PAYLOAD_LEN};
pub use extend::{
    ExtendError, ExtendRequest, LinkSpec, TAP_C_HANDSHAKE_LEN, TAP_S_HANDSHAKE_LEN,
};
pub use relay_cell::{RelayCell, RelayCommand, RELAY_DATA_LEN, RELAY_HEADER_LEN};
