//! Per-circuit state: onion crypto, circuit legs, and the relay worker
//! that pumps cells between them.

mod crypto;
mod link;
mod transverse;

pub use crypto::{CryptoError, CryptoState, DIGEST_LEN, KEY_LEN, SEED_LEN};
pub use link::{CircuitLink, LinkError};
pub use transverse::{CircuitError, TransverseCircuit};
