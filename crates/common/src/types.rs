use serde::{Deserialize, Serialize};

/// Per-connection circuit identifier.
///
/// A circuit id only has meaning on a single connection; the same circuit is
/// known by different ids on each of its legs. The endpoint that initiated
/// the connection allocates ids with the most significant bit set, the
/// responder with the bit clear, so the two sides can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CircId(pub u32);

impl CircId {
    /// Bit that marks ids allocated by the connection initiator.
    pub const INITIATOR_BIT: u32 = 0x8000_0000;

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// True if the initiator of the connection allocated this id.
    pub fn allocated_by_initiator(&self) -> bool {
        self.0 & Self::INITIATOR_BIT != 0
    }
}

impl std::fmt::Display for CircId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<u32> for CircId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// 20-byte relay identity fingerprint (SHA-1 of the identity key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 20]);

impl Fingerprint {
    pub const LEN: usize = 20;

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Fingerprint {
    type Error = FingerprintError;

    fn try_from(bytes: &[u8]) -> std::result::Result<Self, Self::Error> {
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| FingerprintError::BadLength(bytes.len()))?;
        Ok(Self(arr))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

/// Errors constructing a fingerprint
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("fingerprint must be 20 bytes, got {0}")]
    BadLength(usize),
}
