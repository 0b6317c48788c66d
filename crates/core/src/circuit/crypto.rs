//! Per-hop relay cell cryptography.
//!
//! Each direction of a circuit leg owns an AES-128-CTR keystream (keyed with
//! Kf or Kb) and a running SHA-1 digest (seeded with Df or Db). The digest
//! covers every relay payload originated or terminated at this hop, hashed
//! with its digest field zeroed; payloads merely forwarded through do not
//! touch it. Because a cell's destination is only known after decryption,
//! the digest is advanced speculatively and rewound from a snapshot when the
//! cell turns out to belong to a later hop.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use sha1::{Digest, Sha1};

use crate::protocol::{RelayCell, PAYLOAD_LEN};

/// AES-128 in counter mode, the relay cell stream cipher
type Aes128Ctr = Ctr128BE<Aes128>;

/// Stream cipher key length (Kf / Kb)
pub const KEY_LEN: usize = 16;

/// Digest seed length (Df / Db)
pub const DIGEST_LEN: usize = 20;

/// Length of the concatenated key material for one leg:
/// Df | Db | Kf | Kb, as produced by the circuit handshake KDF
pub const SEED_LEN: usize = 2 * DIGEST_LEN + 2 * KEY_LEN;

/// Cryptographic state for one direction of one hop.
pub struct CryptoState {
    /// Keystream for en/decrypting cell payloads; encrypt and decrypt are
    /// the same XOR, so the position advances on every call
    cipher: Aes128Ctr,

    /// Running digest over payloads terminated or originated here
    digest: Sha1,

    /// Snapshot taken before each speculative digest update
    previous: Sha1,
}

impl CryptoState {
    /// Build one direction's state from its cipher key and digest seed.
    pub fn new(key: &[u8; KEY_LEN], seed: &[u8; DIGEST_LEN]) -> Self {
        let iv = [0u8; 16];
        let digest = Sha1::new().chain_update(seed);
        Self {
            cipher: Aes128Ctr::new(key.into(), &iv.into()),
            previous: digest.clone(),
            digest,
        }
    }

    /// Split a handshake KDF output (Df | Db | Kf | Kb) into the forward and
    /// backward states for one leg.
    pub fn pair_from_seed(material: &[u8]) -> Result<(CryptoState, CryptoState), CryptoError> {
        if material.len() != SEED_LEN {
            return Err(CryptoError::BadSeedLength(material.len()));
        }

        let mut df = [0u8; DIGEST_LEN];
        let mut db = [0u8; DIGEST_LEN];
        let mut kf = [0u8; KEY_LEN];
        let mut kb = [0u8; KEY_LEN];
        df.copy_from_slice(&material[..DIGEST_LEN]);
        db.copy_from_slice(&material[DIGEST_LEN..2 * DIGEST_LEN]);
        kf.copy_from_slice(&material[2 * DIGEST_LEN..2 * DIGEST_LEN + KEY_LEN]);
        kb.copy_from_slice(&material[2 * DIGEST_LEN + KEY_LEN..]);

        Ok((CryptoState::new(&kf, &df), CryptoState::new(&kb, &db)))
    }

    /// Decrypt an inbound relay payload in place and speculatively advance
    /// the running digest.
    ///
    /// Returns the first four bytes of the updated running digest; the
    /// caller compares them against the cell's digest field to decide
    /// whether the cell terminates here, and must call
    /// [`rewind_digest`](CryptoState::rewind_digest) on a miss.
    pub fn decrypt_inbound(&mut self, payload: &mut [u8; PAYLOAD_LEN]) -> [u8; 4] {
        self.cipher.apply_keystream(&mut payload[..]);

        self.previous = self.digest.clone();
        let saved = {
            let mut cell = RelayCell::new(payload);
            let saved = cell.digest();
            cell.clear_digest();
            saved
        };
        self.digest.update(&payload[..]);
        RelayCell::new(payload).set_digest(&saved);

        self.running_digest()
    }

    /// Prepare and encrypt a payload originated at this hop: advance the
    /// running digest over the payload with a zeroed digest field, stamp the
    /// digest prefix into the cell, then apply the keystream.
    pub fn encrypt_origin(&mut self, payload: &mut [u8; PAYLOAD_LEN]) {
        self.previous = self.digest.clone();

        RelayCell::new(payload).clear_digest();
        self.digest.update(&payload[..]);
        let prefix = self.running_digest();
        RelayCell::new(payload).set_digest(&prefix);

        self.cipher.apply_keystream(&mut payload[..]);
    }

    /// Apply the keystream only, for payloads this hop relays without
    /// originating or terminating them.
    pub fn encrypt(&mut self, payload: &mut [u8; PAYLOAD_LEN]) {
        self.cipher.apply_keystream(&mut payload[..]);
    }

    /// Undo the last speculative digest update.
    pub fn rewind_digest(&mut self) {
        self.digest = self.previous.clone();
    }

    /// First four bytes of the running digest as it stands now.
    pub fn running_digest(&self) -> [u8; 4] {
        let full = self.digest.clone().finalize();
        [full[0], full[1], full[2], full[3]]
    }
}

/// Errors building crypto state
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key material must be {SEED_LEN} bytes, got {0}")]
    BadSeedLength(usize),
}
