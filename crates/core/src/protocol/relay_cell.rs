use super::cell::PAYLOAD_LEN;

/// Size of the relay-cell header that precedes the data region
pub const RELAY_HEADER_LEN: usize = 11;

/// Maximum data carried inside one relay cell
pub const RELAY_DATA_LEN: usize = PAYLOAD_LEN - RELAY_HEADER_LEN;

/// Byte range of the digest field within a relay payload
const DIGEST_RANGE: std::ops::Range<usize> = 5..9;

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open a stream
    Begin = 1,
    /// DATA - stream data
    Data = 2,
    /// END - close a stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend the circuit (legacy TAP)
    Extend = 6,
    /// EXTENDED - circuit extended (legacy)
    Extended = 7,
    /// TRUNCATE - truncate the circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - long-range padding
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - open a directory stream
    BeginDir = 13,
    /// EXTEND2 - extend the circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended
    Extended2 = 15,
}

impl RelayCommand {
    /// Parse a relay command byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }
}

/// Mutable view of a relay payload.
///
/// Layout (big-endian):
/// command (1) | recognized (2) | stream id (2) | digest (4) | length (2) |
/// data (up to [`RELAY_DATA_LEN`]).
///
/// The view never reallocates; all accessors operate on the fixed payload
/// buffer in place, which is what the per-hop crypto needs when it zeroes
/// and restores the digest field around the running hash.
pub struct RelayCell<'a> {
    buf: &'a mut [u8; PAYLOAD_LEN],
}

impl<'a> RelayCell<'a> {
    pub fn new(buf: &'a mut [u8; PAYLOAD_LEN]) -> Self {
        Self { buf }
    }

    pub fn command_byte(&self) -> u8 {
        self.buf[0]
    }

    pub fn command(&self) -> Option<RelayCommand> {
        RelayCommand::from_u8(self.buf[0])
    }

    pub fn recognized(&self) -> u16 {
        u16::from_be_bytes([self.buf[1], self.buf[2]])
    }

    pub fn stream_id(&self) -> u16 {
        u16::from_be_bytes([self.buf[3], self.buf[4]])
    }

    pub fn digest(&self) -> [u8; 4] {
        [self.buf[5], self.buf[6], self.buf[7], self.buf[8]]
    }

    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.buf[9], self.buf[10]])
    }

    /// Data region, bounded by the length field and the payload size
    pub fn data(&self) -> &[u8] {
        let len = (self.length() as usize).min(RELAY_DATA_LEN);
        &self.buf[RELAY_HEADER_LEN..RELAY_HEADER_LEN + len]
    }

    /// Zero the 4-byte digest field
    pub fn clear_digest(&mut self) {
        self.buf[DIGEST_RANGE].fill(0);
    }

    /// Write the 4-byte digest field
    pub fn set_digest(&mut self, digest: &[u8; 4]) {
        self.buf[DIGEST_RANGE].copy_from_slice(digest);
    }

    /// Build a relay payload from scratch: recognized and digest zeroed,
    /// length set, data copied, tail zero-padded.
    ///
    /// Callers must not pass more than [`RELAY_DATA_LEN`] bytes of data.
    pub fn encode(command: RelayCommand, stream_id: u16, data: &[u8]) -> [u8; PAYLOAD_LEN] {
        debug_assert!(data.len() <= RELAY_DATA_LEN);
        let mut buf = [0u8; PAYLOAD_LEN];
        buf[0] = command as u8;
        buf[3..5].copy_from_slice(&stream_id.to_be_bytes());
        let len = data.len().min(RELAY_DATA_LEN);
        buf[9..11].copy_from_slice(&(len as u16).to_be_bytes());
        buf[RELAY_HEADER_LEN..RELAY_HEADER_LEN + len].copy_from_slice(&data[..len]);
        buf
    }
}
