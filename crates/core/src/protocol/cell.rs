use onionrelay_common::CircId;

/// Payload size of a fixed-length cell
pub const PAYLOAD_LEN: usize = 509;

/// Total size of a framed cell: 4-byte circuit id + 1-byte command + payload
pub const CELL_LEN: usize = 4 + 1 + PAYLOAD_LEN;

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - link padding
    Padding = 0,
    /// CREATE - create a circuit (legacy TAP handshake)
    Create = 1,
    /// CREATED - circuit created (legacy)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - tear a circuit down
    Destroy = 4,
    /// CREATE_FAST - unauthenticated circuit creation
    CreateFast = 5,
    /// CREATED_FAST
    CreatedFast = 6,
    /// VERSIONS - link version negotiation
    Versions = 7,
    /// NETINFO - address/time exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell permitted to carry an extension request
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current handshakes)
    Create2 = 10,
    /// CREATED2 - circuit created
    Created2 = 11,
}

impl CellCommand {
    /// Parse a command byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            _ => None,
        }
    }
}

/// Reason byte carried in a DESTROY cell.
///
/// Unknown values are kept verbatim so a relay in the middle of a circuit
/// propagates codes it does not understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    None,
    Protocol,
    Internal,
    Requested,
    Hibernating,
    ResourceLimit,
    ConnectFailed,
    OrIdentity,
    OrConnClosed,
    Finished,
    Timeout,
    Destroyed,
    NoSuchService,
    Unknown(u8),
}

impl DestroyReason {
    pub fn from_u8(byte: u8) -> Self {
        match byte {
            0 => DestroyReason::None,
            1 => DestroyReason::Protocol,
            2 => DestroyReason::Internal,
            3 => DestroyReason::Requested,
            4 => DestroyReason::Hibernating,
            5 => DestroyReason::ResourceLimit,
            6 => DestroyReason::ConnectFailed,
            7 => DestroyReason::OrIdentity,
            8 => DestroyReason::OrConnClosed,
            9 => DestroyReason::Finished,
            10 => DestroyReason::Timeout,
            11 => DestroyReason::Destroyed,
            12 => DestroyReason::NoSuchService,
            other => DestroyReason::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            DestroyReason::None => 0,
            DestroyReason::Protocol => 1,
            DestroyReason::Internal => 2,
            DestroyReason::Requested => 3,
            DestroyReason::Hibernating => 4,
            DestroyReason::ResourceLimit => 5,
            DestroyReason::ConnectFailed => 6,
            DestroyReason::OrIdentity => 7,
            DestroyReason::OrConnClosed => 8,
            DestroyReason::Finished => 9,
            DestroyReason::Timeout => 10,
            DestroyReason::Destroyed => 11,
            DestroyReason::NoSuchService => 12,
            DestroyReason::Unknown(other) => *other,
        }
    }
}

impl std::fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DestroyReason::Unknown(code) => write!(f, "unknown({})", code),
            known => write!(f, "{:?}", known),
        }
    }
}

/// A fixed-length link cell.
///
/// The payload is always exactly [`PAYLOAD_LEN`] bytes; anything shorter is
/// zero-padded at construction. Relays rewrite the circuit id when moving a
/// cell between legs but never touch the payload length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit id on the connection this cell travels on
    pub circ_id: CircId,

    /// Command
    pub command: CellCommand,

    /// Fixed-size payload
    pub payload: [u8; PAYLOAD_LEN],
}

impl Cell {
    /// Create a cell, copying `payload` into a zero-padded fixed buffer.
    ///
    /// Callers must not pass more than [`PAYLOAD_LEN`] bytes; extension
    /// payload lengths are validated before any cell is constructed.
    pub fn new(circ_id: CircId, command: CellCommand, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= PAYLOAD_LEN);
        let mut buf = [0u8; PAYLOAD_LEN];
        let n = payload.len().min(PAYLOAD_LEN);
        buf[..n].copy_from_slice(&payload[..n]);
        Self {
            circ_id,
            command,
            payload: buf,
        }
    }

    /// Create a RELAY cell from an already-built relay payload
    pub fn relay(circ_id: CircId, payload: [u8; PAYLOAD_LEN]) -> Self {
        Self {
            circ_id,
            command: CellCommand::Relay,
            payload,
        }
    }

    /// Create a DESTROY cell carrying a reason code
    pub fn destroy(circ_id: CircId, reason: DestroyReason) -> Self {
        Self::new(circ_id, CellCommand::Destroy, &[reason.as_u8()])
    }

    /// Reason code of a DESTROY cell (first payload byte).
    ///
    /// An empty or unparseable payload reads as `None`, matching how peers
    /// treat a clean teardown.
    pub fn destroy_reason(&self) -> DestroyReason {
        self.payload
            .first()
            .map(|b| DestroyReason::from_u8(*b))
            .unwrap_or(DestroyReason::None)
    }

    /// Serialize into the fixed link framing
    pub fn to_bytes(&self) -> [u8; CELL_LEN] {
        let mut buf = [0u8; CELL_LEN];
        buf[0..4].copy_from_slice(&self.circ_id.as_u32().to_be_bytes());
        buf[4] = self.command as u8;
        buf[5..].copy_from_slice(&self.payload);
        buf
    }

    /// Parse from the fixed link framing
    pub fn from_bytes(data: &[u8]) -> Result<Self, CellError> {
        if data.len() < CELL_LEN {
            return Err(CellError::ShortFrame(data.len()));
        }
        let circ_id = CircId::new(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
        let command = CellCommand::from_u8(data[4]).ok_or(CellError::UnknownCommand(data[4]))?;
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&data[5..CELL_LEN]);
        Ok(Self {
            circ_id,
            command,
            payload,
        })
    }
}

/// Cell framing errors
#[derive(Debug, thiserror::Error)]
pub enum CellError {
    #[error("cell frame too short: {0} bytes")]
    ShortFrame(usize),

    #[error("unknown cell command: {0}")]
    UnknownCommand(u8),
}
