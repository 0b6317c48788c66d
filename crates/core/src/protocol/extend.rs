use onionrelay_common::Fingerprint;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use super::cell::CellCommand;
use super::relay_cell::RelayCommand;

/// Client-side TAP onion skin length, carried by a legacy EXTEND
pub const TAP_C_HANDSHAKE_LEN: usize = 186;

/// Server-side TAP reply length, carried by a CREATED
pub const TAP_S_HANDSHAKE_LEN: usize = 148;

/// Fixed size of a legacy EXTEND payload:
/// IPv4 (4) + port (2) + onion skin (186) + identity fingerprint (20)
const EXTEND_PAYLOAD_LEN: usize = 4 + 2 + TAP_C_HANDSHAKE_LEN + Fingerprint::LEN;

/// Link specifier type bytes used by EXTEND2
const LS_IPV4: u8 = 0;
const LS_IPV6: u8 = 1;
const LS_LEGACY_ID: u8 = 2;
const LS_ED25519_ID: u8 = 3;

/// One link specifier from an EXTEND2 payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    /// TLS-over-TCP, IPv4 address + port
    Ipv4(SocketAddrV4),
    /// TLS-over-TCP, IPv6 address + port
    Ipv6(SocketAddrV6),
    /// Legacy RSA identity fingerprint
    LegacyId(Fingerprint),
    /// Ed25519 identity key
    Ed25519Id([u8; 32]),
}

impl LinkSpec {
    fn type_byte(&self) -> u8 {
        match self {
            LinkSpec::Ipv4(_) => LS_IPV4,
            LinkSpec::Ipv6(_) => LS_IPV6,
            LinkSpec::LegacyId(_) => LS_LEGACY_ID,
            LinkSpec::Ed25519Id(_) => LS_ED25519_ID,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            LinkSpec::Ipv4(addr) => {
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            LinkSpec::Ipv6(addr) => {
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            LinkSpec::LegacyId(fp) => out.extend_from_slice(fp.as_bytes()),
            LinkSpec::Ed25519Id(key) => out.extend_from_slice(key),
        }
    }
}

/// Which extension exchange a request belongs to.
///
/// Legacy requests travel as EXTEND and are answered through CREATE/CREATED;
/// current requests travel as EXTEND2 over CREATE2/CREATED2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtendVariant {
    Legacy,
    V2,
}

/// A decoded request to extend a circuit by one hop: where to reach the next
/// relay, plus the opaque handshake blob forwarded verbatim in the CREATE(2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendRequest {
    variant: ExtendVariant,
    specs: Vec<LinkSpec>,
    handshake: Vec<u8>,
}

impl ExtendRequest {
    /// Parse a legacy EXTEND payload
    pub fn parse_extend(data: &[u8]) -> Result<Self, ExtendError> {
        if data.len() < EXTEND_PAYLOAD_LEN {
            return Err(ExtendError::ShortPayload);
        }

        let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
        let port = u16::from_be_bytes([data[4], data[5]]);
        let handshake = data[6..6 + TAP_C_HANDSHAKE_LEN].to_vec();
        let fp_start = 6 + TAP_C_HANDSHAKE_LEN;
        let fingerprint = Fingerprint::try_from(&data[fp_start..fp_start + Fingerprint::LEN])
            .map_err(|_| ExtendError::ShortPayload)?;

        Ok(Self {
            variant: ExtendVariant::Legacy,
            specs: vec![
                LinkSpec::Ipv4(SocketAddrV4::new(ip, port)),
                LinkSpec::LegacyId(fingerprint),
            ],
            handshake,
        })
    }

    /// Parse an EXTEND2 payload: NSPEC, then NSPEC link specifiers as
    /// (type, length, body), then the rest of the data region as the
    /// opaque handshake.
    pub fn parse_extend2(data: &[u8]) -> Result<Self, ExtendError> {
        let nspec = *data.first().ok_or(ExtendError::ShortPayload)? as usize;
        let mut rest = &data[1..];
        let mut specs = Vec::with_capacity(nspec);

        for _ in 0..nspec {
            if rest.len() < 2 {
                return Err(ExtendError::ShortPayload);
            }
            let (ty, len) = (rest[0], rest[1] as usize);
            rest = &rest[2..];
            if rest.len() < len {
                return Err(ExtendError::ShortPayload);
            }
            let (body, tail) = rest.split_at(len);
            rest = tail;

            specs.push(Self::parse_spec(ty, body)?);
        }

        Ok(Self {
            variant: ExtendVariant::V2,
            specs,
            handshake: rest.to_vec(),
        })
    }

    fn parse_spec(ty: u8, body: &[u8]) -> Result<LinkSpec, ExtendError> {
        match ty {
            LS_IPV4 => {
                let body: &[u8; 6] = body.try_into().map_err(|_| ExtendError::ShortPayload)?;
                let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let port = u16::from_be_bytes([body[4], body[5]]);
                Ok(LinkSpec::Ipv4(SocketAddrV4::new(ip, port)))
            }
            LS_IPV6 => {
                let body: &[u8; 18] = body.try_into().map_err(|_| ExtendError::ShortPayload)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let port = u16::from_be_bytes([body[16], body[17]]);
                Ok(LinkSpec::Ipv6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    0,
                    0,
                )))
            }
            LS_LEGACY_ID => {
                let fp = Fingerprint::try_from(body).map_err(|_| ExtendError::ShortPayload)?;
                Ok(LinkSpec::LegacyId(fp))
            }
            LS_ED25519_ID => {
                let key: [u8; 32] = body.try_into().map_err(|_| ExtendError::ShortPayload)?;
                Ok(LinkSpec::Ed25519Id(key))
            }
            other => Err(ExtendError::UnrecognizedLinkSpec(other)),
        }
    }

    /// TCP addresses the next hop may be reached at, in specifier order
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.specs
            .iter()
            .filter_map(|spec| match spec {
                LinkSpec::Ipv4(addr) => Some(SocketAddr::V4(*addr)),
                LinkSpec::Ipv6(addr) => Some(SocketAddr::V6(*addr)),
                _ => None,
            })
            .collect()
    }

    /// Identity fingerprint of the next hop.
    ///
    /// Mandatory: an EXTEND2 without a legacy identity specifier cannot be
    /// routed and fails here.
    pub fn fingerprint(&self) -> Result<Fingerprint, ExtendError> {
        self.specs
            .iter()
            .find_map(|spec| match spec {
                LinkSpec::LegacyId(fp) => Some(*fp),
                _ => None,
            })
            .ok_or(ExtendError::NoFingerprint)
    }

    /// Ed25519 identity of the next hop, when the request carries one
    pub fn ed_identity(&self) -> Option<[u8; 32]> {
        self.specs.iter().find_map(|spec| match spec {
            LinkSpec::Ed25519Id(key) => Some(*key),
            _ => None,
        })
    }

    /// Opaque handshake blob, forwarded verbatim as the CREATE(2) payload
    pub fn handshake(&self) -> &[u8] {
        &self.handshake
    }

    /// Cell command that carries this handshake to the next hop
    pub fn create_command(&self) -> CellCommand {
        match self.variant {
            ExtendVariant::Legacy => CellCommand::Create,
            ExtendVariant::V2 => CellCommand::Create2,
        }
    }

    /// Cell command expected back from the next hop
    pub fn created_command(&self) -> CellCommand {
        match self.variant {
            ExtendVariant::Legacy => CellCommand::Created,
            ExtendVariant::V2 => CellCommand::Created2,
        }
    }

    /// Relay command for the answer sent back toward the origin
    pub fn extended_command(&self) -> RelayCommand {
        match self.variant {
            ExtendVariant::Legacy => RelayCommand::Extended,
            ExtendVariant::V2 => RelayCommand::Extended2,
        }
    }

    /// Serialize back to the wire form this request was parsed from
    pub fn encode(&self) -> Vec<u8> {
        match self.variant {
            ExtendVariant::Legacy => {
                let mut out = Vec::with_capacity(EXTEND_PAYLOAD_LEN);
                for spec in &self.specs {
                    if let LinkSpec::Ipv4(addr) = spec {
                        out.extend_from_slice(&addr.ip().octets());
                        out.extend_from_slice(&addr.port().to_be_bytes());
                    }
                }
                out.extend_from_slice(&self.handshake);
                for spec in &self.specs {
                    if let LinkSpec::LegacyId(fp) = spec {
                        out.extend_from_slice(fp.as_bytes());
                    }
                }
                out
            }
            ExtendVariant::V2 => {
                let mut out = Vec::new();
                out.push(self.specs.len() as u8);
                for spec in &self.specs {
                    let mut body = Vec::new();
                    spec.encode_body(&mut body);
                    out.push(spec.type_byte());
                    out.push(body.len() as u8);
                    out.extend_from_slice(&body);
                }
                out.extend_from_slice(&self.handshake);
                out
            }
        }
    }
}

/// Errors decoding an extension request
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExtendError {
    #[error("extend payload truncated")]
    ShortPayload,

    #[error("unrecognized link specifier type: {0}")]
    UnrecognizedLinkSpec(u8),

    #[error("extend request carries no identity fingerprint")]
    NoFingerprint,
}
