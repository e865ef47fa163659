//! Handshake protocol: message types, connection states, codecs and the two
//! role orchestrators.

pub mod client;
pub mod codec;
pub mod key_exchange;
pub mod negotiation;
pub mod server;
pub mod signing;

use tlsengine_types::{AlertDescription, TlsError};

/// Handshake message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandshakeType {
    HelloRequest = 0,
    ClientHello = 1,
    ServerHello = 2,
    NewSessionTicket = 4,
    EndOfEarlyData = 5,
    EncryptedExtensions = 8,
    Certificate = 11,
    ServerKeyExchange = 12,
    CertificateRequest = 13,
    ServerHelloDone = 14,
    CertificateVerify = 15,
    ClientKeyExchange = 16,
    Finished = 20,
    CertificateStatus = 22,
    SupplementalData = 23,
    KeyUpdate = 24,
    MessageHash = 254,
}

impl HandshakeType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::HelloRequest,
            1 => Self::ClientHello,
            2 => Self::ServerHello,
            4 => Self::NewSessionTicket,
            5 => Self::EndOfEarlyData,
            8 => Self::EncryptedExtensions,
            11 => Self::Certificate,
            12 => Self::ServerKeyExchange,
            13 => Self::CertificateRequest,
            14 => Self::ServerHelloDone,
            15 => Self::CertificateVerify,
            16 => Self::ClientKeyExchange,
            20 => Self::Finished,
            22 => Self::CertificateStatus,
            23 => Self::SupplementalData,
            24 => Self::KeyUpdate,
            254 => Self::MessageHash,
            _ => return None,
        })
    }
}

/// Connection state. The numeric order is the wire-independent handshake
/// order shared by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum HandshakeState {
    Start = 0,
    ClientHello = 1,
    ServerHelloRetryRequest = 2,
    ClientHelloRetry = 3,
    ServerHello = 4,
    ServerEncryptedExtensions = 5,
    ServerSupplementalData = 6,
    ServerCertificate = 7,
    ServerCertificateStatus = 8,
    ServerCertificateVerify = 9,
    ServerKeyExchange = 10,
    ServerCertificateRequest = 11,
    ServerHelloDone = 12,
    ClientEndOfEarlyData = 13,
    ClientSupplementalData = 14,
    ClientCertificate = 15,
    ClientKeyExchange = 16,
    ClientCertificateVerify = 17,
    ClientFinished = 18,
    ServerSessionTicket = 19,
    ServerFinished = 20,
    End = 21,
}

impl HandshakeState {
    /// True if the state occurs in a TLS 1.0-1.2 handshake.
    pub fn is_legacy_compatible(self) -> bool {
        use HandshakeState::*;
        !matches!(
            self,
            ServerHelloRetryRequest
                | ClientHelloRetry
                | ServerEncryptedExtensions
                | ServerCertificateVerify
                | ClientEndOfEarlyData
        )
    }

    /// True if the state occurs in a TLS 1.3 handshake.
    pub fn is_modern_compatible(self) -> bool {
        use HandshakeState::*;
        !matches!(
            self,
            ServerSupplementalData
                | ServerCertificateStatus
                | ServerKeyExchange
                | ServerHelloDone
                | ClientSupplementalData
                | ClientKeyExchange
                | ServerSessionTicket
        )
    }
}

/// A fully reassembled handshake message.
#[derive(Debug, Clone)]
pub struct HandshakeMessage {
    pub msg_type: HandshakeType,
    /// Header and body, exactly as received.
    pub encoding: Vec<u8>,
}

impl HandshakeMessage {
    pub fn body(&self) -> &[u8] {
        &self.encoding[HANDSHAKE_HEADER_LEN..]
    }
}

pub const HANDSHAKE_HEADER_LEN: usize = 4;

/// Parse the 4-byte header at the front of `data`.
///
/// Returns `Ok(None)` until the whole message is buffered. Lengths beyond
/// `max_len` fail with `illegal_parameter`, unknown types with
/// `unexpected_message`.
pub fn peek_handshake_header(
    data: &[u8],
    max_len: usize,
) -> Result<Option<(HandshakeType, usize)>, TlsError> {
    if data.len() < HANDSHAKE_HEADER_LEN {
        return Ok(None);
    }
    let msg_type = HandshakeType::from_u8(data[0]).ok_or_else(|| {
        TlsError::fatal(
            AlertDescription::UnexpectedMessage,
            format!("unknown handshake type {}", data[0]),
        )
    })?;
    let len = ((data[1] as usize) << 16) | ((data[2] as usize) << 8) | data[3] as usize;
    if len > max_len {
        return Err(TlsError::fatal(
            AlertDescription::IllegalParameter,
            format!("{msg_type:?} of {len} bytes exceeds limit {max_len}"),
        ));
    }
    let total = HANDSHAKE_HEADER_LEN + len;
    if data.len() < total {
        return Ok(None);
    }
    Ok(Some((msg_type, total)))
}

/// Wrap a handshake body with its 4-byte header.
pub fn wrap_handshake(msg_type: HandshakeType, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HANDSHAKE_HEADER_LEN + body.len());
    out.push(msg_type as u8);
    tlsengine_utils::put_opaque24(&mut out, body);
    out
}
