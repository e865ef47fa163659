#![forbid(unsafe_code)]
#![doc = "TLS handshake engine for tlsengine: one state machine for the legacy (TLS 1.0-1.2) and modern (TLS 1.3) flows."]

pub mod alert;
pub mod config;
pub mod connection;
pub mod crypt;
pub mod extensions;
pub mod handshake;
pub mod record;
pub mod session;

use std::fmt;

use tlsengine_types::TlsError;

pub use connection::transport::{NonBlockingConnection, RecordTransport, TlsStream};

/// TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    Ssl3,
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl ProtocolVersion {
    pub const fn wire(self) -> u16 {
        match self {
            ProtocolVersion::Ssl3 => 0x0300,
            ProtocolVersion::Tls10 => 0x0301,
            ProtocolVersion::Tls11 => 0x0302,
            ProtocolVersion::Tls12 => 0x0303,
            ProtocolVersion::Tls13 => 0x0304,
        }
    }

    pub fn from_wire(v: u16) -> Option<Self> {
        match v {
            0x0300 => Some(ProtocolVersion::Ssl3),
            0x0301 => Some(ProtocolVersion::Tls10),
            0x0302 => Some(ProtocolVersion::Tls11),
            0x0303 => Some(ProtocolVersion::Tls12),
            0x0304 => Some(ProtocolVersion::Tls13),
            _ => None,
        }
    }

    pub fn is_tls13(self) -> bool {
        self == ProtocolVersion::Tls13
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolVersion::Ssl3 => "SSLv3",
            ProtocolVersion::Tls10 => "TLSv1.0",
            ProtocolVersion::Tls11 => "TLSv1.1",
            ProtocolVersion::Tls12 => "TLSv1.2",
            ProtocolVersion::Tls13 => "TLSv1.3",
        };
        f.write_str(name)
    }
}

/// TLS cipher suite identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CipherSuite(pub u16);

impl CipherSuite {
    // Signalling values
    pub const TLS_NULL_WITH_NULL_NULL: Self = Self(0x0000);
    pub const TLS_EMPTY_RENEGOTIATION_INFO_SCSV: Self = Self(0x00FF);
    pub const TLS_FALLBACK_SCSV: Self = Self(0x5600);

    // TLS 1.3 cipher suites
    pub const TLS_AES_128_GCM_SHA256: Self = Self(0x1301);
    pub const TLS_AES_256_GCM_SHA384: Self = Self(0x1302);
    pub const TLS_CHACHA20_POLY1305_SHA256: Self = Self(0x1303);

    // ECDHE_ECDSA
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA: Self = Self(0xC009);
    pub const TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA: Self = Self(0xC00A);
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256: Self = Self(0xC023);
    pub const TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA384: Self = Self(0xC024);
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: Self = Self(0xC02B);
    pub const TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384: Self = Self(0xC02C);
    pub const TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256: Self = Self(0xCCA9);

    // ECDHE_RSA
    pub const TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA: Self = Self(0xC013);
    pub const TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA: Self = Self(0xC014);
    pub const TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: Self = Self(0xC02F);
    pub const TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384: Self = Self(0xC030);
    pub const TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256: Self = Self(0xCCA8);

    // Static RSA
    pub const TLS_RSA_WITH_RC4_128_SHA: Self = Self(0x0005);
    pub const TLS_RSA_WITH_AES_128_CBC_SHA: Self = Self(0x002F);
    pub const TLS_RSA_WITH_AES_256_CBC_SHA: Self = Self(0x0035);
    pub const TLS_RSA_WITH_AES_128_GCM_SHA256: Self = Self(0x009C);
    pub const TLS_RSA_WITH_AES_256_GCM_SHA384: Self = Self(0x009D);

    // DHE_RSA
    pub const TLS_DHE_RSA_WITH_AES_128_CBC_SHA: Self = Self(0x0033);
    pub const TLS_DHE_RSA_WITH_AES_128_GCM_SHA256: Self = Self(0x009E);

    // ECDH_anon
    pub const TLS_ECDH_ANON_WITH_AES_128_CBC_SHA: Self = Self(0xC018);
    pub const TLS_ECDH_ANON_WITH_AES_256_CBC_SHA: Self = Self(0xC019);

    // PSK (RFC 4279, RFC 5487)
    pub const TLS_PSK_WITH_AES_128_CBC_SHA: Self = Self(0x008C);
    pub const TLS_PSK_WITH_AES_256_CBC_SHA: Self = Self(0x008D);
    pub const TLS_PSK_WITH_AES_128_GCM_SHA256: Self = Self(0x00A8);
    pub const TLS_PSK_WITH_AES_256_GCM_SHA384: Self = Self(0x00A9);
    pub const TLS_PSK_WITH_AES_128_CBC_SHA256: Self = Self(0x00AE);

    // ECDHE_PSK (RFC 5489, RFC 7905)
    pub const TLS_ECDHE_PSK_WITH_AES_128_CBC_SHA: Self = Self(0xC035);
    pub const TLS_ECDHE_PSK_WITH_AES_256_CBC_SHA: Self = Self(0xC036);
    pub const TLS_ECDHE_PSK_WITH_AES_128_CBC_SHA256: Self = Self(0xC037);
    pub const TLS_ECDHE_PSK_WITH_CHACHA20_POLY1305_SHA256: Self = Self(0xCCAC);

    /// True for values that signal a capability and can never be selected.
    pub fn is_signalling(self) -> bool {
        self == Self::TLS_NULL_WITH_NULL_NULL
            || self == Self::TLS_EMPTY_RENEGOTIATION_INFO_SCSV
            || self == Self::TLS_FALLBACK_SCSV
    }
}

/// The role of a TLS endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

/// A synchronous TLS connection.
pub trait TlsConnection {
    /// Perform the TLS handshake. May only be called once.
    fn handshake(&mut self) -> Result<(), TlsError>;
    /// Read decrypted data into `buf`. Returns 0 once the peer has closed.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError>;
    /// Write data to be encrypted and sent.
    fn write(&mut self, buf: &[u8]) -> Result<usize, TlsError>;
    /// Shut down the TLS connection gracefully.
    fn shutdown(&mut self) -> Result<(), TlsError>;
    /// Get the negotiated TLS version.
    fn version(&self) -> Option<ProtocolVersion>;
    /// Get the negotiated cipher suite.
    fn cipher_suite(&self) -> Option<CipherSuite>;
}
