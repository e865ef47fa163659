//! TLS cryptographic operations wrapper.
//!
//! Bridges the protocol with the `tlsengine-crypto` provider: the cipher
//! suite registry, transcript hashing, HKDF and PRF, and both key schedules.

pub mod hkdf;
pub mod key_schedule;
pub mod key_schedule12;
pub mod prf;
pub mod traffic_keys;
pub mod transcript;

use tlsengine_types::{AlertDescription, BulkCipherAlgId, HashAlgId, MacAlgId, TlsError};
use zeroize::Zeroizing;

use crate::{CipherSuite, ProtocolVersion};

/// Owned secret material. Wiped when dropped.
pub type Secret = Zeroizing<Vec<u8>>;

/// Wrap freshly derived bytes as a [`Secret`].
pub fn secret(bytes: Vec<u8>) -> Secret {
    Zeroizing::new(bytes)
}

/// Hash used by the PRF and the transcript for a given version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfHash {
    /// TLS 1.0/1.1: MD5 and SHA-1 side by side.
    Md5Sha1,
    Single(HashAlgId),
}

impl PrfHash {
    pub fn output_size(self) -> usize {
        match self {
            PrfHash::Md5Sha1 => 36,
            PrfHash::Single(h) => h.output_size(),
        }
    }
}

/// Key exchange algorithm of a cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchangeAlg {
    /// TLS 1.3 suites; the key exchange is negotiated by extensions.
    Tls13,
    Ecdhe,
    Rsa,
    Dhe,
    Psk,
    EcdhePsk,
    EcdhAnon,
}

impl KeyExchangeAlg {
    /// Returns true if this is any PSK-based key exchange.
    pub fn is_psk(&self) -> bool {
        matches!(self, Self::Psk | Self::EcdhePsk)
    }

    /// Returns true if the server must send a Certificate message.
    pub fn requires_certificate(&self) -> bool {
        matches!(self, Self::Ecdhe | Self::Rsa | Self::Dhe)
    }

    pub fn uses_ecdhe(&self) -> bool {
        matches!(self, Self::Ecdhe | Self::EcdhePsk | Self::EcdhAnon)
    }
}

/// Server authentication algorithm of a legacy cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAlg {
    /// No certificate signature tied to the suite: TLS 1.3, PSK and anonymous.
    Anonymous,
    Rsa,
    Ecdsa,
}

/// How records are protected under a suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherClass {
    Aead,
    Block,
    Stream,
}

/// Static description of a cipher suite.
#[derive(Debug, Clone, Copy)]
pub struct CipherSuiteInfo {
    pub suite: CipherSuite,
    pub name: &'static str,
    pub kx: KeyExchangeAlg,
    pub auth: AuthAlg,
    pub cipher: BulkCipherAlgId,
    pub mac: MacAlgId,
    /// PRF hash for TLS 1.2, transcript hash for TLS 1.3.
    pub prf_hash: HashAlgId,
    pub min_version: ProtocolVersion,
    pub max_version: ProtocolVersion,
}

impl CipherSuiteInfo {
    pub fn class(&self) -> CipherClass {
        if self.cipher.is_aead() {
            CipherClass::Aead
        } else if self.cipher.block_size().is_some() {
            CipherClass::Block
        } else {
            CipherClass::Stream
        }
    }

    pub fn is_tls13(&self) -> bool {
        self.kx == KeyExchangeAlg::Tls13
    }

    /// True if the suite may be used at `version`.
    pub fn usable_at(&self, version: ProtocolVersion) -> bool {
        version >= self.min_version && version <= self.max_version
    }

    /// The PRF / transcript hash once `version` is known.
    pub fn prf_for(&self, version: ProtocolVersion) -> PrfHash {
        if version < ProtocolVersion::Tls12 {
            PrfHash::Md5Sha1
        } else {
            PrfHash::Single(self.prf_hash)
        }
    }

    /// Fixed IV bytes taken from the key block (TLS 1.2 AEAD salt or CBC IV).
    pub fn fixed_iv_len(&self) -> usize {
        match self.cipher {
            BulkCipherAlgId::Aes128Gcm | BulkCipherAlgId::Aes256Gcm => 4,
            BulkCipherAlgId::Chacha20Poly1305 => 12,
            BulkCipherAlgId::Aes128Cbc | BulkCipherAlgId::Aes256Cbc => 16,
            _ => 0,
        }
    }
}

macro_rules! suite {
    ($suite:ident, $kx:ident, $auth:ident, $cipher:ident, $mac:ident, $prf:ident, $min:ident, $max:ident) => {
        CipherSuiteInfo {
            suite: CipherSuite::$suite,
            name: stringify!($suite),
            kx: KeyExchangeAlg::$kx,
            auth: AuthAlg::$auth,
            cipher: BulkCipherAlgId::$cipher,
            mac: MacAlgId::$mac,
            prf_hash: HashAlgId::$prf,
            min_version: ProtocolVersion::$min,
            max_version: ProtocolVersion::$max,
        }
    };
}

/// Every suite the engine recognises, in default preference order.
pub static CIPHER_SUITES: &[CipherSuiteInfo] = &[
    suite!(TLS_AES_128_GCM_SHA256, Tls13, Anonymous, Aes128Gcm, Aead, Sha256, Tls13, Tls13),
    suite!(TLS_AES_256_GCM_SHA384, Tls13, Anonymous, Aes256Gcm, Aead, Sha384, Tls13, Tls13),
    suite!(TLS_CHACHA20_POLY1305_SHA256, Tls13, Anonymous, Chacha20Poly1305, Aead, Sha256, Tls13, Tls13),
    suite!(TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256, Ecdhe, Ecdsa, Aes128Gcm, Aead, Sha256, Tls12, Tls12),
    suite!(TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384, Ecdhe, Ecdsa, Aes256Gcm, Aead, Sha384, Tls12, Tls12),
    suite!(TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256, Ecdhe, Ecdsa, Chacha20Poly1305, Aead, Sha256, Tls12, Tls12),
    suite!(TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256, Ecdhe, Rsa, Aes128Gcm, Aead, Sha256, Tls12, Tls12),
    suite!(TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384, Ecdhe, Rsa, Aes256Gcm, Aead, Sha384, Tls12, Tls12),
    suite!(TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256, Ecdhe, Rsa, Chacha20Poly1305, Aead, Sha256, Tls12, Tls12),
    suite!(TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256, Ecdhe, Ecdsa, Aes128Cbc, HmacSha256, Sha256, Tls12, Tls12),
    suite!(TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA384, Ecdhe, Ecdsa, Aes256Cbc, HmacSha384, Sha384, Tls12, Tls12),
    suite!(TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA, Ecdhe, Ecdsa, Aes128Cbc, HmacSha1, Sha256, Tls10, Tls12),
    suite!(TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA, Ecdhe, Ecdsa, Aes256Cbc, HmacSha1, Sha256, Tls10, Tls12),
    suite!(TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA, Ecdhe, Rsa, Aes128Cbc, HmacSha1, Sha256, Tls10, Tls12),
    suite!(TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA, Ecdhe, Rsa, Aes256Cbc, HmacSha1, Sha256, Tls10, Tls12),
    suite!(TLS_ECDHE_PSK_WITH_CHACHA20_POLY1305_SHA256, EcdhePsk, Anonymous, Chacha20Poly1305, Aead, Sha256, Tls12, Tls12),
    suite!(TLS_ECDHE_PSK_WITH_AES_128_CBC_SHA256, EcdhePsk, Anonymous, Aes128Cbc, HmacSha256, Sha256, Tls12, Tls12),
    suite!(TLS_ECDHE_PSK_WITH_AES_128_CBC_SHA, EcdhePsk, Anonymous, Aes128Cbc, HmacSha1, Sha256, Tls10, Tls12),
    suite!(TLS_ECDHE_PSK_WITH_AES_256_CBC_SHA, EcdhePsk, Anonymous, Aes256Cbc, HmacSha1, Sha256, Tls10, Tls12),
    suite!(TLS_PSK_WITH_AES_128_GCM_SHA256, Psk, Anonymous, Aes128Gcm, Aead, Sha256, Tls12, Tls12),
    suite!(TLS_PSK_WITH_AES_256_GCM_SHA384, Psk, Anonymous, Aes256Gcm, Aead, Sha384, Tls12, Tls12),
    suite!(TLS_PSK_WITH_AES_128_CBC_SHA256, Psk, Anonymous, Aes128Cbc, HmacSha256, Sha256, Tls12, Tls12),
    suite!(TLS_PSK_WITH_AES_128_CBC_SHA, Psk, Anonymous, Aes128Cbc, HmacSha1, Sha256, Tls10, Tls12),
    suite!(TLS_PSK_WITH_AES_256_CBC_SHA, Psk, Anonymous, Aes256Cbc, HmacSha1, Sha256, Tls10, Tls12),
    suite!(TLS_ECDH_ANON_WITH_AES_128_CBC_SHA, EcdhAnon, Anonymous, Aes128Cbc, HmacSha1, Sha256, Tls10, Tls12),
    suite!(TLS_ECDH_ANON_WITH_AES_256_CBC_SHA, EcdhAnon, Anonymous, Aes256Cbc, HmacSha1, Sha256, Tls10, Tls12),
    suite!(TLS_DHE_RSA_WITH_AES_128_GCM_SHA256, Dhe, Rsa, Aes128Gcm, Aead, Sha256, Tls12, Tls12),
    suite!(TLS_DHE_RSA_WITH_AES_128_CBC_SHA, Dhe, Rsa, Aes128Cbc, HmacSha1, Sha256, Tls10, Tls12),
    suite!(TLS_RSA_WITH_AES_128_GCM_SHA256, Rsa, Rsa, Aes128Gcm, Aead, Sha256, Tls12, Tls12),
    suite!(TLS_RSA_WITH_AES_256_GCM_SHA384, Rsa, Rsa, Aes256Gcm, Aead, Sha384, Tls12, Tls12),
    suite!(TLS_RSA_WITH_AES_128_CBC_SHA, Rsa, Rsa, Aes128Cbc, HmacSha1, Sha256, Tls10, Tls12),
    suite!(TLS_RSA_WITH_AES_256_CBC_SHA, Rsa, Rsa, Aes256Cbc, HmacSha1, Sha256, Tls10, Tls12),
    suite!(TLS_RSA_WITH_RC4_128_SHA, Rsa, Rsa, Rc4_128, HmacSha1, Sha256, Tls10, Tls12),
];

/// Look up a suite in the registry.
pub fn lookup_suite(suite: CipherSuite) -> Option<&'static CipherSuiteInfo> {
    CIPHER_SUITES.iter().find(|info| info.suite == suite)
}

/// Look up a suite, mapping an unknown value to `illegal_parameter`.
pub fn require_suite(suite: CipherSuite) -> Result<&'static CipherSuiteInfo, TlsError> {
    lookup_suite(suite).ok_or_else(|| {
        TlsError::fatal(
            AlertDescription::IllegalParameter,
            format!("unknown cipher suite 0x{:04x}", suite.0),
        )
    })
}
