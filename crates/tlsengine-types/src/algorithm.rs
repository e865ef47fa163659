/// Hash algorithm identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgId {
    Md5,
    Sha1,
    Sha256,
    Sha384,
}

impl HashAlgId {
    /// Digest length in bytes.
    pub const fn output_size(self) -> usize {
        match self {
            HashAlgId::Md5 => 16,
            HashAlgId::Sha1 => 20,
            HashAlgId::Sha256 => 32,
            HashAlgId::Sha384 => 48,
        }
    }

    /// The TLS 1.2 `HashAlgorithm` registry code (RFC 5246 §7.4.1.4.1).
    pub const fn tls_code(self) -> u8 {
        match self {
            HashAlgId::Md5 => 1,
            HashAlgId::Sha1 => 2,
            HashAlgId::Sha256 => 4,
            HashAlgId::Sha384 => 5,
        }
    }
}

/// MAC algorithm identifiers used by the record layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacAlgId {
    /// AEAD suites carry no separate MAC.
    Aead,
    HmacSha1,
    HmacSha256,
    HmacSha384,
}

impl MacAlgId {
    /// The underlying hash, if this is an HMAC.
    pub const fn hash(self) -> Option<HashAlgId> {
        match self {
            MacAlgId::Aead => None,
            MacAlgId::HmacSha1 => Some(HashAlgId::Sha1),
            MacAlgId::HmacSha256 => Some(HashAlgId::Sha256),
            MacAlgId::HmacSha384 => Some(HashAlgId::Sha384),
        }
    }

    /// MAC output and key length in bytes (zero for AEAD).
    pub const fn len(self) -> usize {
        match self.hash() {
            Some(h) => h.output_size(),
            None => 0,
        }
    }
}

/// Bulk (record) cipher identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkCipherAlgId {
    Null,
    Rc4_128,
    Aes128Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
}

impl BulkCipherAlgId {
    /// Encryption key length in bytes.
    pub const fn key_len(self) -> usize {
        match self {
            BulkCipherAlgId::Null => 0,
            BulkCipherAlgId::Rc4_128 | BulkCipherAlgId::Aes128Cbc | BulkCipherAlgId::Aes128Gcm => 16,
            BulkCipherAlgId::Aes256Cbc
            | BulkCipherAlgId::Aes256Gcm
            | BulkCipherAlgId::Chacha20Poly1305 => 32,
        }
    }

    /// Block size for block ciphers, `None` otherwise.
    pub const fn block_size(self) -> Option<usize> {
        match self {
            BulkCipherAlgId::Aes128Cbc | BulkCipherAlgId::Aes256Cbc => Some(16),
            _ => None,
        }
    }

    pub const fn is_aead(self) -> bool {
        matches!(
            self,
            BulkCipherAlgId::Aes128Gcm | BulkCipherAlgId::Aes256Gcm | BulkCipherAlgId::Chacha20Poly1305
        )
    }
}

/// TLS named group identifiers (RFC 8446 §4.2.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamedGroup(pub u16);

impl NamedGroup {
    pub const SECP256R1: Self = Self(0x0017);
    pub const SECP384R1: Self = Self(0x0018);
    pub const SECP521R1: Self = Self(0x0019);
    pub const X25519: Self = Self(0x001D);
    pub const X448: Self = Self(0x001E);
    pub const FFDHE2048: Self = Self(0x0100);
    pub const FFDHE3072: Self = Self(0x0101);

    /// True for elliptic-curve groups (including the Montgomery curves).
    pub fn is_elliptic_curve(self) -> bool {
        (0x0001..=0x001E).contains(&self.0)
    }

    /// True for RFC 7919 finite-field groups.
    pub fn is_finite_field(self) -> bool {
        (0x0100..=0x01FF).contains(&self.0)
    }
}

/// TLS signature scheme identifiers (RFC 8446 §4.2.3).
///
/// In TLS 1.2 the same 16 bits are read as a `SignatureAndHashAlgorithm`
/// pair: the high byte is the hash, the low byte the signature algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureScheme(pub u16);

impl SignatureScheme {
    pub const RSA_PKCS1_SHA1: Self = Self(0x0201);
    pub const ECDSA_SHA1: Self = Self(0x0203);
    pub const RSA_PKCS1_SHA256: Self = Self(0x0401);
    pub const ECDSA_SECP256R1_SHA256: Self = Self(0x0403);
    pub const RSA_PKCS1_SHA384: Self = Self(0x0501);
    pub const ECDSA_SECP384R1_SHA384: Self = Self(0x0503);
    pub const RSA_PSS_RSAE_SHA256: Self = Self(0x0804);
    pub const RSA_PSS_RSAE_SHA384: Self = Self(0x0805);
    pub const ED25519: Self = Self(0x0807);

    /// The digest the scheme applies to its input before signing, if any.
    pub fn hash(self) -> Option<HashAlgId> {
        match self {
            Self::RSA_PKCS1_SHA1 | Self::ECDSA_SHA1 => Some(HashAlgId::Sha1),
            Self::RSA_PKCS1_SHA256 | Self::ECDSA_SECP256R1_SHA256 | Self::RSA_PSS_RSAE_SHA256 => {
                Some(HashAlgId::Sha256)
            }
            Self::RSA_PKCS1_SHA384 | Self::ECDSA_SECP384R1_SHA384 | Self::RSA_PSS_RSAE_SHA384 => {
                Some(HashAlgId::Sha384)
            }
            _ => None,
        }
    }

    /// The kind of key that produces signatures under this scheme.
    pub fn key_kind(self) -> Option<SignatureKeyKind> {
        match self.0 & 0xFF {
            _ if self == Self::ED25519 => Some(SignatureKeyKind::Ed25519),
            _ if self.0 >> 8 == 0x08 => Some(SignatureKeyKind::Rsa),
            0x01 => Some(SignatureKeyKind::Rsa),
            0x03 => Some(SignatureKeyKind::Ecdsa),
            _ => None,
        }
    }

    /// Schemes that may not appear in a TLS 1.3 CertificateVerify.
    pub fn is_legacy_only(self) -> bool {
        (self.0 & 0xFF == 0x01 && self.0 >> 8 != 0x08) || self.hash() == Some(HashAlgId::Sha1)
    }
}

/// Signing key families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureKeyKind {
    Rsa,
    Ecdsa,
    Ed25519,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_scheme_hash_and_kind() {
        assert_eq!(SignatureScheme::ED25519.hash(), None);
        assert_eq!(
            SignatureScheme::ED25519.key_kind(),
            Some(SignatureKeyKind::Ed25519)
        );
        assert_eq!(
            SignatureScheme::ECDSA_SECP256R1_SHA256.hash(),
            Some(HashAlgId::Sha256)
        );
        assert_eq!(
            SignatureScheme::ECDSA_SHA1.key_kind(),
            Some(SignatureKeyKind::Ecdsa)
        );
        assert_eq!(
            SignatureScheme::RSA_PSS_RSAE_SHA256.key_kind(),
            Some(SignatureKeyKind::Rsa)
        );
    }

    #[test]
    fn test_legacy_only_schemes() {
        assert!(SignatureScheme::ECDSA_SHA1.is_legacy_only());
        assert!(SignatureScheme::RSA_PKCS1_SHA256.is_legacy_only());
        assert!(!SignatureScheme::RSA_PSS_RSAE_SHA256.is_legacy_only());
        assert!(!SignatureScheme::ED25519.is_legacy_only());
        assert!(!SignatureScheme::ECDSA_SECP256R1_SHA256.is_legacy_only());
    }

    #[test]
    fn test_group_families() {
        assert!(NamedGroup::X25519.is_elliptic_curve());
        assert!(NamedGroup::SECP256R1.is_elliptic_curve());
        assert!(NamedGroup::FFDHE2048.is_finite_field());
        assert!(!NamedGroup::FFDHE2048.is_elliptic_curve());
    }

    #[test]
    fn test_mac_lengths() {
        assert_eq!(MacAlgId::Aead.len(), 0);
        assert_eq!(MacAlgId::HmacSha1.len(), 20);
        assert_eq!(MacAlgId::HmacSha384.len(), 48);
    }
}
