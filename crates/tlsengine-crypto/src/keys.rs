//! Owned key material handed to the provider.

use std::fmt;

use tlsengine_types::SignatureKeyKind;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A private signing key. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub enum PrivateKey {
    /// 32-byte Ed25519 seed.
    Ed25519([u8; 32]),
    /// 32-byte P-256 scalar.
    EcdsaP256([u8; 32]),
}

impl PrivateKey {
    pub fn kind(&self) -> SignatureKeyKind {
        match self {
            PrivateKey::Ed25519(_) => SignatureKeyKind::Ed25519,
            PrivateKey::EcdsaP256(_) => SignatureKeyKind::Ecdsa,
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrivateKey::Ed25519(_) => f.write_str("PrivateKey::Ed25519(..)"),
            PrivateKey::EcdsaP256(_) => f.write_str("PrivateKey::EcdsaP256(..)"),
        }
    }
}

/// A public verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    Ed25519([u8; 32]),
    /// SEC1 encoded point.
    EcdsaP256(Vec<u8>),
}

impl PublicKey {
    pub fn kind(&self) -> SignatureKeyKind {
        match self {
            PublicKey::Ed25519(_) => SignatureKeyKind::Ed25519,
            PublicKey::EcdsaP256(_) => SignatureKeyKind::Ecdsa,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_key_debug_hides_material() {
        let key = PrivateKey::EcdsaP256([0x42; 32]);
        let shown = format!("{key:?}");
        assert!(!shown.contains("42"));
        assert_eq!(key.kind(), SignatureKeyKind::Ecdsa);
    }
}
