//! RustCrypto-backed implementation of [`CryptoProvider`].

mod cipher;
mod ecc;
mod hash;

use tlsengine_types::{BulkCipherAlgId, CryptoError, HashAlgId, NamedGroup};

use crate::keys::{PrivateKey, PublicKey};
use crate::provider::{Aead, CbcCipher, CryptoProvider, Digest, KeyAgreement, Mac, Signer, Verifier};

/// The default provider: SHA-1/2, MD5, HMAC, AES-GCM, ChaCha20-Poly1305,
/// AES-CBC, X25519, P-256 ECDH/ECDSA and Ed25519.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustCryptoProvider;

impl RustCryptoProvider {
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for RustCryptoProvider {
    fn new_digest(&self, alg: HashAlgId) -> Result<Box<dyn Digest>, CryptoError> {
        Ok(hash::new_digest(alg))
    }

    fn new_mac(&self, alg: HashAlgId, key: &[u8]) -> Result<Box<dyn Mac>, CryptoError> {
        hash::new_hmac(alg, key)
    }

    fn new_aead(&self, alg: BulkCipherAlgId, key: &[u8]) -> Result<Box<dyn Aead>, CryptoError> {
        cipher::new_aead(alg, key)
    }

    fn new_cbc(&self, alg: BulkCipherAlgId, key: &[u8]) -> Result<Box<dyn CbcCipher>, CryptoError> {
        cipher::new_cbc(alg, key)
    }

    fn generate_key_agreement(
        &self,
        group: NamedGroup,
    ) -> Result<Box<dyn KeyAgreement>, CryptoError> {
        ecc::generate_key_agreement(group)
    }

    fn new_signer(&self, key: &PrivateKey) -> Result<Box<dyn Signer>, CryptoError> {
        ecc::new_signer(key)
    }

    fn new_verifier(&self, key: &PublicKey) -> Result<Box<dyn Verifier>, CryptoError> {
        ecc::new_verifier(key)
    }

    fn fill_random(&self, out: &mut [u8]) -> Result<(), CryptoError> {
        getrandom::getrandom(out).map_err(|_| CryptoError::RandomFail)
    }

    fn supports_bulk_cipher(&self, alg: BulkCipherAlgId) -> bool {
        matches!(
            alg,
            BulkCipherAlgId::Aes128Gcm
                | BulkCipherAlgId::Aes256Gcm
                | BulkCipherAlgId::Chacha20Poly1305
                | BulkCipherAlgId::Aes128Cbc
                | BulkCipherAlgId::Aes256Cbc
        )
    }

    fn supports_group(&self, group: NamedGroup) -> bool {
        group == NamedGroup::X25519 || group == NamedGroup::SECP256R1
    }
}
