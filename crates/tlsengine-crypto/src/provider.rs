//! Trait-based provider mechanism for the primitives the TLS engine consumes.
//!
//! The engine never names a concrete algorithm implementation; it asks a
//! [`CryptoProvider`] for boxed objects keyed by algorithm identifiers.

use std::fmt;

use tlsengine_types::{
    BulkCipherAlgId, CryptoError, HashAlgId, NamedGroup, SignatureKeyKind, SignatureScheme,
};
use zeroize::Zeroizing;

use crate::keys::{PrivateKey, PublicKey};

/// A hash / message digest algorithm.
pub trait Digest: Send {
    /// The output size in bytes.
    fn output_size(&self) -> usize;

    /// The internal block size in bytes.
    fn block_size(&self) -> usize;

    /// Feed data into the hash state.
    fn update(&mut self, data: &[u8]);

    /// Finalize the hash into `out` and reset the state.
    /// The length of `out` must be at least `output_size()`.
    fn finish(&mut self, out: &mut [u8]) -> Result<(), CryptoError>;

    /// Reset the hash state to process a new message.
    fn reset(&mut self);
}

/// A keyed Message Authentication Code (HMAC).
pub trait Mac: Send {
    /// The output size of the MAC in bytes.
    fn output_size(&self) -> usize;

    /// Feed data into the MAC computation.
    fn update(&mut self, data: &[u8]);

    /// Finalize into `out` and reset for reuse with the same key.
    fn finish(&mut self, out: &mut [u8]) -> Result<(), CryptoError>;

    /// Reset the MAC state for reuse with the same key.
    fn reset(&mut self);
}

/// An Authenticated Encryption with Associated Data (AEAD) algorithm.
pub trait Aead: Send {
    /// The length of the authentication tag in bytes.
    fn tag_size(&self) -> usize;

    /// The expected nonce size in bytes.
    fn nonce_size(&self) -> usize;

    /// Returns ciphertext || tag.
    fn encrypt(&self, nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// `ciphertext` must include the appended tag.
    fn decrypt(&self, nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// A block cipher run in CBC mode. Padding is the caller's concern.
pub trait CbcCipher: Send {
    fn block_size(&self) -> usize;

    /// Encrypt whole blocks in place; returns the last ciphertext block.
    fn encrypt(&self, iv: &[u8], data: &mut [u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt whole blocks in place; returns the last ciphertext block.
    fn decrypt(&self, iv: &[u8], data: &mut [u8]) -> Result<Vec<u8>, CryptoError>;
}

/// One side of an ephemeral key agreement.
pub trait KeyAgreement: Send {
    fn group(&self) -> NamedGroup;

    /// The local public value in TLS wire form.
    fn public_key(&self) -> Vec<u8>;

    /// Compute the shared secret from the peer's public key.
    fn compute_shared_secret(&self, peer_public_key: &[u8])
        -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

/// A digital signature algorithm bound to one private key.
pub trait Signer: Send + Sync {
    fn key_kind(&self) -> SignatureKeyKind;

    /// Schemes this key can produce, most preferred first.
    fn schemes(&self) -> &'static [SignatureScheme];

    fn public_key(&self) -> PublicKey;

    /// Sign `message` under `scheme`. The scheme's hash is applied here.
    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// A signature verifier bound to one public key.
pub trait Verifier: Send {
    fn key_kind(&self) -> SignatureKeyKind;

    /// Verify a signature against a message.
    fn verify(
        &self,
        scheme: SignatureScheme,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError>;
}

/// Factory for every primitive the engine uses.
pub trait CryptoProvider: Send + Sync + fmt::Debug {
    fn new_digest(&self, alg: HashAlgId) -> Result<Box<dyn Digest>, CryptoError>;

    fn new_mac(&self, alg: HashAlgId, key: &[u8]) -> Result<Box<dyn Mac>, CryptoError>;

    fn new_aead(&self, alg: BulkCipherAlgId, key: &[u8]) -> Result<Box<dyn Aead>, CryptoError>;

    fn new_cbc(&self, alg: BulkCipherAlgId, key: &[u8]) -> Result<Box<dyn CbcCipher>, CryptoError>;

    /// Generate a fresh ephemeral key pair for `group`.
    fn generate_key_agreement(&self, group: NamedGroup)
        -> Result<Box<dyn KeyAgreement>, CryptoError>;

    fn new_signer(&self, key: &PrivateKey) -> Result<Box<dyn Signer>, CryptoError>;

    fn new_verifier(&self, key: &PublicKey) -> Result<Box<dyn Verifier>, CryptoError>;

    /// Fill `out` from the system CSPRNG.
    fn fill_random(&self, out: &mut [u8]) -> Result<(), CryptoError>;

    fn supports_bulk_cipher(&self, alg: BulkCipherAlgId) -> bool;

    fn supports_group(&self, group: NamedGroup) -> bool;

    /// Static RSA key transport and signatures.
    fn supports_rsa(&self) -> bool {
        false
    }

    /// Finite-field Diffie-Hellman.
    fn supports_ffdh(&self) -> bool {
        false
    }

    /// One-shot hash computation.
    fn hash(&self, alg: HashAlgId, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut ctx = self.new_digest(alg)?;
        ctx.update(data);
        let mut out = vec![0u8; ctx.output_size()];
        ctx.finish(&mut out)?;
        Ok(out)
    }

    /// One-shot HMAC over the concatenation of `parts`.
    fn hmac(&self, alg: HashAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, CryptoError> {
        let mut mac = self.new_mac(alg, key)?;
        for p in parts {
            mac.update(p);
        }
        let mut out = vec![0u8; mac.output_size()];
        mac.finish(&mut out)?;
        Ok(out)
    }
}
