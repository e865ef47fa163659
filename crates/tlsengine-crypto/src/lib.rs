#![forbid(unsafe_code)]
#![doc = "Crypto provider interfaces and a RustCrypto-backed implementation for tlsengine."]

// Core traits
pub mod provider;

// Key material carriers
pub mod keys;

// Backends
pub mod rust_crypto;

pub use keys::{PrivateKey, PublicKey};
pub use provider::{Aead, CbcCipher, CryptoProvider, Digest, KeyAgreement, Mac, Signer, Verifier};
pub use rust_crypto::RustCryptoProvider;
