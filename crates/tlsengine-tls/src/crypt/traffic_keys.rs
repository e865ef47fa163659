//! TLS 1.3 traffic key derivation.

use tlsengine_crypto::CryptoProvider;
use tlsengine_types::TlsError;

use super::hkdf::hkdf_expand_label;
use super::{CipherSuiteInfo, Secret};

/// AEAD IV length for every TLS 1.3 suite.
pub const TLS13_IV_LEN: usize = 12;

/// Record protection key and IV derived from a traffic secret.
pub struct TrafficKeys {
    pub key: Secret,
    pub iv: Secret,
}

impl TrafficKeys {
    /// ```text
    /// key = HKDF-Expand-Label(secret, "key", "", key_length)
    /// iv  = HKDF-Expand-Label(secret, "iv", "", iv_length)
    /// ```
    pub fn derive(
        provider: &dyn CryptoProvider,
        suite: &CipherSuiteInfo,
        traffic_secret: &[u8],
    ) -> Result<Self, TlsError> {
        let alg = suite.prf_hash;
        let key = hkdf_expand_label(
            provider,
            alg,
            traffic_secret,
            b"key",
            b"",
            suite.cipher.key_len(),
        )?;
        let iv = hkdf_expand_label(provider, alg, traffic_secret, b"iv", b"", TLS13_IV_LEN)?;
        Ok(Self { key, iv })
    }
}
