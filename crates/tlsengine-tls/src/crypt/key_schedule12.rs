//! Legacy key derivation (RFC 2246 §6.3, RFC 5246 §6.3 and §8.1, RFC 7627).
//!
//! The pre-master secret becomes a 48-byte master secret, which is then
//! expanded into the key block holding per-direction MAC keys, cipher keys
//! and fixed IVs.

use tlsengine_crypto::CryptoProvider;
use tlsengine_types::{AlertDescription, BulkCipherAlgId, TlsError};

use super::prf::prf;
use super::{secret, CipherClass, CipherSuiteInfo, PrfHash, Secret};
use crate::ProtocolVersion;

pub const MASTER_SECRET_LEN: usize = 48;
pub const VERIFY_DATA_LEN: usize = 12;

pub const CLIENT_FINISHED_LABEL: &str = "client finished";
pub const SERVER_FINISHED_LABEL: &str = "server finished";

/// Slices of the key block, in RFC 5246 §6.3 order.
pub struct KeyBlock {
    pub client_mac_key: Secret,
    pub server_mac_key: Secret,
    pub client_key: Secret,
    pub server_key: Secret,
    pub client_iv: Secret,
    pub server_iv: Secret,
}

/// `(mac_key_len, key_len, iv_len)` for a suite at `version`.
///
/// CBC suites take their IV from the key block only in TLS 1.0; later
/// versions send an explicit IV with every record.
pub fn key_block_layout(suite: &CipherSuiteInfo, version: ProtocolVersion) -> (usize, usize, usize) {
    let iv_len = match suite.class() {
        CipherClass::Block if version > ProtocolVersion::Tls10 => 0,
        _ => suite.fixed_iv_len(),
    };
    (suite.mac.len(), suite.cipher.key_len(), iv_len)
}

/// master_secret = PRF(pre_master_secret, "master secret",
///                     ClientHello.random + ServerHello.random)[0..47]
pub fn derive_master_secret(
    provider: &dyn CryptoProvider,
    hash: PrfHash,
    pre_master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Result<Secret, TlsError> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    prf(
        provider,
        hash,
        pre_master_secret,
        "master secret",
        &seed,
        MASTER_SECRET_LEN,
    )
}

/// RFC 7627: the seed is the session hash, taken over every handshake
/// message up to and including ClientKeyExchange.
pub fn derive_extended_master_secret(
    provider: &dyn CryptoProvider,
    hash: PrfHash,
    pre_master_secret: &[u8],
    session_hash: &[u8],
) -> Result<Secret, TlsError> {
    prf(
        provider,
        hash,
        pre_master_secret,
        "extended master secret",
        session_hash,
        MASTER_SECRET_LEN,
    )
}

/// key_block = PRF(master_secret, "key expansion",
///                 ServerHello.random + ClientHello.random)
pub fn derive_key_block(
    provider: &dyn CryptoProvider,
    hash: PrfHash,
    master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    suite: &CipherSuiteInfo,
    version: ProtocolVersion,
) -> Result<KeyBlock, TlsError> {
    if suite.cipher == BulkCipherAlgId::Null {
        return Err(TlsError::fatal(
            AlertDescription::InternalError,
            "key block for a null cipher",
        ));
    }
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(client_random);

    let (mac_len, key_len, iv_len) = key_block_layout(suite, version);
    let total = 2 * (mac_len + key_len + iv_len);
    let block = prf(provider, hash, master_secret, "key expansion", &seed, total)?;

    let mut offset = 0;
    let mut take = |len: usize| {
        let part = secret(block[offset..offset + len].to_vec());
        offset += len;
        part
    };
    Ok(KeyBlock {
        client_mac_key: take(mac_len),
        server_mac_key: take(mac_len),
        client_key: take(key_len),
        server_key: take(key_len),
        client_iv: take(iv_len),
        server_iv: take(iv_len),
    })
}

/// verify_data = PRF(master_secret, finished_label, Hash(handshake_messages))[0..11]
pub fn compute_verify_data(
    provider: &dyn CryptoProvider,
    hash: PrfHash,
    master_secret: &[u8],
    label: &str,
    transcript_hash: &[u8],
) -> Result<Vec<u8>, TlsError> {
    let vd = prf(
        provider,
        hash,
        master_secret,
        label,
        transcript_hash,
        VERIFY_DATA_LEN,
    )?;
    Ok(vd.to_vec())
}

/// RFC 5705 keying material exporter.
///
/// ```text
/// PRF(master_secret, label,
///     client_random + server_random [+ context_value_length + context_value])
/// ```
#[allow(clippy::too_many_arguments)]
pub fn export_keying_material(
    provider: &dyn CryptoProvider,
    hash: PrfHash,
    master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    label: &str,
    context: Option<&[u8]>,
    length: usize,
) -> Result<Secret, TlsError> {
    const RESERVED: [&str; 4] = [
        "client finished",
        "server finished",
        "master secret",
        "key expansion",
    ];
    if RESERVED.contains(&label) || label == "extended master secret" {
        return Err(TlsError::InvalidOperation(format!(
            "exporter label {label:?} is reserved"
        )));
    }
    let mut seed = Vec::with_capacity(64 + context.map_or(0, |c| 2 + c.len()));
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    if let Some(ctx) = context {
        let len = u16::try_from(ctx.len()).map_err(|_| {
            TlsError::InvalidOperation("exporter context longer than 65535 bytes".into())
        })?;
        seed.extend_from_slice(&len.to_be_bytes());
        seed.extend_from_slice(ctx);
    }
    prf(provider, hash, master_secret, label, &seed, length)
}
