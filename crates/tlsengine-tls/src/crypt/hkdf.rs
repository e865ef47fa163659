//! HKDF primitives (RFC 5869) and the TLS 1.3 label encoding (RFC 8446 §7.1).

use tlsengine_crypto::CryptoProvider;
use tlsengine_types::{CryptoError, HashAlgId, TlsError};

use super::{secret, Secret};

/// HKDF-Extract(salt, IKM) -> PRK.
///
/// An empty salt is replaced by `Hash.length` zero bytes.
pub fn hkdf_extract(
    provider: &dyn CryptoProvider,
    alg: HashAlgId,
    salt: &[u8],
    ikm: &[u8],
) -> Result<Secret, TlsError> {
    let zeros;
    let salt = if salt.is_empty() {
        zeros = vec![0u8; alg.output_size()];
        &zeros[..]
    } else {
        salt
    };
    Ok(secret(provider.hmac(alg, salt, &[ikm])?))
}

/// HKDF-Expand(PRK, info, length) -> OKM.
pub fn hkdf_expand(
    provider: &dyn CryptoProvider,
    alg: HashAlgId,
    prk: &[u8],
    info: &[u8],
    length: usize,
) -> Result<Secret, TlsError> {
    let hash_len = alg.output_size();
    let n = length.div_ceil(hash_len);
    if n > 255 {
        return Err(CryptoError::KdfDkLenOverflow.into());
    }
    let mut mac = provider.new_mac(alg, prk)?;
    let mut okm = secret(Vec::with_capacity(n * hash_len));
    let mut t = secret(vec![0u8; hash_len]);
    for i in 1..=n {
        if i > 1 {
            mac.update(&t);
        }
        mac.update(info);
        mac.update(&[i as u8]);
        mac.finish(&mut t)?;
        okm.extend_from_slice(&t);
    }
    okm.truncate(length);
    Ok(okm)
}

/// Encode the HkdfLabel structure:
///
/// ```text
/// struct {
///     uint16 length;
///     opaque label<7..255>;   // "tls13 " + label
///     opaque context<0..255>;
/// } HkdfLabel;
/// ```
fn encode_hkdf_label(length: u16, label: &[u8], context: &[u8]) -> Vec<u8> {
    let full_label_len = 6 + label.len();
    let mut buf = Vec::with_capacity(2 + 1 + full_label_len + 1 + context.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.push(full_label_len as u8);
    buf.extend_from_slice(b"tls13 ");
    buf.extend_from_slice(label);
    buf.push(context.len() as u8);
    buf.extend_from_slice(context);
    buf
}

/// HKDF-Expand-Label(Secret, Label, Context, Length).
pub fn hkdf_expand_label(
    provider: &dyn CryptoProvider,
    alg: HashAlgId,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    length: usize,
) -> Result<Secret, TlsError> {
    let info = encode_hkdf_label(length as u16, label, context);
    hkdf_expand(provider, alg, secret, &info, length)
}

/// Derive-Secret(Secret, Label, Messages), given the already computed
/// transcript hash of `Messages`.
pub fn derive_secret(
    provider: &dyn CryptoProvider,
    alg: HashAlgId,
    secret: &[u8],
    label: &[u8],
    transcript_hash: &[u8],
) -> Result<Secret, TlsError> {
    hkdf_expand_label(
        provider,
        alg,
        secret,
        label,
        transcript_hash,
        alg.output_size(),
    )
}
