//! Legacy PRFs (RFC 2246 §5, RFC 5246 §5).
//!
//! ```text
//! TLS 1.2:      PRF(secret, label, seed) = P_<hash>(secret, label + seed)
//! TLS 1.0/1.1:  PRF(secret, label, seed) = P_MD5(S1, label + seed) XOR
//!                                          P_SHA-1(S2, label + seed)
//!
//! P_hash(secret, seed) = HMAC_hash(secret, A(1) + seed) ||
//!                        HMAC_hash(secret, A(2) + seed) || ...
//! A(0) = seed
//! A(i) = HMAC_hash(secret, A(i-1))
//! ```

use tlsengine_crypto::CryptoProvider;
use tlsengine_types::{HashAlgId, TlsError};

use super::{secret, PrfHash, Secret};

/// Derive `output_len` bytes from `secret`, `label` and `seed`.
pub fn prf(
    provider: &dyn CryptoProvider,
    hash: PrfHash,
    key: &[u8],
    label: &str,
    seed: &[u8],
    output_len: usize,
) -> Result<Secret, TlsError> {
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label.as_bytes());
    label_seed.extend_from_slice(seed);

    match hash {
        PrfHash::Single(alg) => p_hash(provider, alg, key, &label_seed, output_len),
        PrfHash::Md5Sha1 => {
            // S1 and S2 overlap by one byte when the secret length is odd.
            let half = key.len().div_ceil(2);
            let s1 = &key[..half];
            let s2 = &key[key.len() - half..];
            let mut out = p_hash(provider, HashAlgId::Md5, s1, &label_seed, output_len)?;
            let sha = p_hash(provider, HashAlgId::Sha1, s2, &label_seed, output_len)?;
            for (o, s) in out.iter_mut().zip(sha.iter()) {
                *o ^= s;
            }
            Ok(out)
        }
    }
}

/// P_hash expansion function.
fn p_hash(
    provider: &dyn CryptoProvider,
    alg: HashAlgId,
    key: &[u8],
    seed: &[u8],
    output_len: usize,
) -> Result<Secret, TlsError> {
    let mut mac = provider.new_mac(alg, key)?;
    let hash_len = alg.output_size();
    let mut result = secret(Vec::with_capacity(output_len + hash_len));

    // A(0) = seed
    let mut a = secret(seed.to_vec());
    let mut block = secret(vec![0u8; hash_len]);

    while result.len() < output_len {
        mac.update(&a);
        let mut next = secret(vec![0u8; hash_len]);
        mac.finish(&mut next)?;
        a = next;

        mac.update(&a);
        mac.update(seed);
        mac.finish(&mut block)?;
        result.extend_from_slice(&block);
    }

    result.truncate(output_len);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlsengine_crypto::RustCryptoProvider;

    #[test]
    fn test_prf_sha256_matches_manual_expansion() {
        let p = RustCryptoProvider::new();
        let key = [0x9bu8; 16];
        let seed = [0xa0u8; 10];
        let out = prf(
            &p,
            PrfHash::Single(HashAlgId::Sha256),
            &key,
            "test label",
            &seed,
            32,
        )
        .unwrap();

        let mut label_seed = b"test label".to_vec();
        label_seed.extend_from_slice(&seed);
        let a1 = p.hmac(HashAlgId::Sha256, &key, &[&label_seed]).unwrap();
        let p1 = p
            .hmac(HashAlgId::Sha256, &key, &[&a1, &label_seed])
            .unwrap();
        assert_eq!(&out[..], &p1[..]);
    }

    #[test]
    fn test_prf_prefix_property() {
        let p = RustCryptoProvider::new();
        let hash = PrfHash::Single(HashAlgId::Sha384);
        let short = prf(&p, hash, b"secret", "label", b"seed", 20).unwrap();
        let long = prf(&p, hash, b"secret", "label", b"seed", 150).unwrap();
        assert_eq!(long.len(), 150);
        assert_eq!(&long[..20], &short[..]);
    }

    #[test]
    fn test_prf_tls10_is_md5_xor_sha1() {
        let p = RustCryptoProvider::new();
        // Odd length: the middle byte belongs to both halves.
        let key = [1u8, 2, 3, 4, 5];
        let out = prf(&p, PrfHash::Md5Sha1, &key, "key expansion", b"randoms", 48).unwrap();

        let ls = b"key expansionrandoms";
        let md5 = p_hash(&p, HashAlgId::Md5, &key[..3], ls, 48).unwrap();
        let sha = p_hash(&p, HashAlgId::Sha1, &key[2..], ls, 48).unwrap();
        let expected: Vec<u8> = md5.iter().zip(sha.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(&out[..], &expected[..]);
    }
}
