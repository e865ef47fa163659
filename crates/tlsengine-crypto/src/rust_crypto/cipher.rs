use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use aes_gcm::aead::{Aead as _, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use tlsengine_types::{BulkCipherAlgId, CryptoError};

use crate::provider::{Aead, CbcCipher};

// ---------------------------------------------------------------------------
// AEAD
// ---------------------------------------------------------------------------

enum AeadState {
    Aes128Gcm(Box<Aes128Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

struct RcAead {
    state: AeadState,
}

fn check_key(key: &[u8], expected: usize) -> Result<(), CryptoError> {
    if key.len() != expected {
        return Err(CryptoError::InvalidKeyLength {
            expected,
            got: key.len(),
        });
    }
    Ok(())
}

pub(super) fn new_aead(alg: BulkCipherAlgId, key: &[u8]) -> Result<Box<dyn Aead>, CryptoError> {
    check_key(key, alg.key_len())?;
    let bad = |_| CryptoError::InvalidKey;
    let state = match alg {
        BulkCipherAlgId::Aes128Gcm => {
            AeadState::Aes128Gcm(Box::new(Aes128Gcm::new_from_slice(key).map_err(bad)?))
        }
        BulkCipherAlgId::Aes256Gcm => {
            AeadState::Aes256Gcm(Box::new(Aes256Gcm::new_from_slice(key).map_err(bad)?))
        }
        BulkCipherAlgId::Chacha20Poly1305 => AeadState::ChaCha20Poly1305(Box::new(
            ChaCha20Poly1305::new_from_slice(key).map_err(bad)?,
        )),
        _ => return Err(CryptoError::NotSupported),
    };
    Ok(Box::new(RcAead { state }))
}

impl Aead for RcAead {
    fn tag_size(&self) -> usize {
        16
    }

    fn nonce_size(&self) -> usize {
        12
    }

    fn encrypt(&self, nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != 12 {
            return Err(CryptoError::InvalidIvLength);
        }
        let nonce = GenericArray::from_slice(nonce);
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let out = match &self.state {
            AeadState::Aes128Gcm(c) => c.encrypt(nonce, payload),
            AeadState::Aes256Gcm(c) => c.encrypt(nonce, payload),
            AeadState::ChaCha20Poly1305(c) => c.encrypt(nonce, payload),
        };
        out.map_err(|_| CryptoError::InvalidArg)
    }

    fn decrypt(&self, nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != 12 {
            return Err(CryptoError::InvalidIvLength);
        }
        if ciphertext.len() < 16 {
            return Err(CryptoError::AeadTagVerifyFail);
        }
        let nonce = GenericArray::from_slice(nonce);
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let out = match &self.state {
            AeadState::Aes128Gcm(c) => c.decrypt(nonce, payload),
            AeadState::Aes256Gcm(c) => c.decrypt(nonce, payload),
            AeadState::ChaCha20Poly1305(c) => c.decrypt(nonce, payload),
        };
        out.map_err(|_| CryptoError::AeadTagVerifyFail)
    }
}

// ---------------------------------------------------------------------------
// AES-CBC
// ---------------------------------------------------------------------------

enum BlockState {
    Aes128(Box<Aes128>),
    Aes256(Box<Aes256>),
}

struct RcCbc {
    state: BlockState,
}

pub(super) fn new_cbc(alg: BulkCipherAlgId, key: &[u8]) -> Result<Box<dyn CbcCipher>, CryptoError> {
    check_key(key, alg.key_len())?;
    let bad = |_| CryptoError::InvalidKey;
    let state = match alg {
        BulkCipherAlgId::Aes128Cbc => {
            BlockState::Aes128(Box::new(Aes128::new_from_slice(key).map_err(bad)?))
        }
        BulkCipherAlgId::Aes256Cbc => {
            BlockState::Aes256(Box::new(Aes256::new_from_slice(key).map_err(bad)?))
        }
        _ => return Err(CryptoError::NotSupported),
    };
    Ok(Box::new(RcCbc { state }))
}

impl RcCbc {
    fn encrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match &self.state {
            BlockState::Aes128(c) => c.encrypt_block(block),
            BlockState::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match &self.state {
            BlockState::Aes128(c) => c.decrypt_block(block),
            BlockState::Aes256(c) => c.decrypt_block(block),
        }
    }
}

fn check_cbc_input(iv: &[u8], data: &[u8]) -> Result<(), CryptoError> {
    if iv.len() != 16 {
        return Err(CryptoError::InvalidIvLength);
    }
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(CryptoError::InvalidArg);
    }
    Ok(())
}

impl CbcCipher for RcCbc {
    fn block_size(&self) -> usize {
        16
    }

    fn encrypt(&self, iv: &[u8], data: &mut [u8]) -> Result<Vec<u8>, CryptoError> {
        check_cbc_input(iv, data)?;
        let mut chain = [0u8; 16];
        chain.copy_from_slice(iv);
        for block in data.chunks_exact_mut(16) {
            for (b, c) in block.iter_mut().zip(chain.iter()) {
                *b ^= c;
            }
            self.encrypt_block(block);
            chain.copy_from_slice(block);
        }
        Ok(chain.to_vec())
    }

    fn decrypt(&self, iv: &[u8], data: &mut [u8]) -> Result<Vec<u8>, CryptoError> {
        check_cbc_input(iv, data)?;
        let mut chain = [0u8; 16];
        chain.copy_from_slice(iv);
        for block in data.chunks_exact_mut(16) {
            let mut saved = [0u8; 16];
            saved.copy_from_slice(block);
            self.decrypt_block(block);
            for (b, c) in block.iter_mut().zip(chain.iter()) {
                *b ^= c;
            }
            chain = saved;
        }
        Ok(chain.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // NIST SP 800-38A F.2.1, first two blocks
    #[test]
    fn test_aes128_cbc_sp800_38a() {
        let key = hex!("2b7e151628aed2a6abf7158809cf4f3c");
        let iv = hex!("000102030405060708090a0b0c0d0e0f");
        let mut data = hex!(
            "6bc1bee22e409f96e93d7e117393172a"
            "ae2d8a571e03ac9c9eb76fac45af8e51"
        );
        let cbc = new_cbc(BulkCipherAlgId::Aes128Cbc, &key).unwrap();
        let last = cbc.encrypt(&iv, &mut data).unwrap();
        assert_eq!(
            data,
            hex!(
                "7649abac8119b246cee98e9b12e9197d"
                "5086cb9b507219ee95db113a917678b2"
            )
        );
        assert_eq!(last, data[16..].to_vec());
        cbc.decrypt(&iv, &mut data).unwrap();
        assert_eq!(&data[..16], &hex!("6bc1bee22e409f96e93d7e117393172a"));
    }

    #[test]
    fn test_cbc_rejects_partial_block() {
        let cbc = new_cbc(BulkCipherAlgId::Aes256Cbc, &[7u8; 32]).unwrap();
        let mut data = [0u8; 15];
        assert!(cbc.encrypt(&[0u8; 16], &mut data).is_err());
    }

    #[test]
    fn test_aead_tamper_detected() {
        let aead = new_aead(BulkCipherAlgId::Chacha20Poly1305, &[1u8; 32]).unwrap();
        let nonce = [2u8; 12];
        let mut ct = aead.encrypt(&nonce, b"hdr", b"hello").unwrap();
        assert_eq!(ct.len(), 5 + 16);
        assert_eq!(aead.decrypt(&nonce, b"hdr", &ct).unwrap(), b"hello");
        ct[0] ^= 1;
        assert!(matches!(
            aead.decrypt(&nonce, b"hdr", &ct),
            Err(CryptoError::AeadTagVerifyFail)
        ));
    }

    #[test]
    fn test_aead_key_length_checked() {
        assert!(matches!(
            new_aead(BulkCipherAlgId::Aes128Gcm, &[0u8; 32]),
            Err(CryptoError::InvalidKeyLength {
                expected: 16,
                got: 32
            })
        ));
    }
}
