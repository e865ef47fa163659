//! Record protection: the cipher state for one direction.
//!
//! - TLS 1.3 AEAD (RFC 8446 §5.2): inner content type, nonce = iv XOR seq.
//! - TLS 1.2 AEAD (RFC 5288 / RFC 7905): explicit nonce for GCM, xor nonce for ChaCha20.
//! - CBC (RFC 5246 §6.2.3.2, RFC 7366): MAC-then-encrypt or encrypt-then-MAC,
//!   chained IV in TLS 1.0, explicit IV from TLS 1.1.

use std::sync::Arc;

use subtle::ConstantTimeEq;
use tlsengine_crypto::{Aead, CbcCipher, CryptoProvider};
use tlsengine_types::{AlertDescription, BulkCipherAlgId, HashAlgId, TlsError};
use zeroize::Zeroize;

use super::{ContentType, RecordHeader, MAX_PLAINTEXT_LENGTH, TLS13_RECORD_VERSION};
use crate::crypt::traffic_keys::TrafficKeys;
use crate::crypt::{secret, CipherClass, CipherSuiteInfo, Secret};
use crate::ProtocolVersion;

/// TLS 1.3 allows at most 256 bytes of expansion over the plaintext limit.
const MAX_TLS13_EXPANSION: usize = 256;

/// TLS 1.2 GCM explicit nonce length.
const GCM_EXPLICIT_NONCE_LEN: usize = 8;

fn bad_record_mac() -> TlsError {
    TlsError::fatal(AlertDescription::BadRecordMac, "record authentication failed")
}

fn overflow(what: &str) -> TlsError {
    TlsError::fatal(AlertDescription::RecordOverflow, format!("{what} too long"))
}

/// `iv XOR pad_left(seq)`.
fn xor_nonce(iv: &[u8], seq: u64) -> Vec<u8> {
    let mut nonce = iv.to_vec();
    let offset = nonce.len() - 8;
    for (n, s) in nonce[offset..].iter_mut().zip(seq.to_be_bytes()) {
        *n ^= s;
    }
    nonce
}

/// seq(8) || type(1) || version(2) || length(2).
fn mac_header(seq: u64, content_type: ContentType, version: u16, len: usize) -> [u8; 13] {
    let mut out = [0u8; 13];
    out[..8].copy_from_slice(&seq.to_be_bytes());
    out[8] = content_type as u8;
    out[9..11].copy_from_slice(&version.to_be_bytes());
    out[11..13].copy_from_slice(&(len as u16).to_be_bytes());
    out
}

fn next_seq(seq: &mut u64) -> Result<u64, TlsError> {
    let current = *seq;
    *seq = current.checked_add(1).ok_or_else(|| {
        TlsError::fatal(AlertDescription::InternalError, "sequence number exhausted")
    })?;
    Ok(current)
}

/// Cipher state for one direction of the record layer.
pub enum RecordProtection {
    /// Before any keys are active.
    Null,
    Aead12(Aead12State),
    Aead13(Aead13State),
    Cbc(CbcState),
}

impl RecordProtection {
    /// TLS 1.3 protection from a traffic key and IV.
    pub fn tls13(
        provider: &dyn CryptoProvider,
        suite: &CipherSuiteInfo,
        keys: &TrafficKeys,
    ) -> Result<Self, TlsError> {
        let aead = provider.new_aead(suite.cipher, &keys.key)?;
        Ok(RecordProtection::Aead13(Aead13State {
            aead,
            iv: keys.iv.clone(),
            seq: 0,
        }))
    }

    /// TLS 1.0-1.2 protection from one direction of the key block.
    pub fn tls12(
        provider: &Arc<dyn CryptoProvider>,
        suite: &CipherSuiteInfo,
        version: ProtocolVersion,
        mac_key: &[u8],
        key: &[u8],
        iv: &[u8],
        encrypt_then_mac: bool,
    ) -> Result<Self, TlsError> {
        match suite.class() {
            CipherClass::Aead => {
                let aead = provider.new_aead(suite.cipher, key)?;
                Ok(RecordProtection::Aead12(Aead12State {
                    aead,
                    explicit_nonce: suite.cipher != BulkCipherAlgId::Chacha20Poly1305,
                    iv: secret(iv.to_vec()),
                    seq: 0,
                }))
            }
            CipherClass::Block => {
                let cipher = provider.new_cbc(suite.cipher, key)?;
                let mac_hash = suite.mac.hash().ok_or_else(|| {
                    TlsError::fatal(AlertDescription::InternalError, "block suite without MAC")
                })?;
                let explicit_iv = version >= ProtocolVersion::Tls11;
                Ok(RecordProtection::Cbc(CbcState {
                    provider: Arc::clone(provider),
                    block_size: cipher.block_size(),
                    cipher,
                    mac_hash,
                    mac_key: secret(mac_key.to_vec()),
                    mac_len: suite.mac.len(),
                    chained_iv: if explicit_iv { None } else { Some(iv.to_vec()) },
                    encrypt_then_mac,
                    seq: 0,
                }))
            }
            CipherClass::Stream => Err(TlsError::fatal(
                AlertDescription::HandshakeFailure,
                format!("{} has no record protection", suite.name),
            )),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RecordProtection::Null)
    }

    pub fn sequence_number(&self) -> u64 {
        match self {
            RecordProtection::Null => 0,
            RecordProtection::Aead12(s) => s.seq,
            RecordProtection::Aead13(s) => s.seq,
            RecordProtection::Cbc(s) => s.seq,
        }
    }

    /// Bytes added to a plaintext of `len` bytes, worst case.
    pub fn expansion(&self, len: usize) -> usize {
        match self {
            RecordProtection::Null => 0,
            RecordProtection::Aead12(s) => {
                s.aead.tag_size() + if s.explicit_nonce { GCM_EXPLICIT_NONCE_LEN } else { 0 }
            }
            RecordProtection::Aead13(s) => 1 + s.aead.tag_size(),
            RecordProtection::Cbc(s) => {
                let iv = if s.chained_iv.is_some() { 0 } else { s.block_size };
                let round = |n: usize| n.div_ceil(s.block_size) * s.block_size;
                let body = if s.encrypt_then_mac {
                    round(len + 1) + s.mac_len
                } else {
                    round(len + s.mac_len + 1)
                };
                iv + body - len
            }
        }
    }

    /// Protect one fragment. Returns the outer content type and the record body.
    pub fn seal(
        &mut self,
        content_type: ContentType,
        version: u16,
        plaintext: &[u8],
    ) -> Result<(ContentType, Vec<u8>), TlsError> {
        match self {
            RecordProtection::Null => Ok((content_type, plaintext.to_vec())),
            RecordProtection::Aead12(s) => Ok((content_type, s.seal(content_type, version, plaintext)?)),
            RecordProtection::Aead13(s) => Ok((ContentType::ApplicationData, s.seal(content_type, plaintext)?)),
            RecordProtection::Cbc(s) => Ok((content_type, s.seal(content_type, version, plaintext)?)),
        }
    }

    /// Remove protection. Returns the real content type and the plaintext.
    pub fn open(
        &mut self,
        header: &RecordHeader,
        fragment: &[u8],
    ) -> Result<(ContentType, Vec<u8>), TlsError> {
        let (content_type, plaintext) = match self {
            RecordProtection::Null => (header.content_type, fragment.to_vec()),
            RecordProtection::Aead12(s) => (header.content_type, s.open(header, fragment)?),
            RecordProtection::Aead13(s) => s.open(header, fragment)?,
            RecordProtection::Cbc(s) => (header.content_type, s.open(header, fragment)?),
        };
        if plaintext.len() > MAX_PLAINTEXT_LENGTH {
            return Err(overflow("plaintext"));
        }
        Ok((content_type, plaintext))
    }
}

// ---------------------------------------------------------------------------
// TLS 1.3 AEAD
// ---------------------------------------------------------------------------

pub struct Aead13State {
    aead: Box<dyn Aead>,
    iv: Secret,
    seq: u64,
}

impl Aead13State {
    fn seal(&mut self, content_type: ContentType, plaintext: &[u8]) -> Result<Vec<u8>, TlsError> {
        let mut inner = Vec::with_capacity(plaintext.len() + 1);
        inner.extend_from_slice(plaintext);
        inner.push(content_type as u8);
        let len = inner.len() + self.aead.tag_size();
        let aad = [
            ContentType::ApplicationData as u8,
            (TLS13_RECORD_VERSION >> 8) as u8,
            TLS13_RECORD_VERSION as u8,
            (len >> 8) as u8,
            len as u8,
        ];
        let seq = next_seq(&mut self.seq)?;
        let nonce = xor_nonce(&self.iv, seq);
        let out = self.aead.encrypt(&nonce, &aad, &inner);
        inner.zeroize();
        Ok(out?)
    }

    fn open(
        &mut self,
        header: &RecordHeader,
        fragment: &[u8],
    ) -> Result<(ContentType, Vec<u8>), TlsError> {
        if header.content_type != ContentType::ApplicationData {
            return Err(TlsError::fatal(
                AlertDescription::UnexpectedMessage,
                format!("unprotected {:?} record", header.content_type),
            ));
        }
        if fragment.len() > MAX_PLAINTEXT_LENGTH + MAX_TLS13_EXPANSION {
            return Err(overflow("ciphertext"));
        }
        if fragment.len() < self.aead.tag_size() {
            return Err(bad_record_mac());
        }
        let aad = header.encode();
        let seq = next_seq(&mut self.seq)?;
        let nonce = xor_nonce(&self.iv, seq);
        let mut inner = self
            .aead
            .decrypt(&nonce, &aad, fragment)
            .map_err(|_| bad_record_mac())?;
        let Some(end) = inner.iter().rposition(|&b| b != 0) else {
            return Err(TlsError::fatal(
                AlertDescription::UnexpectedMessage,
                "record without content type",
            ));
        };
        let content_type = ContentType::from_u8(inner[end]).ok_or_else(|| {
            TlsError::fatal(AlertDescription::UnexpectedMessage, "unknown inner content type")
        })?;
        inner.truncate(end);
        Ok((content_type, inner))
    }
}

// ---------------------------------------------------------------------------
// TLS 1.2 AEAD
// ---------------------------------------------------------------------------

pub struct Aead12State {
    aead: Box<dyn Aead>,
    /// GCM carries the low 8 nonce bytes on the wire; ChaCha20 XORs the sequence number.
    explicit_nonce: bool,
    iv: Secret,
    seq: u64,
}

impl Aead12State {
    fn nonce(&self, seq: u64, explicit: Option<&[u8]>) -> Vec<u8> {
        if self.explicit_nonce {
            let mut nonce = self.iv.to_vec();
            match explicit {
                Some(e) => nonce.extend_from_slice(e),
                None => nonce.extend_from_slice(&seq.to_be_bytes()),
            }
            nonce
        } else {
            xor_nonce(&self.iv, seq)
        }
    }

    fn seal(
        &mut self,
        content_type: ContentType,
        version: u16,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        let seq = next_seq(&mut self.seq)?;
        let aad = mac_header(seq, content_type, version, plaintext.len());
        let nonce = self.nonce(seq, None);
        let sealed = self.aead.encrypt(&nonce, &aad, plaintext)?;
        if !self.explicit_nonce {
            return Ok(sealed);
        }
        let mut out = Vec::with_capacity(GCM_EXPLICIT_NONCE_LEN + sealed.len());
        out.extend_from_slice(&seq.to_be_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn open(&mut self, header: &RecordHeader, fragment: &[u8]) -> Result<Vec<u8>, TlsError> {
        let prefix = if self.explicit_nonce { GCM_EXPLICIT_NONCE_LEN } else { 0 };
        let tag = self.aead.tag_size();
        if fragment.len() < prefix + tag {
            return Err(bad_record_mac());
        }
        let (explicit, ciphertext) = fragment.split_at(prefix);
        let seq = next_seq(&mut self.seq)?;
        let aad = mac_header(seq, header.content_type, header.version, ciphertext.len() - tag);
        let nonce = self.nonce(seq, self.explicit_nonce.then_some(explicit));
        self.aead
            .decrypt(&nonce, &aad, ciphertext)
            .map_err(|_| bad_record_mac())
    }
}

// ---------------------------------------------------------------------------
// CBC
// ---------------------------------------------------------------------------

pub struct CbcState {
    provider: Arc<dyn CryptoProvider>,
    cipher: Box<dyn CbcCipher>,
    block_size: usize,
    mac_hash: HashAlgId,
    mac_key: Secret,
    mac_len: usize,
    /// TLS 1.0: the IV is the last ciphertext block of the previous record.
    chained_iv: Option<Vec<u8>>,
    encrypt_then_mac: bool,
    seq: u64,
}

impl CbcState {
    fn mac(&self, header: &[u8; 13], data: &[u8]) -> Result<Vec<u8>, TlsError> {
        Ok(self.provider.hmac(self.mac_hash, &self.mac_key, &[header, data])?)
    }

    fn pad(&self, data: &mut Vec<u8>) {
        let pad = self.block_size - (data.len() + 1) % self.block_size;
        let pad = pad % self.block_size;
        data.resize(data.len() + pad + 1, pad as u8);
    }

    /// Encrypt padded data; returns IV (if explicit) followed by ciphertext.
    fn encrypt(&mut self, mut data: Vec<u8>) -> Result<Vec<u8>, TlsError> {
        let mut out = Vec::with_capacity(self.block_size + data.len());
        let iv = match &self.chained_iv {
            Some(iv) => iv.clone(),
            None => {
                let mut iv = vec![0u8; self.block_size];
                self.provider.fill_random(&mut iv)?;
                out.extend_from_slice(&iv);
                iv
            }
        };
        let last = self.cipher.encrypt(&iv, &mut data)?;
        if let Some(chained) = &mut self.chained_iv {
            *chained = last;
        }
        out.extend_from_slice(&data);
        data.zeroize();
        Ok(out)
    }

    /// Decrypt IV-prefixed (or chained) ciphertext in place.
    fn decrypt(&mut self, fragment: &[u8]) -> Result<Vec<u8>, TlsError> {
        let (iv, ciphertext) = match &self.chained_iv {
            Some(iv) => (iv.clone(), fragment),
            None => {
                let (iv, ct) = fragment.split_at(self.block_size);
                (iv.to_vec(), ct)
            }
        };
        if ciphertext.is_empty() || ciphertext.len() % self.block_size != 0 {
            return Err(bad_record_mac());
        }
        let mut data = ciphertext.to_vec();
        let last = self.cipher.decrypt(&iv, &mut data)?;
        if let Some(chained) = &mut self.chained_iv {
            *chained = last;
        }
        Ok(data)
    }

    fn seal(
        &mut self,
        content_type: ContentType,
        version: u16,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        let seq = next_seq(&mut self.seq)?;
        let mut data = plaintext.to_vec();
        if self.encrypt_then_mac {
            self.pad(&mut data);
            let mut fragment = self.encrypt(data)?;
            let mac = self.mac(&mac_header(seq, content_type, version, fragment.len()), &fragment)?;
            fragment.extend_from_slice(&mac);
            Ok(fragment)
        } else {
            let mac = self.mac(&mac_header(seq, content_type, version, plaintext.len()), plaintext)?;
            data.extend_from_slice(&mac);
            self.pad(&mut data);
            self.encrypt(data)
        }
    }

    fn open(&mut self, header: &RecordHeader, fragment: &[u8]) -> Result<Vec<u8>, TlsError> {
        let iv_len = if self.chained_iv.is_some() { 0 } else { self.block_size };
        let seq = next_seq(&mut self.seq)?;
        if self.encrypt_then_mac {
            if fragment.len() < iv_len + self.block_size + self.mac_len {
                return Err(bad_record_mac());
            }
            let (body, received) = fragment.split_at(fragment.len() - self.mac_len);
            let expected = self.mac(
                &mac_header(seq, header.content_type, header.version, body.len()),
                body,
            )?;
            if received.ct_eq(&expected).unwrap_u8() != 1 {
                return Err(bad_record_mac());
            }
            let mut data = self.decrypt(body)?;
            let pad = usize::from(data[data.len() - 1]);
            if pad + 1 > data.len() || data[data.len() - pad - 1..].iter().any(|&b| usize::from(b) != pad) {
                return Err(bad_record_mac());
            }
            data.truncate(data.len() - pad - 1);
            return Ok(data);
        }

        let min = (self.mac_len + 1).div_ceil(self.block_size) * self.block_size;
        if fragment.len() < iv_len + min {
            return Err(bad_record_mac());
        }
        let data = self.decrypt(fragment)?;

        // Padding and MAC are checked without branching on secret data.
        let pad = usize::from(data[data.len() - 1]);
        let fits = pad + 1 + self.mac_len <= data.len();
        let mut ok = u8::from(fits);
        let pad_start = data.len().saturating_sub(pad + 1);
        for &b in &data[pad_start..] {
            ok &= b.ct_eq(&(pad as u8)).unwrap_u8();
        }
        let content_len = if fits { data.len() - pad - 1 - self.mac_len } else { 0 };
        let expected = self.mac(
            &mac_header(seq, header.content_type, header.version, content_len),
            &data[..content_len],
        )?;
        let received = &data[content_len..content_len + self.mac_len];
        ok &= received.ct_eq(&expected).unwrap_u8();
        if ok != 1 {
            return Err(bad_record_mac());
        }
        let mut data = data;
        data.truncate(content_len);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::lookup_suite;
    use crate::CipherSuite;
    use tlsengine_crypto::RustCryptoProvider;

    fn provider() -> Arc<dyn CryptoProvider> {
        Arc::new(RustCryptoProvider::new())
    }

    fn header(content_type: ContentType, version: u16, len: usize) -> RecordHeader {
        RecordHeader {
            content_type,
            version,
            length: len,
        }
    }

    fn pair(
        suite: CipherSuite,
        version: ProtocolVersion,
        etm: bool,
    ) -> (RecordProtection, RecordProtection) {
        let p = provider();
        let info = lookup_suite(suite).unwrap();
        let mac_key = vec![0x11; info.mac.len()];
        let key = vec![0x22; info.cipher.key_len()];
        let iv = vec![0x33; info.fixed_iv_len()];
        let w = RecordProtection::tls12(&p, info, version, &mac_key, &key, &iv, etm).unwrap();
        let r = RecordProtection::tls12(&p, info, version, &mac_key, &key, &iv, etm).unwrap();
        (w, r)
    }

    fn exchange(w: &mut RecordProtection, r: &mut RecordProtection, version: u16, data: &[u8]) -> Vec<u8> {
        let (ct, body) = w.seal(ContentType::ApplicationData, version, data).unwrap();
        let (ct2, pt) = r.open(&header(ct, version, body.len()), &body).unwrap();
        assert_eq!(ct2, ContentType::ApplicationData);
        pt
    }

    #[test]
    fn test_tls13_inner_content_type_and_padding() {
        let p = provider();
        let info = lookup_suite(CipherSuite::TLS_AES_128_GCM_SHA256).unwrap();
        let keys = TrafficKeys::derive(&*p, info, &[0x5a; 32]).unwrap();
        let mut w = RecordProtection::tls13(&*p, info, &keys).unwrap();
        let mut r = RecordProtection::tls13(&*p, info, &keys).unwrap();

        let (outer, body) = w.seal(ContentType::Handshake, 0x0303, b"finished").unwrap();
        assert_eq!(outer, ContentType::ApplicationData);
        assert_eq!(body.len(), 8 + 1 + 16);
        let (ct, pt) = r
            .open(&header(outer, 0x0303, body.len()), &body)
            .unwrap();
        assert_eq!(ct, ContentType::Handshake);
        assert_eq!(pt, b"finished");
        assert_eq!(w.sequence_number(), 1);
        assert_eq!(r.sequence_number(), 1);

        // A second record under the same key uses a new nonce.
        let (_, body2) = w.seal(ContentType::Handshake, 0x0303, b"finished").unwrap();
        assert_ne!(body, body2);
    }

    #[test]
    fn test_tls13_tampered_record_rejected() {
        let p = provider();
        let info = lookup_suite(CipherSuite::TLS_CHACHA20_POLY1305_SHA256).unwrap();
        let keys = TrafficKeys::derive(&*p, info, &[0x5a; 32]).unwrap();
        let mut w = RecordProtection::tls13(&*p, info, &keys).unwrap();
        let mut r = RecordProtection::tls13(&*p, info, &keys).unwrap();
        let (outer, mut body) = w.seal(ContentType::ApplicationData, 0x0303, b"data").unwrap();
        body[0] ^= 1;
        let err = r.open(&header(outer, 0x0303, body.len()), &body).unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::BadRecordMac));
    }

    #[test]
    fn test_tls13_rejects_plaintext_handshake_record() {
        let p = provider();
        let info = lookup_suite(CipherSuite::TLS_AES_128_GCM_SHA256).unwrap();
        let keys = TrafficKeys::derive(&*p, info, &[1; 32]).unwrap();
        let mut r = RecordProtection::tls13(&*p, info, &keys).unwrap();
        let err = r
            .open(&header(ContentType::Handshake, 0x0303, 4), &[0, 0, 0, 0])
            .unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::UnexpectedMessage));
    }

    #[test]
    fn test_gcm12_explicit_nonce_on_wire() {
        let (mut w, mut r) = pair(
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            ProtocolVersion::Tls12,
            false,
        );
        let (_, body) = w.seal(ContentType::ApplicationData, 0x0303, b"abc").unwrap();
        assert_eq!(&body[..8], &0u64.to_be_bytes());
        assert_eq!(body.len(), 8 + 3 + 16);
        let (_, pt) = r
            .open(&header(ContentType::ApplicationData, 0x0303, body.len()), &body)
            .unwrap();
        assert_eq!(pt, b"abc");
    }

    #[test]
    fn test_chacha12_has_no_explicit_nonce() {
        let (mut w, mut r) = pair(
            CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            ProtocolVersion::Tls12,
            false,
        );
        let (_, body) = w.seal(ContentType::ApplicationData, 0x0303, b"abc").unwrap();
        assert_eq!(body.len(), 3 + 16);
        let (_, pt) = r
            .open(&header(ContentType::ApplicationData, 0x0303, body.len()), &body)
            .unwrap();
        assert_eq!(pt, b"abc");
        assert_eq!(exchange(&mut w, &mut r, 0x0303, b"second"), b"second".to_vec());
    }

    #[test]
    fn test_chacha12_out_of_sequence_record_rejected() {
        let (mut w, mut r) = pair(
            CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            ProtocolVersion::Tls12,
            false,
        );
        // The first record is lost; the reader still expects sequence 0.
        w.seal(ContentType::ApplicationData, 0x0303, b"lost").unwrap();
        let (_, body) = w.seal(ContentType::ApplicationData, 0x0303, b"late").unwrap();
        let err = r
            .open(&header(ContentType::ApplicationData, 0x0303, body.len()), &body)
            .unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::BadRecordMac));
    }

    #[test]
    fn test_aead12_header_is_authenticated() {
        let (mut w, mut r) = pair(
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            ProtocolVersion::Tls12,
            false,
        );
        let (_, body) = w.seal(ContentType::ApplicationData, 0x0303, b"abc").unwrap();
        // Same bytes presented as a handshake record.
        let err = r
            .open(&header(ContentType::Handshake, 0x0303, body.len()), &body)
            .unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::BadRecordMac));
    }

    #[test]
    fn test_cbc_mac_then_encrypt_tls12() {
        let (mut w, mut r) = pair(
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
            ProtocolVersion::Tls12,
            false,
        );
        for i in 0..4 {
            let msg = vec![i as u8; 10 + i * 7];
            assert_eq!(exchange(&mut w, &mut r, 0x0303, &msg), msg);
        }
        let (_, body) = w.seal(ContentType::ApplicationData, 0x0303, b"x").unwrap();
        // explicit IV + one block of data||mac||pad
        assert_eq!(body.len(), 16 + 32);
    }

    #[test]
    fn test_cbc_chained_iv_tls10() {
        let (mut w, mut r) = pair(
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA,
            ProtocolVersion::Tls10,
            false,
        );
        let (_, body) = w.seal(ContentType::ApplicationData, 0x0301, b"x").unwrap();
        assert_eq!(body.len(), 32);
        let (_, pt) = r
            .open(&header(ContentType::ApplicationData, 0x0301, body.len()), &body)
            .unwrap();
        assert_eq!(pt, b"x");
        assert_eq!(exchange(&mut w, &mut r, 0x0301, b"next record"), b"next record".to_vec());
    }

    #[test]
    fn test_cbc_encrypt_then_mac() {
        let (mut w, mut r) = pair(
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256,
            ProtocolVersion::Tls12,
            true,
        );
        let msg = b"encrypt then mac".to_vec();
        assert_eq!(exchange(&mut w, &mut r, 0x0303, &msg), msg);

        let (_, mut body) = w.seal(ContentType::ApplicationData, 0x0303, b"tamper").unwrap();
        let last = body.len() - 1;
        body[last] ^= 0x80;
        let err = r
            .open(&header(ContentType::ApplicationData, 0x0303, body.len()), &body)
            .unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::BadRecordMac));
    }

    #[test]
    fn test_cbc_tampered_ciphertext_rejected() {
        let (mut w, mut r) = pair(
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
            ProtocolVersion::Tls12,
            false,
        );
        let (_, mut body) = w.seal(ContentType::ApplicationData, 0x0303, b"secret data").unwrap();
        body[20] ^= 1;
        let err = r
            .open(&header(ContentType::ApplicationData, 0x0303, body.len()), &body)
            .unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::BadRecordMac));
    }

    #[test]
    fn test_cbc_short_record_rejected() {
        let (_, mut r) = pair(
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
            ProtocolVersion::Tls12,
            false,
        );
        let err = r
            .open(&header(ContentType::ApplicationData, 0x0303, 16), &[0u8; 16])
            .unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::BadRecordMac));
    }

    #[test]
    fn test_expansion_matches_sealed_size() {
        let (mut w, _) = pair(
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256,
            ProtocolVersion::Tls12,
            false,
        );
        let expansion = w.expansion(100);
        let (_, body) = w.seal(ContentType::ApplicationData, 0x0303, &[0u8; 100]).unwrap();
        assert_eq!(body.len(), 100 + expansion);
    }

    #[test]
    fn test_stream_suites_have_no_protection() {
        let p = provider();
        let info = lookup_suite(CipherSuite::TLS_RSA_WITH_RC4_128_SHA).unwrap();
        assert!(
            RecordProtection::tls12(&p, info, ProtocolVersion::Tls12, &[0; 20], &[0; 16], &[], false)
                .is_err()
        );
    }
}
