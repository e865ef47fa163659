//! Running transcript over handshake messages.
//!
//! The hash algorithm is only known once the cipher suite is negotiated, so
//! messages are buffered and the digest is produced by replaying the buffer.
//! That makes [`HandshakeHash::fork`] free of side effects and lets the
//! legacy CertificateVerify sign the raw message sequence.

use std::sync::Arc;

use tlsengine_crypto::CryptoProvider;
use tlsengine_types::{AlertDescription, HashAlgId, TlsError};

use super::PrfHash;
use crate::handshake::HandshakeType;

/// Append-only transcript of handshake messages.
pub struct HandshakeHash {
    provider: Arc<dyn CryptoProvider>,
    buffer: Vec<u8>,
    prf: Option<PrfHash>,
    sealed: bool,
    tracking: bool,
}

fn internal(msg: &str) -> TlsError {
    TlsError::fatal(AlertDescription::InternalError, format!("transcript: {msg}"))
}

impl HandshakeHash {
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self {
            provider,
            buffer: Vec::new(),
            prf: None,
            sealed: false,
            tracking: true,
        }
    }

    /// Feed a complete handshake message (header included).
    pub fn update(&mut self, message: &[u8]) {
        self.buffer.extend_from_slice(message);
    }

    /// Fix the hash algorithm. Repeating the same choice is allowed.
    pub fn notify_prf_determined(&mut self, prf: PrfHash) -> Result<(), TlsError> {
        match self.prf {
            Some(existing) if existing != prf => Err(internal("hash already determined")),
            Some(_) => Ok(()),
            None => {
                self.prf = Some(prf);
                Ok(())
            }
        }
    }

    /// Freeze the algorithm choice once the ServerHello has settled it. A
    /// sealed transcript can no longer be rewritten for a retry.
    pub fn seal(&mut self) -> Result<(), TlsError> {
        if self.prf.is_none() {
            return Err(internal("seal without a hash"));
        }
        self.sealed = true;
        Ok(())
    }

    pub fn prf(&self) -> Option<PrfHash> {
        self.prf
    }

    /// Stop retaining access to the raw message sequence.
    pub fn stop_tracking(&mut self) {
        self.tracking = false;
    }

    /// The raw message sequence, for signatures over `handshake_messages`.
    pub fn messages(&self) -> Result<&[u8], TlsError> {
        if !self.tracking {
            return Err(internal("raw messages no longer tracked"));
        }
        Ok(&self.buffer)
    }

    /// Discard all messages and the algorithm choice.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.prf = None;
        self.sealed = false;
        self.tracking = true;
    }

    /// Hash `data` with the negotiated algorithm.
    pub fn hash_data(&self, data: &[u8]) -> Result<Vec<u8>, TlsError> {
        let prf = self.prf.ok_or_else(|| internal("hash not determined"))?;
        hash_with(&*self.provider, prf, data)
    }

    /// The digest of everything so far, without disturbing the transcript.
    pub fn fork(&self) -> Result<Vec<u8>, TlsError> {
        self.hash_data(&self.buffer)
    }

    /// Replace ClientHello1 with its synthetic `message_hash` stand-in
    /// (RFC 8446 §4.4.1) ahead of a HelloRetryRequest.
    pub fn adjust_for_retry(&mut self) -> Result<(), TlsError> {
        if self.sealed {
            return Err(internal("retry after the ServerHello"));
        }
        let hash = self.fork()?;
        let mut synthetic = Vec::with_capacity(4 + hash.len());
        synthetic.push(HandshakeType::MessageHash as u8);
        synthetic.push(0);
        synthetic.push(0);
        synthetic.push(hash.len() as u8);
        synthetic.extend_from_slice(&hash);
        self.buffer = synthetic;
        Ok(())
    }
}

/// Hash `data` under a PRF hash choice.
pub fn hash_with(
    provider: &dyn CryptoProvider,
    prf: PrfHash,
    data: &[u8],
) -> Result<Vec<u8>, TlsError> {
    match prf {
        PrfHash::Single(alg) => Ok(provider.hash(alg, data)?),
        PrfHash::Md5Sha1 => {
            let mut out = provider.hash(HashAlgId::Md5, data)?;
            out.extend_from_slice(&provider.hash(HashAlgId::Sha1, data)?);
            Ok(out)
        }
    }
}
