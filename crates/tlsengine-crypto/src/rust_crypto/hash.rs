use hmac::{Hmac, Mac as _};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest as _, Sha256, Sha384};
use tlsengine_types::{CryptoError, HashAlgId};

use crate::provider::{Digest, Mac};

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

enum DigestState {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
}

macro_rules! with_state {
    ($state:expr, $h:ident => $body:expr) => {
        match $state {
            DigestState::Md5($h) => $body,
            DigestState::Sha1($h) => $body,
            DigestState::Sha256($h) => $body,
            DigestState::Sha384($h) => $body,
        }
    };
}

struct RcDigest {
    alg: HashAlgId,
    state: DigestState,
}

pub(super) fn new_digest(alg: HashAlgId) -> Box<dyn Digest> {
    let state = match alg {
        HashAlgId::Md5 => DigestState::Md5(Md5::new()),
        HashAlgId::Sha1 => DigestState::Sha1(Sha1::new()),
        HashAlgId::Sha256 => DigestState::Sha256(Sha256::new()),
        HashAlgId::Sha384 => DigestState::Sha384(Sha384::new()),
    };
    Box::new(RcDigest { alg, state })
}

fn block_size(alg: HashAlgId) -> usize {
    match alg {
        HashAlgId::Sha384 => 128,
        _ => 64,
    }
}

impl Digest for RcDigest {
    fn output_size(&self) -> usize {
        self.alg.output_size()
    }

    fn block_size(&self) -> usize {
        block_size(self.alg)
    }

    fn update(&mut self, data: &[u8]) {
        with_state!(&mut self.state, h => h.update(data))
    }

    fn finish(&mut self, out: &mut [u8]) -> Result<(), CryptoError> {
        let need = self.alg.output_size();
        if out.len() < need {
            return Err(CryptoError::BufferTooSmall {
                need,
                got: out.len(),
            });
        }
        with_state!(&mut self.state, h => out[..need].copy_from_slice(&h.finalize_reset()));
        Ok(())
    }

    fn reset(&mut self) {
        with_state!(&mut self.state, h => sha2::Digest::reset(h))
    }
}

// ---------------------------------------------------------------------------
// HMAC
// ---------------------------------------------------------------------------

enum HmacState {
    Md5(Hmac<Md5>),
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
    Sha384(Hmac<Sha384>),
}

macro_rules! with_hmac {
    ($state:expr, $h:ident => $body:expr) => {
        match $state {
            HmacState::Md5($h) => $body,
            HmacState::Sha1($h) => $body,
            HmacState::Sha256($h) => $body,
            HmacState::Sha384($h) => $body,
        }
    };
}

struct RcHmac {
    alg: HashAlgId,
    state: HmacState,
}

pub(super) fn new_hmac(alg: HashAlgId, key: &[u8]) -> Result<Box<dyn Mac>, CryptoError> {
    let bad = |_| CryptoError::InvalidKey;
    let state = match alg {
        HashAlgId::Md5 => HmacState::Md5(Hmac::new_from_slice(key).map_err(bad)?),
        HashAlgId::Sha1 => HmacState::Sha1(Hmac::new_from_slice(key).map_err(bad)?),
        HashAlgId::Sha256 => HmacState::Sha256(Hmac::new_from_slice(key).map_err(bad)?),
        HashAlgId::Sha384 => HmacState::Sha384(Hmac::new_from_slice(key).map_err(bad)?),
    };
    Ok(Box::new(RcHmac { alg, state }))
}

impl Mac for RcHmac {
    fn output_size(&self) -> usize {
        self.alg.output_size()
    }

    fn update(&mut self, data: &[u8]) {
        with_hmac!(&mut self.state, h => h.update(data))
    }

    fn finish(&mut self, out: &mut [u8]) -> Result<(), CryptoError> {
        let need = self.alg.output_size();
        if out.len() < need {
            return Err(CryptoError::BufferTooSmall {
                need,
                got: out.len(),
            });
        }
        with_hmac!(&mut self.state, h => {
            out[..need].copy_from_slice(&h.finalize_reset().into_bytes())
        });
        Ok(())
    }

    fn reset(&mut self) {
        with_hmac!(&mut self.state, h => hmac::Mac::reset(h))
    }
}
