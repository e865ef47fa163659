use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use sha1::{Digest as _, Sha1};
use tlsengine_types::{CryptoError, NamedGroup, SignatureKeyKind, SignatureScheme};
use zeroize::Zeroizing;

use crate::keys::{PrivateKey, PublicKey};
use crate::provider::{KeyAgreement, Signer, Verifier};

// ---------------------------------------------------------------------------
// Key agreement
// ---------------------------------------------------------------------------

struct X25519Agreement {
    secret: x25519_dalek::StaticSecret,
    public: x25519_dalek::PublicKey,
}

struct P256Agreement {
    secret: p256::SecretKey,
}

pub(super) fn generate_key_agreement(
    group: NamedGroup,
) -> Result<Box<dyn KeyAgreement>, CryptoError> {
    match group {
        NamedGroup::X25519 => {
            let mut seed = Zeroizing::new([0u8; 32]);
            getrandom::getrandom(&mut seed[..]).map_err(|_| CryptoError::RandomFail)?;
            let secret = x25519_dalek::StaticSecret::from(*seed);
            let public = x25519_dalek::PublicKey::from(&secret);
            Ok(Box::new(X25519Agreement { secret, public }))
        }
        NamedGroup::SECP256R1 => {
            // Rejection-sample a scalar in [1, n).
            for _ in 0..8 {
                let mut seed = Zeroizing::new([0u8; 32]);
                getrandom::getrandom(&mut seed[..]).map_err(|_| CryptoError::RandomFail)?;
                if let Ok(secret) = p256::SecretKey::from_slice(&seed[..]) {
                    return Ok(Box::new(P256Agreement { secret }));
                }
            }
            Err(CryptoError::RandomFail)
        }
        _ => Err(CryptoError::NotSupported),
    }
}

impl KeyAgreement for X25519Agreement {
    fn group(&self) -> NamedGroup {
        NamedGroup::X25519
    }

    fn public_key(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    fn compute_shared_secret(
        &self,
        peer_public_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let peer: [u8; 32] = peer_public_key
            .try_into()
            .map_err(|_| CryptoError::EccInvalidPublicKey)?;
        let shared = self
            .secret
            .diffie_hellman(&x25519_dalek::PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(CryptoError::EccInvalidPublicKey);
        }
        Ok(Zeroizing::new(shared.as_bytes().to_vec()))
    }
}

impl KeyAgreement for P256Agreement {
    fn group(&self) -> NamedGroup {
        NamedGroup::SECP256R1
    }

    fn public_key(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    fn compute_shared_secret(
        &self,
        peer_public_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let peer = p256::PublicKey::from_sec1_bytes(peer_public_key)
            .map_err(|_| CryptoError::EccInvalidPublicKey)?;
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }
}

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

const ED25519_SCHEMES: &[SignatureScheme] = &[SignatureScheme::ED25519];
const ECDSA_P256_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::ECDSA_SECP256R1_SHA256,
    SignatureScheme::ECDSA_SHA1,
];

struct Ed25519Signer {
    key: ed25519_dalek::SigningKey,
}

struct EcdsaP256Signer {
    key: p256::ecdsa::SigningKey,
}

pub(super) fn new_signer(key: &PrivateKey) -> Result<Box<dyn Signer>, CryptoError> {
    match key {
        PrivateKey::Ed25519(seed) => Ok(Box::new(Ed25519Signer {
            key: ed25519_dalek::SigningKey::from_bytes(seed),
        })),
        PrivateKey::EcdsaP256(scalar) => {
            let key = p256::ecdsa::SigningKey::from_slice(scalar)
                .map_err(|_| CryptoError::InvalidKey)?;
            Ok(Box::new(EcdsaP256Signer { key }))
        }
    }
}

fn unsupported_scheme(kind: SignatureKeyKind, scheme: SignatureScheme) -> bool {
    match kind {
        SignatureKeyKind::Ed25519 => !ED25519_SCHEMES.contains(&scheme),
        SignatureKeyKind::Ecdsa => !ECDSA_P256_SCHEMES.contains(&scheme),
        SignatureKeyKind::Rsa => true,
    }
}

impl Signer for Ed25519Signer {
    fn key_kind(&self) -> SignatureKeyKind {
        SignatureKeyKind::Ed25519
    }

    fn schemes(&self) -> &'static [SignatureScheme] {
        ED25519_SCHEMES
    }

    fn public_key(&self) -> PublicKey {
        PublicKey::Ed25519(self.key.verifying_key().to_bytes())
    }

    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if unsupported_scheme(SignatureKeyKind::Ed25519, scheme) {
            return Err(CryptoError::NotSupported);
        }
        let sig = ed25519_dalek::Signer::sign(&self.key, message);
        Ok(sig.to_bytes().to_vec())
    }
}

impl Signer for EcdsaP256Signer {
    fn key_kind(&self) -> SignatureKeyKind {
        SignatureKeyKind::Ecdsa
    }

    fn schemes(&self) -> &'static [SignatureScheme] {
        ECDSA_P256_SCHEMES
    }

    fn public_key(&self) -> PublicKey {
        PublicKey::EcdsaP256(
            self.key
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
        )
    }

    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let sig: p256::ecdsa::Signature = match scheme {
            SignatureScheme::ECDSA_SECP256R1_SHA256 => {
                p256::ecdsa::signature::Signer::try_sign(&self.key, message)
                    .map_err(|_| CryptoError::InvalidKey)?
            }
            SignatureScheme::ECDSA_SHA1 => {
                let digest = Sha1::digest(message);
                self.key
                    .sign_prehash(&digest)
                    .map_err(|_| CryptoError::InvalidKey)?
            }
            _ => return Err(CryptoError::NotSupported),
        };
        Ok(sig.to_der().as_bytes().to_vec())
    }
}

struct Ed25519Verifier {
    key: ed25519_dalek::VerifyingKey,
}

struct EcdsaP256Verifier {
    key: p256::ecdsa::VerifyingKey,
}

pub(super) fn new_verifier(key: &PublicKey) -> Result<Box<dyn Verifier>, CryptoError> {
    match key {
        PublicKey::Ed25519(bytes) => {
            let key = ed25519_dalek::VerifyingKey::from_bytes(bytes)
                .map_err(|_| CryptoError::EccInvalidPublicKey)?;
            Ok(Box::new(Ed25519Verifier { key }))
        }
        PublicKey::EcdsaP256(sec1) => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(sec1)
                .map_err(|_| CryptoError::EccInvalidPublicKey)?;
            Ok(Box::new(EcdsaP256Verifier { key }))
        }
    }
}

impl Verifier for Ed25519Verifier {
    fn key_kind(&self) -> SignatureKeyKind {
        SignatureKeyKind::Ed25519
    }

    fn verify(
        &self,
        scheme: SignatureScheme,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        if unsupported_scheme(SignatureKeyKind::Ed25519, scheme) {
            return Ok(false);
        }
        let sig: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::SignatureMalformed)?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig);
        Ok(ed25519_dalek::Verifier::verify(&self.key, message, &sig).is_ok())
    }
}

impl Verifier for EcdsaP256Verifier {
    fn key_kind(&self) -> SignatureKeyKind {
        SignatureKeyKind::Ecdsa
    }

    fn verify(
        &self,
        scheme: SignatureScheme,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        let sig = p256::ecdsa::Signature::from_der(signature)
            .map_err(|_| CryptoError::SignatureMalformed)?;
        let ok = match scheme {
            SignatureScheme::ECDSA_SECP256R1_SHA256 => {
                p256::ecdsa::signature::Verifier::verify(&self.key, message, &sig).is_ok()
            }
            SignatureScheme::ECDSA_SHA1 => {
                let digest = Sha1::digest(message);
                self.key.verify_prehash(&digest, &sig).is_ok()
            }
            _ => false,
        };
        Ok(ok)
    }
}
