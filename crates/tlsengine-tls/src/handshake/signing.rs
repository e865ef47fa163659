//! Signature scheme selection, signing and verification for
//! ServerKeyExchange and CertificateVerify.

use tlsengine_crypto::{CryptoProvider, PublicKey, Signer};
use tlsengine_types::{AlertDescription, SignatureScheme, TlsError};

use super::codec::DigitallySigned;
use crate::ProtocolVersion;

/// Context string for server CertificateVerify.
const SERVER_CONTEXT: &[u8] = b"TLS 1.3, server CertificateVerify";

/// Context string for client CertificateVerify.
const CLIENT_CONTEXT: &[u8] = b"TLS 1.3, client CertificateVerify";

/// Build the content signed in a TLS 1.3 CertificateVerify.
///
/// Format: 64 spaces || context_string || 0x00 || transcript_hash
pub fn build_verify_content(transcript_hash: &[u8], is_server: bool) -> Vec<u8> {
    let context = if is_server {
        SERVER_CONTEXT
    } else {
        CLIENT_CONTEXT
    };
    let mut content = Vec::with_capacity(64 + context.len() + 1 + transcript_hash.len());
    content.extend_from_slice(&[0x20u8; 64]);
    content.extend_from_slice(context);
    content.push(0x00);
    content.extend_from_slice(transcript_hash);
    content
}

/// client_random || server_random || params.
fn server_params_content(client_random: &[u8; 32], server_random: &[u8; 32], params: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(64 + params.len());
    content.extend_from_slice(client_random);
    content.extend_from_slice(server_random);
    content.extend_from_slice(params);
    content
}

/// Pick the scheme to sign with at `version`.
///
/// `peer_schemes` is the peer's signature_algorithms list. In TLS 1.2 an
/// absent list means {sha1} for the key's algorithm (RFC 5246 §7.4.1.4.1).
pub fn select_signature_scheme(
    signer: &dyn Signer,
    peer_schemes: Option<&[SignatureScheme]>,
    version: ProtocolVersion,
) -> Result<SignatureScheme, TlsError> {
    let local = signer.schemes();
    let chosen = match (version, peer_schemes) {
        (v, Some(peer)) if v >= ProtocolVersion::Tls12 => local
            .iter()
            .filter(|s| !(v.is_tls13() && s.is_legacy_only()))
            .find(|s| peer.contains(s))
            .copied(),
        (ProtocolVersion::Tls13, None) => None,
        _ => local
            .iter()
            .find(|s| **s == SignatureScheme::ECDSA_SHA1)
            .copied(),
    };
    chosen.ok_or_else(|| {
        TlsError::fatal(
            AlertDescription::HandshakeFailure,
            format!("no usable signature scheme for {:?} key at {version}", signer.key_kind()),
        )
    })
}

/// The scheme implied by a legacy signature with no algorithm field.
fn implied_scheme(key: &PublicKey) -> Result<SignatureScheme, TlsError> {
    match key {
        PublicKey::EcdsaP256(_) => Ok(SignatureScheme::ECDSA_SHA1),
        PublicKey::Ed25519(_) => Err(TlsError::fatal(
            AlertDescription::IllegalParameter,
            "Ed25519 signature requires TLS 1.2",
        )),
    }
}

/// Check that `scheme` was offered and fits `key`.
fn check_scheme(
    key: &PublicKey,
    scheme: SignatureScheme,
    offered: &[SignatureScheme],
    version: ProtocolVersion,
) -> Result<(), TlsError> {
    if !offered.contains(&scheme)
        || scheme.key_kind() != Some(key.kind())
        || (version.is_tls13() && scheme.is_legacy_only())
    {
        return Err(TlsError::fatal(
            AlertDescription::IllegalParameter,
            format!("signature scheme 0x{:04x} not acceptable", scheme.0),
        ));
    }
    Ok(())
}

/// Verify `signature` over `message`; a bad signature is `decrypt_error`.
pub fn verify_signature(
    provider: &dyn CryptoProvider,
    key: &PublicKey,
    scheme: SignatureScheme,
    message: &[u8],
    signature: &[u8],
) -> Result<(), TlsError> {
    let verifier = provider
        .new_verifier(key)
        .map_err(|e| TlsError::fatal(AlertDescription::BadCertificate, format!("peer key: {e}")))?;
    match verifier.verify(scheme, message, signature) {
        Ok(true) => Ok(()),
        _ => Err(TlsError::fatal(
            AlertDescription::DecryptError,
            "signature verification failed",
        )),
    }
}

/// Sign ServerKeyExchange params. The algorithm field is present from TLS 1.2.
pub fn sign_server_params(
    signer: &dyn Signer,
    scheme: SignatureScheme,
    version: ProtocolVersion,
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    params: &[u8],
) -> Result<DigitallySigned, TlsError> {
    let content = server_params_content(client_random, server_random, params);
    let signature = signer.sign(scheme, &content)?;
    Ok(DigitallySigned {
        algorithm: (version >= ProtocolVersion::Tls12).then_some(scheme),
        signature,
    })
}

/// Verify the signature on ServerKeyExchange params.
#[allow(clippy::too_many_arguments)]
pub fn verify_server_params(
    provider: &dyn CryptoProvider,
    key: &PublicKey,
    signed: &DigitallySigned,
    offered: &[SignatureScheme],
    version: ProtocolVersion,
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    params: &[u8],
) -> Result<(), TlsError> {
    let scheme = match signed.algorithm {
        Some(scheme) => {
            check_scheme(key, scheme, offered, version)?;
            scheme
        }
        None => implied_scheme(key)?,
    };
    let content = server_params_content(client_random, server_random, params);
    verify_signature(provider, key, scheme, &content, &signed.signature)
}

/// Sign a TLS 1.3 CertificateVerify.
pub fn sign_certificate_verify13(
    signer: &dyn Signer,
    scheme: SignatureScheme,
    transcript_hash: &[u8],
    is_server: bool,
) -> Result<Vec<u8>, TlsError> {
    Ok(signer.sign(scheme, &build_verify_content(transcript_hash, is_server))?)
}

/// Verify a TLS 1.3 CertificateVerify from the peer.
pub fn verify_certificate_verify13(
    provider: &dyn CryptoProvider,
    key: &PublicKey,
    scheme: SignatureScheme,
    signature: &[u8],
    offered: &[SignatureScheme],
    transcript_hash: &[u8],
    is_server: bool,
) -> Result<(), TlsError> {
    check_scheme(key, scheme, offered, ProtocolVersion::Tls13)?;
    let content = build_verify_content(transcript_hash, is_server);
    verify_signature(provider, key, scheme, &content, signature)
}

/// Sign a legacy CertificateVerify over the raw handshake messages.
pub fn sign_certificate_verify12(
    signer: &dyn Signer,
    scheme: SignatureScheme,
    version: ProtocolVersion,
    handshake_messages: &[u8],
) -> Result<DigitallySigned, TlsError> {
    let signature = signer.sign(scheme, handshake_messages)?;
    Ok(DigitallySigned {
        algorithm: (version >= ProtocolVersion::Tls12).then_some(scheme),
        signature,
    })
}

/// Verify a legacy CertificateVerify.
pub fn verify_certificate_verify12(
    provider: &dyn CryptoProvider,
    key: &PublicKey,
    signed: &DigitallySigned,
    offered: &[SignatureScheme],
    version: ProtocolVersion,
    handshake_messages: &[u8],
) -> Result<(), TlsError> {
    let scheme = match signed.algorithm {
        Some(scheme) => {
            check_scheme(key, scheme, offered, version)?;
            scheme
        }
        None => implied_scheme(key)?,
    };
    verify_signature(provider, key, scheme, handshake_messages, &signed.signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlsengine_crypto::{PrivateKey, RustCryptoProvider};

    fn ecdsa() -> Box<dyn Signer> {
        RustCryptoProvider::new()
            .new_signer(&PrivateKey::EcdsaP256([0x17; 32]))
            .unwrap()
    }

    fn ed25519() -> Box<dyn Signer> {
        RustCryptoProvider::new()
            .new_signer(&PrivateKey::Ed25519([0x42; 32]))
            .unwrap()
    }

    #[test]
    fn test_verify_content_layout() {
        let content = build_verify_content(&[0xAA; 32], true);
        assert_eq!(&content[..64], &[0x20; 64]);
        assert_eq!(&content[64..64 + SERVER_CONTEXT.len()], SERVER_CONTEXT);
        assert_eq!(content[64 + SERVER_CONTEXT.len()], 0);
        assert_eq!(content.len(), 64 + SERVER_CONTEXT.len() + 1 + 32);
        assert_ne!(content, build_verify_content(&[0xAA; 32], false));
    }

    #[test]
    fn test_select_scheme_by_version() {
        let signer = ecdsa();
        let peer = [SignatureScheme::ECDSA_SHA1, SignatureScheme::ECDSA_SECP256R1_SHA256];
        assert_eq!(
            select_signature_scheme(&*signer, Some(&peer), ProtocolVersion::Tls12).unwrap(),
            SignatureScheme::ECDSA_SECP256R1_SHA256
        );
        // SHA-1 only is acceptable in 1.2 but not in 1.3.
        let sha1_only = [SignatureScheme::ECDSA_SHA1];
        assert_eq!(
            select_signature_scheme(&*signer, Some(&sha1_only), ProtocolVersion::Tls12).unwrap(),
            SignatureScheme::ECDSA_SHA1
        );
        assert!(
            select_signature_scheme(&*signer, Some(&sha1_only), ProtocolVersion::Tls13).is_err()
        );
        assert_eq!(
            select_signature_scheme(&*signer, None, ProtocolVersion::Tls11).unwrap(),
            SignatureScheme::ECDSA_SHA1
        );
        assert_eq!(
            select_signature_scheme(&*signer, None, ProtocolVersion::Tls12).unwrap(),
            SignatureScheme::ECDSA_SHA1
        );
    }

    #[test]
    fn test_ed25519_not_usable_before_tls12() {
        let signer = ed25519();
        assert!(select_signature_scheme(&*signer, None, ProtocolVersion::Tls10).is_err());
        assert!(select_signature_scheme(&*signer, None, ProtocolVersion::Tls12).is_err());
        assert_eq!(
            select_signature_scheme(
                &*signer,
                Some(&[SignatureScheme::ED25519]),
                ProtocolVersion::Tls13
            )
            .unwrap(),
            SignatureScheme::ED25519
        );
    }

    #[test]
    fn test_server_params_tls12() {
        let provider = RustCryptoProvider::new();
        let signer = ed25519();
        let key = signer.public_key();
        let offered = [SignatureScheme::ED25519];
        let signed = sign_server_params(
            &*signer,
            SignatureScheme::ED25519,
            ProtocolVersion::Tls12,
            &[1; 32],
            &[2; 32],
            b"params",
        )
        .unwrap();
        assert_eq!(signed.algorithm, Some(SignatureScheme::ED25519));
        verify_server_params(
            &provider, &key, &signed, &offered, ProtocolVersion::Tls12, &[1; 32], &[2; 32],
            b"params",
        )
        .unwrap();

        // Swapped randoms do not verify.
        let err = verify_server_params(
            &provider, &key, &signed, &offered, ProtocolVersion::Tls12, &[2; 32], &[1; 32],
            b"params",
        )
        .unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::DecryptError));

        // A scheme we never offered.
        let err = verify_server_params(
            &provider,
            &key,
            &signed,
            &[SignatureScheme::ECDSA_SECP256R1_SHA256],
            ProtocolVersion::Tls12,
            &[1; 32],
            &[2; 32],
            b"params",
        )
        .unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::IllegalParameter));
    }

    #[test]
    fn test_server_params_tls10_has_no_algorithm() {
        let provider = RustCryptoProvider::new();
        let signer = ecdsa();
        let signed = sign_server_params(
            &*signer,
            SignatureScheme::ECDSA_SHA1,
            ProtocolVersion::Tls10,
            &[1; 32],
            &[2; 32],
            b"params",
        )
        .unwrap();
        assert_eq!(signed.algorithm, None);
        verify_server_params(
            &provider,
            &signer.public_key(),
            &signed,
            &[],
            ProtocolVersion::Tls10,
            &[1; 32],
            &[2; 32],
            b"params",
        )
        .unwrap();
    }

    #[test]
    fn test_certificate_verify13() {
        let provider = RustCryptoProvider::new();
        let signer = ecdsa();
        let key = signer.public_key();
        let scheme = SignatureScheme::ECDSA_SECP256R1_SHA256;
        let sig = sign_certificate_verify13(&*signer, scheme, &[9; 32], true).unwrap();
        verify_certificate_verify13(&provider, &key, scheme, &sig, &[scheme], &[9; 32], true)
            .unwrap();
        // Wrong context string.
        assert!(
            verify_certificate_verify13(&provider, &key, scheme, &sig, &[scheme], &[9; 32], false)
                .is_err()
        );
        // Legacy-only scheme is refused.
        let err = verify_certificate_verify13(
            &provider,
            &key,
            SignatureScheme::ECDSA_SHA1,
            &sig,
            &[SignatureScheme::ECDSA_SHA1],
            &[9; 32],
            true,
        )
        .unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::IllegalParameter));
    }

    #[test]
    fn test_certificate_verify12() {
        let provider = RustCryptoProvider::new();
        let signer = ecdsa();
        let scheme = SignatureScheme::ECDSA_SECP256R1_SHA256;
        let signed =
            sign_certificate_verify12(&*signer, scheme, ProtocolVersion::Tls12, b"messages")
                .unwrap();
        verify_certificate_verify12(
            &provider,
            &signer.public_key(),
            &signed,
            &[scheme],
            ProtocolVersion::Tls12,
            b"messages",
        )
        .unwrap();
        assert!(verify_certificate_verify12(
            &provider,
            &signer.public_key(),
            &signed,
            &[scheme],
            ProtocolVersion::Tls12,
            b"messageS",
        )
        .is_err());
    }
}
