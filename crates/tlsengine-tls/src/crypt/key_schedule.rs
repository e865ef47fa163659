//! TLS 1.3 key schedule (RFC 8446 §7.1).
//!
//! ```text
//! PSK or 0 -> Early Secret -> Handshake Secret -> Master Secret
//! ```
//! Each extraction is salted with `Derive-Secret(prev, "derived", "")`, and
//! the previous stage's secret is wiped as soon as the next one exists.

use std::sync::Arc;

use tlsengine_crypto::CryptoProvider;
use tlsengine_types::{AlertDescription, HashAlgId, TlsError};

use super::hkdf::{derive_secret, hkdf_expand_label, hkdf_extract};
use super::{secret, Secret};

/// Current stage of the TLS 1.3 key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScheduleStage {
    Initial,
    EarlySecret,
    HandshakeSecret,
    MasterSecret,
}

/// TLS 1.3 key schedule state. The current secret is wiped on drop.
pub struct KeySchedule {
    provider: Arc<dyn CryptoProvider>,
    hash: HashAlgId,
    stage: KeyScheduleStage,
    current_secret: Secret,
}

fn wrong_stage(op: &str) -> TlsError {
    TlsError::fatal(
        AlertDescription::InternalError,
        format!("{op}: wrong key schedule stage"),
    )
}

impl KeySchedule {
    pub fn new(provider: Arc<dyn CryptoProvider>, hash: HashAlgId) -> Self {
        Self {
            provider,
            hash,
            stage: KeyScheduleStage::Initial,
            current_secret: secret(Vec::new()),
        }
    }

    pub fn stage(&self) -> KeyScheduleStage {
        self.stage
    }

    pub fn hash_alg(&self) -> HashAlgId {
        self.hash
    }

    fn empty_hash(&self) -> Result<Vec<u8>, TlsError> {
        Ok(self.provider.hash(self.hash, &[])?)
    }

    fn derive(&self, label: &[u8], transcript_hash: &[u8]) -> Result<Secret, TlsError> {
        derive_secret(
            &*self.provider,
            self.hash,
            &self.current_secret,
            label,
            transcript_hash,
        )
    }

    /// Move to the next stage: salt with "derived", extract `ikm`.
    fn advance(&mut self, ikm: &[u8]) -> Result<(), TlsError> {
        let empty = self.empty_hash()?;
        let salt = self.derive(b"derived", &empty)?;
        self.current_secret = hkdf_extract(&*self.provider, self.hash, &salt, ikm)?;
        Ok(())
    }

    /// Initial -> EarlySecret. Without a PSK the IKM is `Hash.length` zeros.
    pub fn derive_early_secret(&mut self, psk: Option<&[u8]>) -> Result<(), TlsError> {
        if self.stage != KeyScheduleStage::Initial {
            return Err(wrong_stage("derive_early_secret"));
        }
        let zeros = vec![0u8; self.hash.output_size()];
        let ikm = psk.unwrap_or(&zeros);
        self.current_secret = hkdf_extract(&*self.provider, self.hash, &[], ikm)?;
        self.stage = KeyScheduleStage::EarlySecret;
        Ok(())
    }

    /// The PSK binder key ("ext binder" for external PSKs, "res binder" for
    /// resumption).
    pub fn derive_binder_key(&self, external: bool) -> Result<Secret, TlsError> {
        if self.stage != KeyScheduleStage::EarlySecret {
            return Err(wrong_stage("derive_binder_key"));
        }
        let label: &[u8] = if external { b"ext binder" } else { b"res binder" };
        let empty = self.empty_hash()?;
        self.derive(label, &empty)
    }

    /// client_early_traffic_secret over Hash(ClientHello).
    pub fn derive_early_traffic_secret(&self, client_hello_hash: &[u8]) -> Result<Secret, TlsError> {
        if self.stage != KeyScheduleStage::EarlySecret {
            return Err(wrong_stage("derive_early_traffic_secret"));
        }
        self.derive(b"c e traffic", client_hello_hash)
    }

    /// EarlySecret -> HandshakeSecret, mixing in the (EC)DHE shared secret.
    pub fn derive_handshake_secret(&mut self, shared_secret: &[u8]) -> Result<(), TlsError> {
        if self.stage != KeyScheduleStage::EarlySecret {
            return Err(wrong_stage("derive_handshake_secret"));
        }
        self.advance(shared_secret)?;
        self.stage = KeyScheduleStage::HandshakeSecret;
        Ok(())
    }

    /// Returns `(client_hs_traffic_secret, server_hs_traffic_secret)` over
    /// Hash(ClientHello..ServerHello).
    pub fn derive_handshake_traffic_secrets(
        &self,
        transcript_hash: &[u8],
    ) -> Result<(Secret, Secret), TlsError> {
        if self.stage != KeyScheduleStage::HandshakeSecret {
            return Err(wrong_stage("derive_handshake_traffic_secrets"));
        }
        Ok((
            self.derive(b"c hs traffic", transcript_hash)?,
            self.derive(b"s hs traffic", transcript_hash)?,
        ))
    }

    /// HandshakeSecret -> MasterSecret.
    pub fn derive_master_secret(&mut self) -> Result<(), TlsError> {
        if self.stage != KeyScheduleStage::HandshakeSecret {
            return Err(wrong_stage("derive_master_secret"));
        }
        let zeros = vec![0u8; self.hash.output_size()];
        self.advance(&zeros)?;
        self.stage = KeyScheduleStage::MasterSecret;
        Ok(())
    }

    /// Returns `(client_ap_traffic_secret_0, server_ap_traffic_secret_0)`
    /// over Hash(ClientHello..server Finished).
    pub fn derive_app_traffic_secrets(
        &self,
        transcript_hash: &[u8],
    ) -> Result<(Secret, Secret), TlsError> {
        if self.stage != KeyScheduleStage::MasterSecret {
            return Err(wrong_stage("derive_app_traffic_secrets"));
        }
        Ok((
            self.derive(b"c ap traffic", transcript_hash)?,
            self.derive(b"s ap traffic", transcript_hash)?,
        ))
    }

    pub fn derive_exporter_master_secret(&self, transcript_hash: &[u8]) -> Result<Secret, TlsError> {
        if self.stage != KeyScheduleStage::MasterSecret {
            return Err(wrong_stage("derive_exporter_master_secret"));
        }
        self.derive(b"exp master", transcript_hash)
    }

    /// resumption_master_secret over Hash(ClientHello..client Finished).
    pub fn derive_resumption_master_secret(
        &self,
        transcript_hash: &[u8],
    ) -> Result<Secret, TlsError> {
        if self.stage != KeyScheduleStage::MasterSecret {
            return Err(wrong_stage("derive_resumption_master_secret"));
        }
        self.derive(b"res master", transcript_hash)
    }
}

/// finished_key = HKDF-Expand-Label(BaseKey, "finished", "", Hash.length)
pub fn finished_key(
    provider: &dyn CryptoProvider,
    hash: HashAlgId,
    base_key: &[u8],
) -> Result<Secret, TlsError> {
    hkdf_expand_label(provider, hash, base_key, b"finished", b"", hash.output_size())
}

/// verify_data = HMAC(finished_key, transcript_hash). Also used for PSK
/// binders, with the binder key as `base_key`.
pub fn compute_verify_data(
    provider: &dyn CryptoProvider,
    hash: HashAlgId,
    base_key: &[u8],
    transcript_hash: &[u8],
) -> Result<Vec<u8>, TlsError> {
    let key = finished_key(provider, hash, base_key)?;
    Ok(provider.hmac(hash, &key, &[transcript_hash])?)
}

/// application_traffic_secret_N+1 (RFC 8446 §7.2).
pub fn update_traffic_secret(
    provider: &dyn CryptoProvider,
    hash: HashAlgId,
    current: &[u8],
) -> Result<Secret, TlsError> {
    hkdf_expand_label(provider, hash, current, b"traffic upd", b"", hash.output_size())
}

/// The PSK associated with a NewSessionTicket (RFC 8446 §4.6.1).
pub fn resumption_psk(
    provider: &dyn CryptoProvider,
    hash: HashAlgId,
    resumption_master_secret: &[u8],
    ticket_nonce: &[u8],
) -> Result<Secret, TlsError> {
    hkdf_expand_label(
        provider,
        hash,
        resumption_master_secret,
        b"resumption",
        ticket_nonce,
        hash.output_size(),
    )
}

/// PSK binder over a truncated ClientHello transcript (RFC 8446 §4.2.11.2).
pub fn psk_binder(
    provider: &Arc<dyn CryptoProvider>,
    hash: HashAlgId,
    psk: &[u8],
    external: bool,
    truncated_transcript_hash: &[u8],
) -> Result<Vec<u8>, TlsError> {
    let mut schedule = KeySchedule::new(Arc::clone(provider), hash);
    schedule.derive_early_secret(Some(psk))?;
    let binder_key = schedule.derive_binder_key(external)?;
    compute_verify_data(&**provider, hash, &binder_key, truncated_transcript_hash)
}

/// TLS-Exporter(label, context_value, key_length) (RFC 8446 §7.5).
pub fn export_keying_material(
    provider: &dyn CryptoProvider,
    hash: HashAlgId,
    exporter_master_secret: &[u8],
    label: &[u8],
    context: &[u8],
    length: usize,
) -> Result<Secret, TlsError> {
    let empty = provider.hash(hash, &[])?;
    let derived = derive_secret(provider, hash, exporter_master_secret, label, &empty)?;
    let context_hash = provider.hash(hash, context)?;
    hkdf_expand_label(provider, hash, &derived, b"exporter", &context_hash, length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use tlsengine_crypto::RustCryptoProvider;

    fn schedule() -> KeySchedule {
        KeySchedule::new(Arc::new(RustCryptoProvider::new()), HashAlgId::Sha256)
    }

    // RFC 8448 §3, simple 1-RTT handshake
    #[test]
    fn test_rfc8448_full_schedule() {
        let mut ks = schedule();
        ks.derive_early_secret(None).unwrap();
        assert_eq!(
            &ks.current_secret[..],
            &hex!("33ad0a1c607ec03b09e6cd9893680ce210adf300aa1f2660e1b22e10f170f92a")
        );

        let dhe = hex!("8bd4054fb55b9d63fdfbacf9f04b9f0d35e6d63f537563efd46272900f89492d");
        ks.derive_handshake_secret(&dhe).unwrap();
        assert_eq!(
            &ks.current_secret[..],
            &hex!("1dc826e93606aa6fdc0aadc12f741b01046aa6b99f691ed221a9f0ca043fbeac")
        );

        let ch_sh = hex!("860c06edc07858ee8e78f0e7428c58edd6b43f2ca3e6e95f02ed063cf0e1cad8");
        let (c_hs, s_hs) = ks.derive_handshake_traffic_secrets(&ch_sh).unwrap();
        assert_eq!(
            &c_hs[..],
            &hex!("b3eddb126e067f35a780b3abf45e2d8f3b1a950738f52e9600746a0e27a55a21")
        );
        assert_eq!(
            &s_hs[..],
            &hex!("b67b7d690cc16c4e75e54213cb2d37b4e9c912bcded9105d42befd59d391ad38")
        );

        ks.derive_master_secret().unwrap();
        assert_eq!(
            &ks.current_secret[..],
            &hex!("18df06843d13a08bf2a449844c5f8a478001bc4d4c627984d5a41da8d0402919")
        );

        let ch_sf = hex!("9608102a0f1ccc6db6250b7b7e417b1a000eaada3daae4777a7686c9ff83df13");
        let (c_ap, s_ap) = ks.derive_app_traffic_secrets(&ch_sf).unwrap();
        assert_eq!(
            &c_ap[..],
            &hex!("9e40646ce79a7f9dc05af8889bce6552875afa0b06df0087f792ebb7c17504a5")
        );
        assert_eq!(
            &s_ap[..],
            &hex!("a11af9f05531f856ad47116b45a950328204b4f44bfb6b3a4b4f1f3fcb631643")
        );
    }

    #[test]
    fn test_stage_enforced() {
        let mut ks = schedule();
        assert!(ks.derive_handshake_secret(&[0u8; 32]).is_err());
        assert!(ks.derive_master_secret().is_err());
        ks.derive_early_secret(None).unwrap();
        assert!(ks.derive_early_secret(None).is_err());
        assert!(ks.derive_app_traffic_secrets(&[0u8; 32]).is_err());
        assert!(ks.derive_binder_key(true).is_ok());
    }

    #[test]
    fn test_binder_labels_differ() {
        let mut ks = schedule();
        ks.derive_early_secret(Some(&[0x42; 32])).unwrap();
        let ext = ks.derive_binder_key(true).unwrap();
        let res = ks.derive_binder_key(false).unwrap();
        assert_ne!(&ext[..], &res[..]);
    }

    #[test]
    fn test_psk_binder_matches_manual_derivation() {
        let provider: Arc<dyn CryptoProvider> = Arc::new(RustCryptoProvider::new());
        let psk = [0x42u8; 32];
        let th = [0x07u8; 32];
        let binder = psk_binder(&provider, HashAlgId::Sha256, &psk, false, &th).unwrap();

        let mut ks = KeySchedule::new(Arc::clone(&provider), HashAlgId::Sha256);
        ks.derive_early_secret(Some(&psk)).unwrap();
        let key = ks.derive_binder_key(false).unwrap();
        let manual = compute_verify_data(&*provider, HashAlgId::Sha256, &key, &th).unwrap();
        assert_eq!(binder, manual);

        let external = psk_binder(&provider, HashAlgId::Sha256, &psk, true, &th).unwrap();
        assert_ne!(binder, external);
    }

    #[test]
    fn test_verify_data_detects_flipped_bit() {
        let p = RustCryptoProvider::new();
        let base = hex!("b67b7d690cc16c4e75e54213cb2d37b4e9c912bcded9105d42befd59d391ad38");
        let th = [0x11u8; 32];
        let a = compute_verify_data(&p, HashAlgId::Sha256, &base, &th).unwrap();
        let b = compute_verify_data(&p, HashAlgId::Sha256, &base, &th).unwrap();
        assert_eq!(a, b);
        let mut flipped = th;
        flipped[0] ^= 1;
        let c = compute_verify_data(&p, HashAlgId::Sha256, &base, &flipped).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_traffic_update_and_exporter() {
        let p = RustCryptoProvider::new();
        let s0 = [7u8; 32];
        let s1 = update_traffic_secret(&p, HashAlgId::Sha256, &s0).unwrap();
        assert_eq!(s1.len(), 32);
        assert_ne!(&s1[..], &s0[..]);

        let a = export_keying_material(&p, HashAlgId::Sha256, &s0, b"EXPERIMENTAL x", b"", 20)
            .unwrap();
        let b = export_keying_material(&p, HashAlgId::Sha256, &s0, b"EXPERIMENTAL x", b"c", 20)
            .unwrap();
        assert_eq!(a.len(), 20);
        assert_ne!(&a[..], &b[..]);
    }
}
