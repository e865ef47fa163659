//! TLS configuration with builder pattern.

use std::fmt;
use std::sync::Arc;

use tlsengine_crypto::{CryptoProvider, PrivateKey, PublicKey, RustCryptoProvider};
use tlsengine_types::{AlertDescription, HashAlgId, NamedGroup, SignatureScheme, TlsError};

use crate::crypt::{AuthAlg, KeyExchangeAlg, Secret, CIPHER_SUITES};
use crate::extensions::codec::PskKeyExchangeMode;
use crate::handshake::codec::SupplementalDataEntry;
use crate::session::{Session, SessionCache};
use crate::{CipherSuite, ProtocolVersion, TlsRole};

/// Local certificate chain and the matching signing key.
#[derive(Clone)]
pub struct Credentials {
    /// End-entity certificate first.
    pub chain: Vec<Vec<u8>>,
    pub key: PrivateKey,
    /// DER OCSP response to staple when the client asks for one.
    pub ocsp_response: Option<Vec<u8>>,
}

impl Credentials {
    pub fn new(chain: Vec<Vec<u8>>, key: PrivateKey) -> Self {
        Self {
            chain,
            key,
            ocsp_response: None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("chain_len", &self.chain.len())
            .field("key", &self.key)
            .field("ocsp_response", &self.ocsp_response.is_some())
            .finish()
    }
}

/// Trust decision for a peer's certificate chain.
pub trait PeerAuthenticator: Send + Sync {
    /// Accept or reject `chain` and return the end-entity public key.
    fn authenticate(&self, chain: &[Vec<u8>], server_name: Option<&str>)
        -> Result<PublicKey, TlsError>;
}

/// Accepts only end-entity certificates registered up front, and maps each
/// to its public key.
#[derive(Debug, Clone, Default)]
pub struct PinnedKeyAuthenticator {
    pins: Vec<(Vec<u8>, PublicKey)>,
}

impl PinnedKeyAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(mut self, certificate: Vec<u8>, key: PublicKey) -> Self {
        self.pins.push((certificate, key));
        self
    }
}

impl PeerAuthenticator for PinnedKeyAuthenticator {
    fn authenticate(
        &self,
        chain: &[Vec<u8>],
        _server_name: Option<&str>,
    ) -> Result<PublicKey, TlsError> {
        let leaf = chain.first().ok_or_else(|| {
            TlsError::fatal(AlertDescription::BadCertificate, "empty certificate chain")
        })?;
        self.pins
            .iter()
            .find(|(cert, _)| cert == leaf)
            .map(|(_, key)| key.clone())
            .ok_or_else(|| TlsError::fatal(AlertDescription::BadCertificate, "certificate not pinned"))
    }
}

/// Server policy for client certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuthMode {
    #[default]
    None,
    Optional,
    Required,
}

/// Record splitting applied to application data below TLS 1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppDataSplitMode {
    /// 1/n-1 split on every write.
    #[default]
    OneAndRemainder,
    /// An empty record before every write.
    EmptyFirst,
    /// An empty record before the first write only.
    EmptyFirstOnce,
}

/// RFC 6066 max_fragment_length codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MaxFragmentLength {
    Bytes512 = 1,
    Bytes1024 = 2,
    Bytes2048 = 3,
    Bytes4096 = 4,
}

impl MaxFragmentLength {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Bytes512),
            2 => Some(Self::Bytes1024),
            3 => Some(Self::Bytes2048),
            4 => Some(Self::Bytes4096),
            _ => None,
        }
    }

    /// Plaintext limit: 2^(8 + code).
    pub fn limit(self) -> usize {
        1 << (8 + self as u8)
    }
}

/// External pre-shared key.
#[derive(Clone)]
pub struct PskConfig {
    pub identity: Vec<u8>,
    pub key: Secret,
    /// Hash the PSK is bound to in TLS 1.3.
    pub hash: HashAlgId,
}

impl fmt::Debug for PskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PskConfig")
            .field("identity", &String::from_utf8_lossy(&self.identity))
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

/// TLS configuration.
#[derive(Clone)]
pub struct TlsConfig {
    pub role: TlsRole,
    pub min_version: ProtocolVersion,
    pub max_version: ProtocolVersion,
    /// Preference order.
    pub cipher_suites: Vec<CipherSuite>,
    pub supported_groups: Vec<NamedGroup>,
    pub signature_algorithms: Vec<SignatureScheme>,
    /// Groups that get a key share in the first ClientHello.
    pub key_share_groups: Vec<NamedGroup>,
    pub credentials: Option<Credentials>,
    pub authenticator: Option<Arc<dyn PeerAuthenticator>>,
    /// Client: require and verify the server certificate.
    pub verify_peer: bool,
    pub client_auth: ClientAuthMode,
    pub psk: Option<PskConfig>,
    /// Server: hint sent in a PSK ServerKeyExchange.
    pub psk_identity_hint: Option<Vec<u8>>,
    pub psk_key_exchange_modes: Vec<PskKeyExchangeMode>,
    pub session_cache: Option<Arc<dyn SessionCache>>,
    /// Client: session to offer.
    pub resumption_session: Option<Session>,
    pub extended_master_secret: bool,
    pub require_extended_master_secret: bool,
    pub allow_legacy_resumption: bool,
    pub encrypt_then_mac: bool,
    pub max_fragment_length: Option<MaxFragmentLength>,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub server_name: Option<String>,
    /// Client: ask for a stapled OCSP response.
    pub status_request: bool,
    pub app_data_split_mode: AppDataSplitMode,
    pub max_handshake_message_size: usize,
    /// Records written under one TLS 1.3 key before updating it.
    pub key_update_threshold: u64,
    /// Server: tickets sent after a TLS 1.3 handshake.
    pub send_tickets: usize,
    /// TLS 1.2 and below: offer (client) or issue and accept (server)
    /// RFC 5077 session tickets.
    pub session_tickets: bool,
    /// TLS 1.2 and below: entries sent in a SupplementalData message.
    pub supplemental_data: Vec<SupplementalDataEntry>,
    /// Seconds.
    pub session_lifetime: u32,
    /// Client: this is a fallback connection attempt.
    pub fallback: bool,
    pub provider: Arc<dyn CryptoProvider>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("role", &self.role)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("cipher_suites", &self.cipher_suites)
            .field("supported_groups", &self.supported_groups)
            .field("signature_algorithms", &self.signature_algorithms)
            .field("has_credentials", &self.credentials.is_some())
            .field("verify_peer", &self.verify_peer)
            .field("client_auth", &self.client_auth)
            .field("has_psk", &self.psk.is_some())
            .field("has_resumption_session", &self.resumption_session.is_some())
            .field("extended_master_secret", &self.extended_master_secret)
            .field("encrypt_then_mac", &self.encrypt_then_mac)
            .field("session_tickets", &self.session_tickets)
            .field("alpn_protocols", &self.alpn_protocols.len())
            .field("server_name", &self.server_name)
            .field("app_data_split_mode", &self.app_data_split_mode)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Create a new config builder.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// Versions offered or accepted, highest first.
    pub fn versions(&self) -> Vec<ProtocolVersion> {
        [
            ProtocolVersion::Tls13,
            ProtocolVersion::Tls12,
            ProtocolVersion::Tls11,
            ProtocolVersion::Tls10,
        ]
        .into_iter()
        .filter(|v| *v >= self.min_version && *v <= self.max_version)
        .collect()
    }

    /// Handshake message size limit.
    pub fn handshake_message_limit(&self) -> usize {
        self.max_handshake_message_size.max(1024)
    }
}

/// Builder for `TlsConfig`.
pub struct TlsConfigBuilder {
    role: TlsRole,
    min_version: ProtocolVersion,
    max_version: ProtocolVersion,
    cipher_suites: Vec<CipherSuite>,
    supported_groups: Vec<NamedGroup>,
    signature_algorithms: Vec<SignatureScheme>,
    key_share_groups: Option<Vec<NamedGroup>>,
    credentials: Option<Credentials>,
    authenticator: Option<Arc<dyn PeerAuthenticator>>,
    verify_peer: bool,
    client_auth: ClientAuthMode,
    psk: Option<PskConfig>,
    psk_identity_hint: Option<Vec<u8>>,
    psk_key_exchange_modes: Vec<PskKeyExchangeMode>,
    session_cache: Option<Arc<dyn SessionCache>>,
    resumption_session: Option<Session>,
    extended_master_secret: bool,
    require_extended_master_secret: bool,
    allow_legacy_resumption: bool,
    encrypt_then_mac: bool,
    max_fragment_length: Option<MaxFragmentLength>,
    alpn_protocols: Vec<Vec<u8>>,
    server_name: Option<String>,
    status_request: bool,
    app_data_split_mode: AppDataSplitMode,
    max_handshake_message_size: usize,
    key_update_threshold: u64,
    send_tickets: usize,
    session_tickets: bool,
    supplemental_data: Vec<SupplementalDataEntry>,
    session_lifetime: u32,
    fallback: bool,
    provider: Arc<dyn CryptoProvider>,
}

impl Default for TlsConfigBuilder {
    fn default() -> Self {
        Self {
            role: TlsRole::Client,
            min_version: ProtocolVersion::Tls12,
            max_version: ProtocolVersion::Tls13,
            cipher_suites: Vec::new(),
            supported_groups: vec![NamedGroup::X25519, NamedGroup::SECP256R1],
            signature_algorithms: vec![
                SignatureScheme::ED25519,
                SignatureScheme::ECDSA_SECP256R1_SHA256,
            ],
            key_share_groups: None,
            credentials: None,
            authenticator: None,
            verify_peer: true,
            client_auth: ClientAuthMode::None,
            psk: None,
            psk_identity_hint: None,
            psk_key_exchange_modes: vec![PskKeyExchangeMode::PskDheKe],
            session_cache: None,
            resumption_session: None,
            extended_master_secret: true,
            require_extended_master_secret: false,
            allow_legacy_resumption: false,
            encrypt_then_mac: true,
            max_fragment_length: None,
            alpn_protocols: Vec::new(),
            server_name: None,
            status_request: false,
            app_data_split_mode: AppDataSplitMode::OneAndRemainder,
            max_handshake_message_size: 32768,
            key_update_threshold: 1 << 24,
            send_tickets: 1,
            session_tickets: false,
            supplemental_data: Vec::new(),
            session_lifetime: 7200,
            fallback: false,
            provider: Arc::new(RustCryptoProvider::new()),
        }
    }
}

impl fmt::Debug for TlsConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfigBuilder")
            .field("role", &self.role)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .finish_non_exhaustive()
    }
}

impl TlsConfigBuilder {
    pub fn role(mut self, role: TlsRole) -> Self {
        self.role = role;
        self
    }

    pub fn min_version(mut self, version: ProtocolVersion) -> Self {
        self.min_version = version;
        self
    }

    pub fn max_version(mut self, version: ProtocolVersion) -> Self {
        self.max_version = version;
        self
    }

    pub fn cipher_suites(mut self, suites: &[CipherSuite]) -> Self {
        self.cipher_suites = suites.to_vec();
        self
    }

    pub fn supported_groups(mut self, groups: &[NamedGroup]) -> Self {
        self.supported_groups = groups.to_vec();
        self
    }

    pub fn signature_algorithms(mut self, schemes: &[SignatureScheme]) -> Self {
        self.signature_algorithms = schemes.to_vec();
        self
    }

    pub fn key_share_groups(mut self, groups: &[NamedGroup]) -> Self {
        self.key_share_groups = Some(groups.to_vec());
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn PeerAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    pub fn client_auth(mut self, mode: ClientAuthMode) -> Self {
        self.client_auth = mode;
        self
    }

    pub fn psk(mut self, psk: PskConfig) -> Self {
        self.psk = Some(psk);
        self
    }

    pub fn psk_identity_hint(mut self, hint: Vec<u8>) -> Self {
        self.psk_identity_hint = Some(hint);
        self
    }

    pub fn psk_key_exchange_modes(mut self, modes: &[PskKeyExchangeMode]) -> Self {
        self.psk_key_exchange_modes = modes.to_vec();
        self
    }

    pub fn session_cache(mut self, cache: Arc<dyn SessionCache>) -> Self {
        self.session_cache = Some(cache);
        self
    }

    pub fn resumption_session(mut self, session: Session) -> Self {
        self.resumption_session = Some(session);
        self
    }

    pub fn extended_master_secret(mut self, enabled: bool) -> Self {
        self.extended_master_secret = enabled;
        self
    }

    pub fn require_extended_master_secret(mut self, required: bool) -> Self {
        self.require_extended_master_secret = required;
        self
    }

    pub fn allow_legacy_resumption(mut self, allowed: bool) -> Self {
        self.allow_legacy_resumption = allowed;
        self
    }

    pub fn encrypt_then_mac(mut self, enabled: bool) -> Self {
        self.encrypt_then_mac = enabled;
        self
    }

    pub fn max_fragment_length(mut self, mfl: MaxFragmentLength) -> Self {
        self.max_fragment_length = Some(mfl);
        self
    }

    pub fn alpn(mut self, protocols: &[&[u8]]) -> Self {
        self.alpn_protocols = protocols.iter().map(|p| p.to_vec()).collect();
        self
    }

    pub fn server_name(mut self, name: &str) -> Self {
        self.server_name = Some(name.to_string());
        self
    }

    pub fn status_request(mut self, enabled: bool) -> Self {
        self.status_request = enabled;
        self
    }

    pub fn app_data_split_mode(mut self, mode: AppDataSplitMode) -> Self {
        self.app_data_split_mode = mode;
        self
    }

    pub fn max_handshake_message_size(mut self, size: usize) -> Self {
        self.max_handshake_message_size = size;
        self
    }

    pub fn key_update_threshold(mut self, records: u64) -> Self {
        self.key_update_threshold = records;
        self
    }

    pub fn send_tickets(mut self, count: usize) -> Self {
        self.send_tickets = count;
        self
    }

    pub fn session_tickets(mut self, enabled: bool) -> Self {
        self.session_tickets = enabled;
        self
    }

    pub fn supplemental_data(mut self, entries: Vec<SupplementalDataEntry>) -> Self {
        self.supplemental_data = entries;
        self
    }

    pub fn session_lifetime(mut self, secs: u32) -> Self {
        self.session_lifetime = secs;
        self
    }

    pub fn fallback(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn CryptoProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        if self.min_version < ProtocolVersion::Tls10 {
            return Err(TlsError::InvalidOperation("SSLv3 is not supported".into()));
        }
        if self.min_version > self.max_version {
            return Err(TlsError::InvalidOperation(format!(
                "min_version {} above max_version {}",
                self.min_version, self.max_version
            )));
        }
        let provider = self.provider;
        let cipher_suites = if self.cipher_suites.is_empty() {
            CIPHER_SUITES
                .iter()
                .filter(|s| provider.supports_bulk_cipher(s.cipher))
                .filter(|s| s.auth != AuthAlg::Rsa || provider.supports_rsa())
                .filter(|s| s.kx != KeyExchangeAlg::Dhe || provider.supports_ffdh())
                .map(|s| s.suite)
                .collect()
        } else {
            self.cipher_suites
        };
        let supported_groups: Vec<NamedGroup> = self
            .supported_groups
            .into_iter()
            .filter(|g| provider.supports_group(*g))
            .collect();
        if supported_groups.is_empty() {
            return Err(TlsError::InvalidOperation("no usable groups".into()));
        }
        let key_share_groups = match self.key_share_groups {
            Some(groups) => {
                if let Some(g) = groups.iter().find(|g| !supported_groups.contains(g)) {
                    return Err(TlsError::InvalidOperation(format!(
                        "key share group 0x{:04x} is not a supported group",
                        g.0
                    )));
                }
                groups
            }
            None => supported_groups[..1].to_vec(),
        };
        Ok(TlsConfig {
            role: self.role,
            min_version: self.min_version,
            max_version: self.max_version,
            cipher_suites,
            supported_groups,
            signature_algorithms: self.signature_algorithms,
            key_share_groups,
            credentials: self.credentials,
            authenticator: self.authenticator,
            verify_peer: self.verify_peer,
            client_auth: self.client_auth,
            psk: self.psk,
            psk_identity_hint: self.psk_identity_hint,
            psk_key_exchange_modes: self.psk_key_exchange_modes,
            session_cache: self.session_cache,
            resumption_session: self.resumption_session,
            extended_master_secret: self.extended_master_secret,
            require_extended_master_secret: self.require_extended_master_secret,
            allow_legacy_resumption: self.allow_legacy_resumption,
            encrypt_then_mac: self.encrypt_then_mac,
            max_fragment_length: self.max_fragment_length,
            alpn_protocols: self.alpn_protocols,
            server_name: self.server_name,
            status_request: self.status_request,
            app_data_split_mode: self.app_data_split_mode,
            max_handshake_message_size: self.max_handshake_message_size,
            key_update_threshold: self.key_update_threshold,
            send_tickets: self.send_tickets,
            session_tickets: self.session_tickets,
            supplemental_data: self.supplemental_data,
            session_lifetime: self.session_lifetime,
            fallback: self.fallback,
            provider,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = TlsConfig::builder().build().unwrap();
        assert_eq!(config.role, TlsRole::Client);
        assert_eq!(config.min_version, ProtocolVersion::Tls12);
        assert_eq!(config.max_version, ProtocolVersion::Tls13);
        assert!(config.verify_peer);
        assert_eq!(config.key_share_groups, vec![NamedGroup::X25519]);
        assert_eq!(config.handshake_message_limit(), 32768);
        assert!(!config.session_tickets);
        assert!(config.supplemental_data.is_empty());
        // Suites the provider cannot run are left out.
        assert!(config
            .cipher_suites
            .contains(&CipherSuite::TLS_AES_128_GCM_SHA256));
        assert!(!config
            .cipher_suites
            .contains(&CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256));
        assert!(!config
            .cipher_suites
            .contains(&CipherSuite::TLS_RSA_WITH_RC4_128_SHA));
    }

    #[test]
    fn test_version_range_validated() {
        let err = TlsConfig::builder()
            .min_version(ProtocolVersion::Tls13)
            .max_version(ProtocolVersion::Tls12)
            .build()
            .unwrap_err();
        assert!(err.is_local());
        assert!(TlsConfig::builder()
            .min_version(ProtocolVersion::Ssl3)
            .build()
            .is_err());
    }

    #[test]
    fn test_versions_highest_first() {
        let config = TlsConfig::builder()
            .min_version(ProtocolVersion::Tls10)
            .max_version(ProtocolVersion::Tls12)
            .build()
            .unwrap();
        assert_eq!(
            config.versions(),
            vec![
                ProtocolVersion::Tls12,
                ProtocolVersion::Tls11,
                ProtocolVersion::Tls10
            ]
        );
    }

    #[test]
    fn test_handshake_limit_floor() {
        let config = TlsConfig::builder()
            .max_handshake_message_size(10)
            .build()
            .unwrap();
        assert_eq!(config.handshake_message_limit(), 1024);
    }

    #[test]
    fn test_debug_hides_psk() {
        let config = TlsConfig::builder()
            .psk(PskConfig {
                identity: b"client1".to_vec(),
                key: crate::crypt::secret(vec![0xAB; 32]),
                hash: HashAlgId::Sha256,
            })
            .build()
            .unwrap();
        let shown = format!("{config:?} {:?}", config.psk);
        assert!(!shown.contains("171"));
        assert!(!shown.to_lowercase().contains("abab"));
    }

    #[test]
    fn test_pinned_authenticator() {
        let key = PublicKey::Ed25519([7; 32]);
        let auth = PinnedKeyAuthenticator::new().pin(b"leaf".to_vec(), key.clone());
        assert_eq!(auth.authenticate(&[b"leaf".to_vec()], None).unwrap(), key);
        assert!(auth.authenticate(&[b"other".to_vec()], None).is_err());
        assert!(auth.authenticate(&[], None).is_err());
    }

    #[test]
    fn test_max_fragment_length_limit() {
        assert_eq!(MaxFragmentLength::Bytes512.limit(), 512);
        assert_eq!(MaxFragmentLength::Bytes4096.limit(), 4096);
        assert_eq!(MaxFragmentLength::from_code(5), None);
    }
}
