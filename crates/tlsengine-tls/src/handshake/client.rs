//! Client handshake orchestrator.
//!
//! Legacy flow (TLS 1.0 - 1.2):
//!
//! ```text
//! ClientHello              -->
//!                          <-- ServerHello, Certificate*, CertificateStatus*,
//!                              ServerKeyExchange*, CertificateRequest*,
//!                              ServerHelloDone
//! Certificate*, ClientKeyExchange, CertificateVerify*,
//! [ChangeCipherSpec], Finished -->
//!                          <-- [ChangeCipherSpec], Finished
//! ```
//!
//! The server may send SupplementalData right after its ServerHello and the
//! client may answer with its own ahead of Certificate. A server that
//! acknowledged the session_ticket extension sends NewSessionTicket before
//! its ChangeCipherSpec. An abbreviated (resumed) legacy handshake goes
//! straight from ServerHello to the server's Finished.
//!
//! Modern flow (TLS 1.3):
//!
//! ```text
//! ClientHello              -->
//!                          <-- HelloRetryRequest        (at most once)
//! ClientHello              -->
//!                          <-- ServerHello, {EncryptedExtensions},
//!                              {CertificateRequest*}, {Certificate*},
//!                              {CertificateVerify*}, {Finished}
//! {Certificate*}, {CertificateVerify*}, {Finished} -->
//! ```

use std::sync::Arc;

use log::{debug, trace, warn};
use tlsengine_crypto::{KeyAgreement, PublicKey, Signer};
use tlsengine_types::{AlertDescription, HashAlgId, SignatureScheme, TlsError};
use tlsengine_utils::Reader;

use super::codec::{
    decode_certificate_status, decode_certificate_verify, decode_encrypted_extensions,
    decode_finished, decode_supplemental_data, encode_certificate_verify,
    encode_supplemental_data, CertificateMsg, CertificateRequest12, CertificateRequest13,
    ClientHello, DigitallySigned, NewSessionTicket12, NewSessionTicket13, ServerHello,
    CERT_TYPE_ECDSA_SIGN,
};
use super::key_exchange::KeyExchange;
use super::negotiation::{check_downgrade, check_verify_data, validate_selected_suite};
use super::signing::{
    select_signature_scheme, sign_certificate_verify12, sign_certificate_verify13,
    verify_certificate_verify13, verify_server_params,
};
use super::{wrap_handshake, HandshakeMessage, HandshakeState, HandshakeType};
use crate::config::{MaxFragmentLength, TlsConfig};
use crate::connection::{dispatch, ConnectionCore, HandlerTable, HandshakeFlow};
use crate::crypt::key_schedule::{self, KeySchedule};
use crate::crypt::key_schedule12::{
    self, CLIENT_FINISHED_LABEL, SERVER_FINISHED_LABEL, VERIFY_DATA_LEN,
};
use crate::crypt::transcript::hash_with;
use crate::crypt::{lookup_suite, secret, CipherClass, CipherSuiteInfo, KeyExchangeAlg, PrfHash, Secret};
use crate::extensions::codec::{
    build_alpn, build_cookie, build_ec_point_formats, build_key_share_ch,
    build_psk_key_exchange_modes, build_pre_shared_key_ch, build_server_name,
    build_signature_algorithms, build_status_request, build_supported_groups,
    build_supported_versions_ch, parse_alpn_selected, parse_cookie, parse_ec_point_formats,
    parse_empty, parse_key_share_hrr, parse_key_share_sh, parse_max_fragment_length,
    parse_pre_shared_key_sh, parse_renegotiation_info, parse_signature_algorithms,
    parse_supported_versions_sh, KeyShareEntry, OfferedPsks, PskIdentity,
};
use crate::extensions::{
    check_permitted_13, check_solicited, ExtensionContext, ExtensionType, ExtensionsMap,
};
use crate::record::TLS13_RECORD_VERSION;
use crate::session::{now_secs, Session, SessionParameters};
use crate::{CipherSuite, ProtocolVersion};

use HandshakeState as S;
use HandshakeType as T;

/// Extensions a resumed legacy ServerHello may carry.
const RESUMPTION_EXTENSIONS: &[ExtensionType] = &[
    ExtensionType::RENEGOTIATION_INFO,
    ExtensionType::EXTENDED_MASTER_SECRET,
    ExtensionType::ENCRYPT_THEN_MAC,
    ExtensionType::APPLICATION_LAYER_PROTOCOL_NEGOTIATION,
];

/// TLS 1.3 extensions that must never appear in a legacy ServerHello.
const MODERN_ONLY_EXTENSIONS: &[ExtensionType] = &[
    ExtensionType::KEY_SHARE,
    ExtensionType::PRE_SHARED_KEY,
    ExtensionType::COOKIE,
    ExtensionType::EARLY_DATA,
];

static INITIAL: &HandlerTable<ClientHandshake> =
    &[(T::ServerHello, &[S::ClientHello], ClientHandshake::on_server_hello)];

static LEGACY: &HandlerTable<ClientHandshake> = &[
    (T::SupplementalData, &[S::ServerHello], ClientHandshake::on_supplemental_data),
    (
        T::Certificate,
        &[S::ServerHello, S::ServerSupplementalData],
        ClientHandshake::on_certificate12,
    ),
    (T::CertificateStatus, &[S::ServerCertificate], ClientHandshake::on_certificate_status),
    (
        T::ServerKeyExchange,
        &[
            S::ServerHello,
            S::ServerSupplementalData,
            S::ServerCertificate,
            S::ServerCertificateStatus,
        ],
        ClientHandshake::on_server_key_exchange,
    ),
    (
        T::CertificateRequest,
        &[S::ServerCertificate, S::ServerCertificateStatus, S::ServerKeyExchange],
        ClientHandshake::on_certificate_request12,
    ),
    (
        T::ServerHelloDone,
        &[
            S::ServerHello,
            S::ServerSupplementalData,
            S::ServerCertificate,
            S::ServerCertificateStatus,
            S::ServerKeyExchange,
            S::ServerCertificateRequest,
        ],
        ClientHandshake::on_server_hello_done,
    ),
    (T::NewSessionTicket, &[S::ClientFinished], ClientHandshake::on_new_session_ticket12),
    (
        T::Finished,
        &[S::ServerHello, S::ClientFinished, S::ServerSessionTicket],
        ClientHandshake::on_finished12,
    ),
];

static MODERN: &HandlerTable<ClientHandshake> = &[
    (T::ServerHello, &[S::ClientHelloRetry], ClientHandshake::on_server_hello),
    (T::EncryptedExtensions, &[S::ServerHello], ClientHandshake::on_encrypted_extensions),
    (
        T::CertificateRequest,
        &[S::ServerEncryptedExtensions],
        ClientHandshake::on_certificate_request13,
    ),
    (
        T::Certificate,
        &[S::ServerEncryptedExtensions, S::ServerCertificateRequest],
        ClientHandshake::on_certificate13,
    ),
    (T::CertificateVerify, &[S::ServerCertificate], ClientHandshake::on_certificate_verify13),
    (T::Finished, &[S::ServerCertificateVerify], ClientHandshake::on_finished13),
];

fn internal(what: &str) -> TlsError {
    TlsError::fatal(AlertDescription::InternalError, format!("client: {what}"))
}

fn illegal(reason: impl Into<String>) -> TlsError {
    TlsError::fatal(AlertDescription::IllegalParameter, reason)
}

fn unexpected(reason: impl Into<String>) -> TlsError {
    TlsError::fatal(AlertDescription::UnexpectedMessage, reason)
}

/// Legacy states in which the server's Certificate may still follow.
fn before_certificate(state: HandshakeState) -> bool {
    matches!(state, S::ServerHello | S::ServerSupplementalData)
}

/// A pre-shared key offered in the ClientHello.
struct PskOffer {
    identity: Vec<u8>,
    key: Secret,
    hash: HashAlgId,
    /// External PSK rather than a resumption ticket.
    external: bool,
    obfuscated_ticket_age: u32,
}

impl PskOffer {
    fn extension(&self, binder: Vec<u8>) -> OfferedPsks {
        OfferedPsks {
            identities: vec![PskIdentity {
                identity: self.identity.clone(),
                obfuscated_ticket_age: self.obfuscated_ticket_age,
            }],
            binders: vec![binder],
        }
    }
}

/// What the server asked for in a CertificateRequest.
struct CertRequest {
    /// TLS 1.3 certificate_request_context.
    context: Vec<u8>,
    schemes: Option<Vec<SignatureScheme>>,
    /// Legacy certificate_types. Empty for TLS 1.3.
    certificate_types: Vec<u8>,
}

/// Client side of one handshake.
pub struct ClientHandshake {
    config: Arc<TlsConfig>,
    /// Versions offered, highest first.
    versions: Vec<ProtocolVersion>,
    /// The last ClientHello sent.
    hello: Option<ClientHello>,
    /// One TLS 1.3 key share per offered group.
    key_shares: Vec<Box<dyn KeyAgreement>>,
    /// Session offered for resumption.
    resumption: Option<SessionParameters>,
    psk: Option<PskOffer>,
    psk_accepted: bool,
    /// Cipher suite named by the HelloRetryRequest.
    retry_suite: Option<CipherSuite>,
    key_exchange: Option<KeyExchange>,
    server_key_exchange_seen: bool,
    status_acknowledged: bool,
    /// The server acknowledged session_ticket and owes a NewSessionTicket.
    expect_ticket: bool,
    ticket: Option<NewSessionTicket12>,
    key_schedule: Option<KeySchedule>,
    client_hs_secret: Option<Secret>,
    server_hs_secret: Option<Secret>,
    /// Authenticated server key; `None` when verification is disabled.
    peer_key: Option<PublicKey>,
    cert_request: Option<CertRequest>,
    server_extensions: ExtensionsMap,
}

impl ClientHandshake {
    pub fn new(config: &Arc<TlsConfig>) -> Self {
        Self {
            versions: config.versions(),
            config: Arc::clone(config),
            hello: None,
            key_shares: Vec::new(),
            resumption: None,
            psk: None,
            psk_accepted: false,
            retry_suite: None,
            key_exchange: None,
            server_key_exchange_seen: false,
            status_acknowledged: false,
            expect_ticket: false,
            ticket: None,
            key_schedule: None,
            client_hs_secret: None,
            server_hs_secret: None,
            peer_key: None,
            cert_request: None,
            server_extensions: ExtensionsMap::new(),
        }
    }

    fn offers_tls13(&self) -> bool {
        self.versions.first().is_some_and(|v| v.is_tls13())
    }

    fn offers_legacy(&self) -> bool {
        self.versions.iter().any(|v| !v.is_tls13())
    }

    fn max_version(&self) -> Result<ProtocolVersion, TlsError> {
        self.versions
            .first()
            .copied()
            .ok_or_else(|| internal("no versions configured"))
    }

    fn hello(&self) -> Result<&ClientHello, TlsError> {
        self.hello.as_ref().ok_or_else(|| internal("no ClientHello sent"))
    }

    /// Route one message through the table for the current flow.
    pub(crate) fn handle(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        let table = match core.flow {
            HandshakeFlow::Undetermined => INITIAL,
            HandshakeFlow::Legacy => LEGACY,
            HandshakeFlow::Modern => MODERN,
        };
        dispatch(table, self, core, msg)
    }

    // ------------------------------------------------------------------
    // ClientHello
    // ------------------------------------------------------------------

    /// Suites to offer: configured suites usable at some offered version.
    /// PSK suites need a configured PSK and anonymous suites need peer
    /// verification to be off.
    fn offered_suites(&self) -> Vec<CipherSuite> {
        let cfg = &self.config;
        cfg.cipher_suites
            .iter()
            .filter_map(|s| lookup_suite(*s))
            .filter(|info| self.versions.iter().any(|v| info.usable_at(*v)))
            .filter(|info| !info.kx.is_psk() || cfg.psk.is_some())
            .filter(|info| info.kx != KeyExchangeAlg::EcdhAnon || !cfg.verify_peer)
            .map(|info| info.suite)
            .collect()
    }

    /// A stored session still acceptable to offer.
    fn session_to_offer(&self, suites: &[CipherSuite]) -> Option<SessionParameters> {
        let cfg = &self.config;
        let params = match &cfg.resumption_session {
            Some(session) if session.is_resumable() => session.parameters().cloned(),
            Some(_) => None,
            None => {
                let name = cfg.server_name.as_ref()?;
                cfg.session_cache.as_ref()?.get(name.as_bytes())
            }
        }?;
        if !self.versions.contains(&params.version) || !suites.contains(&params.cipher_suite) {
            debug!("stored session no longer matches the configuration");
            return None;
        }
        if params.version.is_tls13() {
            let usable = params.psk.is_some()
                && params.ticket.is_some()
                && !params.is_expired(u64::from(params.ticket_lifetime));
            return usable.then_some(params);
        }
        let ems_ok = params.extended_master_secret
            || (cfg.allow_legacy_resumption && !cfg.require_extended_master_secret);
        if !ems_ok {
            debug!("not offering a session without extended master secret");
            return None;
        }
        let ticket_ok = cfg.session_tickets
            && params.ticket.is_some()
            && !params.is_expired(u64::from(params.ticket_lifetime));
        (!params.session_id.is_empty() || ticket_ok).then_some(params)
    }

    fn psk_to_offer(&self) -> Option<PskOffer> {
        if let Some(session) = self.resumption.as_ref().filter(|s| s.version.is_tls13()) {
            let suite = lookup_suite(session.cipher_suite)?;
            return Some(PskOffer {
                identity: session.ticket.clone()?,
                key: session.psk.clone()?,
                hash: suite.prf_hash,
                external: false,
                obfuscated_ticket_age: session.obfuscated_ticket_age(),
            });
        }
        let psk = self.config.psk.as_ref()?;
        Some(PskOffer {
            identity: psk.identity.clone(),
            key: psk.key.clone(),
            hash: psk.hash,
            external: true,
            obfuscated_ticket_age: 0,
        })
    }

    /// Build and send the first ClientHello.
    pub(crate) fn start(&mut self, core: &mut ConnectionCore) -> Result<(), TlsError> {
        let provider = core.provider();
        let max = self.max_version()?;
        let suites = self.offered_suites();
        if suites.is_empty() {
            return Err(TlsError::InvalidOperation(
                "no cipher suite usable at the configured versions".into(),
            ));
        }
        provider.fill_random(&mut core.params.client_random)?;

        self.resumption = self.session_to_offer(&suites);
        let tickets = self.config.session_tickets;
        if let Some(session) = self
            .resumption
            .as_mut()
            .filter(|s| tickets && !s.version.is_tls13() && s.ticket.is_some())
        {
            // A fresh id the server echoes when it accepts the ticket.
            let mut id = vec![0u8; 32];
            provider.fill_random(&mut id)?;
            session.session_id = id;
        }
        let session_id = match &self.resumption {
            Some(session) if !session.version.is_tls13() => session.session_id.clone(),
            _ if self.offers_tls13() => {
                let mut id = vec![0u8; 32];
                provider.fill_random(&mut id)?;
                id
            }
            _ => Vec::new(),
        };
        if self.offers_tls13() {
            for group in &self.config.key_share_groups {
                self.key_shares.push(provider.generate_key_agreement(*group)?);
            }
            self.psk = self.psk_to_offer();
        }

        let mut cipher_suites = suites;
        if self.offers_legacy() {
            cipher_suites.push(CipherSuite::TLS_EMPTY_RENEGOTIATION_INFO_SCSV);
        }
        if self.config.fallback {
            cipher_suites.push(CipherSuite::TLS_FALLBACK_SCSV);
        }
        let hello = ClientHello {
            legacy_version: max.min(ProtocolVersion::Tls12).wire(),
            random: core.params.client_random,
            session_id,
            cipher_suites,
            compression_methods: vec![0],
            extensions: self.hello_extensions(None)?,
        };
        core.record.set_write_version(ProtocolVersion::Tls10.wire());
        debug!(
            "offering {:?} (resumption: {}, psk: {})",
            self.versions,
            self.resumption.is_some(),
            self.psk.is_some()
        );
        self.send_client_hello(core, hello)?;
        core.state = S::ClientHello;
        Ok(())
    }

    fn hello_extensions(&self, cookie: Option<&[u8]>) -> Result<ExtensionsMap, TlsError> {
        let cfg = &self.config;
        let mut ext = ExtensionsMap::new();
        if self.offers_tls13() {
            ext.insert(
                ExtensionType::SUPPORTED_VERSIONS,
                build_supported_versions_ch(&self.versions),
            )?;
            let shares: Vec<KeyShareEntry> = self
                .key_shares
                .iter()
                .map(|k| KeyShareEntry {
                    group: k.group(),
                    key_exchange: k.public_key(),
                })
                .collect();
            ext.insert(ExtensionType::KEY_SHARE, build_key_share_ch(&shares))?;
            ext.insert(
                ExtensionType::PSK_KEY_EXCHANGE_MODES,
                build_psk_key_exchange_modes(&cfg.psk_key_exchange_modes),
            )?;
            if let Some(cookie) = cookie {
                ext.insert(ExtensionType::COOKIE, build_cookie(cookie))?;
            }
        }
        if self.max_version()? >= ProtocolVersion::Tls12 {
            ext.insert(
                ExtensionType::SIGNATURE_ALGORITHMS,
                build_signature_algorithms(&cfg.signature_algorithms),
            )?;
        }
        ext.insert(
            ExtensionType::SUPPORTED_GROUPS,
            build_supported_groups(&cfg.supported_groups),
        )?;
        if self.offers_legacy() {
            ext.insert(ExtensionType::EC_POINT_FORMATS, build_ec_point_formats())?;
            if cfg.extended_master_secret {
                ext.insert(ExtensionType::EXTENDED_MASTER_SECRET, Vec::new())?;
            }
            if cfg.encrypt_then_mac {
                ext.insert(ExtensionType::ENCRYPT_THEN_MAC, Vec::new())?;
            }
            if cfg.session_tickets {
                let ticket = self
                    .resumption
                    .as_ref()
                    .filter(|s| !s.version.is_tls13())
                    .and_then(|s| s.ticket.clone())
                    .unwrap_or_default();
                ext.insert(ExtensionType::SESSION_TICKET, ticket)?;
            }
        }
        if let Some(name) = &cfg.server_name {
            ext.insert(ExtensionType::SERVER_NAME, build_server_name(name))?;
        }
        if !cfg.alpn_protocols.is_empty() {
            ext.insert(
                ExtensionType::APPLICATION_LAYER_PROTOCOL_NEGOTIATION,
                build_alpn(&cfg.alpn_protocols),
            )?;
        }
        if let Some(mfl) = cfg.max_fragment_length {
            ext.insert(ExtensionType::MAX_FRAGMENT_LENGTH, vec![mfl as u8])?;
        }
        if cfg.status_request {
            ext.insert(ExtensionType::STATUS_REQUEST, build_status_request())?;
        }
        if let Some(psk) = &self.psk {
            let placeholder = vec![0u8; psk.hash.output_size()];
            ext.insert(
                ExtensionType::PRE_SHARED_KEY,
                build_pre_shared_key_ch(&psk.extension(placeholder)),
            )?;
        }
        Ok(ext)
    }

    /// Fill in the PSK binder, if any, then send and remember the hello.
    fn send_client_hello(
        &mut self,
        core: &mut ConnectionCore,
        mut hello: ClientHello,
    ) -> Result<(), TlsError> {
        if let Some(psk) = &self.psk {
            let provider = core.provider();
            let placeholder = psk.extension(vec![0u8; psk.hash.output_size()]);
            let encoded = wrap_handshake(T::ClientHello, &hello.encode());
            let truncated = &encoded[..encoded.len() - placeholder.binders_len()];
            let mut binder_input = core.transcript.messages()?.to_vec();
            binder_input.extend_from_slice(truncated);
            let binder_hash = hash_with(&*provider, PrfHash::Single(psk.hash), &binder_input)?;
            let binder =
                key_schedule::psk_binder(&provider, psk.hash, &psk.key, psk.external, &binder_hash)?;
            hello.extensions.set(
                ExtensionType::PRE_SHARED_KEY,
                build_pre_shared_key_ch(&psk.extension(binder)),
            );
        }
        core.send_handshake(T::ClientHello, &hello.encode())?;
        self.hello = Some(hello);
        Ok(())
    }

    // ------------------------------------------------------------------
    // ServerHello / HelloRetryRequest
    // ------------------------------------------------------------------

    fn negotiated_version(&self, sh: &ServerHello) -> Result<ProtocolVersion, TlsError> {
        if let Some(data) = sh.extensions.get(ExtensionType::SUPPORTED_VERSIONS) {
            let selected = parse_supported_versions_sh(data)?;
            if selected != ProtocolVersion::Tls13.wire() || !self.offers_tls13() {
                return Err(illegal(format!("server selected version 0x{selected:04x}")));
            }
            if sh.legacy_version != ProtocolVersion::Tls12.wire() {
                return Err(illegal("TLS 1.3 ServerHello with bad legacy_version"));
            }
            return Ok(ProtocolVersion::Tls13);
        }
        ProtocolVersion::from_wire(sh.legacy_version)
            .filter(|v| !v.is_tls13() && self.versions.contains(v))
            .ok_or_else(|| {
                TlsError::fatal(
                    AlertDescription::ProtocolVersion,
                    format!("server selected version 0x{:04x}", sh.legacy_version),
                )
            })
    }

    fn on_server_hello(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        let sh = ServerHello::decode(msg.body())?;
        if sh.is_hello_retry_request() {
            return self.on_hello_retry_request(core, msg, sh);
        }
        let version = self.negotiated_version(&sh)?;
        if let Some(retry_suite) = self.retry_suite {
            if !version.is_tls13() || sh.cipher_suite != retry_suite {
                return Err(illegal("ServerHello does not match the HelloRetryRequest"));
            }
        }
        check_downgrade(&sh.random, self.max_version()?, version)?;
        let suite = validate_selected_suite(sh.cipher_suite, &self.hello()?.cipher_suites, version)?;
        if sh.compression_method != 0 {
            return Err(illegal("server selected compression"));
        }

        core.params.version = Some(version);
        core.params.suite = Some(suite);
        core.params.server_random = sh.random;
        let record_version = if version.is_tls13() {
            TLS13_RECORD_VERSION
        } else {
            version.wire()
        };
        core.record.set_read_version(record_version);
        core.record.set_write_version(record_version);
        core.transcript.notify_prf_determined(suite.prf_for(version))?;
        core.transcript.seal()?;
        core.transcript.update(&msg.encoding);
        debug!("server selected {version} with {}", suite.name);

        self.server_extensions = sh.extensions.clone();
        if version.is_tls13() {
            core.flow = HandshakeFlow::Modern;
            self.process_server_hello13(core, &sh, suite)
        } else {
            core.flow = HandshakeFlow::Legacy;
            self.process_server_hello12(core, &sh, suite, version)
        }
    }

    fn on_hello_retry_request(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
        hrr: ServerHello,
    ) -> Result<(), TlsError> {
        if self.retry_suite.is_some() {
            return Err(unexpected("second HelloRetryRequest"));
        }
        let hello = self.hello()?.clone();
        if hrr.session_id != hello.session_id {
            return Err(illegal("HelloRetryRequest session id mismatch"));
        }
        if hrr.compression_method != 0 {
            return Err(illegal("HelloRetryRequest selected compression"));
        }
        let selected = hrr
            .extensions
            .get(ExtensionType::SUPPORTED_VERSIONS)
            .ok_or_else(|| {
                TlsError::fatal(
                    AlertDescription::MissingExtension,
                    "HelloRetryRequest without supported_versions",
                )
            })
            .and_then(parse_supported_versions_sh)?;
        if selected != ProtocolVersion::Tls13.wire() || !self.offers_tls13() {
            return Err(illegal("HelloRetryRequest for a version other than TLS 1.3"));
        }
        let suite = validate_selected_suite(hrr.cipher_suite, &hello.cipher_suites, ProtocolVersion::Tls13)?;
        check_permitted_13(&hrr.extensions, ExtensionContext::HelloRetryRequest)?;
        check_solicited(&hrr.extensions, &hello.extensions, &[ExtensionType::COOKIE])?;

        let group = hrr
            .extensions
            .get(ExtensionType::KEY_SHARE)
            .map(parse_key_share_hrr)
            .transpose()?;
        let cookie = hrr
            .extensions
            .get(ExtensionType::COOKIE)
            .map(parse_cookie)
            .transpose()?;
        if group.is_none() && cookie.is_none() {
            return Err(illegal("HelloRetryRequest would not change the ClientHello"));
        }
        if let Some(group) = group {
            if !self.config.supported_groups.contains(&group)
                || self.key_shares.iter().any(|k| k.group() == group)
            {
                return Err(illegal(format!("HelloRetryRequest for group 0x{:04x}", group.0)));
            }
        }

        core.flow = HandshakeFlow::Modern;
        core.params.version = Some(ProtocolVersion::Tls13);
        core.params.suite = Some(suite);
        core.transcript.notify_prf_determined(PrfHash::Single(suite.prf_hash))?;
        core.transcript.adjust_for_retry()?;
        core.transcript.update(&msg.encoding);
        self.retry_suite = Some(hrr.cipher_suite);
        debug!("HelloRetryRequest: group {group:?}, cookie {}", cookie.is_some());

        core.record.set_write_version(TLS13_RECORD_VERSION);
        core.send_compat_ccs()?;
        if let Some(group) = group {
            self.key_shares = vec![core.provider().generate_key_agreement(group)?];
        }
        if self.psk.as_ref().is_some_and(|p| p.hash != suite.prf_hash) {
            debug!("dropping PSK bound to another hash");
            self.psk = None;
        }
        let retry = ClientHello {
            extensions: self.hello_extensions(cookie.as_deref())?,
            ..hello
        };
        self.send_client_hello(core, retry)?;
        core.state = S::ClientHelloRetry;
        Ok(())
    }

    /// ALPN, max_fragment_length and the server_name acknowledgement, shared
    /// by the legacy ServerHello and EncryptedExtensions.
    fn apply_negotiated_extensions(
        &self,
        core: &mut ConnectionCore,
        ext: &ExtensionsMap,
    ) -> Result<(), TlsError> {
        if let Some(data) = ext.get(ExtensionType::APPLICATION_LAYER_PROTOCOL_NEGOTIATION) {
            let protocol = parse_alpn_selected(data)?;
            if !self.config.alpn_protocols.contains(&protocol) {
                return Err(illegal("server selected an ALPN protocol we did not offer"));
            }
            core.params.alpn = Some(protocol);
        }
        if let Some(data) = ext.get(ExtensionType::MAX_FRAGMENT_LENGTH) {
            let code = parse_max_fragment_length(data)?;
            let mfl = self
                .config
                .max_fragment_length
                .filter(|m| *m as u8 == code)
                .ok_or_else(|| illegal("max_fragment_length differs from the request"))?;
            core.params.max_fragment_length = Some(mfl);
            core.record.set_plaintext_limit(MaxFragmentLength::limit(mfl));
        }
        if let Some(data) = ext.get(ExtensionType::SERVER_NAME) {
            parse_empty(data, "server_name")?;
            core.params.server_name = self.config.server_name.clone();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Legacy flow
    // ------------------------------------------------------------------

    fn process_server_hello12(
        &mut self,
        core: &mut ConnectionCore,
        sh: &ServerHello,
        suite: &'static CipherSuiteInfo,
        version: ProtocolVersion,
    ) -> Result<(), TlsError> {
        let offered = self.hello()?.extensions.clone();
        if let Some(t) = sh.extensions.types().find(|t| MODERN_ONLY_EXTENSIONS.contains(t)) {
            return Err(illegal(format!("extension {} in a legacy ServerHello", t.0)));
        }
        check_solicited(&sh.extensions, &offered, &[ExtensionType::RENEGOTIATION_INFO])?;

        let resumed = match &self.resumption {
            Some(session) => {
                !session.version.is_tls13()
                    && !sh.session_id.is_empty()
                    && session.session_id == sh.session_id
            }
            None => false,
        };
        if resumed {
            if let Some(t) = sh.extensions.types().find(|t| !RESUMPTION_EXTENSIONS.contains(t)) {
                return Err(illegal(format!("extension {} in a resumed ServerHello", t.0)));
            }
        }

        if let Some(data) = sh.extensions.get(ExtensionType::RENEGOTIATION_INFO) {
            parse_renegotiation_info(data)?;
            core.params.secure_renegotiation = true;
        }
        if let Some(data) = sh.extensions.get(ExtensionType::EC_POINT_FORMATS) {
            parse_ec_point_formats(data)?;
        }
        let ems = match sh.extensions.get(ExtensionType::EXTENDED_MASTER_SECRET) {
            Some(data) => {
                parse_empty(data, "extended_master_secret")?;
                true
            }
            None => false,
        };
        let etm = match sh.extensions.get(ExtensionType::ENCRYPT_THEN_MAC) {
            Some(data) => {
                parse_empty(data, "encrypt_then_mac")?;
                if suite.class() != CipherClass::Block {
                    return Err(illegal("encrypt_then_mac with a non-CBC suite"));
                }
                true
            }
            None => false,
        };
        if let Some(data) = sh.extensions.get(ExtensionType::STATUS_REQUEST) {
            parse_empty(data, "status_request")?;
            self.status_acknowledged = true;
        }
        if let Some(data) = sh.extensions.get(ExtensionType::SESSION_TICKET) {
            parse_empty(data, "session_ticket")?;
            self.expect_ticket = true;
        }
        core.params.extended_master_secret = ems;
        core.params.encrypt_then_mac = etm;
        core.params.session_id = sh.session_id.clone();
        self.apply_negotiated_extensions(core, &sh.extensions)?;

        if resumed {
            let session = self
                .resumption
                .take()
                .ok_or_else(|| internal("resumed without a session"))?;
            if session.version != version || session.cipher_suite != suite.suite {
                return Err(illegal("resumed session version or cipher suite changed"));
            }
            if session.extended_master_secret != ems {
                return Err(TlsError::fatal(
                    AlertDescription::HandshakeFailure,
                    "extended master secret changed on resumption",
                ));
            }
            debug!("resuming session");
            core.params.resumed = true;
            core.params.peer_certificates = session.peer_certificates.clone();
            core.install_legacy_keys(&session.master_secret)?;
            core.params.master_secret = Some(session.master_secret.clone());
            core.session = Session::new(session);
            core.expect_ccs = true;
            core.state = S::ServerHello;
            return Ok(());
        }

        self.resumption = None;
        if self.config.require_extended_master_secret && !ems {
            return Err(TlsError::fatal(
                AlertDescription::HandshakeFailure,
                "server did not negotiate extended master secret",
            ));
        }
        self.key_exchange = Some(KeyExchange::new(suite.kx, self.config.psk.as_ref(), None)?);
        core.state = S::ServerHello;
        Ok(())
    }

    fn authenticate_server(
        &mut self,
        core: &mut ConnectionCore,
        chain: Vec<Vec<u8>>,
    ) -> Result<(), TlsError> {
        let server_name = self.config.server_name.as_deref();
        let result = match &self.config.authenticator {
            Some(auth) => auth.authenticate(&chain, server_name),
            None => Err(TlsError::fatal(
                AlertDescription::CertificateUnknown,
                "no authenticator configured",
            )),
        };
        match result {
            Ok(key) => self.peer_key = Some(key),
            Err(e) if !self.config.verify_peer => {
                warn!("server certificate not verified: {e}");
                self.peer_key = None;
            }
            Err(e) => return Err(e),
        }
        core.params.peer_certificates = chain;
        Ok(())
    }

    fn on_supplemental_data(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        if core.params.resumed {
            return Err(unexpected("SupplementalData in an abbreviated handshake"));
        }
        core.params.peer_supplemental_data = decode_supplemental_data(msg.body())?;
        trace!("server supplemental data: {} entries", core.params.peer_supplemental_data.len());
        core.state = S::ServerSupplementalData;
        Ok(())
    }

    fn on_certificate12(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        let suite = core.params.negotiated_suite()?;
        if core.params.resumed || !suite.kx.requires_certificate() {
            return Err(unexpected("Certificate not expected for this exchange"));
        }
        let cert = CertificateMsg::decode(msg.body(), false)?;
        if cert.is_empty() {
            return Err(TlsError::fatal(
                AlertDescription::DecodeError,
                "empty server certificate",
            ));
        }
        self.authenticate_server(core, cert.chain())?;
        core.state = S::ServerCertificate;
        Ok(())
    }

    fn on_certificate_status(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        if !self.status_acknowledged {
            return Err(unexpected("CertificateStatus without status_request"));
        }
        core.params.ocsp_response = Some(decode_certificate_status(msg.body())?);
        core.state = S::ServerCertificateStatus;
        Ok(())
    }

    fn on_server_key_exchange(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        let suite = core.params.negotiated_suite()?;
        let version = core.params.negotiated_version()?;
        if core.params.resumed || (before_certificate(core.state) && suite.kx.requires_certificate()) {
            return Err(unexpected("ServerKeyExchange before Certificate"));
        }
        let kx = self
            .key_exchange
            .as_mut()
            .ok_or_else(|| internal("no key exchange"))?;
        let body = msg.body();
        let params_len = kx.process_server_key_exchange(body, &self.config.supported_groups)?;
        if kx.is_signed() {
            let mut r = Reader::new(&body[params_len..], "ServerKeyExchange");
            let signed = DigitallySigned::decode(&mut r, version >= ProtocolVersion::Tls12)?;
            r.expect_end()?;
            match &self.peer_key {
                Some(key) => verify_server_params(
                    &*core.provider(),
                    key,
                    &signed,
                    &self.config.signature_algorithms,
                    version,
                    &core.params.client_random,
                    &core.params.server_random,
                    &body[..params_len],
                )?,
                None => trace!("skipping ServerKeyExchange signature check"),
            }
        } else if params_len != body.len() {
            return Err(TlsError::fatal(
                AlertDescription::DecodeError,
                "trailing data in ServerKeyExchange",
            ));
        }
        self.server_key_exchange_seen = true;
        core.state = S::ServerKeyExchange;
        Ok(())
    }

    fn on_certificate_request12(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        let version = core.params.negotiated_version()?;
        if core.params.peer_certificates.is_empty() {
            return Err(TlsError::fatal(
                AlertDescription::HandshakeFailure,
                "CertificateRequest from an anonymous server",
            ));
        }
        let request = CertificateRequest12::decode(msg.body(), version >= ProtocolVersion::Tls12)?;
        self.cert_request = Some(CertRequest {
            context: Vec::new(),
            schemes: request.signature_algorithms,
            certificate_types: request.certificate_types,
        });
        core.state = S::ServerCertificateRequest;
        Ok(())
    }

    /// Our certificate chain and signer for a CertificateRequest, or an empty
    /// chain when we have nothing acceptable.
    fn client_credentials(
        &self,
        core: &ConnectionCore,
        request: &CertRequest,
        version: ProtocolVersion,
    ) -> Result<(Vec<Vec<u8>>, Option<(Box<dyn Signer>, SignatureScheme)>), TlsError> {
        let Some(creds) = &self.config.credentials else {
            return Ok((Vec::new(), None));
        };
        if !version.is_tls13() && !request.certificate_types.contains(&CERT_TYPE_ECDSA_SIGN) {
            debug!("server accepts no certificate type we hold");
            return Ok((Vec::new(), None));
        }
        let signer = core.provider().new_signer(&creds.key)?;
        match select_signature_scheme(&*signer, request.schemes.as_deref(), version) {
            Ok(scheme) => Ok((creds.chain.clone(), Some((signer, scheme)))),
            Err(_) => {
                debug!("no common signature scheme for the client certificate");
                Ok((Vec::new(), None))
            }
        }
    }

    fn on_server_hello_done(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        if !msg.body().is_empty() {
            return Err(TlsError::fatal(
                AlertDescription::DecodeError,
                "ServerHelloDone with a body",
            ));
        }
        let suite = core.params.negotiated_suite()?;
        let version = core.params.negotiated_version()?;
        if core.params.resumed || (before_certificate(core.state) && suite.kx.requires_certificate()) {
            return Err(unexpected("ServerHelloDone before Certificate"));
        }
        let provider = core.provider();
        let mut kx = self
            .key_exchange
            .take()
            .ok_or_else(|| internal("no key exchange"))?;
        if !self.server_key_exchange_seen {
            kx.skip_server_key_exchange()?;
        }

        if !self.config.supplemental_data.is_empty() {
            core.send_handshake(
                T::SupplementalData,
                &encode_supplemental_data(&self.config.supplemental_data),
            )?;
        }
        let mut signer = None;
        if let Some(request) = self.cert_request.take() {
            let (chain, chosen) = self.client_credentials(core, &request, version)?;
            core.send_handshake(T::Certificate, &CertificateMsg::from_chain(&chain, false).encode())?;
            core.params.local_certificates = chain;
            signer = chosen;
        }

        let client_key_exchange = kx.generate_client_key_exchange(&*provider)?;
        core.send_handshake(T::ClientKeyExchange, &client_key_exchange)?;
        let premaster = kx.into_premaster_secret()?;
        let prf = suite.prf_for(version);
        let master = if core.params.extended_master_secret {
            key_schedule12::derive_extended_master_secret(
                &*provider,
                prf,
                &premaster,
                &core.transcript.fork()?,
            )?
        } else {
            key_schedule12::derive_master_secret(
                &*provider,
                prf,
                &premaster,
                &core.params.client_random,
                &core.params.server_random,
            )?
        };
        drop(premaster);

        if let Some((signer, scheme)) = signer {
            let signed =
                sign_certificate_verify12(&*signer, scheme, version, core.transcript.messages()?)?;
            core.send_handshake(T::CertificateVerify, &encode_certificate_verify(&signed))?;
        }

        core.install_legacy_keys(&master)?;
        core.send_change_cipher_spec()?;
        let verify_data = key_schedule12::compute_verify_data(
            &*provider,
            prf,
            &master,
            CLIENT_FINISHED_LABEL,
            &core.transcript.fork()?,
        )?;
        core.send_handshake(T::Finished, &verify_data)?;
        core.params.client_verify_data = verify_data;
        core.params.master_secret = Some(master);
        core.expect_ccs = true;
        core.state = S::ClientFinished;
        Ok(())
    }

    fn on_finished12(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        if core.state == S::ServerHello && !core.params.resumed {
            return Err(unexpected("Finished before ServerHelloDone"));
        }
        if core.state == S::ClientFinished && self.expect_ticket {
            return Err(unexpected("Finished without the promised NewSessionTicket"));
        }
        if !core.ccs_received {
            return Err(unexpected("Finished before ChangeCipherSpec"));
        }
        let suite = core.params.negotiated_suite()?;
        let version = core.params.negotiated_version()?;
        let prf = suite.prf_for(version);
        let provider = core.provider();
        let master = core
            .params
            .master_secret
            .clone()
            .ok_or_else(|| internal("no master secret"))?;

        let received = decode_finished(msg.body(), VERIFY_DATA_LEN)?;
        let expected = key_schedule12::compute_verify_data(
            &*provider,
            prf,
            &master,
            SERVER_FINISHED_LABEL,
            &core.transcript.fork()?,
        )?;
        check_verify_data(&expected, received)?;
        core.params.server_verify_data = received.to_vec();
        core.transcript.update(&msg.encoding);

        if core.params.resumed {
            core.send_change_cipher_spec()?;
            let verify_data = key_schedule12::compute_verify_data(
                &*provider,
                prf,
                &master,
                CLIENT_FINISHED_LABEL,
                &core.transcript.fork()?,
            )?;
            core.send_handshake(T::Finished, &verify_data)?;
            core.params.client_verify_data = verify_data;
        } else {
            self.store_legacy_session(core, suite, version, master)?;
        }
        core.complete_handshake();
        Ok(())
    }

    /// RFC 5077 ticket, sent between our Finished and the server's
    /// ChangeCipherSpec. An empty ticket means none was issued.
    fn on_new_session_ticket12(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        if !self.expect_ticket {
            return Err(unexpected("NewSessionTicket without session_ticket"));
        }
        if core.ccs_received {
            return Err(unexpected("NewSessionTicket after ChangeCipherSpec"));
        }
        let ticket = NewSessionTicket12::decode(msg.body())?;
        debug!(
            "received session ticket ({} bytes, hint {}s)",
            ticket.ticket.len(),
            ticket.lifetime_hint
        );
        self.ticket = Some(ticket).filter(|t| !t.ticket.is_empty());
        self.expect_ticket = false;
        core.state = S::ServerSessionTicket;
        Ok(())
    }

    fn store_legacy_session(
        &self,
        core: &mut ConnectionCore,
        suite: &CipherSuiteInfo,
        version: ProtocolVersion,
        master: Secret,
    ) -> Result<(), TlsError> {
        let params = SessionParameters {
            session_id: core.params.session_id.clone(),
            cipher_suite: suite.suite,
            version,
            master_secret: master,
            peer_certificates: core.params.peer_certificates.clone(),
            extended_master_secret: core.params.extended_master_secret,
            alpn: core.params.alpn.clone(),
            server_extensions: self.server_extensions.clone(),
            server_name: self.config.server_name.clone(),
            created_at: now_secs(),
            psk: None,
            ticket: self.ticket.as_ref().map(|t| t.ticket.clone()),
            ticket_lifetime: self.ticket.as_ref().map_or(0, |t| t.lifetime_hint),
            ticket_age_add: 0,
        };
        if params.session_id.is_empty() && params.ticket.is_none() {
            core.session = Session::not_resumable(params);
            return Ok(());
        }
        if let (Some(cache), Some(name)) = (&self.config.session_cache, &self.config.server_name) {
            cache.put(name.as_bytes(), params.clone());
        }
        core.session = Session::new(params);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Modern flow
    // ------------------------------------------------------------------

    fn process_server_hello13(
        &mut self,
        core: &mut ConnectionCore,
        sh: &ServerHello,
        suite: &'static CipherSuiteInfo,
    ) -> Result<(), TlsError> {
        let hello = self.hello()?;
        if sh.session_id != hello.session_id {
            return Err(illegal("ServerHello session id mismatch"));
        }
        check_permitted_13(&sh.extensions, ExtensionContext::ServerHello)?;
        check_solicited(&sh.extensions, &hello.extensions, &[])?;

        let share = sh
            .extensions
            .get(ExtensionType::KEY_SHARE)
            .ok_or_else(|| {
                TlsError::fatal(AlertDescription::MissingExtension, "ServerHello without key_share")
            })
            .and_then(parse_key_share_sh)?;
        let agreement = self
            .key_shares
            .iter()
            .find(|k| k.group() == share.group)
            .ok_or_else(|| illegal(format!("key share for unoffered group 0x{:04x}", share.group.0)))?;
        let shared = agreement
            .compute_shared_secret(&share.key_exchange)
            .map_err(|_| illegal("invalid server key share"))?;
        core.params.negotiated_group = Some(share.group);

        let psk = match sh.extensions.get(ExtensionType::PRE_SHARED_KEY) {
            Some(data) => {
                let index = parse_pre_shared_key_sh(data)?;
                let offer = self
                    .psk
                    .as_ref()
                    .ok_or_else(|| illegal("pre_shared_key without an offer"))?;
                if index != 0 || offer.hash != suite.prf_hash {
                    return Err(illegal(format!("server selected PSK {index}")));
                }
                Some(offer.key.clone())
            }
            None => None,
        };
        self.psk_accepted = psk.is_some();

        let mut schedule = KeySchedule::new(core.provider(), suite.prf_hash);
        schedule.derive_early_secret(psk.as_deref().map(Vec::as_slice))?;
        schedule.derive_handshake_secret(&shared)?;
        drop(shared);
        let (client_hs, server_hs) =
            schedule.derive_handshake_traffic_secrets(&core.transcript.fork()?)?;
        core.set_read_secret(&server_hs)?;
        self.client_hs_secret = Some(client_hs);
        self.server_hs_secret = Some(server_hs);
        self.key_schedule = Some(schedule);
        self.key_shares.clear();

        if self.psk_accepted {
            if let Some(session) = self.resumption.as_ref().filter(|s| s.version.is_tls13()) {
                core.params.resumed = true;
                core.params.peer_certificates = session.peer_certificates.clone();
            }
            debug!("server accepted the PSK (resumed: {})", core.params.resumed);
        }
        core.params.session_id = sh.session_id.clone();
        core.state = S::ServerHello;
        Ok(())
    }

    fn on_encrypted_extensions(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        let ext = decode_encrypted_extensions(msg.body())?;
        check_permitted_13(&ext, ExtensionContext::EncryptedExtensions)?;
        check_solicited(&ext, &self.hello()?.extensions, &[])?;
        self.apply_negotiated_extensions(core, &ext)?;
        for (t, data) in ext.iter() {
            self.server_extensions.set(t, data.to_vec());
        }
        core.state = if self.psk_accepted {
            // No certificate exchange under a PSK.
            S::ServerCertificateVerify
        } else {
            S::ServerEncryptedExtensions
        };
        Ok(())
    }

    fn on_certificate_request13(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        let request = CertificateRequest13::decode(msg.body())?;
        check_permitted_13(&request.extensions, ExtensionContext::CertificateRequest)?;
        let schemes = request
            .extensions
            .get(ExtensionType::SIGNATURE_ALGORITHMS)
            .ok_or_else(|| {
                TlsError::fatal(
                    AlertDescription::MissingExtension,
                    "CertificateRequest without signature_algorithms",
                )
            })
            .and_then(parse_signature_algorithms)?;
        self.cert_request = Some(CertRequest {
            context: request.context,
            schemes: Some(schemes),
            certificate_types: Vec::new(),
        });
        core.state = S::ServerCertificateRequest;
        Ok(())
    }

    fn on_certificate13(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        let cert = CertificateMsg::decode(msg.body(), true)?;
        if cert.context.as_deref().is_some_and(|c| !c.is_empty()) {
            return Err(illegal("server Certificate with a request context"));
        }
        if cert.is_empty() {
            return Err(TlsError::fatal(
                AlertDescription::DecodeError,
                "empty server certificate",
            ));
        }
        for entry in &cert.entries {
            check_permitted_13(&entry.extensions, ExtensionContext::Certificate)?;
        }
        if let Some(status) = cert.entries[0].extensions.get(ExtensionType::STATUS_REQUEST) {
            if !self.config.status_request {
                return Err(TlsError::fatal(
                    AlertDescription::UnsupportedExtension,
                    "unsolicited OCSP response",
                ));
            }
            core.params.ocsp_response = Some(decode_certificate_status(status)?);
        }
        self.authenticate_server(core, cert.chain())?;
        core.state = S::ServerCertificate;
        Ok(())
    }

    fn on_certificate_verify13(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        let signed = decode_certificate_verify(msg.body(), true)?;
        let scheme = signed
            .algorithm
            .ok_or_else(|| TlsError::fatal(AlertDescription::DecodeError, "CertificateVerify without algorithm"))?;
        match &self.peer_key {
            Some(key) => verify_certificate_verify13(
                &*core.provider(),
                key,
                scheme,
                &signed.signature,
                &self.config.signature_algorithms,
                &core.transcript.fork()?,
                true,
            )?,
            None => trace!("skipping CertificateVerify check"),
        }
        core.transcript.update(&msg.encoding);
        core.state = S::ServerCertificateVerify;
        Ok(())
    }

    fn on_finished13(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        let suite = core.params.negotiated_suite()?;
        let hash = suite.prf_hash;
        let provider = core.provider();
        let server_hs = self
            .server_hs_secret
            .take()
            .ok_or_else(|| internal("no server handshake secret"))?;
        let received = decode_finished(msg.body(), hash.output_size())?;
        let expected =
            key_schedule::compute_verify_data(&*provider, hash, &server_hs, &core.transcript.fork()?)?;
        check_verify_data(&expected, received)?;
        core.params.server_verify_data = received.to_vec();
        core.transcript.update(&msg.encoding);

        let mut schedule = self
            .key_schedule
            .take()
            .ok_or_else(|| internal("no key schedule"))?;
        schedule.derive_master_secret()?;
        let server_finished_hash = core.transcript.fork()?;
        let (client_app, server_app) = schedule.derive_app_traffic_secrets(&server_finished_hash)?;
        core.params.exporter_master_secret =
            Some(schedule.derive_exporter_master_secret(&server_finished_hash)?);
        core.set_read_secret(&server_app)?;

        core.send_compat_ccs()?;
        let client_hs = self
            .client_hs_secret
            .take()
            .ok_or_else(|| internal("no client handshake secret"))?;
        core.set_write_secret(&client_hs)?;
        if let Some(request) = self.cert_request.take() {
            self.send_client_certificate13(core, &request)?;
        }
        let verify_data =
            key_schedule::compute_verify_data(&*provider, hash, &client_hs, &core.transcript.fork()?)?;
        core.send_handshake(T::Finished, &verify_data)?;
        core.params.client_verify_data = verify_data;
        core.set_write_secret(&client_app)?;
        core.params.client_app_secret = Some(client_app);
        core.params.server_app_secret = Some(server_app);
        core.params.resumption_master_secret =
            Some(schedule.derive_resumption_master_secret(&core.transcript.fork()?)?);

        core.session = Session::not_resumable(modern_session(core, suite, None, None)?);
        core.complete_handshake();
        Ok(())
    }

    fn send_client_certificate13(
        &self,
        core: &mut ConnectionCore,
        request: &CertRequest,
    ) -> Result<(), TlsError> {
        let (chain, signer) = self.client_credentials(core, request, ProtocolVersion::Tls13)?;
        let mut cert = CertificateMsg::from_chain(&chain, true);
        cert.context = Some(request.context.clone());
        core.send_handshake(T::Certificate, &cert.encode())?;
        let Some((signer, scheme)) = signer else {
            debug!("sent an empty client certificate");
            return Ok(());
        };
        let signature =
            sign_certificate_verify13(&*signer, scheme, &core.transcript.fork()?, false)?;
        let signed = DigitallySigned {
            algorithm: Some(scheme),
            signature,
        };
        core.send_handshake(T::CertificateVerify, &encode_certificate_verify(&signed))?;
        core.params.local_certificates = chain;
        Ok(())
    }
}

/// Session parameters for a TLS 1.3 connection, optionally carrying a ticket.
fn modern_session(
    core: &ConnectionCore,
    suite: &CipherSuiteInfo,
    psk: Option<Secret>,
    ticket: Option<&NewSessionTicket13>,
) -> Result<SessionParameters, TlsError> {
    Ok(SessionParameters {
        session_id: core.params.session_id.clone(),
        cipher_suite: suite.suite,
        version: core.params.negotiated_version()?,
        master_secret: secret(Vec::new()),
        peer_certificates: core.params.peer_certificates.clone(),
        extended_master_secret: false,
        alpn: core.params.alpn.clone(),
        server_extensions: ExtensionsMap::new(),
        server_name: core.config().server_name.clone(),
        created_at: now_secs(),
        psk,
        ticket: ticket.map(|t| t.ticket.clone()),
        ticket_lifetime: ticket.map_or(0, |t| t.lifetime),
        ticket_age_add: ticket.map_or(0, |t| t.age_add),
    })
}

/// Post-handshake NewSessionTicket: derive the resumption PSK and keep the
/// ticket as this connection's resumable session.
pub(crate) fn process_new_session_ticket(
    core: &mut ConnectionCore,
    msg: &HandshakeMessage,
) -> Result<(), TlsError> {
    let ticket = NewSessionTicket13::decode(msg.body())?;
    check_permitted_13(&ticket.extensions, ExtensionContext::NewSessionTicket)?;
    if ticket.lifetime == 0 {
        debug!("discarding ticket with zero lifetime");
        return Ok(());
    }
    let suite = core.params.negotiated_suite()?;
    let resumption_secret = core
        .params
        .resumption_master_secret
        .as_ref()
        .ok_or_else(|| internal("no resumption master secret"))?;
    let psk = key_schedule::resumption_psk(
        &*core.provider(),
        suite.prf_hash,
        resumption_secret,
        &ticket.nonce,
    )?;
    let params = modern_session(core, suite, Some(psk), Some(&ticket))?;
    let config = Arc::clone(core.config());
    if let (Some(cache), Some(name)) = (&config.session_cache, &config.server_name) {
        cache.put(name.as_bytes(), params.clone());
    }
    debug!("stored session ticket, lifetime {}s", ticket.lifetime);
    core.session = Session::new(params);
    Ok(())
}
