//! Server handshake orchestrator.
//!
//! The first ClientHello decides the flow. A TLS 1.3 negotiation may answer
//! it with a HelloRetryRequest and then expects a second ClientHello; a
//! legacy negotiation either resumes by session id or RFC 5077 ticket
//! (abbreviated handshake, server Finished first) or runs the full exchange
//! ending with the client's Finished.

use std::sync::Arc;

use log::{debug, trace};
use tlsengine_crypto::{PublicKey, Signer};
use tlsengine_types::{
    AlertDescription, NamedGroup, SignatureKeyKind, SignatureScheme, TlsError,
};

use super::codec::{
    decode_certificate_verify, decode_finished, decode_supplemental_data,
    encode_certificate_status, encode_certificate_verify, encode_encrypted_extensions,
    encode_supplemental_data, CertificateMsg, CertificateRequest12, CertificateRequest13,
    ClientHello, NewSessionTicket12, NewSessionTicket13, ServerHello, CERT_TYPE_ECDSA_SIGN, HELLO_RETRY_REQUEST_RANDOM, MAX_TICKET_LIFETIME,
};
use super::key_exchange::KeyExchange;
use super::negotiation::{
    apply_downgrade_sentinel, check_verify_data, select_alpn, select_cipher_suite, select_group,
    select_key_share, select_version, versions_from_legacy, KeyShareChoice,
};
use super::signing::{
    select_signature_scheme, sign_certificate_verify13, sign_server_params,
    verify_certificate_verify12, verify_certificate_verify13,
};
use super::{HandshakeMessage, HandshakeState, HandshakeType};
use crate::config::{ClientAuthMode, MaxFragmentLength, TlsConfig};
use crate::connection::{dispatch, ConnectionCore, HandlerTable, HandshakeFlow};
use crate::crypt::key_schedule::{self, KeySchedule};
use crate::crypt::key_schedule12::{
    self, CLIENT_FINISHED_LABEL, SERVER_FINISHED_LABEL, VERIFY_DATA_LEN,
};
use crate::crypt::transcript::hash_with;
use crate::crypt::{secret, AuthAlg, CipherClass, CipherSuiteInfo, PrfHash, Secret};
use crate::extensions::codec::{
    build_alpn, build_key_share_hrr, build_key_share_sh, build_cookie, build_ec_point_formats,
    build_pre_shared_key_sh, build_renegotiation_info, build_signature_algorithms,
    build_supported_versions_sh, parse_alpn, parse_cookie, parse_ec_point_formats, parse_empty,
    parse_key_share_ch, parse_max_fragment_length, parse_pre_shared_key_ch,
    parse_psk_key_exchange_modes, parse_renegotiation_info, parse_server_name,
    parse_signature_algorithms, parse_status_request, parse_supported_groups,
    parse_supported_versions_ch, KeyShareEntry, PskKeyExchangeMode,
};
use crate::extensions::{ExtensionType, ExtensionsMap};
use crate::record::TLS13_RECORD_VERSION;
use crate::session::{now_secs, Session, SessionParameters};
use crate::{CipherSuite, ProtocolVersion};

use HandshakeState as S;
use HandshakeType as T;

const COOKIE_LEN: usize = 16;
const TICKET_LEN: usize = 32;

static INITIAL: &HandlerTable<ServerHandshake> =
    &[(T::ClientHello, &[S::Start], ServerHandshake::on_client_hello)];

static LEGACY: &HandlerTable<ServerHandshake> = &[
    (T::SupplementalData, &[S::ServerHelloDone], ServerHandshake::on_supplemental_data),
    (
        T::Certificate,
        &[S::ServerHelloDone, S::ClientSupplementalData],
        ServerHandshake::on_certificate12,
    ),
    (
        T::ClientKeyExchange,
        &[S::ServerHelloDone, S::ClientSupplementalData, S::ClientCertificate],
        ServerHandshake::on_client_key_exchange,
    ),
    (T::CertificateVerify, &[S::ClientKeyExchange], ServerHandshake::on_certificate_verify12),
    (
        T::Finished,
        &[S::ClientKeyExchange, S::ClientCertificateVerify, S::ServerFinished],
        ServerHandshake::on_finished12,
    ),
];

static MODERN: &HandlerTable<ServerHandshake> = &[
    (T::ClientHello, &[S::ServerHelloRetryRequest], ServerHandshake::on_client_hello),
    (T::Certificate, &[S::ServerFinished], ServerHandshake::on_certificate13),
    (T::CertificateVerify, &[S::ClientCertificate], ServerHandshake::on_certificate_verify13),
    (
        T::Finished,
        &[S::ServerFinished, S::ClientCertificate, S::ClientCertificateVerify],
        ServerHandshake::on_finished13,
    ),
];

fn internal(what: &str) -> TlsError {
    TlsError::fatal(AlertDescription::InternalError, format!("server: {what}"))
}

fn illegal(reason: impl Into<String>) -> TlsError {
    TlsError::fatal(AlertDescription::IllegalParameter, reason)
}

fn unexpected(reason: impl Into<String>) -> TlsError {
    TlsError::fatal(AlertDescription::UnexpectedMessage, reason)
}

fn missing(reason: &str) -> TlsError {
    TlsError::fatal(AlertDescription::MissingExtension, reason.to_string())
}

/// Whether a signing key can authenticate a legacy suite.
fn key_fits_suite(kind: SignatureKeyKind, auth: AuthAlg) -> bool {
    match auth {
        AuthAlg::Anonymous => true,
        AuthAlg::Ecdsa => matches!(kind, SignatureKeyKind::Ecdsa | SignatureKeyKind::Ed25519),
        AuthAlg::Rsa => kind == SignatureKeyKind::Rsa,
    }
}

/// A PSK the server accepted from the client's offer.
struct AcceptedPsk {
    index: u16,
    key: Secret,
    /// Session behind a resumption ticket; `None` for an external PSK.
    session: Option<SessionParameters>,
}

/// The parts of a ClientHello both flows consult.
#[derive(Default)]
struct ClientOffer {
    groups: Vec<NamedGroup>,
    schemes: Option<Vec<SignatureScheme>>,
    alpn: Vec<Vec<u8>>,
    server_name: Option<String>,
    max_fragment_length: Option<MaxFragmentLength>,
    status_request: bool,
}

impl ClientOffer {
    fn parse(ch: &ClientHello) -> Result<Self, TlsError> {
        let ext = &ch.extensions;
        let mut offer = ClientOffer::default();
        if let Some(data) = ext.get(ExtensionType::SUPPORTED_GROUPS) {
            offer.groups = parse_supported_groups(data)?;
        }
        if let Some(data) = ext.get(ExtensionType::SIGNATURE_ALGORITHMS) {
            offer.schemes = Some(parse_signature_algorithms(data)?);
        }
        if let Some(data) = ext.get(ExtensionType::APPLICATION_LAYER_PROTOCOL_NEGOTIATION) {
            offer.alpn = parse_alpn(data)?;
        }
        if let Some(data) = ext.get(ExtensionType::SERVER_NAME) {
            offer.server_name = parse_server_name(data)?;
        }
        if let Some(data) = ext.get(ExtensionType::MAX_FRAGMENT_LENGTH) {
            let code = parse_max_fragment_length(data)?;
            offer.max_fragment_length = Some(
                MaxFragmentLength::from_code(code)
                    .ok_or_else(|| illegal(format!("max_fragment_length code {code}")))?,
            );
        }
        if let Some(data) = ext.get(ExtensionType::STATUS_REQUEST) {
            offer.status_request = parse_status_request(data)?;
        }
        Ok(offer)
    }
}

/// Server side of one handshake.
pub struct ServerHandshake {
    config: Arc<TlsConfig>,
    versions: Vec<ProtocolVersion>,
    offer: ClientOffer,
    /// First ClientHello, kept across a HelloRetryRequest.
    first_hello: Option<ClientHello>,
    /// Group and cookie sent in the HelloRetryRequest.
    retry: Option<(NamedGroup, Vec<u8>)>,
    retry_suite: Option<CipherSuite>,
    key_exchange: Option<KeyExchange>,
    key_schedule: Option<KeySchedule>,
    client_hs_secret: Option<Secret>,
    client_app_secret: Option<Secret>,
    server_app_secret: Option<Secret>,
    certificate_requested: bool,
    /// session_ticket acknowledged: issue a ticket before our Finished.
    issue_ticket: bool,
    /// Authenticated client key, once a non-empty Certificate arrived.
    peer_key: Option<PublicKey>,
}

impl ServerHandshake {
    pub fn new(config: &Arc<TlsConfig>) -> Self {
        Self {
            versions: config.versions(),
            config: Arc::clone(config),
            offer: ClientOffer::default(),
            first_hello: None,
            retry: None,
            retry_suite: None,
            key_exchange: None,
            key_schedule: None,
            client_hs_secret: None,
            client_app_secret: None,
            server_app_secret: None,
            certificate_requested: false,
            issue_ticket: false,
            peer_key: None,
        }
    }

    /// Nothing to send: wait for the ClientHello.
    pub(crate) fn start(&mut self, core: &mut ConnectionCore) -> Result<(), TlsError> {
        core.state = S::Start;
        Ok(())
    }

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

    fn signer(&self, core: &ConnectionCore) -> Result<Option<Box<dyn Signer>>, TlsError> {
        match &self.config.credentials {
            Some(creds) => Ok(Some(core.provider().new_signer(&creds.key)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // ClientHello
    // ------------------------------------------------------------------

    fn on_client_hello(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        let ch = ClientHello::decode(msg.body())?;
        let offered_versions = match ch.extensions.get(ExtensionType::SUPPORTED_VERSIONS) {
            Some(data) => parse_supported_versions_ch(data)?,
            None => versions_from_legacy(ch.legacy_version),
        };
        let version = select_version(&self.versions, &offered_versions)?;
        if self.retry.is_some() && !version.is_tls13() {
            return Err(illegal("second ClientHello dropped TLS 1.3"));
        }
        debug!("client offered {offered_versions:04x?}, selected {version}");
        self.offer = ClientOffer::parse(&ch)?;
        if version.is_tls13() {
            self.process_client_hello13(core, msg, ch)
        } else {
            self.process_client_hello12(core, msg, ch, version)
        }
    }

    /// max_fragment_length, server_name and ALPN answers, shared by the
    /// legacy ServerHello and EncryptedExtensions.
    fn negotiated_extensions(
        &self,
        core: &mut ConnectionCore,
        ext: &mut ExtensionsMap,
        full_handshake: bool,
    ) -> Result<(), TlsError> {
        if let Some(protocol) = select_alpn(&self.config.alpn_protocols, &self.offer.alpn)? {
            ext.insert(
                ExtensionType::APPLICATION_LAYER_PROTOCOL_NEGOTIATION,
                build_alpn(std::slice::from_ref(&protocol)),
            )?;
            core.params.alpn = Some(protocol);
        }
        if !full_handshake {
            return Ok(());
        }
        if let Some(mfl) = self.offer.max_fragment_length {
            ext.insert(ExtensionType::MAX_FRAGMENT_LENGTH, vec![mfl as u8])?;
            core.params.max_fragment_length = Some(mfl);
        }
        if let Some(name) = &self.offer.server_name {
            ext.insert(ExtensionType::SERVER_NAME, Vec::new())?;
            core.params.server_name = Some(name.clone());
        }
        Ok(())
    }

    fn apply_fragment_limit(&self, core: &mut ConnectionCore) {
        if let Some(mfl) = core.params.max_fragment_length {
            core.record.set_plaintext_limit(mfl.limit());
        }
    }

    // ------------------------------------------------------------------
    // Legacy flow
    // ------------------------------------------------------------------

    /// A cached session the client may resume at `version`, named by a
    /// session ticket or else by the session id. A ticket is only honoured
    /// alongside a session id, which the ServerHello echoes on acceptance.
    fn resumable_session(
        &self,
        ch: &ClientHello,
        version: ProtocolVersion,
        ems: bool,
    ) -> Option<SessionParameters> {
        if ch.session_id.is_empty() {
            return None;
        }
        let cache = self.config.session_cache.as_ref()?;
        let ticket = ch
            .extensions
            .get(ExtensionType::SESSION_TICKET)
            .filter(|t| self.config.session_tickets && !t.is_empty());
        let session = match ticket {
            Some(ticket) => {
                let mut session = cache.get(ticket)?;
                if session.is_expired(u64::from(session.ticket_lifetime)) {
                    debug!("session ticket expired");
                    return None;
                }
                session.session_id = ch.session_id.clone();
                session
            }
            None => cache.get(&ch.session_id)?,
        };
        if session.version != version
            || !ch.cipher_suites.contains(&session.cipher_suite)
            || !self.config.cipher_suites.contains(&session.cipher_suite)
        {
            debug!("cached session does not fit this ClientHello");
            return None;
        }
        if session.extended_master_secret != ems {
            debug!("extended master secret differs, falling back to a full handshake");
            return None;
        }
        if !ems && !self.config.allow_legacy_resumption {
            return None;
        }
        Some(session)
    }

    fn process_client_hello12(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
        ch: ClientHello,
        version: ProtocolVersion,
    ) -> Result<(), TlsError> {
        core.flow = HandshakeFlow::Legacy;
        core.transcript.update(&msg.encoding);
        if !ch.compression_methods.contains(&0) {
            return Err(illegal("null compression not offered"));
        }
        let max = self.versions.first().copied().ok_or_else(|| internal("no versions"))?;
        if ch.cipher_suites.contains(&CipherSuite::TLS_FALLBACK_SCSV) && version < max {
            return Err(TlsError::fatal(
                AlertDescription::InappropriateFallback,
                format!("fallback to {version} while {max} is supported"),
            ));
        }

        let ext = &ch.extensions;
        let mut secure_renegotiation =
            ch.cipher_suites.contains(&CipherSuite::TLS_EMPTY_RENEGOTIATION_INFO_SCSV);
        if let Some(data) = ext.get(ExtensionType::RENEGOTIATION_INFO) {
            parse_renegotiation_info(data)?;
            secure_renegotiation = true;
        }
        let client_point_formats = match ext.get(ExtensionType::EC_POINT_FORMATS) {
            Some(data) => {
                parse_ec_point_formats(data)?;
                true
            }
            None => false,
        };
        let client_ems = match ext.get(ExtensionType::EXTENDED_MASTER_SECRET) {
            Some(data) => {
                parse_empty(data, "extended_master_secret")?;
                true
            }
            None => false,
        };
        let client_etm = match ext.get(ExtensionType::ENCRYPT_THEN_MAC) {
            Some(data) => {
                parse_empty(data, "encrypt_then_mac")?;
                true
            }
            None => false,
        };
        let client_tickets = ext.get(ExtensionType::SESSION_TICKET).is_some();
        let ems = client_ems && self.config.extended_master_secret;
        if self.config.require_extended_master_secret && !ems {
            return Err(TlsError::fatal(
                AlertDescription::HandshakeFailure,
                "client did not offer extended master secret",
            ));
        }

        let provider = core.provider();
        let signer = self.signer(core)?;
        let group = if self.offer.groups.is_empty() {
            self.config.supported_groups.first().copied()
        } else {
            select_group(&self.config.supported_groups, &self.offer.groups)
        };
        let resumption = self.resumable_session(&ch, version, ems);
        let suite = match &resumption {
            Some(session) => crate::crypt::require_suite(session.cipher_suite)?,
            None => {
                let schemes = self.offer.schemes.as_deref();
                let psk_configured = self.config.psk.is_some();
                select_cipher_suite(&self.config.cipher_suites, &ch.cipher_suites, version, |info| {
                    if info.kx.uses_ecdhe() && group.is_none() {
                        return false;
                    }
                    if info.kx.is_psk() && !psk_configured {
                        return false;
                    }
                    if !info.kx.requires_certificate() {
                        return true;
                    }
                    signer.as_ref().is_some_and(|s| {
                        key_fits_suite(s.key_kind(), info.auth)
                            && select_signature_scheme(&**s, schemes, version).is_ok()
                    })
                })?
            }
        };

        let mut server_random = [0u8; 32];
        provider.fill_random(&mut server_random)?;
        apply_downgrade_sentinel(&mut server_random, max, version);
        let session_id = match &resumption {
            Some(session) => session.session_id.clone(),
            None if self.config.session_cache.is_some() => {
                let mut id = vec![0u8; 32];
                provider.fill_random(&mut id)?;
                id
            }
            None => Vec::new(),
        };
        let etm = client_etm && self.config.encrypt_then_mac && suite.class() == CipherClass::Block;

        core.params.version = Some(version);
        core.params.suite = Some(suite);
        core.params.client_random = ch.random;
        core.params.server_random = server_random;
        core.params.session_id = session_id.clone();
        core.params.secure_renegotiation = secure_renegotiation;
        core.params.extended_master_secret = ems;
        core.params.encrypt_then_mac = etm;
        core.transcript.notify_prf_determined(suite.prf_for(version))?;
        core.transcript.seal()?;

        let full = resumption.is_none();
        let mut extensions = ExtensionsMap::new();
        if secure_renegotiation {
            extensions.insert(ExtensionType::RENEGOTIATION_INFO, build_renegotiation_info())?;
        }
        if ems {
            extensions.insert(ExtensionType::EXTENDED_MASTER_SECRET, Vec::new())?;
        }
        if etm {
            extensions.insert(ExtensionType::ENCRYPT_THEN_MAC, Vec::new())?;
        }
        self.negotiated_extensions(core, &mut extensions, full)?;
        let ocsp = self
            .config
            .credentials
            .as_ref()
            .and_then(|c| c.ocsp_response.clone())
            .filter(|_| full && self.offer.status_request && suite.kx.requires_certificate());
        if full {
            if suite.kx.uses_ecdhe() && client_point_formats {
                extensions.insert(ExtensionType::EC_POINT_FORMATS, build_ec_point_formats())?;
            }
            if ocsp.is_some() {
                extensions.insert(ExtensionType::STATUS_REQUEST, Vec::new())?;
            }
            if client_tickets && self.config.session_tickets && self.config.session_cache.is_some()
            {
                extensions.insert(ExtensionType::SESSION_TICKET, Vec::new())?;
                self.issue_ticket = true;
            }
        }

        let sh = ServerHello {
            legacy_version: version.wire(),
            random: server_random,
            session_id,
            cipher_suite: suite.suite,
            compression_method: 0,
            extensions,
        };
        core.record.set_write_version(version.wire());
        core.send_handshake(T::ServerHello, &sh.encode())?;
        core.record.set_read_version(version.wire());
        self.apply_fragment_limit(core);
        debug!("negotiated {version} with {} (resuming: {})", suite.name, !full);

        if let Some(session) = resumption {
            core.params.resumed = true;
            core.params.peer_certificates = session.peer_certificates.clone();
            core.install_legacy_keys(&session.master_secret)?;
            core.send_change_cipher_spec()?;
            let verify_data = key_schedule12::compute_verify_data(
                &*provider,
                suite.prf_for(version),
                &session.master_secret,
                SERVER_FINISHED_LABEL,
                &core.transcript.fork()?,
            )?;
            core.send_handshake(T::Finished, &verify_data)?;
            core.params.server_verify_data = verify_data;
            core.params.master_secret = Some(session.master_secret.clone());
            core.session = Session::new(session);
            core.expect_ccs = true;
            core.state = S::ServerFinished;
            return Ok(());
        }

        let mut kx = KeyExchange::new(
            suite.kx,
            self.config.psk.as_ref(),
            self.config.psk_identity_hint.as_deref(),
        )?;
        if !self.config.supplemental_data.is_empty() {
            core.send_handshake(
                T::SupplementalData,
                &encode_supplemental_data(&self.config.supplemental_data),
            )?;
        }
        if suite.kx.requires_certificate() {
            let creds = self
                .config
                .credentials
                .as_ref()
                .ok_or_else(|| internal("certificate suite without credentials"))?;
            core.send_handshake(
                T::Certificate,
                &CertificateMsg::from_chain(&creds.chain, false).encode(),
            )?;
            core.params.local_certificates = creds.chain.clone();
            if let Some(ocsp) = &ocsp {
                core.send_handshake(T::CertificateStatus, &encode_certificate_status(ocsp))?;
            }
        }
        let peer_groups = if self.offer.groups.is_empty() {
            group.map(|g| vec![g]).unwrap_or_default()
        } else {
            self.offer.groups.clone()
        };
        if let Some(params) =
            kx.generate_server_key_exchange(&*provider, &self.config.supported_groups, &peer_groups)?
        {
            let mut body = params.clone();
            if kx.is_signed() {
                let signer = signer.as_ref().ok_or_else(|| internal("no signer"))?;
                let scheme =
                    select_signature_scheme(&**signer, self.offer.schemes.as_deref(), version)?;
                sign_server_params(
                    &**signer,
                    scheme,
                    version,
                    &core.params.client_random,
                    &core.params.server_random,
                    &params,
                )?
                .encode(&mut body);
            }
            core.send_handshake(T::ServerKeyExchange, &body)?;
        }
        core.params.negotiated_group = kx.group();
        if self.config.client_auth != ClientAuthMode::None && suite.kx.requires_certificate() {
            let request = CertificateRequest12 {
                certificate_types: vec![CERT_TYPE_ECDSA_SIGN],
                signature_algorithms: (version >= ProtocolVersion::Tls12)
                    .then(|| self.config.signature_algorithms.clone()),
                authorities: Vec::new(),
            };
            core.send_handshake(T::CertificateRequest, &request.encode())?;
            self.certificate_requested = true;
        }
        core.send_handshake(T::ServerHelloDone, &[])?;
        self.key_exchange = Some(kx);
        core.state = S::ServerHelloDone;
        Ok(())
    }

    fn authenticate_client(
        &mut self,
        core: &mut ConnectionCore,
        chain: Vec<Vec<u8>>,
    ) -> Result<(), TlsError> {
        let auth = self.config.authenticator.as_ref().ok_or_else(|| {
            TlsError::fatal(AlertDescription::CertificateUnknown, "no authenticator configured")
        })?;
        self.peer_key = Some(auth.authenticate(&chain, None)?);
        core.params.peer_certificates = chain;
        Ok(())
    }

    /// An empty client Certificate: fatal only when authentication is
    /// required.
    fn accept_empty_certificate(&self, version: ProtocolVersion) -> Result<(), TlsError> {
        if self.config.client_auth != ClientAuthMode::Required {
            debug!("client sent no certificate");
            return Ok(());
        }
        let alert = if version.is_tls13() {
            AlertDescription::CertificateRequired
        } else {
            AlertDescription::HandshakeFailure
        };
        Err(TlsError::fatal(alert, "client certificate required"))
    }

    fn on_supplemental_data(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        core.params.peer_supplemental_data = decode_supplemental_data(msg.body())?;
        trace!("client supplemental data: {} entries", core.params.peer_supplemental_data.len());
        core.state = S::ClientSupplementalData;
        Ok(())
    }

    fn on_certificate12(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        if !self.certificate_requested {
            return Err(unexpected("Certificate without CertificateRequest"));
        }
        let cert = CertificateMsg::decode(msg.body(), false)?;
        if cert.is_empty() {
            self.accept_empty_certificate(core.params.negotiated_version()?)?;
        } else {
            self.authenticate_client(core, cert.chain())?;
        }
        core.state = S::ClientCertificate;
        Ok(())
    }

    fn on_client_key_exchange(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        if self.certificate_requested
            && matches!(core.state, S::ServerHelloDone | S::ClientSupplementalData)
        {
            return Err(unexpected("ClientKeyExchange before Certificate"));
        }
        let suite = core.params.negotiated_suite()?;
        let version = core.params.negotiated_version()?;
        let mut kx = self
            .key_exchange
            .take()
            .ok_or_else(|| internal("no key exchange"))?;
        kx.process_client_key_exchange(msg.body())?;
        let premaster = kx.into_premaster_secret()?;
        let provider = core.provider();
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
        core.install_legacy_keys(&master)?;
        core.params.master_secret = Some(master);
        core.expect_ccs = true;
        core.state = S::ClientKeyExchange;
        Ok(())
    }

    fn on_certificate_verify12(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        let key = self
            .peer_key
            .as_ref()
            .ok_or_else(|| unexpected("CertificateVerify without a client certificate"))?;
        let version = core.params.negotiated_version()?;
        let signed = decode_certificate_verify(msg.body(), version >= ProtocolVersion::Tls12)?;
        verify_certificate_verify12(
            &*core.provider(),
            key,
            &signed,
            &self.config.signature_algorithms,
            version,
            core.transcript.messages()?,
        )?;
        core.transcript.update(&msg.encoding);
        core.state = S::ClientCertificateVerify;
        Ok(())
    }

    fn on_finished12(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        if core.state == S::ClientKeyExchange && self.peer_key.is_some() {
            return Err(unexpected("Finished before CertificateVerify"));
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
            CLIENT_FINISHED_LABEL,
            &core.transcript.fork()?,
        )?;
        check_verify_data(&expected, received)?;
        core.params.client_verify_data = received.to_vec();
        core.transcript.update(&msg.encoding);

        if !core.params.resumed {
            let mut params = self.session_parameters(core, suite, version, master.clone());
            if self.issue_ticket {
                self.send_ticket12(core, &mut params)?;
            }
            core.send_change_cipher_spec()?;
            let verify_data = key_schedule12::compute_verify_data(
                &*provider,
                prf,
                &master,
                SERVER_FINISHED_LABEL,
                &core.transcript.fork()?,
            )?;
            core.send_handshake(T::Finished, &verify_data)?;
            core.params.server_verify_data = verify_data;

            if params.session_id.is_empty() {
                core.session = Session::not_resumable(params);
            } else {
                if let Some(cache) = &self.config.session_cache {
                    cache.put(&params.session_id, params.clone());
                }
                core.session = Session::new(params);
            }
        }
        core.complete_handshake();
        Ok(())
    }

    /// Issue an RFC 5077 ticket: a random key into the session cache.
    fn send_ticket12(
        &self,
        core: &mut ConnectionCore,
        params: &mut SessionParameters,
    ) -> Result<(), TlsError> {
        let cache = self
            .config
            .session_cache
            .as_ref()
            .ok_or_else(|| internal("session ticket without a cache"))?;
        let mut ticket = vec![0u8; TICKET_LEN];
        core.provider().fill_random(&mut ticket)?;
        let nst = NewSessionTicket12 {
            lifetime_hint: self.config.session_lifetime,
            ticket: ticket.clone(),
        };
        core.send_handshake(T::NewSessionTicket, &nst.encode())?;
        params.ticket = Some(ticket.clone());
        params.ticket_lifetime = self.config.session_lifetime;
        cache.put(&ticket, params.clone());
        core.state = S::ServerSessionTicket;
        debug!("issued a session ticket");
        Ok(())
    }

    fn session_parameters(
        &self,
        core: &ConnectionCore,
        suite: &CipherSuiteInfo,
        version: ProtocolVersion,
        master_secret: Secret,
    ) -> SessionParameters {
        SessionParameters {
            session_id: core.params.session_id.clone(),
            cipher_suite: suite.suite,
            version,
            master_secret,
            peer_certificates: core.params.peer_certificates.clone(),
            extended_master_secret: core.params.extended_master_secret,
            alpn: core.params.alpn.clone(),
            server_extensions: ExtensionsMap::new(),
            server_name: core.params.server_name.clone(),
            created_at: now_secs(),
            psk: None,
            ticket: None,
            ticket_lifetime: 0,
            ticket_age_add: 0,
        }
    }

    // ------------------------------------------------------------------
    // Modern flow
    // ------------------------------------------------------------------

    /// Check the offered PSKs in order and accept the first whose binder
    /// verifies. `hello_encoding` is the full ClientHello message.
    fn accept_psk(
        &self,
        core: &ConnectionCore,
        ch: &ClientHello,
        hello_encoding: &[u8],
        suite: &CipherSuiteInfo,
    ) -> Result<Option<AcceptedPsk>, TlsError> {
        let Some(data) = ch.extensions.get(ExtensionType::PRE_SHARED_KEY) else {
            return Ok(None);
        };
        let modes = match ch.extensions.get(ExtensionType::PSK_KEY_EXCHANGE_MODES) {
            Some(modes) => parse_psk_key_exchange_modes(modes)?,
            None => return Err(missing("pre_shared_key without psk_key_exchange_modes")),
        };
        let dhe = PskKeyExchangeMode::PskDheKe;
        if !modes.contains(&(dhe as u8)) || !self.config.psk_key_exchange_modes.contains(&dhe) {
            debug!("no common PSK key exchange mode");
            return Ok(None);
        }
        let offered = parse_pre_shared_key_ch(data)?;
        let truncated = &hello_encoding[..hello_encoding.len() - offered.binders_len()];
        let mut binder_input = core.transcript.messages()?.to_vec();
        binder_input.extend_from_slice(truncated);
        let provider = core.provider();

        for (index, (identity, binder)) in
            offered.identities.iter().zip(&offered.binders).enumerate()
        {
            let (key, external, session) = match &self.config.psk {
                Some(psk) if psk.identity == identity.identity => {
                    (psk.key.clone(), true, None)
                }
                _ => match self.ticket_session(&identity.identity, suite) {
                    Some(session) => match session.psk.clone() {
                        Some(key) => (key, false, Some(session)),
                        None => continue,
                    },
                    None => continue,
                },
            };
            let hash = suite.prf_hash;
            if external && self.config.psk.as_ref().is_some_and(|p| p.hash != hash) {
                trace!("external PSK bound to another hash");
                continue;
            }
            let binder_hash = hash_with(&*provider, PrfHash::Single(hash), &binder_input)?;
            let expected = key_schedule::psk_binder(&provider, hash, &key, external, &binder_hash)?;
            check_verify_data(&expected, binder)?;
            debug!("accepted PSK {index} (external: {external})");
            return Ok(Some(AcceptedPsk {
                index: index as u16,
                key,
                session,
            }));
        }
        Ok(None)
    }

    fn ticket_session(&self, ticket: &[u8], suite: &CipherSuiteInfo) -> Option<SessionParameters> {
        let session = self.config.session_cache.as_ref()?.get(ticket)?;
        let fits = session.version.is_tls13()
            && session.ticket.as_deref() == Some(ticket)
            && crate::crypt::lookup_suite(session.cipher_suite)
                .is_some_and(|s| s.prf_hash == suite.prf_hash)
            && !session.is_expired(u64::from(session.ticket_lifetime));
        fits.then_some(session)
    }

    fn process_client_hello13(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
        ch: ClientHello,
    ) -> Result<(), TlsError> {
        if ch.compression_methods != [0] {
            return Err(illegal("TLS 1.3 ClientHello with compression"));
        }
        let suite = select_cipher_suite(
            &self.config.cipher_suites,
            &ch.cipher_suites,
            ProtocolVersion::Tls13,
            |info| info.is_tls13(),
        )?;
        let shares = ch
            .extensions
            .get(ExtensionType::KEY_SHARE)
            .ok_or_else(|| missing("ClientHello without key_share"))
            .and_then(parse_key_share_ch)?;
        if !ch.extensions.contains(ExtensionType::SUPPORTED_GROUPS) {
            return Err(missing("ClientHello without supported_groups"));
        }
        let choice = select_key_share(&self.config.supported_groups, &self.offer.groups, &shares)?;

        if let Some((group, cookie)) = &self.retry {
            let first = self.first_hello.as_ref().ok_or_else(|| internal("no first ClientHello"))?;
            if ch.session_id != first.session_id || Some(suite.suite) != self.retry_suite {
                return Err(illegal("second ClientHello differs from the first"));
            }
            let echoed = ch
                .extensions
                .get(ExtensionType::COOKIE)
                .map(parse_cookie)
                .transpose()?;
            if echoed.as_ref() != Some(cookie) {
                return Err(illegal("cookie mismatch"));
            }
            if shares.len() != 1 || shares[0].group != *group {
                return Err(illegal("second ClientHello ignored the requested group"));
            }
        }

        let index = match choice {
            KeyShareChoice::Share(index) => index,
            KeyShareChoice::Retry(_) if self.retry.is_some() => {
                return Err(illegal("no usable key share after HelloRetryRequest"))
            }
            KeyShareChoice::Retry(group) => {
                return self.send_hello_retry_request(core, msg, ch, suite, group)
            }
        };
        let share = &shares[index];

        core.flow = HandshakeFlow::Modern;
        core.params.version = Some(ProtocolVersion::Tls13);
        core.params.suite = Some(suite);
        core.params.client_random = ch.random;
        core.params.negotiated_group = Some(share.group);
        core.transcript.notify_prf_determined(PrfHash::Single(suite.prf_hash))?;
        core.transcript.seal()?;

        let psk = self.accept_psk(core, &ch, &msg.encoding, suite)?;
        core.transcript.update(&msg.encoding);
        let signer = match psk {
            Some(_) => None,
            None => {
                let signer = self.signer(core)?.ok_or_else(|| {
                    TlsError::fatal(AlertDescription::HandshakeFailure, "no certificate and no PSK")
                })?;
                let schemes = self
                    .offer
                    .schemes
                    .as_deref()
                    .ok_or_else(|| missing("ClientHello without signature_algorithms"))?;
                let scheme = select_signature_scheme(&*signer, Some(schemes), ProtocolVersion::Tls13)?;
                Some((signer, scheme))
            }
        };

        let provider = core.provider();
        let agreement = provider.generate_key_agreement(share.group)?;
        let shared = agreement
            .compute_shared_secret(&share.key_exchange)
            .map_err(|_| illegal("invalid client key share"))?;
        let mut server_random = [0u8; 32];
        provider.fill_random(&mut server_random)?;
        core.params.server_random = server_random;

        let mut extensions = ExtensionsMap::new();
        extensions.insert(
            ExtensionType::SUPPORTED_VERSIONS,
            build_supported_versions_sh(ProtocolVersion::Tls13),
        )?;
        extensions.insert(
            ExtensionType::KEY_SHARE,
            build_key_share_sh(&KeyShareEntry {
                group: share.group,
                key_exchange: agreement.public_key(),
            }),
        )?;
        if let Some(psk) = &psk {
            extensions.insert(ExtensionType::PRE_SHARED_KEY, build_pre_shared_key_sh(psk.index))?;
        }
        let sh = ServerHello {
            legacy_version: ProtocolVersion::Tls12.wire(),
            random: server_random,
            session_id: ch.session_id.clone(),
            cipher_suite: suite.suite,
            compression_method: 0,
            extensions,
        };
        core.record.set_write_version(TLS13_RECORD_VERSION);
        core.send_handshake(T::ServerHello, &sh.encode())?;
        core.record.set_read_version(TLS13_RECORD_VERSION);
        core.send_compat_ccs()?;
        core.params.session_id = ch.session_id.clone();

        let mut schedule = KeySchedule::new(Arc::clone(&provider), suite.prf_hash);
        schedule.derive_early_secret(psk.as_ref().map(|p| p.key.as_slice()))?;
        schedule.derive_handshake_secret(&shared)?;
        drop(shared);
        let (client_hs, server_hs) =
            schedule.derive_handshake_traffic_secrets(&core.transcript.fork()?)?;
        core.set_write_secret(&server_hs)?;
        core.set_read_secret(&client_hs)?;

        let mut ee = ExtensionsMap::new();
        self.negotiated_extensions(core, &mut ee, true)?;
        core.send_handshake(T::EncryptedExtensions, &encode_encrypted_extensions(&ee))?;
        self.apply_fragment_limit(core);

        if let Some(accepted) = &psk {
            if let Some(session) = &accepted.session {
                core.params.resumed = true;
                core.params.peer_certificates = session.peer_certificates.clone();
            }
        }
        if let Some((signer, scheme)) = signer {
            self.send_certificate_flight13(core, &*signer, scheme)?;
        }

        let verify_data = key_schedule::compute_verify_data(
            &*provider,
            suite.prf_hash,
            &server_hs,
            &core.transcript.fork()?,
        )?;
        core.send_handshake(T::Finished, &verify_data)?;
        core.params.server_verify_data = verify_data;

        schedule.derive_master_secret()?;
        let server_finished_hash = core.transcript.fork()?;
        let (client_app, server_app) = schedule.derive_app_traffic_secrets(&server_finished_hash)?;
        core.params.exporter_master_secret =
            Some(schedule.derive_exporter_master_secret(&server_finished_hash)?);
        core.set_write_secret(&server_app)?;
        self.client_hs_secret = Some(client_hs);
        self.client_app_secret = Some(client_app);
        self.server_app_secret = Some(server_app);
        self.key_schedule = Some(schedule);
        core.state = S::ServerFinished;
        Ok(())
    }

    fn send_hello_retry_request(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
        ch: ClientHello,
        suite: &'static CipherSuiteInfo,
        group: NamedGroup,
    ) -> Result<(), TlsError> {
        let provider = core.provider();
        let mut cookie = vec![0u8; COOKIE_LEN];
        provider.fill_random(&mut cookie)?;

        core.flow = HandshakeFlow::Modern;
        core.params.version = Some(ProtocolVersion::Tls13);
        core.params.suite = Some(suite);
        core.transcript.notify_prf_determined(PrfHash::Single(suite.prf_hash))?;
        core.transcript.update(&msg.encoding);
        core.transcript.adjust_for_retry()?;

        let mut extensions = ExtensionsMap::new();
        extensions.insert(
            ExtensionType::SUPPORTED_VERSIONS,
            build_supported_versions_sh(ProtocolVersion::Tls13),
        )?;
        extensions.insert(ExtensionType::KEY_SHARE, build_key_share_hrr(group))?;
        extensions.insert(ExtensionType::COOKIE, build_cookie(&cookie))?;
        let hrr = ServerHello {
            legacy_version: ProtocolVersion::Tls12.wire(),
            random: HELLO_RETRY_REQUEST_RANDOM,
            session_id: ch.session_id.clone(),
            cipher_suite: suite.suite,
            compression_method: 0,
            extensions,
        };
        core.record.set_write_version(TLS13_RECORD_VERSION);
        core.send_handshake(T::ServerHello, &hrr.encode())?;
        core.send_compat_ccs()?;
        debug!("sent HelloRetryRequest for group 0x{:04x}", group.0);

        self.retry = Some((group, cookie));
        self.retry_suite = Some(suite.suite);
        self.first_hello = Some(ch);
        core.state = S::ServerHelloRetryRequest;
        Ok(())
    }

    /// CertificateRequest (when configured), Certificate and
    /// CertificateVerify.
    fn send_certificate_flight13(
        &mut self,
        core: &mut ConnectionCore,
        signer: &dyn Signer,
        scheme: SignatureScheme,
    ) -> Result<(), TlsError> {
        let creds = self
            .config
            .credentials
            .as_ref()
            .ok_or_else(|| internal("no credentials"))?;
        if self.config.client_auth != ClientAuthMode::None {
            let mut extensions = ExtensionsMap::new();
            extensions.insert(
                ExtensionType::SIGNATURE_ALGORITHMS,
                build_signature_algorithms(&self.config.signature_algorithms),
            )?;
            let request = CertificateRequest13 {
                context: Vec::new(),
                extensions,
            };
            core.send_handshake(T::CertificateRequest, &request.encode())?;
            self.certificate_requested = true;
        }

        let mut cert = CertificateMsg::from_chain(&creds.chain, true);
        if let (true, Some(ocsp), Some(leaf)) = (
            self.offer.status_request,
            &creds.ocsp_response,
            cert.entries.first_mut(),
        ) {
            leaf.extensions
                .insert(ExtensionType::STATUS_REQUEST, encode_certificate_status(ocsp))?;
        }
        core.send_handshake(T::Certificate, &cert.encode())?;
        core.params.local_certificates = creds.chain.clone();

        let signature = sign_certificate_verify13(signer, scheme, &core.transcript.fork()?, true)?;
        let signed = super::codec::DigitallySigned {
            algorithm: Some(scheme),
            signature,
        };
        core.send_handshake(T::CertificateVerify, &encode_certificate_verify(&signed))
    }

    fn on_certificate13(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        if !self.certificate_requested {
            return Err(unexpected("Certificate without CertificateRequest"));
        }
        let cert = CertificateMsg::decode(msg.body(), true)?;
        if cert.context.as_deref().is_some_and(|c| !c.is_empty()) {
            return Err(illegal("client Certificate with a foreign request context"));
        }
        if cert.is_empty() {
            self.accept_empty_certificate(ProtocolVersion::Tls13)?;
        } else {
            self.authenticate_client(core, cert.chain())?;
        }
        core.state = S::ClientCertificate;
        Ok(())
    }

    fn on_certificate_verify13(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        let key = self
            .peer_key
            .as_ref()
            .ok_or_else(|| unexpected("CertificateVerify without a client certificate"))?;
        let signed = decode_certificate_verify(msg.body(), true)?;
        let scheme = signed.algorithm.ok_or_else(|| {
            TlsError::fatal(AlertDescription::DecodeError, "CertificateVerify without algorithm")
        })?;
        verify_certificate_verify13(
            &*core.provider(),
            key,
            scheme,
            &signed.signature,
            &self.config.signature_algorithms,
            &core.transcript.fork()?,
            false,
        )?;
        core.transcript.update(&msg.encoding);
        core.state = S::ClientCertificateVerify;
        Ok(())
    }

    fn on_finished13(
        &mut self,
        core: &mut ConnectionCore,
        msg: &HandshakeMessage,
    ) -> Result<(), TlsError> {
        if self.certificate_requested && core.state == S::ServerFinished {
            return Err(unexpected("Finished without the requested Certificate"));
        }
        if core.state == S::ClientCertificate && self.peer_key.is_some() {
            return Err(unexpected("Finished before CertificateVerify"));
        }
        let suite = core.params.negotiated_suite()?;
        let provider = core.provider();
        let client_hs = self
            .client_hs_secret
            .take()
            .ok_or_else(|| internal("no client handshake secret"))?;
        let received = decode_finished(msg.body(), suite.prf_hash.output_size())?;
        let expected = key_schedule::compute_verify_data(
            &*provider,
            suite.prf_hash,
            &client_hs,
            &core.transcript.fork()?,
        )?;
        check_verify_data(&expected, received)?;
        core.params.client_verify_data = received.to_vec();
        core.transcript.update(&msg.encoding);

        let client_app = self
            .client_app_secret
            .take()
            .ok_or_else(|| internal("no client application secret"))?;
        core.set_read_secret(&client_app)?;
        let schedule = self
            .key_schedule
            .take()
            .ok_or_else(|| internal("no key schedule"))?;
        let resumption_master = schedule.derive_resumption_master_secret(&core.transcript.fork()?)?;
        core.params.client_app_secret = Some(client_app);
        core.params.server_app_secret = self.server_app_secret.take();

        let base = self.session_parameters(core, suite, ProtocolVersion::Tls13, secret(Vec::new()));
        self.send_tickets(core, suite, &resumption_master, &base)?;
        core.params.resumption_master_secret = Some(resumption_master);
        core.session = Session::not_resumable(base);
        core.complete_handshake();
        Ok(())
    }

    /// Issue the configured number of tickets. Each ticket is an opaque
    /// random key into the session cache.
    fn send_tickets(
        &self,
        core: &mut ConnectionCore,
        suite: &CipherSuiteInfo,
        resumption_master: &[u8],
        base: &SessionParameters,
    ) -> Result<(), TlsError> {
        let Some(cache) = &self.config.session_cache else {
            return Ok(());
        };
        if self.config.send_tickets == 0 || self.config.psk_key_exchange_modes.is_empty() {
            return Ok(());
        }
        let provider = core.provider();
        let lifetime = self.config.session_lifetime.min(MAX_TICKET_LIFETIME);
        for n in 0..self.config.send_tickets {
            let mut ticket = vec![0u8; TICKET_LEN];
            provider.fill_random(&mut ticket)?;
            let mut age_add = [0u8; 4];
            provider.fill_random(&mut age_add)?;
            let nonce = (n as u64).to_be_bytes().to_vec();
            let psk = key_schedule::resumption_psk(&*provider, suite.prf_hash, resumption_master, &nonce)?;
            let nst = NewSessionTicket13 {
                lifetime,
                age_add: u32::from_be_bytes(age_add),
                nonce,
                ticket: ticket.clone(),
                extensions: ExtensionsMap::new(),
            };
            cache.put(
                &ticket,
                SessionParameters {
                    psk: Some(psk),
                    ticket: Some(ticket.clone()),
                    ticket_lifetime: lifetime,
                    ticket_age_add: nst.age_add,
                    ..base.clone()
                },
            );
            core.send_handshake(T::NewSessionTicket, &nst.encode())?;
        }
        debug!("issued {} session tickets", self.config.send_tickets);
        Ok(())
    }
}
