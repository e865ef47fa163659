//! Connection core: the record-driven state machine shared by both transport
//! drivers.
//!
//! Raw records go in through [`ConnectionCore::offer_input`] and sealed
//! records accumulate in an output queue. Reassembled handshake messages are
//! handed to the role orchestrator (`handshake::client` / `handshake::server`),
//! which calls back into the core to send its flights and switch keys.

pub mod transport;

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use log::{debug, error, trace, warn};
use tlsengine_crypto::CryptoProvider;
use tlsengine_types::{AlertDescription, NamedGroup, TlsError};

use crate::alert::{Alert, AlertLevel};
use crate::config::{AppDataSplitMode, MaxFragmentLength, TlsConfig};
use crate::crypt::key_schedule::{self, update_traffic_secret};
use crate::crypt::key_schedule12;
use crate::crypt::traffic_keys::TrafficKeys;
use crate::crypt::transcript::HandshakeHash;
use crate::crypt::{CipherClass, CipherSuiteInfo, Secret};
use crate::handshake::client::{self, ClientHandshake};
use crate::handshake::codec::{
    decode_key_update, SupplementalDataEntry, UPDATE_NOT_REQUESTED, UPDATE_REQUESTED,
};
use crate::handshake::server::ServerHandshake;
use crate::handshake::{
    peek_handshake_header, wrap_handshake, HandshakeMessage, HandshakeState, HandshakeType,
};
use crate::record::protection::RecordProtection;
use crate::record::{preview_record_header, ContentType, RecordLayer};
use crate::session::Session;
use crate::{CipherSuite, ProtocolVersion, TlsRole};

/// Consecutive KeyUpdates accepted without application data in between.
const MAX_KEY_UPDATES: u32 = 128;

/// Which handshake flow the connection is locked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFlow {
    /// No version negotiated yet.
    Undetermined,
    /// TLS 1.0 to 1.2.
    Legacy,
    /// TLS 1.3.
    Modern,
}

/// Coarse lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Handshaking,
    /// Application data may flow.
    Established,
    Closed,
    Failed,
}

/// Parameters negotiated by one handshake.
#[derive(Default)]
pub struct SecurityParameters {
    pub version: Option<ProtocolVersion>,
    pub suite: Option<&'static CipherSuiteInfo>,
    pub client_random: [u8; 32],
    pub server_random: [u8; 32],
    pub session_id: Vec<u8>,
    pub resumed: bool,
    pub alpn: Option<Vec<u8>>,
    pub max_fragment_length: Option<MaxFragmentLength>,
    pub extended_master_secret: bool,
    pub encrypt_then_mac: bool,
    pub secure_renegotiation: bool,
    pub negotiated_group: Option<NamedGroup>,
    pub server_name: Option<String>,
    pub local_certificates: Vec<Vec<u8>>,
    pub peer_certificates: Vec<Vec<u8>>,
    pub ocsp_response: Option<Vec<u8>>,
    /// Entries from the peer's SupplementalData message.
    pub peer_supplemental_data: Vec<SupplementalDataEntry>,
    pub client_verify_data: Vec<u8>,
    pub server_verify_data: Vec<u8>,
    pub(crate) master_secret: Option<Secret>,
    pub(crate) client_app_secret: Option<Secret>,
    pub(crate) server_app_secret: Option<Secret>,
    pub(crate) exporter_master_secret: Option<Secret>,
    pub(crate) resumption_master_secret: Option<Secret>,
}

impl SecurityParameters {
    pub(crate) fn negotiated_suite(&self) -> Result<&'static CipherSuiteInfo, TlsError> {
        self.suite
            .ok_or_else(|| TlsError::fatal(AlertDescription::InternalError, "no cipher suite"))
    }

    pub(crate) fn negotiated_version(&self) -> Result<ProtocolVersion, TlsError> {
        self.version
            .ok_or_else(|| TlsError::fatal(AlertDescription::InternalError, "no version"))
    }

    fn clear_secrets(&mut self) {
        self.master_secret = None;
        self.client_app_secret = None;
        self.server_app_secret = None;
        self.exporter_master_secret = None;
        self.resumption_master_secret = None;
    }
}

impl fmt::Debug for SecurityParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityParameters")
            .field("version", &self.version)
            .field("suite", &self.suite.map(|s| s.name))
            .field("resumed", &self.resumed)
            .field("alpn", &self.alpn)
            .field("extended_master_secret", &self.extended_master_secret)
            .field("encrypt_then_mac", &self.encrypt_then_mac)
            .field("negotiated_group", &self.negotiated_group)
            .finish_non_exhaustive()
    }
}

/// How the connection failed, kept to answer later reads.
#[derive(Debug, Clone)]
enum Failure {
    AlertSent { alert: AlertDescription, reason: String },
    AlertReceived(AlertDescription),
    Other,
}

impl Failure {
    fn to_error(&self) -> TlsError {
        match self {
            Failure::AlertSent { alert, reason } => TlsError::fatal(*alert, reason.clone()),
            Failure::AlertReceived(alert) => TlsError::AlertReceived(*alert),
            Failure::Other => TlsError::ConnectionClosed,
        }
    }
}

/// Handler for one handshake message in one orchestrator.
pub(crate) type Handler<H> =
    fn(&mut H, &mut ConnectionCore, &HandshakeMessage) -> Result<(), TlsError>;

/// Rows of `(message type, states it may arrive in, handler)`.
pub(crate) type HandlerTable<H> = [(HandshakeType, &'static [HandshakeState], Handler<H>)];

/// Route `msg` through `table`, or raise `unexpected_message`.
pub(crate) fn dispatch<H>(
    table: &HandlerTable<H>,
    orchestrator: &mut H,
    core: &mut ConnectionCore,
    msg: &HandshakeMessage,
) -> Result<(), TlsError> {
    let state = core.state;
    let compatible = match core.flow {
        HandshakeFlow::Legacy => state.is_legacy_compatible(),
        HandshakeFlow::Modern => state.is_modern_compatible(),
        HandshakeFlow::Undetermined => true,
    };
    if !compatible {
        return Err(TlsError::fatal(
            AlertDescription::InternalError,
            format!("state {state:?} outside the {:?} flow", core.flow),
        ));
    }
    let handler = table
        .iter()
        .find(|(msg_type, states, _)| *msg_type == msg.msg_type && states.contains(&state))
        .map(|(_, _, handler)| *handler)
        .ok_or_else(|| {
            TlsError::fatal(
                AlertDescription::UnexpectedMessage,
                format!("{:?} in state {state:?}", msg.msg_type),
            )
        })?;
    handler(orchestrator, core, msg)
}

enum Orchestrator {
    Client(Box<ClientHandshake>),
    Server(Box<ServerHandshake>),
}

impl Orchestrator {
    fn start(&mut self, core: &mut ConnectionCore) -> Result<(), TlsError> {
        match self {
            Orchestrator::Client(c) => c.start(core),
            Orchestrator::Server(s) => s.start(core),
        }
    }

    fn handle(&mut self, core: &mut ConnectionCore, msg: &HandshakeMessage) -> Result<(), TlsError> {
        match self {
            Orchestrator::Client(c) => c.handle(core, msg),
            Orchestrator::Server(s) => s.handle(core, msg),
        }
    }
}

/// Handshake messages that never enter the transcript.
fn never_hashed(msg_type: HandshakeType, flow: HandshakeFlow) -> bool {
    match msg_type {
        HandshakeType::HelloRequest | HandshakeType::KeyUpdate => true,
        HandshakeType::NewSessionTicket => flow == HandshakeFlow::Modern,
        _ => false,
    }
}

/// Messages the orchestrator hashes itself, once binders or retry rewriting
/// are settled.
fn hashed_by_handler(msg_type: HandshakeType) -> bool {
    matches!(
        msg_type,
        HandshakeType::ClientHello
            | HandshakeType::ServerHello
            | HandshakeType::Finished
            | HandshakeType::CertificateVerify
    )
}

fn unexpected(reason: impl Into<String>) -> TlsError {
    TlsError::fatal(AlertDescription::UnexpectedMessage, reason)
}

/// The protocol engine behind one TLS connection.
pub struct ConnectionCore {
    config: Arc<TlsConfig>,
    role: TlsRole,
    pub(crate) state: HandshakeState,
    pub(crate) flow: HandshakeFlow,
    status: ConnectionStatus,
    pub(crate) record: RecordLayer,
    pub(crate) transcript: HandshakeHash,
    pub(crate) params: SecurityParameters,
    pub(crate) session: Session,
    orchestrator: Option<Orchestrator>,
    /// Raw bytes not yet forming a complete record.
    input: Vec<u8>,
    handshake_queue: Vec<u8>,
    alert_queue: Vec<u8>,
    app_data: VecDeque<u8>,
    /// Sealed records waiting for the transport.
    output: Vec<u8>,
    /// Set by the orchestrator when a legacy ChangeCipherSpec is due next.
    pub(crate) expect_ccs: bool,
    pub(crate) ccs_received: bool,
    compat_ccs_sent: bool,
    /// Bumped whenever read keys change.
    read_epoch: u32,
    close_notify_sent: bool,
    close_notify_received: bool,
    input_closed: bool,
    key_update_pending: bool,
    key_updates_received: u32,
    empty_record_sent: bool,
    failure: Option<Failure>,
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("flow", &self.flow)
            .field("status", &self.status)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl ConnectionCore {
    pub fn new(config: Arc<TlsConfig>) -> Self {
        let transcript = HandshakeHash::new(Arc::clone(&config.provider));
        Self {
            role: config.role,
            config,
            state: HandshakeState::Start,
            flow: HandshakeFlow::Undetermined,
            status: ConnectionStatus::Idle,
            record: RecordLayer::new(),
            transcript,
            params: SecurityParameters::default(),
            session: Session::default(),
            orchestrator: None,
            input: Vec::new(),
            handshake_queue: Vec::new(),
            alert_queue: Vec::new(),
            app_data: VecDeque::new(),
            output: Vec::new(),
            expect_ccs: false,
            ccs_received: false,
            compat_ccs_sent: false,
            read_epoch: 0,
            close_notify_sent: false,
            close_notify_received: false,
            input_closed: false,
            key_update_pending: false,
            key_updates_received: 0,
            empty_record_sent: false,
            failure: None,
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn role(&self) -> TlsRole {
        self.role
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn flow(&self) -> HandshakeFlow {
        self.flow
    }

    pub fn is_handshaking(&self) -> bool {
        self.status == ConnectionStatus::Handshaking
    }

    /// True once application data may be exchanged.
    pub fn is_handshake_complete(&self) -> bool {
        self.status == ConnectionStatus::Established
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.status, ConnectionStatus::Closed | ConnectionStatus::Failed)
    }

    pub fn security_parameters(&self) -> &SecurityParameters {
        &self.params
    }

    pub fn version(&self) -> Option<ProtocolVersion> {
        self.params.version
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.params.suite.map(|s| s.suite)
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.params.alpn.as_deref()
    }

    pub fn peer_certificates(&self) -> &[Vec<u8>] {
        &self.params.peer_certificates
    }

    /// The session established or resumed by this connection.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn config(&self) -> &Arc<TlsConfig> {
        &self.config
    }

    pub(crate) fn provider(&self) -> Arc<dyn CryptoProvider> {
        Arc::clone(&self.config.provider)
    }

    /// RFC 5929 tls-unique: the first Finished of the handshake. Not
    /// defined for TLS 1.3, nor for a resumption without EMS.
    pub fn tls_unique(&self) -> Option<&[u8]> {
        if !self.is_handshake_complete() || self.params.version?.is_tls13() {
            return None;
        }
        if self.params.resumed {
            if !self.params.extended_master_secret {
                return None;
            }
            return Some(&self.params.server_verify_data);
        }
        Some(&self.params.client_verify_data)
    }

    /// Keying-material exporter (RFC 5705 / RFC 8446 §7.5).
    pub fn export_keying_material(
        &self,
        label: &str,
        context: Option<&[u8]>,
        length: usize,
    ) -> Result<Secret, TlsError> {
        if !self.is_handshake_complete() {
            return Err(TlsError::InvalidOperation("handshake not complete".into()));
        }
        let suite = self.params.negotiated_suite()?;
        let version = self.params.negotiated_version()?;
        let provider = &*self.config.provider;
        if version.is_tls13() {
            let ems = self.params.exporter_master_secret.as_ref().ok_or_else(|| {
                TlsError::InvalidOperation("exporter secret not available".into())
            })?;
            return key_schedule::export_keying_material(
                provider,
                suite.prf_hash,
                ems,
                label.as_bytes(),
                context.unwrap_or(&[]),
                length,
            );
        }
        if self.params.resumed && !self.params.extended_master_secret {
            return Err(TlsError::InvalidOperation(
                "exporter requires extended master secret on a resumed session".into(),
            ));
        }
        let master = self
            .params
            .master_secret
            .as_ref()
            .ok_or_else(|| TlsError::InvalidOperation("master secret not available".into()))?;
        key_schedule12::export_keying_material(
            provider,
            suite.prf_for(version),
            master,
            &self.params.client_random,
            &self.params.server_random,
            label,
            context,
            length,
        )
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the handshake in `role`. May only be called once.
    pub(crate) fn begin_handshake(&mut self, role: TlsRole) -> Result<(), TlsError> {
        if self.status != ConnectionStatus::Idle {
            return Err(TlsError::InvalidOperation("handshake already started".into()));
        }
        if role != self.role {
            return Err(TlsError::InvalidOperation(format!(
                "configuration is for the {:?} role",
                self.role
            )));
        }
        self.status = ConnectionStatus::Handshaking;
        debug!("starting {role:?} handshake");
        let result = self.start_orchestrator();
        result.map_err(|e| self.fail(e))
    }

    fn start_orchestrator(&mut self) -> Result<(), TlsError> {
        let mut orchestrator = match self.role {
            TlsRole::Client => Orchestrator::Client(Box::new(ClientHandshake::new(&self.config))),
            TlsRole::Server => Orchestrator::Server(Box::new(ServerHandshake::new(&self.config))),
        };
        orchestrator.start(self)?;
        self.orchestrator = Some(orchestrator);
        Ok(())
    }

    /// Called by an orchestrator once both Finished messages are verified.
    pub(crate) fn complete_handshake(&mut self) {
        self.state = HandshakeState::End;
        self.status = ConnectionStatus::Established;
        self.expect_ccs = false;
        self.transcript.stop_tracking();
        self.transcript.reset();
        debug!(
            "handshake complete: {} {} (resumed: {})",
            self.params.version.map_or_else(String::new, |v| v.to_string()),
            self.params.suite.map_or("", |s| s.name),
            self.params.resumed
        );
    }

    /// Tear the connection down after a fatal error, returning the error.
    ///
    /// Local misuse passes through untouched. Everything else sends a
    /// best-effort alert, invalidates the session and drops all handshake
    /// state.
    pub(crate) fn fail(&mut self, err: TlsError) -> TlsError {
        if err.is_local() || self.status == ConnectionStatus::Failed {
            return err;
        }
        let failure = match &err {
            TlsError::AlertReceived(alert) => {
                error!("peer sent fatal alert {}", alert.name());
                Failure::AlertReceived(*alert)
            }
            other => match other.alert() {
                Some(alert) => {
                    error!("raising fatal alert {}: {other}", alert.name());
                    if self.send_alert(Alert::fatal(alert)).is_err() {
                        trace!("could not send fatal alert");
                    }
                    Failure::AlertSent {
                        alert,
                        reason: other.to_string(),
                    }
                }
                None => {
                    error!("connection failed: {other}");
                    Failure::Other
                }
            },
        };
        self.failure = Some(failure);
        self.status = ConnectionStatus::Failed;
        self.invalidate_session();
        self.discard_handshake_state();
        self.input.clear();
        self.record.clear();
        err
    }

    fn discard_handshake_state(&mut self) {
        self.orchestrator = None;
        self.transcript.reset();
        self.handshake_queue.clear();
        self.alert_queue.clear();
        self.params.clear_secrets();
    }

    fn invalidate_session(&mut self) {
        if let (Some(params), Some(cache)) = (self.session.parameters(), &self.config.session_cache)
        {
            match self.role {
                TlsRole::Client => {
                    if let Some(name) = &params.server_name {
                        cache.remove(name.as_bytes());
                    }
                }
                TlsRole::Server => {
                    if !params.session_id.is_empty() {
                        cache.remove(&params.session_id);
                    }
                    if let Some(ticket) = &params.ticket {
                        cache.remove(ticket);
                    }
                }
            }
        }
        self.session.invalidate();
    }

    /// Error for an operation on a connection that can no longer be used.
    fn closed_error(&self) -> TlsError {
        TlsError::ConnectionClosed
    }

    /// Graceful close. Before completion this cancels the handshake.
    pub(crate) fn close(&mut self) -> Result<(), TlsError> {
        match self.status {
            ConnectionStatus::Closed | ConnectionStatus::Failed => Ok(()),
            ConnectionStatus::Idle => {
                self.status = ConnectionStatus::Closed;
                Ok(())
            }
            ConnectionStatus::Handshaking => {
                debug!("closing during handshake");
                let result = self
                    .send_alert(Alert::warning(AlertDescription::UserCanceled))
                    .and_then(|()| self.send_close_notify());
                self.session.invalidate();
                self.discard_handshake_state();
                self.status = ConnectionStatus::Closed;
                result
            }
            ConnectionStatus::Established => {
                let result = self.send_close_notify();
                self.status = ConnectionStatus::Closed;
                result
            }
        }
    }

    fn send_close_notify(&mut self) -> Result<(), TlsError> {
        if self.close_notify_sent {
            return Ok(());
        }
        self.close_notify_sent = true;
        self.send_alert(Alert::warning(AlertDescription::CloseNotify))
    }

    /// The transport reached end of stream.
    pub(crate) fn close_input(&mut self) -> Result<(), TlsError> {
        if self.input_closed {
            return Ok(());
        }
        self.input_closed = true;
        match self.status {
            ConnectionStatus::Handshaking => {
                let err = TlsError::fatal(
                    AlertDescription::InternalError,
                    "input closed during handshake",
                );
                Err(self.fail(err))
            }
            ConnectionStatus::Established if !self.input.is_empty() => {
                let err = TlsError::fatal(AlertDescription::DecodeError, "truncated record at end of input");
                Err(self.fail(err))
            }
            ConnectionStatus::Established => {
                warn!("input closed without close_notify");
                self.invalidate_session();
                self.status = ConnectionStatus::Closed;
                Ok(())
            }
            ConnectionStatus::Idle => {
                self.status = ConnectionStatus::Closed;
                Ok(())
            }
            ConnectionStatus::Closed | ConnectionStatus::Failed => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------

    /// Bytes held back because they do not yet form a whole record.
    pub(crate) fn buffered_input(&self) -> usize {
        self.input.len()
    }

    /// Total length of the record at the head of the input buffer, once its
    /// header is buffered. The record itself may still be incomplete.
    pub(crate) fn preview_input_record(&self) -> Result<Option<usize>, TlsError> {
        Ok(preview_record_header(&self.input)?.map(|h| h.record_len()))
    }

    /// Accept raw bytes from the transport and process every complete record.
    pub(crate) fn offer_input(&mut self, data: &[u8]) -> Result<(), TlsError> {
        match self.status {
            ConnectionStatus::Failed => return Err(self.closed_error()),
            ConnectionStatus::Closed => {
                trace!("dropping {} bytes after close", data.len());
                return Ok(());
            }
            ConnectionStatus::Idle => {
                return Err(TlsError::InvalidOperation("handshake not started".into()));
            }
            ConnectionStatus::Handshaking | ConnectionStatus::Established => {}
        }
        if self.input_closed {
            return Err(TlsError::InvalidOperation("input already closed".into()));
        }
        self.input.extend_from_slice(data);
        let result = self.process_buffered_records();
        result.map_err(|e| self.fail(e))
    }

    fn process_buffered_records(&mut self) -> Result<(), TlsError> {
        while let Some(header) = preview_record_header(&self.input)? {
            let len = header.record_len();
            if self.input.len() < len {
                break;
            }
            let record: Vec<u8> = self.input.drain(..len).collect();
            self.process_record(&record)?;
            if self.is_closed() {
                self.input.clear();
                break;
            }
        }
        Ok(())
    }

    fn process_record(&mut self, data: &[u8]) -> Result<(), TlsError> {
        let compat_ccs = data.first() == Some(&(ContentType::ChangeCipherSpec as u8))
            && self.flow == HandshakeFlow::Modern
            && self.record.is_decrypting();
        let (content_type, fragment) = if compat_ccs {
            RecordLayer::open_plaintext(data)?
        } else {
            self.record.open_record(data)?
        };
        trace!("received {content_type:?} record, {} bytes", fragment.len());
        if fragment.is_empty() && content_type != ContentType::ApplicationData {
            return Err(unexpected(format!("empty {content_type:?} record")));
        }
        match content_type {
            ContentType::Handshake => self.on_handshake_fragment(&fragment),
            ContentType::Alert => self.on_alert_fragment(&fragment),
            ContentType::ChangeCipherSpec => self.on_change_cipher_spec(&fragment),
            ContentType::ApplicationData => self.on_application_data(fragment),
        }
    }

    fn on_application_data(&mut self, data: Vec<u8>) -> Result<(), TlsError> {
        if !self.is_handshake_complete() {
            return Err(unexpected("application data before handshake completion"));
        }
        if !self.handshake_queue.is_empty() {
            return Err(unexpected("application data inside a handshake message"));
        }
        self.key_updates_received = 0;
        self.app_data.extend(data);
        Ok(())
    }

    fn on_change_cipher_spec(&mut self, fragment: &[u8]) -> Result<(), TlsError> {
        if self.flow == HandshakeFlow::Modern {
            if self.is_handshaking() && fragment == [1] {
                trace!("discarding compatibility ChangeCipherSpec");
                return Ok(());
            }
            return Err(unexpected("ChangeCipherSpec in TLS 1.3"));
        }
        if fragment != [1] {
            return Err(TlsError::fatal(
                AlertDescription::DecodeError,
                "malformed ChangeCipherSpec",
            ));
        }
        if !self.expect_ccs || self.ccs_received {
            return Err(unexpected("ChangeCipherSpec not expected"));
        }
        if !self.alert_queue.is_empty() || !self.handshake_queue.is_empty() {
            return Err(unexpected("ChangeCipherSpec inside a fragmented message"));
        }
        self.record.activate_pending_read()?;
        self.ccs_received = true;
        self.expect_ccs = false;
        self.read_epoch += 1;
        debug!("peer ChangeCipherSpec, read keys active");
        Ok(())
    }

    fn on_alert_fragment(&mut self, fragment: &[u8]) -> Result<(), TlsError> {
        self.alert_queue.extend_from_slice(fragment);
        while self.alert_queue.len() >= 2 {
            let bytes = [self.alert_queue[0], self.alert_queue[1]];
            self.alert_queue.drain(..2);
            self.on_alert(Alert::decode(bytes)?)?;
            if self.is_closed() {
                break;
            }
        }
        Ok(())
    }

    fn on_alert(&mut self, alert: Alert) -> Result<(), TlsError> {
        let desc = alert.description;
        if desc == AlertDescription::CloseNotify {
            if !self.is_handshake_complete() {
                return Err(TlsError::fatal(
                    AlertDescription::HandshakeFailure,
                    "close_notify during handshake",
                ));
            }
            debug!("peer sent close_notify");
            self.close_notify_received = true;
            self.send_close_notify()?;
            self.status = ConnectionStatus::Closed;
            return Ok(());
        }
        if alert.level == AlertLevel::Fatal {
            return Err(TlsError::AlertReceived(desc));
        }
        match desc {
            AlertDescription::NoCertificate => {
                Err(unexpected("no_certificate warning from a TLS peer"))
            }
            // Fatal only mid-handshake. Once established, a legacy peer's
            // no_renegotiation falls through to the ignored warnings below.
            AlertDescription::NoRenegotiation if self.is_handshaking() => Err(TlsError::fatal(
                AlertDescription::HandshakeFailure,
                "peer refused to negotiate",
            )),
            AlertDescription::UserCanceled => {
                warn!("peer sent user_canceled");
                Ok(())
            }
            // RFC 8446 §6: every other alert is an error alert.
            _ if self.flow == HandshakeFlow::Modern => Err(TlsError::AlertReceived(desc)),
            _ => {
                warn!("ignoring warning alert {}", desc.name());
                Ok(())
            }
        }
    }

    fn on_handshake_fragment(&mut self, fragment: &[u8]) -> Result<(), TlsError> {
        self.handshake_queue.extend_from_slice(fragment);
        let limit = self.config.handshake_message_limit();
        while let Some((msg_type, total)) = peek_handshake_header(&self.handshake_queue, limit)? {
            let encoding: Vec<u8> = self.handshake_queue.drain(..total).collect();
            let epoch = self.read_epoch;
            self.on_handshake_message(HandshakeMessage { msg_type, encoding })?;
            if self.is_closed() {
                break;
            }
            if self.read_epoch != epoch && !self.handshake_queue.is_empty() {
                return Err(unexpected("handshake data spans a key change"));
            }
        }
        Ok(())
    }

    fn on_handshake_message(&mut self, msg: HandshakeMessage) -> Result<(), TlsError> {
        trace!("handshake message {:?} ({} bytes) in {:?}", msg.msg_type, msg.body().len(), self.state);
        if self.is_handshake_complete() {
            return self.on_post_handshake(&msg);
        }
        if !self.is_handshaking() {
            return Err(unexpected(format!("{:?} outside a handshake", msg.msg_type)));
        }
        if msg.msg_type == HandshakeType::HelloRequest
            && self.role == TlsRole::Client
            && self.flow != HandshakeFlow::Modern
        {
            if !msg.body().is_empty() {
                return Err(TlsError::fatal(AlertDescription::DecodeError, "HelloRequest body"));
            }
            trace!("ignoring HelloRequest during handshake");
            return Ok(());
        }
        if !never_hashed(msg.msg_type, self.flow) && !hashed_by_handler(msg.msg_type) {
            self.transcript.update(&msg.encoding);
        }
        let mut orchestrator = self
            .orchestrator
            .take()
            .ok_or_else(|| TlsError::fatal(AlertDescription::InternalError, "no handshake in progress"))?;
        orchestrator.handle(self, &msg)?;
        if self.is_handshaking() {
            self.orchestrator = Some(orchestrator);
        }
        Ok(())
    }

    fn on_post_handshake(&mut self, msg: &HandshakeMessage) -> Result<(), TlsError> {
        match (self.role, self.flow, msg.msg_type) {
            (TlsRole::Client, HandshakeFlow::Legacy, HandshakeType::HelloRequest) => {
                if !msg.body().is_empty() {
                    return Err(TlsError::fatal(AlertDescription::DecodeError, "HelloRequest body"));
                }
                self.refuse_renegotiation()
            }
            (TlsRole::Server, HandshakeFlow::Legacy, HandshakeType::ClientHello) => {
                self.refuse_renegotiation()
            }
            (_, HandshakeFlow::Modern, HandshakeType::KeyUpdate) => self.on_key_update(msg),
            (TlsRole::Client, HandshakeFlow::Modern, HandshakeType::NewSessionTicket) => {
                client::process_new_session_ticket(self, msg)
            }
            _ => Err(unexpected(format!("{:?} after handshake", msg.msg_type))),
        }
    }

    fn refuse_renegotiation(&mut self) -> Result<(), TlsError> {
        warn!("refusing renegotiation");
        self.send_alert(Alert::warning(AlertDescription::NoRenegotiation))
    }

    fn on_key_update(&mut self, msg: &HandshakeMessage) -> Result<(), TlsError> {
        let update_requested = decode_key_update(msg.body())?;
        self.key_updates_received += 1;
        if self.key_updates_received > MAX_KEY_UPDATES {
            return Err(unexpected("too many KeyUpdate messages"));
        }
        let suite = self.params.negotiated_suite()?;
        let current = match self.role {
            TlsRole::Client => self.params.server_app_secret.as_ref(),
            TlsRole::Server => self.params.client_app_secret.as_ref(),
        }
        .ok_or_else(|| TlsError::fatal(AlertDescription::InternalError, "no traffic secret"))?;
        let next = update_traffic_secret(&*self.config.provider, suite.prf_hash, current)?;
        self.set_read_secret(&next)?;
        match self.role {
            TlsRole::Client => self.params.server_app_secret = Some(next),
            TlsRole::Server => self.params.client_app_secret = Some(next),
        }
        if update_requested {
            self.key_update_pending = true;
        }
        debug!("peer KeyUpdate (update_requested: {update_requested})");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    pub(crate) fn available_output(&self) -> usize {
        self.output.len()
    }

    /// Size of the next whole record in the output queue, or zero.
    pub(crate) fn preview_output_record(&self) -> usize {
        match preview_record_header(&self.output) {
            Ok(Some(header)) if self.output.len() >= header.record_len() => header.record_len(),
            _ => 0,
        }
    }

    pub(crate) fn read_output(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.output.len());
        buf[..n].copy_from_slice(&self.output[..n]);
        self.output.drain(..n);
        n
    }

    pub(crate) fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    fn write_record(&mut self, content_type: ContentType, fragment: &[u8]) -> Result<(), TlsError> {
        let record = self.record.seal_record(content_type, fragment)?;
        self.output.extend_from_slice(&record);
        Ok(())
    }

    fn write_fragmented(&mut self, content_type: ContentType, data: &[u8]) -> Result<(), TlsError> {
        let limit = self.record.plaintext_limit();
        for chunk in data.chunks(limit) {
            self.write_record(content_type, chunk)?;
        }
        Ok(())
    }

    pub(crate) fn send_alert(&mut self, alert: Alert) -> Result<(), TlsError> {
        trace!("sending {:?} alert {}", alert.level, alert.description.name());
        self.write_record(ContentType::Alert, &alert.encode())
    }

    /// Frame, hash and queue one handshake message.
    pub(crate) fn send_handshake(
        &mut self,
        msg_type: HandshakeType,
        body: &[u8],
    ) -> Result<(), TlsError> {
        let encoding = wrap_handshake(msg_type, body);
        if !never_hashed(msg_type, self.flow) {
            self.transcript.update(&encoding);
        }
        debug!("sending {msg_type:?} ({} bytes)", body.len());
        self.write_fragmented(ContentType::Handshake, &encoding)
    }

    /// Legacy ChangeCipherSpec: send, then switch to the pending write keys.
    pub(crate) fn send_change_cipher_spec(&mut self) -> Result<(), TlsError> {
        self.write_record(ContentType::ChangeCipherSpec, &[1])?;
        self.record.activate_pending_write()?;
        debug!("sent ChangeCipherSpec, write keys active");
        Ok(())
    }

    /// TLS 1.3 middlebox compatibility ChangeCipherSpec, sent at most once.
    pub(crate) fn send_compat_ccs(&mut self) -> Result<(), TlsError> {
        if self.compat_ccs_sent {
            return Ok(());
        }
        self.compat_ccs_sent = true;
        self.write_record(ContentType::ChangeCipherSpec, &[1])
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    /// Stage both directions of legacy record protection from the master
    /// secret. They become active on ChangeCipherSpec.
    pub(crate) fn install_legacy_keys(&mut self, master_secret: &[u8]) -> Result<(), TlsError> {
        let suite = self.params.negotiated_suite()?;
        let version = self.params.negotiated_version()?;
        let provider = self.provider();
        let block = key_schedule12::derive_key_block(
            &*provider,
            suite.prf_for(version),
            master_secret,
            &self.params.client_random,
            &self.params.server_random,
            suite,
            version,
        )?;
        let etm = self.params.encrypt_then_mac;
        let client = RecordProtection::tls12(
            &provider,
            suite,
            version,
            &block.client_mac_key,
            &block.client_key,
            &block.client_iv,
            etm,
        )?;
        let server = RecordProtection::tls12(
            &provider,
            suite,
            version,
            &block.server_mac_key,
            &block.server_key,
            &block.server_iv,
            etm,
        )?;
        match self.role {
            TlsRole::Client => self.record.set_pending(server, client),
            TlsRole::Server => self.record.set_pending(client, server),
        }
        Ok(())
    }

    fn tls13_protection(&self, traffic_secret: &[u8]) -> Result<RecordProtection, TlsError> {
        let suite = self.params.negotiated_suite()?;
        let provider = &*self.config.provider;
        let keys = TrafficKeys::derive(provider, suite, traffic_secret)?;
        RecordProtection::tls13(provider, suite, &keys)
    }

    /// Switch TLS 1.3 read protection to `traffic_secret`.
    pub(crate) fn set_read_secret(&mut self, traffic_secret: &[u8]) -> Result<(), TlsError> {
        let protection = self.tls13_protection(traffic_secret)?;
        self.record.set_read(protection);
        self.read_epoch += 1;
        Ok(())
    }

    /// Switch TLS 1.3 write protection to `traffic_secret`.
    pub(crate) fn set_write_secret(&mut self, traffic_secret: &[u8]) -> Result<(), TlsError> {
        let protection = self.tls13_protection(traffic_secret)?;
        self.record.set_write(protection);
        Ok(())
    }

    fn send_key_update(&mut self, update_requested: bool) -> Result<(), TlsError> {
        let body = [if update_requested {
            UPDATE_REQUESTED
        } else {
            UPDATE_NOT_REQUESTED
        }];
        // The KeyUpdate itself goes out under the old key.
        self.send_handshake(HandshakeType::KeyUpdate, &body)?;
        let suite = self.params.negotiated_suite()?;
        let current = match self.role {
            TlsRole::Client => self.params.client_app_secret.as_ref(),
            TlsRole::Server => self.params.server_app_secret.as_ref(),
        }
        .ok_or_else(|| TlsError::fatal(AlertDescription::InternalError, "no traffic secret"))?;
        let next = update_traffic_secret(&*self.config.provider, suite.prf_hash, current)?;
        self.set_write_secret(&next)?;
        match self.role {
            TlsRole::Client => self.params.client_app_secret = Some(next),
            TlsRole::Server => self.params.server_app_secret = Some(next),
        }
        self.key_update_pending = false;
        debug!("sent KeyUpdate (update_requested: {update_requested})");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Application data
    // ------------------------------------------------------------------

    /// Decrypted application bytes waiting to be read.
    pub(crate) fn available_app_data(&self) -> usize {
        self.app_data.len()
    }

    /// Copy queued application data into `buf`. Returns 0 when nothing is
    /// queued or the peer has closed.
    pub(crate) fn read_app_data(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        if self.app_data.is_empty() {
            return match self.status {
                ConnectionStatus::Failed => Err(self
                    .failure
                    .as_ref()
                    .map_or(TlsError::ConnectionClosed, Failure::to_error)),
                ConnectionStatus::Established | ConnectionStatus::Closed => Ok(0),
                ConnectionStatus::Idle | ConnectionStatus::Handshaking => Err(
                    TlsError::InvalidOperation("handshake not complete".into()),
                ),
            };
        }
        let n = buf.len().min(self.app_data.len());
        for (dst, src) in buf.iter_mut().zip(self.app_data.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    /// Seal `data` as application records. Returns the bytes consumed.
    pub(crate) fn write_app_data(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        match self.status {
            ConnectionStatus::Established => {}
            ConnectionStatus::Idle | ConnectionStatus::Handshaking => {
                return Err(TlsError::InvalidOperation(
                    "write before handshake completion".into(),
                ));
            }
            ConnectionStatus::Closed | ConnectionStatus::Failed => {
                return Err(self.closed_error());
            }
        }
        if data.is_empty() {
            return Ok(0);
        }
        let result = self.seal_app_data(data);
        result.map_err(|e| self.fail(e))
    }

    fn seal_app_data(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        if self.flow == HandshakeFlow::Modern {
            if self.key_update_pending {
                self.send_key_update(false)?;
            } else if self.record.write_sequence() >= self.config.key_update_threshold {
                self.send_key_update(true)?;
            }
        }
        let mut rest = data;
        if self.needs_record_split()? {
            match self.config.app_data_split_mode {
                AppDataSplitMode::OneAndRemainder => {
                    self.write_record(ContentType::ApplicationData, &rest[..1])?;
                    rest = &rest[1..];
                }
                AppDataSplitMode::EmptyFirst => {
                    self.write_record(ContentType::ApplicationData, &[])?;
                }
                AppDataSplitMode::EmptyFirstOnce => {
                    if !self.empty_record_sent {
                        self.write_record(ContentType::ApplicationData, &[])?;
                        self.empty_record_sent = true;
                    }
                }
            }
        }
        self.write_fragmented(ContentType::ApplicationData, rest)?;
        Ok(data.len())
    }

    /// CBC below TLS 1.1 chains the IV across records (BEAST).
    fn needs_record_split(&self) -> Result<bool, TlsError> {
        let version = self.params.negotiated_version()?;
        let suite = self.params.negotiated_suite()?;
        Ok(version < ProtocolVersion::Tls11 && suite.class() == CipherClass::Block)
    }
}
