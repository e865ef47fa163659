//! End-to-end scenarios: a client and a server connection exchanging bytes
//! in memory.

use std::sync::Arc;

use tlsengine_crypto::{CryptoProvider, PrivateKey, PublicKey, RustCryptoProvider};
use tlsengine_types::{AlertDescription, NamedGroup, TlsError};

use super::{ConnectionStatus, HandshakeFlow};
use crate::alert::Alert;
use crate::config::{
    AppDataSplitMode, ClientAuthMode, Credentials, MaxFragmentLength, PinnedKeyAuthenticator,
    PskConfig, TlsConfig, TlsConfigBuilder,
};
use crate::crypt::secret;
use crate::extensions::codec::{parse_cookie, parse_key_share_ch, parse_key_share_hrr};
use crate::extensions::ExtensionType;
use crate::handshake::codec::{ClientHello, ServerHello, SupplementalDataEntry};
use crate::session::{InMemorySessionCache, SessionCache};
use crate::{CipherSuite, NonBlockingConnection, ProtocolVersion, RecordTransport, TlsRole};

struct Identity {
    chain: Vec<Vec<u8>>,
    key: PrivateKey,
    public: PublicKey,
}

impl Identity {
    fn new(name: &str, key: PrivateKey) -> Self {
        let public = RustCryptoProvider::new()
            .new_signer(&key)
            .unwrap()
            .public_key();
        Self {
            chain: vec![format!("cert:{name}").into_bytes(), b"cert:issuer".to_vec()],
            key,
            public,
        }
    }

    fn ed25519(name: &str, seed: u8) -> Self {
        Self::new(name, PrivateKey::Ed25519([seed; 32]))
    }

    fn ecdsa(name: &str, seed: u8) -> Self {
        Self::new(name, PrivateKey::EcdsaP256([seed; 32]))
    }

    fn credentials(&self) -> Credentials {
        Credentials::new(self.chain.clone(), self.key.clone())
    }

    fn pinned(&self) -> Arc<PinnedKeyAuthenticator> {
        Arc::new(PinnedKeyAuthenticator::new().pin(self.chain[0].clone(), self.public.clone()))
    }
}

fn server_builder(id: &Identity) -> TlsConfigBuilder {
    TlsConfig::builder()
        .role(TlsRole::Server)
        .credentials(id.credentials())
}

fn client_builder(server: &Identity) -> TlsConfigBuilder {
    TlsConfig::builder()
        .role(TlsRole::Client)
        .authenticator(server.pinned())
        .server_name("server.test")
}

fn tls12(builder: TlsConfigBuilder) -> TlsConfigBuilder {
    builder
        .min_version(ProtocolVersion::Tls12)
        .max_version(ProtocolVersion::Tls12)
}

fn start(
    client: TlsConfigBuilder,
    server: TlsConfigBuilder,
) -> (NonBlockingConnection, NonBlockingConnection) {
    let mut c = NonBlockingConnection::new(Arc::new(client.build().unwrap()));
    let mut s = NonBlockingConnection::new(Arc::new(server.build().unwrap()));
    c.connect().unwrap();
    s.accept().unwrap();
    (c, s)
}

/// Shuttle records both ways until neither side has anything to send.
fn pump(c: &mut NonBlockingConnection, s: &mut NonBlockingConnection) -> Result<(), TlsError> {
    for _ in 0..32 {
        let to_server = c.drain_output();
        if !to_server.is_empty() {
            s.offer_input(&to_server)?;
        }
        let to_client = s.drain_output();
        if !to_client.is_empty() {
            c.offer_input(&to_client)?;
        }
        if to_server.is_empty() && to_client.is_empty() {
            return Ok(());
        }
    }
    panic!("connections did not settle");
}

fn connect(
    client: TlsConfigBuilder,
    server: TlsConfigBuilder,
) -> (NonBlockingConnection, NonBlockingConnection) {
    let (mut c, mut s) = start(client, server);
    pump(&mut c, &mut s).unwrap();
    assert!(c.is_handshake_complete());
    assert!(s.is_handshake_complete());
    (c, s)
}

fn send(from: &mut NonBlockingConnection, to: &mut NonBlockingConnection, data: &[u8]) -> Vec<u8> {
    assert_eq!(from.write_application_data(data).unwrap(), data.len());
    to.offer_input(&from.drain_output()).unwrap();
    let mut out = vec![0u8; to.available_application_bytes()];
    let n = to.read_application_data(&mut out).unwrap();
    out.truncate(n);
    // Replies such as a KeyUpdate go back to the sender.
    let back = to.drain_output();
    if !back.is_empty() {
        from.offer_input(&back).unwrap();
    }
    out
}

fn expect_alert<T: std::fmt::Debug>(result: Result<T, TlsError>, alert: AlertDescription) {
    let err = result.unwrap_err();
    assert_eq!(err.alert(), Some(alert), "unexpected error: {err}");
}

/// Content type and payload of each record in a flight.
fn records(mut flight: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut out = Vec::new();
    while flight.len() >= 5 {
        let len = usize::from(u16::from_be_bytes([flight[3], flight[4]]));
        out.push((flight[0], flight[5..5 + len].to_vec()));
        flight = &flight[5 + len..];
    }
    out
}

/// Plaintext handshake bytes at the start of a flight, up to the first
/// record of another type.
fn leading_handshake(flight: &[u8]) -> Vec<u8> {
    records(flight)
        .into_iter()
        .take_while(|(content_type, _)| *content_type == 22)
        .flat_map(|(_, payload)| payload)
        .collect()
}

/// Message type and body of each handshake message in `payload`.
fn messages(mut payload: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut out = Vec::new();
    while payload.len() >= 4 {
        let len = (usize::from(payload[1]) << 16) | (usize::from(payload[2]) << 8) | usize::from(payload[3]);
        out.push((payload[0], payload[4..4 + len].to_vec()));
        payload = &payload[4 + len..];
    }
    out
}

fn message_types(flight: &[u8]) -> Vec<u8> {
    messages(&leading_handshake(flight)).into_iter().map(|(t, _)| t).collect()
}

fn record_types(flight: &[u8]) -> Vec<u8> {
    records(flight).into_iter().map(|(t, _)| t).collect()
}

#[test]
fn test_tls13_full_handshake() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = connect(client_builder(&server), server_builder(&server));

    for conn in [c.connection(), s.connection()] {
        assert_eq!(conn.version(), Some(ProtocolVersion::Tls13));
        assert_eq!(conn.cipher_suite(), Some(CipherSuite::TLS_AES_128_GCM_SHA256));
        assert_eq!(conn.flow(), HandshakeFlow::Modern);
        assert_eq!(conn.status(), ConnectionStatus::Established);
        assert_eq!(conn.security_parameters().negotiated_group, Some(NamedGroup::X25519));
        assert!(!conn.security_parameters().resumed);
    }
    assert_eq!(c.connection().peer_certificates(), server.chain.as_slice());
    assert!(s.connection().peer_certificates().is_empty());
    assert_eq!(
        s.connection().security_parameters().server_name.as_deref(),
        Some("server.test")
    );

    assert_eq!(send(&mut c, &mut s, b"ping"), b"ping");
    assert_eq!(send(&mut s, &mut c, b"pong"), b"pong");
}

#[test]
fn test_tls13_ecdsa_server_key() {
    let server = Identity::ecdsa("server", 0x22);
    let (mut c, mut s) = connect(client_builder(&server), server_builder(&server));
    assert_eq!(c.connection().version(), Some(ProtocolVersion::Tls13));
    assert_eq!(send(&mut c, &mut s, b"hello"), b"hello");
}

#[test]
fn test_tls13_unknown_server_certificate() {
    let server = Identity::ed25519("server", 0x11);
    let other = Identity::ed25519("other", 0x12);
    let (mut c, mut s) = start(client_builder(&other), server_builder(&server));
    expect_alert(pump(&mut c, &mut s), AlertDescription::BadCertificate);
    assert_eq!(c.connection().status(), ConnectionStatus::Failed);
}

#[test]
fn test_tls13_wrong_pinned_key_fails_certificate_verify() {
    let server = Identity::ed25519("server", 0x11);
    let imposter = Identity::ed25519("server", 0x13);
    let (mut c, mut s) = start(client_builder(&imposter), server_builder(&server));
    expect_alert(pump(&mut c, &mut s), AlertDescription::DecryptError);
}

#[test]
fn test_hello_retry_request() {
    let server = Identity::ed25519("server", 0x11);
    let client = client_builder(&server)
        .supported_groups(&[NamedGroup::X25519, NamedGroup::SECP256R1])
        .key_share_groups(&[NamedGroup::X25519]);
    let srv = server_builder(&server).supported_groups(&[NamedGroup::SECP256R1]);
    let (mut c, mut s) = connect(client, srv);

    for conn in [c.connection(), s.connection()] {
        assert_eq!(conn.version(), Some(ProtocolVersion::Tls13));
        assert_eq!(
            conn.security_parameters().negotiated_group,
            Some(NamedGroup::SECP256R1)
        );
    }
    assert_eq!(send(&mut c, &mut s, b"after retry"), b"after retry");
}

#[test]
fn test_hello_retry_request_echoes_cookie_and_requested_share() {
    let server = Identity::ed25519("server", 0x11);
    let client = client_builder(&server)
        .supported_groups(&[NamedGroup::X25519, NamedGroup::SECP256R1])
        .key_share_groups(&[NamedGroup::X25519]);
    let srv = server_builder(&server).supported_groups(&[NamedGroup::SECP256R1]);
    let (mut c, mut s) = start(client, srv);

    s.offer_input(&c.drain_output()).unwrap();
    let retry_flight = s.drain_output();
    assert_eq!(record_types(&retry_flight), [22, 20]);
    let (msg_type, body) = messages(&leading_handshake(&retry_flight)).remove(0);
    assert_eq!(msg_type, 2);
    let hrr = ServerHello::decode(&body).unwrap();
    assert!(hrr.is_hello_retry_request());
    let group = parse_key_share_hrr(hrr.extensions.get(ExtensionType::KEY_SHARE).unwrap()).unwrap();
    assert_eq!(group, NamedGroup::SECP256R1);
    let cookie = parse_cookie(hrr.extensions.get(ExtensionType::COOKIE).unwrap()).unwrap();

    c.offer_input(&retry_flight).unwrap();
    let second_flight = c.drain_output();
    // Compatibility ChangeCipherSpec, then the second ClientHello.
    assert_eq!(record_types(&second_flight), [20, 22]);
    let (_, hello) = records(&second_flight).remove(1);
    let (msg_type, body) = messages(&hello).remove(0);
    assert_eq!(msg_type, 1);
    let ch2 = ClientHello::decode(&body).unwrap();
    let echoed = parse_cookie(ch2.extensions.get(ExtensionType::COOKIE).unwrap()).unwrap();
    assert_eq!(echoed, cookie);
    let shares = parse_key_share_ch(ch2.extensions.get(ExtensionType::KEY_SHARE).unwrap()).unwrap();
    assert_eq!(shares.len(), 1);
    assert_eq!(shares[0].group, NamedGroup::SECP256R1);

    // The answer to the second ClientHello is a real ServerHello.
    s.offer_input(&second_flight).unwrap();
    let server_flight = s.drain_output();
    let (msg_type, body) = messages(&records(&server_flight)[0].1).remove(0);
    assert_eq!(msg_type, 2);
    assert!(!ServerHello::decode(&body).unwrap().is_hello_retry_request());
    c.offer_input(&server_flight).unwrap();
    pump(&mut c, &mut s).unwrap();
    assert!(c.is_handshake_complete());
    assert!(s.is_handshake_complete());
}

#[test]
fn test_second_hello_retry_request_rejected() {
    let server = Identity::ed25519("server", 0x11);
    let client = client_builder(&server)
        .supported_groups(&[NamedGroup::X25519, NamedGroup::SECP256R1])
        .key_share_groups(&[NamedGroup::X25519]);
    let srv = server_builder(&server).supported_groups(&[NamedGroup::SECP256R1]);
    let (mut c, mut s) = start(client, srv);

    s.offer_input(&c.drain_output()).unwrap();
    let retry_flight = s.drain_output();
    c.offer_input(&retry_flight).unwrap();
    c.drain_output();

    let len = usize::from(u16::from_be_bytes([retry_flight[3], retry_flight[4]]));
    let hrr_record = &retry_flight[..5 + len];
    expect_alert(c.offer_input(hrr_record), AlertDescription::UnexpectedMessage);
}

#[test]
fn test_certificate_before_server_hello_is_unexpected() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, _s) = start(client_builder(&server), server_builder(&server));
    c.drain_output();
    // An empty Certificate message where the ServerHello belongs.
    let record = [22, 3, 3, 0, 7, 11, 0, 0, 3, 0, 0, 0];
    expect_alert(c.offer_input(&record), AlertDescription::UnexpectedMessage);
    assert_eq!(c.connection().status(), ConnectionStatus::Failed);
}

#[test]
fn test_no_common_group() {
    let server = Identity::ed25519("server", 0x11);
    let client = client_builder(&server).supported_groups(&[NamedGroup::X25519]);
    let srv = server_builder(&server).supported_groups(&[NamedGroup::SECP256R1]);
    let (mut c, mut s) = start(client, srv);
    expect_alert(pump(&mut c, &mut s), AlertDescription::HandshakeFailure);

    // The server's alert reaches the client.
    let err = c.offer_input(&s.drain_output()).unwrap_err();
    assert!(matches!(err, TlsError::AlertReceived(AlertDescription::HandshakeFailure)));
}

#[test]
fn test_no_common_cipher_suite() {
    let server = Identity::ed25519("server", 0x11);
    let client = client_builder(&server).cipher_suites(&[CipherSuite::TLS_AES_256_GCM_SHA384]);
    let srv = server_builder(&server).cipher_suites(&[CipherSuite::TLS_AES_128_GCM_SHA256]);
    let (mut c, mut s) = start(client, srv);
    expect_alert(pump(&mut c, &mut s), AlertDescription::HandshakeFailure);
}

#[test]
fn test_tls12_full_handshake() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = connect(tls12(client_builder(&server)), tls12(server_builder(&server)));

    for conn in [c.connection(), s.connection()] {
        assert_eq!(conn.version(), Some(ProtocolVersion::Tls12));
        assert_eq!(
            conn.cipher_suite(),
            Some(CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256)
        );
        assert_eq!(conn.flow(), HandshakeFlow::Legacy);
        let params = conn.security_parameters();
        assert!(params.extended_master_secret);
        assert!(params.secure_renegotiation);
        assert!(!params.encrypt_then_mac);
    }
    assert_eq!(c.connection().peer_certificates(), server.chain.as_slice());
    assert_eq!(send(&mut c, &mut s, b"GET /"), b"GET /");
    assert_eq!(send(&mut s, &mut c, b"200 OK"), b"200 OK");
}

#[test]
fn test_tls12_message_order_and_finished_agree() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = start(tls12(client_builder(&server)), tls12(server_builder(&server)));

    s.offer_input(&c.drain_output()).unwrap();
    let server_flight = s.drain_output();
    // ServerHello, Certificate, ServerKeyExchange, ServerHelloDone.
    assert_eq!(message_types(&server_flight), [2, 11, 12, 14]);

    c.offer_input(&server_flight).unwrap();
    let client_flight = c.drain_output();
    assert_eq!(record_types(&client_flight), [22, 20, 22]);
    assert_eq!(message_types(&client_flight), [16]);

    s.offer_input(&client_flight).unwrap();
    let final_flight = s.drain_output();
    assert_eq!(record_types(&final_flight), [20, 22]);
    c.offer_input(&final_flight).unwrap();
    assert!(c.is_handshake_complete());
    assert!(s.is_handshake_complete());

    let client = c.connection().security_parameters();
    let server = s.connection().security_parameters();
    assert_eq!(client.client_verify_data.len(), 12);
    assert_eq!(client.server_verify_data.len(), 12);
    assert_eq!(client.client_verify_data, server.client_verify_data);
    assert_eq!(client.server_verify_data, server.server_verify_data);
    assert_ne!(client.client_verify_data, client.server_verify_data);
}

#[test]
fn test_tls13_client_falls_back_to_tls12_server() {
    let server = Identity::ed25519("server", 0x11);
    let (c, s) = connect(client_builder(&server), tls12(server_builder(&server)));
    assert_eq!(c.connection().version(), Some(ProtocolVersion::Tls12));
    assert_eq!(s.connection().version(), Some(ProtocolVersion::Tls12));
}

#[test]
fn test_tls12_cbc_uses_encrypt_then_mac() {
    let server = Identity::ecdsa("server", 0x22);
    let suite = CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256;
    let (mut c, mut s) = connect(
        tls12(client_builder(&server)).cipher_suites(&[suite]),
        tls12(server_builder(&server)),
    );
    assert_eq!(c.connection().cipher_suite(), Some(suite));
    assert!(c.connection().security_parameters().encrypt_then_mac);
    assert!(s.connection().security_parameters().encrypt_then_mac);
    assert_eq!(send(&mut c, &mut s, b"block cipher"), b"block cipher");
}

#[test]
fn test_unsupported_version() {
    let server = Identity::ecdsa("server", 0x22);
    let client = client_builder(&server)
        .min_version(ProtocolVersion::Tls10)
        .max_version(ProtocolVersion::Tls11);
    let (mut c, mut s) = start(client, server_builder(&server));
    expect_alert(pump(&mut c, &mut s), AlertDescription::ProtocolVersion);
}

#[test]
fn test_fallback_scsv_rejected() {
    let server = Identity::ed25519("server", 0x11);
    let client = tls12(client_builder(&server)).fallback(true);
    let (mut c, mut s) = start(client, server_builder(&server));
    expect_alert(pump(&mut c, &mut s), AlertDescription::InappropriateFallback);
}

#[test]
fn test_required_extended_master_secret() {
    let server = Identity::ed25519("server", 0x11);
    let client = tls12(client_builder(&server)).extended_master_secret(false);
    let srv = tls12(server_builder(&server)).require_extended_master_secret(true);
    let (mut c, mut s) = start(client, srv);
    expect_alert(pump(&mut c, &mut s), AlertDescription::HandshakeFailure);
}

#[test]
fn test_tls12_without_extended_master_secret() {
    let server = Identity::ed25519("server", 0x11);
    let client = tls12(client_builder(&server)).extended_master_secret(false);
    let (c, s) = connect(client, tls12(server_builder(&server)));
    assert!(!c.connection().security_parameters().extended_master_secret);
    assert!(!s.connection().security_parameters().extended_master_secret);
}

#[test]
fn test_tls12_session_id_resumption() {
    let server = Identity::ed25519("server", 0x11);
    let cache: Arc<dyn SessionCache> = Arc::new(InMemorySessionCache::new(8));
    let srv = || tls12(server_builder(&server)).session_cache(Arc::clone(&cache));

    let (first, _) = connect(tls12(client_builder(&server)), srv());
    let session = first.connection().session().clone();
    assert!(session.is_resumable());
    assert_eq!(session.session_id().len(), 32);

    let (mut c, mut s) = connect(
        tls12(client_builder(&server)).resumption_session(session.clone()),
        srv(),
    );
    for conn in [c.connection(), s.connection()] {
        assert!(conn.security_parameters().resumed);
        assert_eq!(conn.security_parameters().session_id, session.session_id());
    }
    let original = &session.parameters().unwrap().master_secret;
    for conn in [c.connection(), s.connection()] {
        let resumed = conn.security_parameters().master_secret.as_ref().unwrap();
        assert_eq!(resumed.as_slice(), original.as_slice());
    }
    assert_eq!(c.connection().peer_certificates(), server.chain.as_slice());
    assert_eq!(send(&mut c, &mut s, b"resumed"), b"resumed");
}

#[test]
fn test_tls12_ticket_resumption() {
    let server = Identity::ed25519("server", 0x11);
    let cache: Arc<dyn SessionCache> = Arc::new(InMemorySessionCache::new(8));
    let srv = || {
        tls12(server_builder(&server))
            .session_cache(Arc::clone(&cache))
            .session_tickets(true)
    };
    let client = || tls12(client_builder(&server)).session_tickets(true);

    let (mut c, mut s) = start(client(), srv());
    s.offer_input(&c.drain_output()).unwrap();
    c.offer_input(&s.drain_output()).unwrap();
    s.offer_input(&c.drain_output()).unwrap();
    let final_flight = s.drain_output();
    // NewSessionTicket precedes the server's ChangeCipherSpec and Finished.
    assert_eq!(record_types(&final_flight), [22, 20, 22]);
    assert_eq!(message_types(&final_flight), [4]);
    c.offer_input(&final_flight).unwrap();
    assert!(c.is_handshake_complete());

    let session = c.connection().session().clone();
    assert!(session.is_resumable());
    let params = session.parameters().unwrap();
    let ticket = params.ticket.clone().unwrap();
    assert_eq!(ticket.len(), 32);
    assert_eq!(params.ticket_lifetime, 7200);
    assert!(cache.get(&ticket).is_some());

    let (mut c, mut s) = connect(client().resumption_session(session.clone()), srv());
    for conn in [c.connection(), s.connection()] {
        assert!(conn.security_parameters().resumed);
        // Accepted through the ticket: the echoed id is the client's fresh one.
        assert_eq!(conn.security_parameters().session_id.len(), 32);
        assert_ne!(conn.security_parameters().session_id, session.session_id());
    }
    assert_eq!(c.connection().peer_certificates(), server.chain.as_slice());
    assert_eq!(send(&mut c, &mut s, b"ticket"), b"ticket");
}

#[test]
fn test_tls12_ticket_resumption_without_server_session_id() {
    let server = Identity::ed25519("server", 0x11);
    let cache: Arc<dyn SessionCache> = Arc::new(InMemorySessionCache::new(8));
    let srv = || {
        tls12(server_builder(&server))
            .session_cache(Arc::clone(&cache))
            .session_tickets(true)
    };
    let (first, _) = connect(tls12(client_builder(&server)).session_tickets(true), srv());
    let mut params = first.connection().session().parameters().unwrap().clone();
    // Only the ticket names the session now.
    params.session_id.clear();
    let session = crate::session::Session::new(params);

    let (c, s) = connect(
        tls12(client_builder(&server))
            .session_tickets(true)
            .resumption_session(session),
        srv(),
    );
    assert!(c.connection().security_parameters().resumed);
    assert!(s.connection().security_parameters().resumed);
}

#[test]
fn test_tls12_no_ticket_when_server_disabled() {
    let server = Identity::ed25519("server", 0x11);
    let (c, _) = connect(
        tls12(client_builder(&server)).session_tickets(true),
        tls12(server_builder(&server)).session_cache(Arc::new(InMemorySessionCache::new(8))),
    );
    let session = c.connection().session();
    assert!(session.is_resumable());
    assert!(session.parameters().unwrap().ticket.is_none());
}

#[test]
fn test_unannounced_session_ticket_is_unexpected() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = start(tls12(client_builder(&server)), tls12(server_builder(&server)));
    s.offer_input(&c.drain_output()).unwrap();
    c.offer_input(&s.drain_output()).unwrap();
    c.drain_output();
    // NewSessionTicket with lifetime 0 and an empty ticket.
    let record = [22, 3, 3, 0, 10, 4, 0, 0, 6, 0, 0, 0, 0, 0, 0];
    expect_alert(c.offer_input(&record), AlertDescription::UnexpectedMessage);
}

#[test]
fn test_missing_promised_session_ticket() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = start(
        tls12(client_builder(&server)).session_tickets(true),
        tls12(server_builder(&server))
            .session_cache(Arc::new(InMemorySessionCache::new(8)))
            .session_tickets(true),
    );
    s.offer_input(&c.drain_output()).unwrap();
    c.offer_input(&s.drain_output()).unwrap();
    s.offer_input(&c.drain_output()).unwrap();
    let final_flight = s.drain_output();
    let len = usize::from(u16::from_be_bytes([final_flight[3], final_flight[4]]));
    expect_alert(c.offer_input(&final_flight[5 + len..]), AlertDescription::UnexpectedMessage);
}

#[test]
fn test_tls12_supplemental_data_both_ways() {
    let server = Identity::ed25519("server", 0x11);
    let from_server = vec![SupplementalDataEntry {
        data_type: 0x4002,
        data: b"server entry".to_vec(),
    }];
    let from_client = vec![SupplementalDataEntry {
        data_type: 0x4003,
        data: b"client entry".to_vec(),
    }];
    let (mut c, mut s) = start(
        tls12(client_builder(&server)).supplemental_data(from_client.clone()),
        tls12(server_builder(&server)).supplemental_data(from_server.clone()),
    );
    s.offer_input(&c.drain_output()).unwrap();
    let server_flight = s.drain_output();
    assert_eq!(message_types(&server_flight), [2, 23, 11, 12, 14]);
    c.offer_input(&server_flight).unwrap();
    let client_flight = c.drain_output();
    assert_eq!(message_types(&client_flight), [23, 16]);
    s.offer_input(&client_flight).unwrap();
    c.offer_input(&s.drain_output()).unwrap();
    assert!(c.is_handshake_complete());
    assert!(s.is_handshake_complete());

    assert_eq!(c.connection().security_parameters().peer_supplemental_data, from_server);
    assert_eq!(s.connection().security_parameters().peer_supplemental_data, from_client);
    assert_eq!(send(&mut c, &mut s, b"after supplemental"), b"after supplemental");
}

#[test]
fn test_tls12_supplemental_data_with_client_auth() {
    let server = Identity::ed25519("server", 0x11);
    let client_id = Identity::ecdsa("client", 0x33);
    let entries = vec![SupplementalDataEntry {
        data_type: 0x4003,
        data: b"before certificate".to_vec(),
    }];
    let (c, s) = connect(
        tls12(client_builder(&server))
            .credentials(client_id.credentials())
            .supplemental_data(entries.clone()),
        tls12(server_builder(&server))
            .client_auth(ClientAuthMode::Required)
            .authenticator(client_id.pinned()),
    );
    assert_eq!(s.connection().security_parameters().peer_supplemental_data, entries);
    assert_eq!(s.connection().peer_certificates(), client_id.chain.as_slice());
    assert!(c.connection().security_parameters().peer_supplemental_data.is_empty());
}

#[test]
fn test_tls12_unknown_session_gets_full_handshake() {
    let server = Identity::ed25519("server", 0x11);
    let (first, _) = connect(
        tls12(client_builder(&server)),
        tls12(server_builder(&server)).session_cache(Arc::new(InMemorySessionCache::new(8))),
    );
    let session = first.connection().session().clone();

    // A fresh server cache does not know the session.
    let (c, s) = connect(
        tls12(client_builder(&server)).resumption_session(session),
        tls12(server_builder(&server)).session_cache(Arc::new(InMemorySessionCache::new(8))),
    );
    assert!(!c.connection().security_parameters().resumed);
    assert!(!s.connection().security_parameters().resumed);
}

#[test]
fn test_client_session_cache_keyed_by_server_name() {
    let server = Identity::ed25519("server", 0x11);
    let client_cache: Arc<dyn SessionCache> = Arc::new(InMemorySessionCache::new(8));
    connect(
        tls12(client_builder(&server)).session_cache(Arc::clone(&client_cache)),
        tls12(server_builder(&server)).session_cache(Arc::new(InMemorySessionCache::new(8))),
    );
    let cached = client_cache.get(b"server.test").unwrap();
    assert_eq!(cached.version, ProtocolVersion::Tls12);
}

#[test]
fn test_tls13_ticket_resumption() {
    let server = Identity::ed25519("server", 0x11);
    let cache: Arc<dyn SessionCache> = Arc::new(InMemorySessionCache::new(8));
    let srv = || server_builder(&server).session_cache(Arc::clone(&cache));

    let (first, _) = connect(client_builder(&server), srv());
    let session = first.connection().session().clone();
    assert!(session.is_resumable());
    let params = session.parameters().unwrap();
    assert!(params.ticket.is_some());
    assert!(params.psk.is_some());

    let (mut c, mut s) = connect(
        client_builder(&server).resumption_session(session),
        srv(),
    );
    for conn in [c.connection(), s.connection()] {
        assert_eq!(conn.version(), Some(ProtocolVersion::Tls13));
        assert!(conn.security_parameters().resumed);
    }
    assert_eq!(c.connection().peer_certificates(), server.chain.as_slice());
    assert_eq!(send(&mut c, &mut s, b"0.5-rtt later"), b"0.5-rtt later");
}

#[test]
fn test_tls13_session_not_resumable_without_ticket() {
    let server = Identity::ed25519("server", 0x11);
    let (c, _) = connect(client_builder(&server), server_builder(&server));
    assert!(!c.connection().session().is_resumable());
}

#[test]
fn test_tls13_external_psk() {
    let psk = PskConfig {
        identity: b"device-7".to_vec(),
        key: secret(vec![0x5a; 32]),
        hash: tlsengine_types::HashAlgId::Sha256,
    };
    let client = TlsConfig::builder()
        .role(TlsRole::Client)
        .psk(psk.clone());
    let srv = TlsConfig::builder().role(TlsRole::Server).psk(psk);
    let (mut c, mut s) = connect(client, srv);
    assert_eq!(c.connection().version(), Some(ProtocolVersion::Tls13));
    assert!(c.connection().peer_certificates().is_empty());
    assert_eq!(send(&mut c, &mut s, b"psk"), b"psk");
}

#[test]
fn test_tls13_external_psk_mismatch() {
    let psk = |byte: u8| PskConfig {
        identity: b"device-7".to_vec(),
        key: secret(vec![byte; 32]),
        hash: tlsengine_types::HashAlgId::Sha256,
    };
    let client = TlsConfig::builder().role(TlsRole::Client).psk(psk(1));
    let srv = TlsConfig::builder().role(TlsRole::Server).psk(psk(2));
    let (mut c, mut s) = start(client, srv);
    expect_alert(pump(&mut c, &mut s), AlertDescription::DecryptError);
}

#[test]
fn test_tls12_plain_psk() {
    let psk = PskConfig {
        identity: b"sensor".to_vec(),
        key: secret(vec![0x33; 16]),
        hash: tlsengine_types::HashAlgId::Sha256,
    };
    let suite = CipherSuite::TLS_PSK_WITH_AES_128_GCM_SHA256;
    let client = tls12(TlsConfig::builder().role(TlsRole::Client))
        .cipher_suites(&[suite])
        .psk(psk.clone());
    let srv = tls12(TlsConfig::builder().role(TlsRole::Server))
        .cipher_suites(&[suite])
        .psk(psk);
    let (mut c, mut s) = connect(client, srv);
    assert_eq!(s.connection().cipher_suite(), Some(suite));
    assert_eq!(send(&mut c, &mut s, b"reading=21C"), b"reading=21C");
}

#[test]
fn test_tls12_anonymous_ecdh() {
    let suite = CipherSuite::TLS_ECDH_ANON_WITH_AES_128_CBC_SHA;
    let client = tls12(TlsConfig::builder().role(TlsRole::Client))
        .cipher_suites(&[suite])
        .verify_peer(false);
    let srv = tls12(TlsConfig::builder().role(TlsRole::Server)).cipher_suites(&[suite]);
    let (mut c, mut s) = connect(client, srv);
    assert_eq!(c.connection().cipher_suite(), Some(suite));
    assert_eq!(send(&mut s, &mut c, b"anon"), b"anon");
}

#[test]
fn test_tls13_client_auth_required() {
    let server = Identity::ed25519("server", 0x11);
    let client = Identity::ed25519("client", 0x44);
    let (mut c, mut s) = connect(
        client_builder(&server).credentials(client.credentials()),
        server_builder(&server)
            .client_auth(ClientAuthMode::Required)
            .authenticator(client.pinned()),
    );
    assert_eq!(s.connection().peer_certificates(), client.chain.as_slice());
    assert_eq!(
        c.connection().security_parameters().local_certificates,
        client.chain
    );
    assert_eq!(send(&mut c, &mut s, b"authenticated"), b"authenticated");
}

#[test]
fn test_tls13_client_auth_required_without_certificate() {
    let server = Identity::ed25519("server", 0x11);
    let client = Identity::ed25519("client", 0x44);
    let (mut c, mut s) = start(
        client_builder(&server),
        server_builder(&server)
            .client_auth(ClientAuthMode::Required)
            .authenticator(client.pinned()),
    );
    expect_alert(pump(&mut c, &mut s), AlertDescription::CertificateRequired);
}

#[test]
fn test_tls13_client_auth_optional_without_certificate() {
    let server = Identity::ed25519("server", 0x11);
    let client = Identity::ed25519("client", 0x44);
    let (_, s) = connect(
        client_builder(&server),
        server_builder(&server)
            .client_auth(ClientAuthMode::Optional)
            .authenticator(client.pinned()),
    );
    assert!(s.connection().peer_certificates().is_empty());
}

#[test]
fn test_tls12_client_auth_with_ecdsa() {
    let server = Identity::ed25519("server", 0x11);
    let client = Identity::ecdsa("client", 0x55);
    let (mut c, mut s) = connect(
        tls12(client_builder(&server)).credentials(client.credentials()),
        tls12(server_builder(&server))
            .client_auth(ClientAuthMode::Required)
            .authenticator(client.pinned()),
    );
    assert_eq!(s.connection().peer_certificates(), client.chain.as_slice());
    assert_eq!(send(&mut s, &mut c, b"welcome"), b"welcome");
}

#[test]
fn test_tls12_client_auth_required_without_certificate() {
    let server = Identity::ed25519("server", 0x11);
    let client = Identity::ed25519("client", 0x44);
    let (mut c, mut s) = start(
        tls12(client_builder(&server)),
        tls12(server_builder(&server))
            .client_auth(ClientAuthMode::Required)
            .authenticator(client.pinned()),
    );
    expect_alert(pump(&mut c, &mut s), AlertDescription::HandshakeFailure);
}

#[test]
fn test_alpn_negotiation() {
    let server = Identity::ed25519("server", 0x11);
    let (c, s) = connect(
        client_builder(&server).alpn(&[b"h2", b"http/1.1"]),
        server_builder(&server).alpn(&[b"http/1.1"]),
    );
    assert_eq!(c.connection().alpn_protocol(), Some(&b"http/1.1"[..]));
    assert_eq!(s.connection().alpn_protocol(), Some(&b"http/1.1"[..]));
}

#[test]
fn test_alpn_no_overlap() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = start(
        client_builder(&server).alpn(&[b"h2"]),
        server_builder(&server).alpn(&[b"http/1.1"]),
    );
    expect_alert(pump(&mut c, &mut s), AlertDescription::NoApplicationProtocol);
}

#[test]
fn test_max_fragment_length() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = connect(
        client_builder(&server).max_fragment_length(MaxFragmentLength::Bytes512),
        server_builder(&server),
    );
    for conn in [c.connection(), s.connection()] {
        assert_eq!(
            conn.security_parameters().max_fragment_length,
            Some(MaxFragmentLength::Bytes512)
        );
    }

    let data = vec![0xab; 2000];
    s.write_application_data(&data).unwrap();
    let first = s.preview_output_record();
    assert!(first > 0 && first <= 5 + 512 + 256);
    assert!(first < s.available_output_bytes());
    c.offer_input(&s.drain_output()).unwrap();
    let mut buf = vec![0u8; 4096];
    let n = c.read_application_data(&mut buf).unwrap();
    assert_eq!(&buf[..n], data.as_slice());
}

#[test]
fn test_tls10_cbc_record_splitting() {
    let server = Identity::ecdsa("server", 0x22);
    let tls10 = |b: TlsConfigBuilder| {
        b.min_version(ProtocolVersion::Tls10)
            .max_version(ProtocolVersion::Tls10)
    };
    let (mut c, mut s) = connect(tls10(client_builder(&server)), tls10(server_builder(&server)));
    assert_eq!(c.connection().version(), Some(ProtocolVersion::Tls10));

    let data = vec![0x42; 100];
    c.write_application_data(&data).unwrap();
    // 1/n-1: one record carrying a single byte, then the rest.
    let first = c.preview_output_record();
    assert!(first > 0 && first < c.available_output_bytes());
    s.offer_input(&c.drain_output()).unwrap();
    let mut buf = vec![0u8; 256];
    let n = s.read_application_data(&mut buf).unwrap();
    assert_eq!(&buf[..n], data.as_slice());
}

#[test]
fn test_tls10_empty_record_split() {
    let server = Identity::ecdsa("server", 0x22);
    let tls10 = |b: TlsConfigBuilder| {
        b.min_version(ProtocolVersion::Tls10)
            .max_version(ProtocolVersion::Tls10)
    };
    let (mut c, mut s) = connect(
        tls10(client_builder(&server)).app_data_split_mode(AppDataSplitMode::EmptyFirst),
        tls10(server_builder(&server)),
    );
    assert_eq!(send(&mut c, &mut s, b"first"), b"first");
    assert_eq!(send(&mut c, &mut s, b"second"), b"second");
}

#[test]
fn test_tls13_key_update() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = connect(
        client_builder(&server).key_update_threshold(2),
        server_builder(&server),
    );
    for i in 0..6u8 {
        let msg = [i; 10];
        assert_eq!(send(&mut c, &mut s, &msg), msg);
        assert_eq!(send(&mut s, &mut c, &msg), msg);
    }
}

#[test]
fn test_close_notify() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = connect(client_builder(&server), server_builder(&server));
    c.close().unwrap();
    s.offer_input(&c.drain_output()).unwrap();
    assert!(s.is_closed());
    let mut buf = [0u8; 8];
    assert_eq!(s.read_application_data(&mut buf).unwrap(), 0);

    // The server answers with its own close_notify.
    c.offer_input(&s.drain_output()).unwrap();
    assert!(c.is_closed());
    assert!(c.write_application_data(b"late").is_err());
}

#[test]
fn test_close_during_handshake_cancels() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = start(tls12(client_builder(&server)), tls12(server_builder(&server)));
    s.offer_input(&c.drain_output()).unwrap();
    c.offer_input(&s.drain_output()).unwrap();
    assert!(c.connection().is_handshaking());

    // user_canceled is tolerated, the close_notify that follows is not.
    s.close().unwrap();
    assert!(s.is_closed());
    expect_alert(c.offer_input(&s.drain_output()), AlertDescription::HandshakeFailure);
}

#[test]
fn test_eof_during_handshake() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, _) = start(client_builder(&server), server_builder(&server));
    c.drain_output();
    assert!(c.close_input().is_err());
    assert_eq!(c.connection().status(), ConnectionStatus::Failed);
}

#[test]
fn test_exporter_agrees() {
    let server = Identity::ed25519("server", 0x11);
    let variants: [fn(TlsConfigBuilder) -> TlsConfigBuilder; 2] = [|b| b, tls12];
    for builder in variants {
        let (c, s) = connect(builder(client_builder(&server)), builder(server_builder(&server)));
        let ck = c
            .connection()
            .export_keying_material("EXPORTER-test", Some(b"ctx"), 32)
            .unwrap();
        let sk = s
            .connection()
            .export_keying_material("EXPORTER-test", Some(b"ctx"), 32)
            .unwrap();
        assert_eq!(ck.len(), 32);
        assert_eq!(ck, sk);
        let other = c
            .connection()
            .export_keying_material("EXPORTER-other", Some(b"ctx"), 32)
            .unwrap();
        assert_ne!(ck, other);
    }
}

#[test]
fn test_tls_unique() {
    let server = Identity::ed25519("server", 0x11);
    let (c, s) = connect(tls12(client_builder(&server)), tls12(server_builder(&server)));
    let unique = c.connection().tls_unique().unwrap();
    assert_eq!(unique.len(), 12);
    assert_eq!(Some(unique), s.connection().tls_unique());

    let (c13, _) = connect(client_builder(&server), server_builder(&server));
    assert!(c13.connection().tls_unique().is_none());
}

#[test]
fn test_partial_record_preview() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = start(client_builder(&server), server_builder(&server));
    let hello = c.drain_output();
    assert!(hello.len() > 5);

    s.offer_input(&hello[..3]).unwrap();
    assert_eq!(s.available_input_bytes(), 3);
    assert_eq!(s.preview_input_record().unwrap(), None);

    s.offer_input(&hello[3..5]).unwrap();
    assert_eq!(s.preview_input_record().unwrap(), Some(hello.len()));
    assert_eq!(s.available_output_bytes(), 0);

    s.offer_input(&hello[5..]).unwrap();
    assert_eq!(s.available_input_bytes(), 0);
    assert!(s.available_output_bytes() > 0);

    // Feed the server flight one byte at a time.
    for byte in s.drain_output() {
        c.offer_input(&[byte]).unwrap();
    }
    assert!(c.is_handshake_complete());
}

#[test]
fn test_read_output_in_pieces() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = start(client_builder(&server), server_builder(&server));
    let total = c.available_output_bytes();
    let mut hello = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        let n = c.read_output(&mut chunk);
        if n == 0 {
            break;
        }
        hello.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(hello.len(), total);
    s.offer_input(&hello).unwrap();
    pump(&mut c, &mut s).unwrap();
    assert!(c.is_handshake_complete());
}

#[test]
fn test_invalid_operations() {
    let server = Identity::ed25519("server", 0x11);
    let config = Arc::new(client_builder(&server).build().unwrap());

    let mut idle = NonBlockingConnection::new(Arc::clone(&config));
    assert!(matches!(idle.offer_input(&[22, 3, 1]), Err(TlsError::InvalidOperation(_))));
    assert!(matches!(
        idle.write_application_data(b"x"),
        Err(TlsError::InvalidOperation(_))
    ));
    assert!(matches!(
        idle.connection().export_keying_material("EXPORTER", None, 16),
        Err(TlsError::InvalidOperation(_))
    ));

    let mut client = NonBlockingConnection::new(config);
    client.connect().unwrap();
    assert!(matches!(client.connect(), Err(TlsError::InvalidOperation(_))));
    let mut buf = [0u8; 4];
    assert!(matches!(
        client.read_application_data(&mut buf),
        Err(TlsError::InvalidOperation(_))
    ));
    // Misuse does not fail the connection.
    assert_eq!(client.connection().status(), ConnectionStatus::Handshaking);
}

#[test]
fn test_client_hello_to_client_is_unexpected() {
    let server = Identity::ed25519("server", 0x11);
    let config = Arc::new(client_builder(&server).build().unwrap());
    let mut a = NonBlockingConnection::new(Arc::clone(&config));
    let mut b = NonBlockingConnection::new(config);
    a.connect().unwrap();
    b.connect().unwrap();
    b.drain_output();
    expect_alert(b.offer_input(&a.drain_output()), AlertDescription::UnexpectedMessage);
    // The alert is queued for the peer.
    assert!(b.available_output_bytes() > 0);
}

#[test]
fn test_tls12_early_change_cipher_spec() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = start(tls12(client_builder(&server)), tls12(server_builder(&server)));
    let mut flight = c.drain_output();
    flight.extend_from_slice(&[20, 3, 3, 0, 1, 1]);
    expect_alert(s.offer_input(&flight), AlertDescription::UnexpectedMessage);
}

#[test]
fn test_tls13_change_cipher_spec_after_handshake() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, _) = connect(client_builder(&server), server_builder(&server));
    expect_alert(
        c.offer_input(&[20, 3, 3, 0, 1, 1]),
        AlertDescription::UnexpectedMessage,
    );
}

#[test]
fn test_tampered_record_fails() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = connect(client_builder(&server), server_builder(&server));
    c.write_application_data(b"integrity").unwrap();
    let mut record = c.drain_output();
    let last = record.len() - 1;
    record[last] ^= 0x01;
    expect_alert(s.offer_input(&record), AlertDescription::BadRecordMac);
}

#[test]
fn test_input_after_failure_is_rejected() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = connect(client_builder(&server), server_builder(&server));
    c.write_application_data(b"x").unwrap();
    let mut record = c.drain_output();
    record[6] ^= 0xff;
    assert!(s.offer_input(&record).is_err());
    assert_eq!(s.connection().status(), ConnectionStatus::Failed);
    assert!(s.write_application_data(b"y").is_err());
}

#[test]
fn test_drive_handshake_would_block_until_input() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = start(client_builder(&server), server_builder(&server));
    match c.drive_handshake() {
        Err(TlsError::IoError(e)) => assert_eq!(e.kind(), std::io::ErrorKind::WouldBlock),
        other => panic!("expected WouldBlock, got {other:?}"),
    }
    pump(&mut c, &mut s).unwrap();
    c.drive_handshake().unwrap();
    s.drive_handshake().unwrap();
}

#[test]
fn test_tls12_no_renegotiation_warning_after_handshake_is_ignored() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = connect(tls12(client_builder(&server)), tls12(server_builder(&server)));
    s.core_mut()
        .send_alert(Alert::warning(AlertDescription::NoRenegotiation))
        .unwrap();
    c.offer_input(&s.drain_output()).unwrap();
    assert_eq!(c.connection().status(), ConnectionStatus::Established);
    assert_eq!(send(&mut s, &mut c, b"still open"), b"still open");
    assert_eq!(send(&mut c, &mut s, b"both ways"), b"both ways");
}

#[test]
fn test_tls13_no_renegotiation_warning_is_an_error() {
    let server = Identity::ed25519("server", 0x11);
    let (mut c, mut s) = connect(client_builder(&server), server_builder(&server));
    s.core_mut()
        .send_alert(Alert::warning(AlertDescription::NoRenegotiation))
        .unwrap();
    let err = c.offer_input(&s.drain_output()).unwrap_err();
    assert!(matches!(err, TlsError::AlertReceived(AlertDescription::NoRenegotiation)));
}
