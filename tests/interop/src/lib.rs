//! Integration tests for tlsengine.
//! Full handshakes over TCP loopback, driven through the blocking stream API.

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use tlsengine_crypto::{CryptoProvider, PrivateKey, RustCryptoProvider};
    use tlsengine_tls::config::{
        ClientAuthMode, Credentials, PinnedKeyAuthenticator, TlsConfig, TlsConfigBuilder,
    };
    use tlsengine_tls::session::{InMemorySessionCache, Session, SessionCache};
    use tlsengine_tls::{
        CipherSuite, NonBlockingConnection, ProtocolVersion, TlsConnection, TlsRole, TlsStream,
    };
    use tlsengine_types::NamedGroup;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn identity(name: &str, key: PrivateKey) -> (Credentials, Arc<PinnedKeyAuthenticator>) {
        let public = RustCryptoProvider::new()
            .new_signer(&key)
            .unwrap()
            .public_key();
        let cert = format!("CN={name}").into_bytes();
        let pins = PinnedKeyAuthenticator::new().pin(cert.clone(), public);
        (Credentials::new(vec![cert], key), Arc::new(pins))
    }

    fn with_timeouts(stream: TcpStream) -> TcpStream {
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream.set_write_timeout(Some(TIMEOUT)).unwrap();
        stream
    }

    /// Run one request/response exchange over loopback. Returns the client's
    /// session and negotiated version.
    fn exchange(
        server_config: TlsConfig,
        client_config: TlsConfig,
        request: &'static [u8],
        response: &'static [u8],
    ) -> (Session, Option<ProtocolVersion>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_config = Arc::new(server_config);

        let server_handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut conn = TlsStream::new(with_timeouts(stream), server_config);
            conn.handshake().unwrap();

            let mut buf = [0u8; 256];
            let n = conn.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], request);

            conn.write(response).unwrap();
            conn.shutdown().unwrap();
        });

        let stream = with_timeouts(TcpStream::connect_timeout(&addr, TIMEOUT).unwrap());
        let mut conn = TlsStream::connect(stream, Arc::new(client_config)).unwrap();
        conn.write(request).unwrap();

        let mut buf = [0u8; 256];
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], response);
        let session = conn.connection().session().clone();
        let version = conn.version();

        conn.shutdown().unwrap();
        server_handle.join().unwrap();
        (session, version)
    }

    fn server(credentials: Credentials) -> TlsConfigBuilder {
        TlsConfig::builder()
            .role(TlsRole::Server)
            .credentials(credentials)
    }

    fn client(pins: Arc<PinnedKeyAuthenticator>) -> TlsConfigBuilder {
        TlsConfig::builder()
            .role(TlsRole::Client)
            .authenticator(pins)
            .server_name("localhost")
    }

    // -------------------------------------------------------
    // 1. TCP loopback: TLS 1.3 Ed25519
    // -------------------------------------------------------
    #[test]
    fn test_tcp_tls13_loopback_ed25519() {
        let (creds, pins) = identity("ed25519 server", PrivateKey::Ed25519([0x21; 32]));
        let (_, version) = exchange(
            server(creds).build().unwrap(),
            client(pins).build().unwrap(),
            b"Hello from client!",
            b"Hello from server!",
        );
        assert_eq!(version, Some(ProtocolVersion::Tls13));
    }

    // -------------------------------------------------------
    // 2. TCP loopback: TLS 1.2 ECDSA P-256
    // -------------------------------------------------------
    #[test]
    fn test_tcp_tls12_loopback_ecdsa() {
        let (creds, pins) = identity("ecdsa server", PrivateKey::EcdsaP256([0x31; 32]));
        let suites = [CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256];
        let groups = [NamedGroup::SECP256R1];
        let tls12 = |b: TlsConfigBuilder| {
            b.min_version(ProtocolVersion::Tls12)
                .max_version(ProtocolVersion::Tls12)
                .cipher_suites(&suites)
                .supported_groups(&groups)
        };
        let (_, version) = exchange(
            tls12(server(creds)).build().unwrap(),
            tls12(client(pins)).build().unwrap(),
            b"TLS 1.2 works!",
            b"TLS 1.2 confirmed!",
        );
        assert_eq!(version, Some(ProtocolVersion::Tls12));
    }

    // -------------------------------------------------------
    // 3. TCP loopback: TLS 1.3 ticket resumption
    // -------------------------------------------------------
    #[test]
    fn test_tcp_tls13_ticket_resumption() {
        let (creds, pins) = identity("resuming server", PrivateKey::Ed25519([0x41; 32]));
        let cache: Arc<dyn SessionCache> = Arc::new(InMemorySessionCache::new(16));
        let server_config = || {
            server(creds.clone())
                .session_cache(Arc::clone(&cache))
                .build()
                .unwrap()
        };

        let (session, _) = exchange(
            server_config(),
            client(Arc::clone(&pins)).build().unwrap(),
            b"first",
            b"ticket issued",
        );
        assert!(session.is_resumable());

        let (resumed, version) = exchange(
            server_config(),
            client(pins).resumption_session(session).build().unwrap(),
            b"second",
            b"resumed",
        );
        assert_eq!(version, Some(ProtocolVersion::Tls13));
        assert!(resumed.parameters().is_some());
    }

    // -------------------------------------------------------
    // 4. TCP loopback: TLS 1.3 mutual authentication
    // -------------------------------------------------------
    #[test]
    fn test_tcp_tls13_mutual_auth() {
        let (server_creds, server_pins) =
            identity("server", PrivateKey::EcdsaP256([0x51; 32]));
        let (client_creds, client_pins) = identity("client", PrivateKey::Ed25519([0x52; 32]));
        let (_, version) = exchange(
            server(server_creds)
                .client_auth(ClientAuthMode::Required)
                .authenticator(client_pins)
                .build()
                .unwrap(),
            client(server_pins)
                .credentials(client_creds)
                .build()
                .unwrap(),
            b"who am i",
            b"a pinned client",
        );
        assert_eq!(version, Some(ProtocolVersion::Tls13));
    }

    // -------------------------------------------------------
    // 5. Blocking server, non-blocking client over one socket
    // -------------------------------------------------------
    #[test]
    fn test_nonblocking_client_against_stream_server() {
        use std::io::{Read, Write};

        let (creds, pins) = identity("mixed server", PrivateKey::Ed25519([0x61; 32]));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_config = Arc::new(server(creds).build().unwrap());

        let server_handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut conn = TlsStream::accept(with_timeouts(stream), server_config).unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            conn.write(&buf[..n]).unwrap();
            conn.shutdown().unwrap();
        });

        let mut socket = with_timeouts(TcpStream::connect_timeout(&addr, TIMEOUT).unwrap());
        let mut conn = NonBlockingConnection::new(Arc::new(client(pins).build().unwrap()));
        conn.connect().unwrap();
        let mut buf = vec![0u8; 32 * 1024];
        while !conn.is_handshake_complete() {
            socket.write_all(&conn.drain_output()).unwrap();
            let n = socket.read(&mut buf).unwrap();
            assert!(n > 0, "server closed during handshake");
            conn.offer_input(&buf[..n]).unwrap();
        }
        socket.write_all(&conn.drain_output()).unwrap();

        conn.write_application_data(b"echo me").unwrap();
        socket.write_all(&conn.drain_output()).unwrap();
        let mut echoed = Vec::new();
        while echoed.len() < 7 {
            let n = socket.read(&mut buf).unwrap();
            assert!(n > 0, "server closed before echoing");
            conn.offer_input(&buf[..n]).unwrap();
            let mut app = vec![0u8; conn.available_application_bytes()];
            let got = conn.read_application_data(&mut app).unwrap();
            echoed.extend_from_slice(&app[..got]);
        }
        assert_eq!(echoed, b"echo me");
        server_handle.join().unwrap();
    }
}
