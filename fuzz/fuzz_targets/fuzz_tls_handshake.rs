#![no_main]
use libfuzzer_sys::fuzz_target;
use tlsengine_tls::handshake::codec::{
    decode_encrypted_extensions, CertificateMsg, CertificateRequest12, CertificateRequest13,
    ClientHello, NewSessionTicket13, ServerHello,
};
use tlsengine_tls::handshake::peek_handshake_header;

fuzz_target!(|data: &[u8]| {
    let Ok(Some((_, total))) = peek_handshake_header(data, 1 << 16) else {
        return;
    };
    let body = &data[4..total];
    let _ = ClientHello::decode(body);
    let _ = ServerHello::decode(body);
    let _ = decode_encrypted_extensions(body);
    let _ = CertificateMsg::decode(body, true);
    let _ = CertificateMsg::decode(body, false);
    let _ = CertificateRequest12::decode(body, true);
    let _ = CertificateRequest13::decode(body);
    let _ = NewSessionTicket13::decode(body);
});
