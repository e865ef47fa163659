#![no_main]
use std::sync::{Arc, OnceLock};

use libfuzzer_sys::fuzz_target;
use tlsengine_tls::config::TlsConfig;
use tlsengine_tls::{NonBlockingConnection, TlsRole};

static CONFIG: OnceLock<Arc<TlsConfig>> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    let config = CONFIG.get_or_init(|| {
        Arc::new(TlsConfig::builder().role(TlsRole::Server).build().unwrap())
    });
    let mut conn = NonBlockingConnection::new(Arc::clone(config));
    if conn.accept().is_err() {
        return;
    }
    // Arbitrary bytes must end in an error or a partial handshake, never a panic.
    let _ = conn.offer_input(data);
    let _ = conn.drain_output();
});
