#![no_main]
use libfuzzer_sys::fuzz_target;
use tlsengine_tls::record::{preview_record_header, RecordLayer};

fuzz_target!(|data: &[u8]| {
    if let Ok(Some(header)) = preview_record_header(data) {
        if data.len() >= header.record_len() {
            let _ = RecordLayer::open_plaintext(&data[..header.record_len()]);
            let _ = RecordLayer::new().open_record(&data[..header.record_len()]);
        }
    }
});
