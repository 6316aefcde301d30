#![no_main]

use http2::{CONNECTION_PREFACE, ConnectionOptions, ServerConnection, Settings};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut conn = ServerConnection::new(Settings::server(), ConnectionOptions::default());
    if conn.feed_data(CONNECTION_PREFACE).is_err() {
        return;
    }
    // feed in uneven slices to exercise partial frames
    for chunk in data.chunks(7) {
        if conn.feed_data(chunk).is_err() {
            break;
        }
        let _ = conn.poll_events();
        let _ = conn.shared().take_output();
    }
});
