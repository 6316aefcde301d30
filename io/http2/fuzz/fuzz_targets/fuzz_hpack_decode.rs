#![no_main]

use http2::{HpackDecoder, HpackEncoder};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut decoder = HpackDecoder::default();

    if let Ok(headers) = decoder.decode(data) {
        assert!(decoder.table().dynamic_table_size_in_bytes() <= decoder.table().max_size());

        // indexing may differ, names and values may not
        if !headers.is_empty() {
            let mut encoder = HpackEncoder::default();
            let mut encoded = Vec::new();
            encoder.encode(&headers, &mut encoded);

            let decoded = HpackDecoder::default()
                .decode(&encoded)
                .expect("re-encoded block must decode");
            assert_eq!(headers.len(), decoded.len(), "roundtrip header count mismatch");
            for (orig, dec) in headers.iter().zip(decoded.iter()) {
                assert_eq!(orig.name, dec.name, "roundtrip name mismatch");
                assert_eq!(orig.value, dec.value, "roundtrip value mismatch");
            }
        }
    }
});
