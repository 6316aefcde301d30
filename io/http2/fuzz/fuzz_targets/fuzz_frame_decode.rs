#![no_main]

use bytes::BytesMut;
use http2::frame::{Action, HeaderBlockAssembler};
use http2::{Frame, FrameDecoder, FrameEncoder};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let decoder = FrameDecoder::new();
    let encoder = FrameEncoder::new();
    let mut assembler = HeaderBlockAssembler::default();
    let mut buf = BytesMut::from(data);

    while let Ok(Some(frame)) = decoder.decode(&mut buf) {
        // whatever decodes must survive re-encoding
        let mut out = BytesMut::new();
        encoder.encode(&frame, &mut out);
        match decoder.decode(&mut out) {
            Ok(Some(again)) => {
                if let (Frame::Data(a), Frame::Data(b)) = (&frame, &again) {
                    assert_eq!(a.data, b.data, "data changed on re-encode");
                } else if !matches!(frame, Frame::Unknown(_)) {
                    assert_eq!(frame.stream_id(), again.stream_id());
                }
            }
            Ok(None) => panic!("re-encoded frame is incomplete"),
            Err(_) => {}
        }

        if let Action::Error(_) = assembler.feed(frame) {
            break;
        }
    }
});
