#![no_main]

use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use protocol_http1::{Http1Parser, MessageKind, ParseEvent, ParserConfig};

fn run(kind: MessageKind, data: &[u8], split: usize) -> Result<Vec<ParseEvent>, ()> {
    let config = ParserConfig {
        max_headers_length: 256,
        max_url_length: 128,
    };
    let mut parser = Http1Parser::new(kind, config);
    let mut events = Vec::new();
    let mut buf = BytesMut::new();
    for chunk in data.chunks(split.max(1)) {
        buf.extend_from_slice(chunk);
        loop {
            match parser.offer(&mut buf) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => break,
                Err(_) => return Err(()),
            }
        }
        assert!(buf.is_empty(), "parser left input behind");
    }
    Ok(merge_bodies(events))
}

fn merge_bodies(events: Vec<ParseEvent>) -> Vec<ParseEvent> {
    let mut out: Vec<ParseEvent> = Vec::new();
    for event in events {
        if let ParseEvent::Body(data) = &event
            && let Some(ParseEvent::Body(prev)) = out.last_mut()
        {
            let mut joined = BytesMut::from(&prev[..]);
            joined.extend_from_slice(data);
            *prev = Bytes::from(joined);
            continue;
        }
        out.push(event);
    }
    out
}

fuzz_target!(|data: &[u8]| {
    let Some((&split, data)) = data.split_first() else {
        return;
    };
    for kind in [MessageKind::Request, MessageKind::Response] {
        let whole = run(kind, data, data.len());
        let pieces = run(kind, data, split as usize);
        // delivery in pieces never changes the outcome
        assert_eq!(whole, pieces);
    }
});
