//! Benchmarks for header compression and frame codec hot paths.
//!
//! - HPACK encode of a typical response head (static + dynamic table hits)
//! - HPACK decode of a typical request head
//! - Huffman encode/decode of header values
//! - Frame decode of a HEADERS + DATA sequence
//!
//! Run with: cargo bench -p http2 --bench hpack

use bytes::{Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use http2::hpack::huffman;
use http2::{
    DataFrame, Frame, FrameDecoder, FrameEncoder, HeaderField, HpackDecoder, HpackEncoder, StreamId,
};
use std::hint::black_box;

fn request_head() -> Vec<HeaderField> {
    vec![
        HeaderField::new(":method", "GET"),
        HeaderField::new(":scheme", "https"),
        HeaderField::new(":path", "/api/v1/items?page=3"),
        HeaderField::new(":authority", "www.example.com"),
        HeaderField::new("user-agent", "bench/1.0"),
        HeaderField::new("accept", "application/json"),
        HeaderField::new("accept-encoding", "gzip, deflate, br"),
        HeaderField::sensitive("authorization", "Bearer abcdefghijklmnop"),
    ]
}

fn response_head() -> Vec<HeaderField> {
    vec![
        HeaderField::new(":status", "200"),
        HeaderField::new("content-type", "application/json"),
        HeaderField::new("content-length", "1234"),
        HeaderField::new("cache-control", "private, max-age=0"),
        HeaderField::new("date", "Mon, 21 Oct 2013 20:13:21 GMT"),
    ]
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("hpack/encode");
    group.throughput(Throughput::Elements(1));

    for huffman in [false, true] {
        let headers = response_head();
        let mut encoder = HpackEncoder::default();
        encoder.set_huffman(huffman);
        let mut buf = Vec::with_capacity(256);
        group.bench_with_input(
            BenchmarkId::new("response", if huffman { "huffman" } else { "raw" }),
            &headers,
            |b, headers| {
                b.iter(|| {
                    buf.clear();
                    encoder.encode(headers, &mut buf);
                    black_box(buf.len());
                });
            },
        );
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("hpack/decode");
    group.throughput(Throughput::Elements(1));

    // first block populates the dynamic table, later ones hit it
    let mut encoder = HpackEncoder::default();
    let mut first = Vec::new();
    encoder.encode(&request_head(), &mut first);
    let mut repeat = Vec::new();
    encoder.encode(&request_head(), &mut repeat);

    group.bench_function("request/cold", |b| {
        b.iter(|| {
            let mut decoder = HpackDecoder::default();
            black_box(decoder.decode(black_box(&first)).unwrap());
        });
    });

    let mut decoder = HpackDecoder::default();
    decoder.decode(&first).unwrap();
    group.bench_function("request/indexed", |b| {
        b.iter(|| {
            black_box(decoder.decode(black_box(&repeat)).unwrap());
        });
    });

    group.finish();
}

fn bench_huffman(c: &mut Criterion) {
    let mut group = c.benchmark_group("hpack/huffman");
    let value = b"Mon, 21 Oct 2013 20:13:21 GMT; max-age=3600; path=/static/assets";
    group.throughput(Throughput::Bytes(value.len() as u64));

    let mut encoded = Vec::new();
    huffman::encode(value, &mut encoded);

    group.bench_function("encode", |b| {
        let mut out = Vec::with_capacity(128);
        b.iter(|| {
            out.clear();
            huffman::encode(black_box(value), &mut out);
        });
    });
    group.bench_function("decode", |b| {
        b.iter(|| black_box(huffman::decode(black_box(&encoded)).unwrap()));
    });

    group.finish();
}

fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame/decode");

    let encoder = FrameEncoder::new();
    let mut wire = BytesMut::new();
    let mut block = Vec::new();
    HpackEncoder::default().encode(&response_head(), &mut block);
    encoder.encode_header_block(StreamId(1), Bytes::from(block), false, &mut wire);
    encoder.encode(
        &Frame::Data(DataFrame {
            stream_id: StreamId(1),
            end_stream: true,
            data: Bytes::from(vec![0u8; 4096]),
            padding: 0,
        }),
        &mut wire,
    );
    let wire = wire.freeze();
    group.throughput(Throughput::Bytes(wire.len() as u64));

    let decoder = FrameDecoder::new();
    group.bench_function("headers_data", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&wire[..]);
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                black_box(frame);
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_huffman, bench_frames);
criterion_main!(benches);
