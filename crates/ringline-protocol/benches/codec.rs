//! Codec benchmarks for ringline-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ringline_protocol::{codec, Frame, SignalBody};
use serde_json::json;

fn offer_frame() -> Frame {
    // Roughly the size of a browser audio-only offer.
    let sdp = "a=candidate:1 1 udp 2122260223 192.168.1.2 54400 typ host\r\n".repeat(24);
    Frame::Offer(SignalBody::for_call("call_18c2f0a9d41", json!({"type": "offer", "sdp": sdp})))
}

fn bench_msgpack(c: &mut Criterion) {
    let frame = offer_frame();
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("msgpack");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode_offer", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.bench_function("decode_offer", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_json(c: &mut Criterion) {
    let frame = offer_frame();
    let encoded = codec::encode_json(&frame).unwrap();

    let mut group = c.benchmark_group("json");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode_offer", |b| {
        b.iter(|| codec::encode_json(black_box(&frame)))
    });
    group.bench_function("decode_offer", |b| {
        b.iter(|| codec::decode_json(black_box(&encoded)))
    });
    group.finish();
}

fn bench_candidate_roundtrip(c: &mut Criterion) {
    let frame = Frame::Candidate(SignalBody::for_call(
        "call_18c2f0a9d41",
        json!({"candidate": "candidate:1 1 udp 2122260223 10.0.0.4 50000 typ host", "sdpMid": "0"}),
    ));

    c.bench_function("roundtrip_candidate", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(benches, bench_msgpack, bench_json, bench_candidate_roundtrip);
criterion_main!(benches);
