//! Performance benchmarks for frame encoding and decoding.
//!
//! The transport exchanges a handful of frames per second at most, so
//! these exist to catch pathological regressions in the codec path, not
//! to chase throughput.
//!
//! Run benchmarks with:
//! ```sh
//! cargo bench --bench frame_bench
//! ```

use bytes::BytesMut;
use cashpoint_core::constants::{ACK, RESPONSE_ADDR};
use cashpoint_protocol::{
    CommandCode, Frame, Outgoing, ResponseFrame, ResponseStatus, WireCodec, WireEvent,
};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tokio_util::codec::Decoder;

/// A status command: the smallest frame the protocol exchanges.
fn status_command() -> Frame {
    Frame::new(0x00, CommandCode::Status, 0x00, &[]).unwrap()
}

/// A dispense response covering eight cassettes.
fn dispense_response() -> ResponseFrame {
    let payload: Vec<u8> = (0..16).collect();
    ResponseFrame::new(
        RESPONSE_ADDR,
        CommandCode::Dispense.as_u8(),
        0x00,
        ResponseStatus::Positive,
        &payload,
    )
    .unwrap()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let command = status_command();
    let response = dispense_response();

    group.bench_function("status_command", |b| {
        b.iter(|| black_box(command.encode()))
    });
    group.bench_function("dispense_response", |b| {
        b.iter(|| black_box(response.encode()))
    });
    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    let bytes = status_command().encode();
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("status_command", |b| {
        b.iter(|| black_box(Frame::parse(&bytes).unwrap()))
    });
    group.finish();
}

fn bench_wire_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_decode");

    // One full exchange worth of inbound bytes: ACK plus the response.
    let mut exchange = vec![ACK];
    exchange.extend_from_slice(&dispense_response().encode());
    group.throughput(Throughput::Bytes(exchange.len() as u64));

    group.bench_function("ack_then_response", |b| {
        b.iter(|| {
            let mut codec = WireCodec::new();
            let mut buf = BytesMut::from(exchange.as_slice());
            let mut events = 0;
            while let Ok(Some(event)) = codec.decode(&mut buf) {
                match event {
                    WireEvent::Ack | WireEvent::Response(_) => events += 1,
                    other => panic!("unexpected event {other:?}"),
                }
            }
            black_box(events)
        })
    });
    group.finish();
}

fn bench_wire_encode(c: &mut Criterion) {
    use tokio_util::codec::Encoder;

    let mut group = c.benchmark_group("wire_encode");
    group.bench_function("command", |b| {
        let mut codec = WireCodec::new();
        b.iter(|| {
            let mut dst = BytesMut::with_capacity(64);
            codec
                .encode(Outgoing::Command(status_command()), &mut dst)
                .unwrap();
            black_box(dst)
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_parse,
    bench_wire_decode,
    bench_wire_encode
);
criterion_main!(benches);
