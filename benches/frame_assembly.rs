//! Benchmarks for frame reassembly
//!
//! Measures the per-packet cost of the slot table for a full-size sensor:
//! - In-order ingest of a complete frame, then pixel buffer hand-off
//! - Reverse-order ingest, exercising gap bookkeeping on every packet
//! - Header parsing alone

use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use skycam::assembler::FrameAssembler;
use skycam::protocol::DataPacket;
use skycam::test_utils::{FrameDatagrams, test_pattern};
use skycam::types::CameraDescriptor;
use std::hint::black_box;
use std::time::Instant;

const WIDTH: u32 = 3056;
const HEIGHT: u32 = 2048;

fn fixture() -> (CameraDescriptor, FrameDatagrams) {
    let descriptor = CameraDescriptor::from_packet_size(WIDTH, HEIGHT, 1500).expect("valid geometry");
    let pixels = test_pattern(descriptor.frame_bytes());
    let datagrams = FrameDatagrams::build(&descriptor, 1, &pixels);
    (descriptor, datagrams)
}

fn ingest_all<'a>(assembler: &mut FrameAssembler, datagrams: impl Iterator<Item = &'a [u8]>) {
    let now = Instant::now();
    for datagram in datagrams {
        let packet = DataPacket::parse(datagram).expect("well-formed packet");
        black_box(assembler.ingest(&packet, now));
    }
}

fn bench_in_order(c: &mut Criterion) {
    let (descriptor, datagrams) = fixture();

    let mut group = c.benchmark_group("frame_assembly");
    group.throughput(Throughput::Bytes(descriptor.frame_bytes() as u64));

    group.bench_function("in_order", |b| {
        b.iter_batched(
            || FrameAssembler::new(descriptor),
            |mut assembler| {
                assembler.begin_frame(Some(datagrams.frame_id));
                let all = std::iter::once(datagrams.leader.as_slice())
                    .chain(datagrams.payloads.iter().map(Vec::as_slice))
                    .chain(std::iter::once(datagrams.trailer.as_slice()));
                ingest_all(&mut assembler, all);
                black_box(assembler.finish().expect("complete frame"))
            },
            BatchSize::LargeInput,
        )
    });

    group.bench_function("reverse_order", |b| {
        b.iter_batched(
            || FrameAssembler::new(descriptor),
            |mut assembler| {
                assembler.begin_frame(Some(datagrams.frame_id));
                ingest_all(&mut assembler, datagrams.payloads.iter().rev().map(Vec::as_slice));
                black_box(assembler.is_complete())
            },
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let (_, datagrams) = fixture();
    let datagram = datagrams.payload(1).expect("first payload");

    c.bench_function("parse_data_packet", |b| {
        b.iter(|| black_box(DataPacket::parse(black_box(datagram))))
    });
}

criterion_group!(benches, bench_in_order, bench_parse);
criterion_main!(benches);
