//! Throughput benchmarks for the binary primitives.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use conduit::crc::crc32;
use conduit::frame::{self, FrameHeader};
use conduit::ringbuf::ByteRing;
use conduit::tlv;

fn bench_crc32(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc32");
    for size in [64usize, 512, 4096] {
        let data = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| crc32(black_box(data)));
        });
    }
    group.finish();
}

fn bench_frame_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame");
    for size in [16usize, 128, 512] {
        let payload = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes((size + frame::HEADER_SIZE) as u64));

        group.bench_with_input(
            BenchmarkId::new("encode", size),
            &payload,
            |b, payload| {
                let mut wire = [0u8; 1024];
                b.iter(|| {
                    let mut header = FrameHeader::new(0x10, 0x20, 1);
                    frame::encode(black_box(&mut wire), black_box(payload), &mut header)
                        .unwrap()
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("decode", size),
            &payload,
            |b, payload| {
                let mut wire = [0u8; 1024];
                let mut header = FrameHeader::new(0x10, 0x20, 1);
                let total = frame::encode(&mut wire, payload, &mut header).unwrap();
                b.iter(|| frame::decode(black_box(&wire[..total])).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_ring_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("ringbuf");
    group.throughput(Throughput::Bytes(1024));
    group.bench_function("write_read_1k", |b| {
        let mut ring = ByteRing::new(4096);
        let data = [0x3Cu8; 1024];
        let mut out = [0u8; 1024];
        b.iter(|| {
            ring.write(black_box(&data));
            ring.read(black_box(&mut out))
        });
    });
    group.finish();
}

fn bench_tlv_find(c: &mut Criterion) {
    let mut buf = [0u8; 512];
    let mut offset = 0;
    for ty in 0u8..32 {
        offset = tlv::append(&mut buf, offset, ty, &[ty; 8]).unwrap();
    }
    let filled = offset;

    c.bench_function("tlv/find_last_of_32", |b| {
        b.iter(|| tlv::find(black_box(&buf[..filled]), black_box(31)).unwrap());
    });
}

criterion_group!(
    benches,
    bench_crc32,
    bench_frame_roundtrip,
    bench_ring_buffer,
    bench_tlv_find
);
criterion_main!(benches);
