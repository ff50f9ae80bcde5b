//! Benchmarks for the outbound compression path
//!
//! Measures LZ4 block compression and envelope validation for payload sizes
//! around and well above the compression threshold, plus framing overhead.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{
    BlockCodec, CURRENT_VERSION, CompressedData, CompressionType, Lz4Codec, Message, VmcMessage,
    decode_framed, encode_framed,
};

const SIZES: [usize; 4] = [1001, 4096, 16 * 1024, 64 * 1024];

fn payload(size: usize) -> Vec<u8> {
    // Half-repetitive data, roughly like bulk transfers of mass storage sectors
    (0..size)
        .map(|i| if i % 64 < 32 { 0 } else { (i * 31) as u8 })
        .collect()
}

fn benchmark_compress(c: &mut Criterion) {
    let mut group = c.benchmark_group("lz4_compress");

    for size in SIZES {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| Lz4Codec.compress(black_box(data)))
        });
    }

    group.finish();
}

fn benchmark_decompress(c: &mut Criterion) {
    let mut group = c.benchmark_group("lz4_decompress_validated");

    for size in SIZES {
        let data = payload(size);
        let envelope = CompressedData::new(
            CompressionType::Lz4,
            size as u32,
            Lz4Codec.compress(&data).unwrap(),
        );
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &envelope, |b, env| {
            b.iter(|| black_box(env).decompress(Some(&Lz4Codec)))
        });
    }

    group.finish();
}

fn benchmark_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    for size in SIZES {
        let msg = Message {
            version: CURRENT_VERSION,
            payload: VmcMessage::Data { data: payload(size) },
        };
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("roundtrip", size), &msg, |b, msg| {
            b.iter(|| {
                let framed = encode_framed(black_box(msg)).unwrap();
                decode_framed(&framed).unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_compress,
    benchmark_decompress,
    benchmark_framing
);
criterion_main!(benches);
