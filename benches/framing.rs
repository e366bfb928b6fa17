//! Microbenchmarks for frame handling on the proxy hot path

use bytes::{BufMut, Bytes, BytesMut};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn bench_broadcast_clone(c: &mut Criterion) {
    let frame = Bytes::from(vec![0u8; 16 * 1024]);
    c.bench_function("broadcast_clone_4_backends", |b| {
        b.iter(|| {
            for _ in 0..4 {
                black_box(frame.clone());
            }
        })
    });
}

fn bench_merge_concat(c: &mut Criterion) {
    let frames: Vec<Bytes> = (0..8).map(|_| Bytes::from(vec![0u8; 4 * 1024])).collect();
    c.bench_function("merge_concat_8_frames", |b| {
        b.iter(|| {
            let mut merged = BytesMut::new();
            for frame in &frames {
                merged.extend_from_slice(frame);
            }
            black_box(merged.freeze())
        })
    });
}

fn bench_length_prefix(c: &mut Criterion) {
    let payload = Bytes::from(vec![0u8; 16 * 1024]);
    c.bench_function("length_prefix_frame", |b| {
        b.iter(|| {
            let mut framed = BytesMut::with_capacity(payload.len() + 5);
            framed.put_u8(0);
            framed.put_u32(payload.len() as u32);
            framed.extend_from_slice(&payload);
            black_box(framed.freeze())
        })
    });
}

criterion_group!(
    benches,
    bench_broadcast_clone,
    bench_merge_concat,
    bench_length_prefix
);
criterion_main!(benches);
