//! Benchmarks for the deterministic hash slicer

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use idmap_middleware::idmap::hash::{
    murmur3_x86_32, sssd_low_range, SssdRangeParams, SSSD_HASH_SEED,
};

fn bench_murmur3(c: &mut Criterion) {
    let sid = "S-1-5-21-3623811015-3361044348-30300820";

    c.bench_function("murmur3_x86_32/domain_sid", |b| {
        b.iter(|| murmur3_x86_32(black_box(sid.as_bytes()), black_box(SSSD_HASH_SEED)))
    });

    let long_input = sid.repeat(64);
    c.bench_function("murmur3_x86_32/2kb", |b| {
        b.iter(|| murmur3_x86_32(black_box(long_input.as_bytes()), black_box(SSSD_HASH_SEED)))
    });
}

fn bench_low_range(c: &mut Criterion) {
    let sid = "S-1-5-21-3623811015-3361044348-30300820";
    let params = SssdRangeParams::default();

    c.bench_function("sssd_low_range", |b| {
        b.iter(|| sssd_low_range(black_box(sid), black_box(&params), black_box(SSSD_HASH_SEED)))
    });
}

criterion_group!(benches, bench_murmur3, bench_low_range);
criterion_main!(benches);
