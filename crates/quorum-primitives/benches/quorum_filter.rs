//! Benchmark quorum filter construction and membership checks
//!
//! Run with: cargo bench -p quorum-primitives

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quorum_primitives::{KeyPair, QuorumFilter};
use rand::RngCore;

fn random_addresses(n: usize) -> Vec<[u8; 20]> {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| {
            let mut a = [0u8; 20];
            rng.fill_bytes(&mut a);
            a
        })
        .collect()
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_build");
    for quorum in [3usize, 16, 128] {
        let members = random_addresses(quorum);
        group.bench_with_input(BenchmarkId::from_parameter(quorum), &members, |b, members| {
            b.iter(|| {
                let mut filter = QuorumFilter::new(members.len() as u32, 0.01).unwrap();
                for m in members {
                    filter.add(m);
                }
                black_box(filter.to_bytes())
            })
        });
    }
    group.finish();
}

fn bench_contains(c: &mut Criterion) {
    let members = random_addresses(128);
    let mut filter = QuorumFilter::new(128, 0.01).unwrap();
    for m in &members {
        filter.add(m);
    }
    let probes = random_addresses(1024);

    c.bench_function("filter_contains_1024", |b| {
        b.iter(|| probes.iter().filter(|p| filter.contains(black_box(p))).count())
    });
}

fn bench_recover(c: &mut Criterion) {
    let key = KeyPair::generate();
    let message = br#"{"deadline":1700000000,"nonce":"bench"}"#;
    let signature = key.sign(message).unwrap();

    c.bench_function("recover_signer", |b| {
        b.iter(|| quorum_primitives::recover_signer(black_box(&signature), black_box(message)).unwrap())
    });
}

criterion_group!(benches, bench_build, bench_contains, bench_recover);
criterion_main!(benches);
