// Copyright 2025 Scatterstore Developers
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Performance benchmarks for the dispersal codec and chunker

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use scatterstore::chunker::Chunker;
use scatterstore::config::{DispersalParams, SecurityProfile};
use scatterstore::crypto::CryptoEngine;
use scatterstore::dispersal::DispersalCodec;

fn secret(len: usize) -> Vec<u8> {
    use rand::{RngCore, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x2545f4914f6cdd1d);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispersal_encode");

    for (n, m, r) in &[(4u8, 3u8, 1u8), (5, 3, 2), (8, 5, 3)] {
        let params = DispersalParams::new(*n, *m, *r).unwrap();
        let codec = DispersalCodec::new(params, CryptoEngine::new(SecurityProfile::High)).unwrap();
        let data = secret(16 * 1024);

        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("16KiB", format!("{n}-{m}-{r}")),
            &data,
            |b, data| {
                b.iter(|| codec.encode(black_box(data)).unwrap());
            },
        );
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispersal_decode");

    for (n, m, r) in &[(4u8, 3u8, 1u8), (8, 5, 3)] {
        let params = DispersalParams::new(*n, *m, *r).unwrap();
        let codec = DispersalCodec::new(params, CryptoEngine::new(SecurityProfile::High)).unwrap();
        let data = secret(16 * 1024);
        let shares = codec.encode(&data).unwrap();

        // worst case: one data share replaced by the last parity share
        let mut ids: Vec<usize> = (1..*m as usize).collect();
        ids.push(*n as usize - 1);
        let subset: Vec<(usize, Vec<u8>)> =
            ids.iter().map(|&i| (i, shares[i].clone())).collect();

        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("16KiB_with_parity", format!("{n}-{m}-{r}")),
            &subset,
            |b, subset| {
                b.iter(|| {
                    let refs: Vec<(usize, &[u8])> =
                        subset.iter().map(|(i, s)| (*i, &s[..])).collect();
                    codec.decode(black_box(&refs), data.len()).unwrap()
                });
            },
        );
    }

    group.finish();
}

fn bench_chunker(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunker");
    let data = secret(8 * 1024 * 1024);

    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("8MiB", |b| {
        b.iter(|| {
            let mut total = 0usize;
            for chunk in Chunker::new(black_box(&data[..])) {
                total += chunk.unwrap().len();
            }
            total
        });
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_chunker);
criterion_main!(benches);
