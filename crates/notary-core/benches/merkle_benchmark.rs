use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use notary_core::merkle::{verify_proof, MerkleTree};

fn generate_leaves(n: usize) -> Vec<Vec<u8>> {
    (0..n).map(|i| format!("receipt-{}", i).into_bytes()).collect()
}

fn bench_tree_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("MerkleTree::from_leaves");

    for size in [10, 100, 1000, 10000].iter() {
        let leaves = generate_leaves(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &leaves, |b, leaves| {
            b.iter(|| MerkleTree::from_leaves(black_box(leaves)))
        });
    }
    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let leaves = generate_leaves(1000);
    let tree = MerkleTree::from_leaves(&leaves).expect("non-empty batch");
    let root = tree.root();
    let proof = tree.proof(500).expect("index in range");

    c.bench_function("verify_proof", |b| {
        b.iter(|| {
            verify_proof(
                black_box(&proof.leaf),
                black_box(&root),
                black_box(&proof.proof),
                black_box(proof.index),
            )
        })
    });
}

criterion_group!(benches, bench_tree_creation, bench_verify);
criterion_main!(benches);
