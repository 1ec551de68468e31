//! Benchmarks for the storage stack and document merging
//!
//! Run with: cargo bench -p autodoc-core
//!
//! These benchmarks establish performance baselines for:
//! - Encrypted, namespaced put/get (the slow-tier path)
//! - Storage key encoding
//! - Merging remote changes into a document

use std::sync::Arc;

use autodoc_core::automerge::transaction::Transactable;
use autodoc_core::automerge::{AutoCommit, ObjType, ROOT};
use autodoc_core::identity::self_key;
use autodoc_core::{
    DocumentId, EncryptedStorage, Identity, KeyPair, MemoryStorage, NamespacedStorage,
    StorageAdapter, StorageKey,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

fn slow_stack() -> Arc<dyn StorageAdapter> {
    let alice = Identity::parse("did:plc:alice").unwrap();
    let key = self_key(&KeyPair::from_seed(&[7u8; 32])).unwrap();
    let namespaced = Arc::new(NamespacedStorage::new(
        Arc::new(MemoryStorage::new()),
        &DocumentId::catalog(&alice),
    ));
    Arc::new(EncryptedStorage::new(namespaced, &key))
}

// ============================================================================
// Storage Benchmarks
// ============================================================================

fn bench_encrypted_put_get(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("encrypted_namespaced");

    for size in [256usize, 4 * 1024, 64 * 1024] {
        let value = vec![0xAB; size];
        let key = StorageKey::new(["snapshot", "0123456789abcdef"]);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("put", size), &value, |b, value| {
            let stack = slow_stack();
            b.iter(|| rt.block_on(stack.put(&key, black_box(value))).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("get", size), &value, |b, value| {
            let stack = slow_stack();
            rt.block_on(stack.put(&key, value)).unwrap();
            b.iter(|| black_box(rt.block_on(stack.get(&key)).unwrap()))
        });
    }

    group.finish();
}

fn bench_key_encoding(c: &mut Criterion) {
    let key = StorageKey::new(["dm/did:plc:alice/did:plc:bob", "incremental", "af3c09"]);
    c.bench_function("storage_key_encode", |b| b.iter(|| black_box(key.encode())));

    let encoded = key.encode();
    c.bench_function("storage_key_decode", |b| {
        b.iter(|| black_box(StorageKey::decode(&encoded).unwrap()))
    });
}

// ============================================================================
// Merge Benchmarks
// ============================================================================

fn channel_with_messages(n: usize) -> AutoCommit {
    let mut doc = AutoCommit::new();
    let list = doc.put_object(&ROOT, "messages", ObjType::List).unwrap();
    for i in 0..n {
        let msg = doc.insert_object(&list, i, ObjType::Map).unwrap();
        doc.put(&msg, "body", format!("message {i}")).unwrap();
        doc.put(&msg, "sent_at", i as i64).unwrap();
    }
    doc.commit();
    doc
}

fn bench_merge_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_remote");

    for n in [10usize, 100, 1000] {
        let mut source = channel_with_messages(n);
        let bytes = source.save();
        group.bench_with_input(BenchmarkId::new("full_state", n), &bytes, |b, bytes| {
            b.iter_batched(
                AutoCommit::new,
                |mut doc| black_box(doc.load_incremental(bytes).unwrap()),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encrypted_put_get,
    bench_key_encoding,
    bench_merge_remote
);
criterion_main!(benches);
