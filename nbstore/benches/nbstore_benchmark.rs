use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use nbstore::impls::cloud::protocol::{encode_bin, Frame, PushDocUpdate, PUSH_DOC_UPDATE};
use nbstore::impls::local::LocalDocStorage;
use nbstore::storage::{UpdateMerger, YrsMerger};
use nbstore::{Connection, DocStorage, DocUpdate, SpaceType, Storage, StorageOptions, StoreConfig, StoreContext};
use yrs::{Doc, ReadTxn, Text, Transact};

/// `count` incremental updates typing into one text.
fn typing_updates(count: usize) -> Vec<Vec<u8>> {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("content");
    (0..count)
        .map(|i| {
            let before = doc.transact().state_vector();
            {
                let mut txn = doc.transact_mut();
                text.insert(&mut txn, i as u32, "x");
            }
            doc.transact().encode_state_as_update_v1(&before)
        })
        .collect()
}

fn bench_merge_updates(c: &mut Criterion) {
    let updates = typing_updates(100);
    let slices: Vec<&[u8]> = updates.iter().map(Vec::as_slice).collect();

    c.bench_function("merge_100_updates", |b| {
        b.iter(|| {
            black_box(YrsMerger.merge_updates(black_box(&slices)).unwrap());
        })
    });
}

fn bench_diff(c: &mut Criterion) {
    let updates = typing_updates(200);
    let slices: Vec<&[u8]> = updates.iter().map(Vec::as_slice).collect();
    let doc = YrsMerger.merge_updates(&slices).unwrap();
    let half: Vec<&[u8]> = slices[..100].to_vec();
    let state = YrsMerger.state_vector(&YrsMerger.merge_updates(&half).unwrap()).unwrap();

    c.bench_function("diff_against_half_state", |b| {
        b.iter(|| {
            black_box(YrsMerger.diff(black_box(&doc), Some(black_box(&state))).unwrap());
        })
    });

    c.bench_function("diff_full_doc", |b| {
        b.iter(|| {
            black_box(YrsMerger.diff(black_box(&doc), None).unwrap());
        })
    });
}

fn bench_push_frame_encode(c: &mut Criterion) {
    let update = vec![7u8; 1024];

    c.bench_function("push_frame_encode_1KB", |b| {
        b.iter(|| {
            let payload = PushDocUpdate {
                space_type: SpaceType::Workspace,
                space_id: "ws".into(),
                doc_id: "page".into(),
                updates: encode_bin(black_box(&update)),
            };
            let frame = Frame::Event {
                event: PUSH_DOC_UPDATE.into(),
                data: serde_json::to_value(&payload).unwrap(),
                ack: Some(1),
            };
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_local_push_and_read(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let ctx = StoreContext::new(StoreConfig::for_testing(dir.path()));
    let storage = LocalDocStorage::new(StorageOptions::new("local", SpaceType::Workspace, "bench"), &ctx);
    rt.block_on(async {
        storage.connection().connect();
        storage.connection().wait_for_connected(None).await.unwrap();
    });
    let updates = typing_updates(50);

    c.bench_function("local_push_50_then_get_doc", |b| {
        let mut round = 0u64;
        b.iter(|| {
            round += 1;
            let doc_id = format!("doc-{round}");
            rt.block_on(async {
                for update in &updates {
                    storage
                        .push_doc_update(DocUpdate::new(doc_id.as_str(), update.clone()), None)
                        .await
                        .unwrap();
                }
                black_box(storage.get_doc(&doc_id).await.unwrap());
            });
        })
    });
}

criterion_group!(
    benches,
    bench_merge_updates,
    bench_diff,
    bench_push_frame_encode,
    bench_local_push_and_read,
);
criterion_main!(benches);
