use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use quill_crdt::{DocumentState, Replica, SiteId};
use std::hint::black_box;

fn typed_replica(chars: usize) -> Replica {
    let mut replica = Replica::new(SiteId::from_u128(1));
    for i in 0..chars {
        let ch = (b'a' + (i % 26) as u8) as char;
        replica.insert(i, ch).unwrap();
    }
    replica
}

fn bench_local_typing(c: &mut Criterion) {
    let mut group = c.benchmark_group("Sequence CRDT");
    group.throughput(Throughput::Elements(1));

    group.bench_function("append_char_1k_doc", |b| {
        let mut replica = typed_replica(1_000);
        b.iter(|| {
            let end = replica.len();
            black_box(replica.insert(end, 'x').unwrap());
        })
    });

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("Sequence CRDT");
    let mut source = Replica::new(SiteId::from_u128(1));
    let ops = source.insert_str(0, &"lorem ipsum ".repeat(40)).unwrap();
    group.throughput(Throughput::Elements(ops.len() as u64));

    group.bench_function("apply_480_remote_inserts", |b| {
        b.iter(|| {
            let mut dest = Replica::new(SiteId::from_u128(2));
            for op in &ops {
                dest.apply_operation(black_box(op.clone())).unwrap();
            }
            black_box(dest.len());
        })
    });

    group.bench_function("apply_480_remote_inserts_reversed", |b| {
        b.iter(|| {
            let mut dest = Replica::new(SiteId::from_u128(2));
            for op in ops.iter().rev() {
                dest.apply_operation(black_box(op.clone())).unwrap();
            }
            black_box(dest.len());
        })
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let a = typed_replica(2_000);
    let state = a.state();

    c.bench_function("merge_2k_into_empty", |b| {
        b.iter(|| {
            let mut dest = Replica::new(SiteId::from_u128(2));
            black_box(dest.merge(black_box(&state)).len());
        })
    });

    c.bench_function("merge_2k_already_synced", |b| {
        let mut dest = Replica::from_state(SiteId::from_u128(2), &state);
        b.iter(|| {
            black_box(dest.merge(black_box(&state)).len());
        })
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let state = typed_replica(2_000).state();
    let encoded = state.encode().unwrap();

    c.bench_function("snapshot_encode_2k", |b| {
        b.iter(|| black_box(state.encode().unwrap()))
    });

    c.bench_function("snapshot_decode_2k", |b| {
        b.iter(|| black_box(DocumentState::decode(black_box(&encoded)).unwrap()))
    });
}

criterion_group!(benches, bench_local_typing, bench_apply_remote, bench_merge, bench_snapshot);
criterion_main!(benches);
