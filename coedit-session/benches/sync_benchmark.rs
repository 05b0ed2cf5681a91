use std::hint::black_box;
use std::time::{Duration, Instant};

use coedit_session::awareness::{
    AwarenessField, AwarenessTable, AwarenessUser, CursorRange, EmitThrottle,
};
use coedit_session::offline::OfflineQueue;
use coedit_session::protocol::WireMessage;
use coedit_session::replica::{EditOp, MutationOrigin, ReplicaManager, UpdateFragment};
use criterion::{criterion_group, criterion_main, Criterion};

fn typed_fragments(count: u32) -> Vec<UpdateFragment> {
    let mut replica = ReplicaManager::new();
    (0..count)
        .map(|i| {
            replica
                .mutate(&[EditOp::insert(i, "x")], MutationOrigin::Local)
                .unwrap()
        })
        .collect()
}

fn bench_replica_local_keystroke(c: &mut Criterion) {
    c.bench_function("replica_local_keystroke", |b| {
        let mut replica = ReplicaManager::new();
        let mut at = 0u32;
        b.iter(|| {
            let fragment = replica
                .mutate(&[EditOp::insert(black_box(at), "a")], MutationOrigin::Local)
                .unwrap();
            at += 1;
            black_box(fragment);
        })
    });
}

fn bench_replica_apply_1000_fragments(c: &mut Criterion) {
    let fragments = typed_fragments(1000);

    c.bench_function("replica_apply_1000_fragments", |b| {
        b.iter(|| {
            let mut replica = ReplicaManager::new();
            for fragment in &fragments {
                replica
                    .apply_update(black_box(fragment.as_bytes()), MutationOrigin::Remote)
                    .unwrap();
            }
            black_box(replica.len());
        })
    });
}

fn bench_snapshot_bootstrap_10k(c: &mut Criterion) {
    let mut source = ReplicaManager::new();
    source
        .mutate(&[EditOp::insert(0, "fn main() {}\n".repeat(800))], MutationOrigin::Local)
        .unwrap();
    let snapshot = source.encode_snapshot();

    c.bench_function("snapshot_bootstrap_10k", |b| {
        b.iter(|| {
            let mut replica = ReplicaManager::new();
            replica.apply_snapshot(black_box(snapshot.as_bytes())).unwrap();
            black_box(replica.len());
        })
    });
}

fn bench_update_frame_encode(c: &mut Criterion) {
    let fragment = typed_fragments(1).remove(0);

    c.bench_function("update_frame_encode", |b| {
        b.iter(|| {
            let frame = WireMessage::update(black_box(fragment.as_bytes()));
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_update_frame_decode(c: &mut Criterion) {
    let fragment = typed_fragments(1).remove(0);
    let text = WireMessage::update(fragment.as_bytes()).encode().unwrap();

    c.bench_function("update_frame_decode", |b| {
        b.iter(|| {
            black_box(WireMessage::decode(black_box(&text)).unwrap());
        })
    });
}

fn bench_awareness_encode_100_peers(c: &mut Criterion) {
    let mut table = AwarenessTable::with_client_id(0);
    for client_id in 1..=100u64 {
        let mut peer = AwarenessTable::with_client_id(client_id);
        peer.set_local(AwarenessField::User(Some(AwarenessUser {
            id: client_id.to_string(),
            name: format!("peer-{client_id}"),
            color: "#6eeb83".into(),
            color_light: "#6eeb8333".into(),
        })));
        peer.set_local(AwarenessField::Cursor(Some(CursorRange { anchor: 4, head: 9 })));
        table
            .apply_remote_update(&peer.encode_entries(&[client_id]).unwrap())
            .unwrap();
    }
    let clients: Vec<u64> = (1..=100).collect();

    c.bench_function("awareness_encode_100_peers", |b| {
        b.iter(|| {
            black_box(table.encode_entries(black_box(&clients)).unwrap());
        })
    });
}

fn bench_awareness_merge(c: &mut Criterion) {
    let mut remote = AwarenessTable::with_client_id(7);
    remote.set_local(AwarenessField::Cursor(Some(CursorRange::caret(3))));
    let update = remote.encode_entries(&[7]).unwrap();

    c.bench_function("awareness_merge", |b| {
        b.iter(|| {
            let mut table = AwarenessTable::with_client_id(1);
            black_box(table.apply_remote_update(black_box(&update)).unwrap());
        })
    });
}

fn bench_emit_throttle_burst(c: &mut Criterion) {
    c.bench_function("emit_throttle_burst_1000", |b| {
        b.iter(|| {
            let mut throttle = EmitThrottle::new(Duration::from_millis(100));
            let now = Instant::now();
            for i in 0..1000u64 {
                black_box(throttle.offer(&[i % 8], now));
            }
            black_box(throttle.flush_due(now + Duration::from_millis(100)));
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    let fragments = typed_fragments(1000);

    c.bench_function("offline_queue_1000_replay", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for fragment in &fragments {
                queue.enqueue(fragment.clone());
            }
            black_box(queue.drain());
        })
    });
}

criterion_group!(
    benches,
    bench_replica_local_keystroke,
    bench_replica_apply_1000_fragments,
    bench_snapshot_bootstrap_10k,
    bench_update_frame_encode,
    bench_update_frame_decode,
    bench_awareness_encode_100_peers,
    bench_awareness_merge,
    bench_emit_throttle_burst,
    bench_offline_queue,
);
criterion_main!(benches);
