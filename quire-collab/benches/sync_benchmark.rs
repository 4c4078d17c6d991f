use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use quire_collab::protocol::{DocumentId, InboundMessage, ServerMessage};
use quire_collab::registry::{Member, Registry};
use quire_collab::transport::ChannelTransport;
use serde_json::json;
use uuid::Uuid;

fn bench_parse_edit(c: &mut Criterion) {
    let frame = InboundMessage::edit_frame(&json!({
        "ops": [{"retain": 120}, {"insert": "collaborative", "attributes": {"bold": true}}]
    }))
    .unwrap();

    c.bench_function("parse_edit_frame", |b| {
        b.iter(|| black_box(InboundMessage::parse(black_box(&frame)).unwrap()))
    });
}

fn bench_parse_ignored(c: &mut Criterion) {
    let frame = r#"{"type":"cursor","position":42}"#;

    c.bench_function("parse_ignored_frame", |b| {
        b.iter(|| black_box(InboundMessage::parse(black_box(frame)).unwrap()))
    });
}

fn bench_encode_initial(c: &mut Criterion) {
    let content = json!({"ops": (0..100).map(|i| json!({"insert": format!("line {i}\n")})).collect::<Vec<_>>()});

    c.bench_function("encode_initial_100_ops", |b| {
        b.iter(|| {
            let message = ServerMessage::initial("Benchmark", Some(content.clone()));
            black_box(message.encode().unwrap())
        })
    });
}

fn bench_snapshot_members(c: &mut Criterion) {
    let registry = Registry::new();
    let mut receivers = Vec::new();
    for doc in 0..10u64 {
        for _ in 0..100 {
            let (transport, rx) = ChannelTransport::pair();
            receivers.push(rx);
            registry.register(DocumentId(doc), Member::new(Uuid::new_v4(), transport));
        }
    }

    c.bench_function("snapshot_members_100_peers", |b| {
        b.iter(|| black_box(registry.snapshot_members(black_box(DocumentId(3)))))
    });
}

fn bench_register_unregister(c: &mut Criterion) {
    let registry = Registry::new();
    let (transport, _rx) = ChannelTransport::pair();

    c.bench_function("register_unregister", |b| {
        b.iter(|| {
            let id = Uuid::new_v4();
            registry.register(DocumentId(1), Member::new(id, transport.clone()));
            black_box(registry.unregister(DocumentId(1), &id));
        })
    });
}

criterion_group!(
    benches,
    bench_parse_edit,
    bench_parse_ignored,
    bench_encode_initial,
    bench_snapshot_members,
    bench_register_unregister,
);
criterion_main!(benches);
