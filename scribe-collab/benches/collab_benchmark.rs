use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use scribe_collab::broadcast::{BroadcastGroup, RoomEvent};
use scribe_collab::config::ServerConfig;
use scribe_collab::presence::{CursorPosition, RoomPresence, UserColor};
use scribe_collab::protocol::{ClientMessage, ServerMessage};
use scribe_collab::session::RoomSession;
use scribe_core::Operation;
use std::hint::black_box;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn typing_op() -> Operation {
    Operation::insert_at("bench", Uuid::from_u128(1), 41, 2048, 1024, "x").unwrap()
}

fn bench_submit_encode(c: &mut Criterion) {
    let msg = ClientMessage::Submit { operation: typing_op() };

    c.bench_function("submit_encode", |b| b.iter(|| black_box(msg.encode().unwrap())));
}

fn bench_broadcast_decode(c: &mut Criterion) {
    let encoded = ServerMessage::Broadcast {
        room_id: "bench".into(),
        operation: typing_op(),
        version: 42,
    }
    .encode()
    .unwrap();

    c.bench_function("broadcast_decode", |b| {
        b.iter(|| black_box(ServerMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_broadcast_json(c: &mut Criterion) {
    let msg = ServerMessage::Broadcast {
        room_id: "bench".into(),
        operation: typing_op(),
        version: 42,
    };

    c.bench_function("broadcast_json_roundtrip", |b| {
        b.iter(|| {
            let text = msg.to_json().unwrap();
            black_box(ServerMessage::from_json(&text).unwrap())
        })
    });
}

/// Ten members typing concurrently against a room one version behind.
fn bench_session_submit(c: &mut Criterion) {
    let config = ServerConfig {
        initial_text: "a".repeat(2048),
        ..ServerConfig::default()
    };

    c.bench_function("session_submit_concurrent_10", |b| {
        b.iter_batched(
            || {
                let mut session = RoomSession::new("bench", &config);
                let now = Instant::now();
                for i in 0..10u128 {
                    session.join(Uuid::from_u128(i), &format!("user{i}"), now).unwrap();
                }
                session
            },
            |mut session| {
                let now = Instant::now();
                for i in 0..10u128 {
                    let op = Operation::insert_at("bench", Uuid::from_u128(i), 0, 2048, (i * 100) as usize, "x").unwrap();
                    black_box(session.submit(Uuid::from_u128(i), op, now).unwrap());
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_presence_transform(c: &mut Criterion) {
    let mut presence = RoomPresence::new(Duration::from_secs(5));
    let now = Instant::now();
    for i in 0..100u128 {
        presence.update(Uuid::from_u128(i), "user", CursorPosition::caret(i as usize * 20), now);
    }
    let op = Operation::insert_at("bench", Uuid::from_u128(1), 0, 2048, 512, "hello").unwrap();

    c.bench_function("presence_transform_100", |b| b.iter(|| presence.transform(black_box(&op))));
}

fn bench_fan_out(c: &mut Criterion) {
    let group = BroadcastGroup::new(2048);
    let receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
    let color = UserColor::for_name("Alice");

    c.bench_function("fan_out_cursor_100", |b| {
        b.iter(|| {
            group.send(RoomEvent::Cursor {
                client_id: Uuid::nil(),
                display_name: "Alice".into(),
                color: color.clone(),
                position: CursorPosition::caret(3),
                version: 0,
            })
        })
    });
    drop(receivers);
}

criterion_group!(
    benches,
    bench_submit_encode,
    bench_broadcast_decode,
    bench_broadcast_json,
    bench_session_submit,
    bench_presence_transform,
    bench_fan_out,
);
criterion_main!(benches);
