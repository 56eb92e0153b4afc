//! Fan-out and frame parsing benchmarks
//!
//! Run with: cargo bench --bench fanout

use std::net::{IpAddr, Ipv4Addr};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use presence_server::net::protocol::{self, ServerMessage, DELIM, MESSAGE_DELIM};
use presence_server::session::client::{Admission, Channels, Payload};
use presence_server::session::Registry;
use presence_server::store::{PlayerRecord, Profile, Rank, Standing};
use tokio::sync::{mpsc, oneshot};

struct Peer {
    rx: mpsc::Receiver<Payload>,
    _hangup: oneshot::Receiver<()>,
}

fn admission(i: usize) -> Admission {
    Admission {
        player: PlayerRecord {
            uuid: format!("player-{}", i),
            name: format!("P{}", i),
            rank: Rank::PLAYER,
            badge: "null".to_string(),
            account: true,
            standing: Standing::Good,
            muted: false,
        },
        profile: Profile::default(),
        addr: IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + i as u32)),
        offline: false,
        flush_mark: 0,
    }
}

/// Registry with `count` clients whose queues are deep enough for a benchmark run
fn populated_registry(count: usize) -> (Registry, Vec<Peer>) {
    let mut registry = Registry::new(count as u32 + 1, 3);
    let peers = (0..count)
        .map(|i| {
            let (outbound, rx) = mpsc::channel(4096);
            let (hangup, hangup_rx) = oneshot::channel();
            registry
                .admit(admission(i), Channels { outbound, hangup })
                .unwrap();
            Peer {
                rx,
                _hangup: hangup_rx,
            }
        })
        .collect();
    (registry, peers)
}

fn drain(peers: &mut [Peer]) {
    for peer in peers {
        while peer.rx.try_recv().is_ok() {}
    }
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");
    group.sample_size(50);

    for count in [100, 500, 1000] {
        let (mut registry, mut peers) = populated_registry(count);
        let payload: Payload = ServerMessage::GlobalSay {
            uuid: "player-0",
            map_id: "0001",
            x: 10,
            y: 20,
            msg: "hello everyone",
        }
        .encode()
        .into();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let evicted = registry.broadcast(black_box(&payload), Some("player-0"));
                drain(&mut peers);
                evicted
            });
        });
    }
    group.finish();
}

fn bench_frame_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_parse");

    for messages in [1, 8, 32] {
        let one = ["gsay", "0001", "10", "20", "hello everyone"].join(DELIM.to_string().as_str());
        let frame = vec![one; messages].join(MESSAGE_DELIM.to_string().as_str());

        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(messages), &frame, |b, frame| {
            b.iter(|| {
                let text = protocol::validate_frame(black_box(frame.as_bytes())).unwrap();
                protocol::split_messages(text)
                    .filter_map(|m| protocol::decode(m).ok())
                    .count()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_broadcast, bench_frame_parse);
criterion_main!(benches);
