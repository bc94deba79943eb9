//! Batch processor benchmarks.

use criterion::{ criterion_group, criterion_main, BatchSize, Criterion, Throughput };
use steerq::{ Computation, Engine, EngineConfig, GroupPolicy, RawPacket };

const IFINDEX: u32 = 1;

fn setup(comp: Computation) -> std::sync::Arc<Engine> {
    let config = EngineConfig::new(1)
        .unwrap()
        .with_prefetch_len(64)
        .unwrap()
        .with_cap_len(256)
        .unwrap()
        .with_queue_slots(1 << 16)
        .unwrap();
    let engine = Engine::new(config).unwrap();

    let sock_a = engine.socket_open().unwrap();
    let sock_b = engine.socket_open().unwrap();
    engine.toggle_queue(sock_a, true).unwrap();
    engine.toggle_queue(sock_b, true).unwrap();
    let gid = engine.group_join(sock_a, None, 1, GroupPolicy::Shared).unwrap();
    engine.group_join(sock_b, Some(gid), 1, GroupPolicy::Shared).unwrap();
    engine.bind(sock_a, gid, IFINDEX, -1).unwrap();
    engine.set_group_computation(sock_a, gid, Some(comp)).unwrap();
    engine
}

fn packets(count: u32) -> Vec<RawPacket> {
    (0..count)
        .map(|i| {
            let mut data = vec![0u8; 64];
            data[0..4].copy_from_slice(&i.to_be_bytes());
            RawPacket::new(data, IFINDEX, 0)
        })
        .collect()
}

fn bench_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch");
    group.throughput(Throughput::Elements(64));

    group.bench_function("steering_64", |b| {
        let engine = setup(Computation::steer_word(0));
        b.iter_batched(
            || packets(64),
            |batch| {
                for packet in batch {
                    engine.receive(0, packet, false).unwrap();
                }
                // Drain so the queues never fill.
                let _ = engine.read_batch(0, 64);
                let _ = engine.read_batch(1, 64);
            },
            BatchSize::SmallInput
        );
    });

    group.bench_function("broadcast_64", |b| {
        let engine = setup(Computation::broadcast());
        b.iter_batched(
            || packets(64),
            |batch| {
                for packet in batch {
                    engine.receive(0, packet, false).unwrap();
                }
                let _ = engine.read_batch(0, 64);
                let _ = engine.read_batch(1, 64);
            },
            BatchSize::SmallInput
        );
    });

    group.finish();
}

criterion_group!(benches, bench_batch);
criterion_main!(benches);
