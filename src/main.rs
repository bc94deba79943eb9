//! Demo binary for the steerq capture engine.
//!
//! Sets up two weighted consumer sockets on one group, feeds synthetic
//! traffic through the per-CPU pipelines, and prints the resulting
//! steering distribution and counters.

use steerq::{ Computation, Engine, EngineConfig, GroupPolicy, RawPacket };

const IFINDEX: u32 = 1;
const PACKETS_PER_CPU: u32 = 100_000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cpus = num_cpus::get().min(4);
    println!("steerq - packet capture and steering engine");
    println!("===========================================");
    println!("CPUs: {}", cpus);

    let config = EngineConfig::new(cpus)?
        .with_prefetch_len(64)?
        .with_cap_len(256)?
        .with_queue_slots(1 << 18)?;
    let engine = Engine::new(config)?;
    engine.start_flush_timer();

    // Two consumers with a 1:3 steering weight split.
    let sock_a = engine.socket_open()?;
    let sock_b = engine.socket_open()?;
    engine.toggle_queue(sock_a, true)?;
    engine.toggle_queue(sock_b, true)?;
    engine.set_weight(sock_a, 1)?;
    engine.set_weight(sock_b, 3)?;

    let gid = engine.group_join(sock_a, None, 1, GroupPolicy::Shared)?;
    engine.group_join(sock_b, Some(gid), 1, GroupPolicy::Shared)?;
    engine.bind(sock_a, gid, IFINDEX, -1)?;
    engine.set_group_computation(sock_a, gid, Some(Computation::steer_word(0)))?;

    println!("group {}: sockets {} (weight 1) and {} (weight 3)", gid, sock_a, sock_b);
    println!("feeding {} packets per CPU...", PACKETS_PER_CPU);

    std::thread::scope(|scope| {
        let engine = &engine;
        for cpu in 0..cpus {
            scope.spawn(move || {
                for i in 0..PACKETS_PER_CPU {
                    let mut data = vec![0u8; 64];
                    data[0..4].copy_from_slice(&i.to_be_bytes());
                    let packet = RawPacket::new(data, IFINDEX, cpu as u16);
                    let _ = engine.receive(cpu, packet, false);
                }
                engine.flush(cpu);
            });
        }
    });

    let total = (cpus as u64) * (PACKETS_PER_CPU as u64);
    let stats_a = engine.sock_stats(sock_a)?;
    let stats_b = engine.sock_stats(sock_b)?;
    let global = engine.stats();

    println!("\nResults:");
    println!("  engine recv: {} (expected {})", global.recv, total);
    println!(
        "  socket {}: recv {} ({:.1}%), lost {}",
        sock_a,
        stats_a.recv,
        (100.0 * (stats_a.recv as f64)) / (total as f64),
        stats_a.lost
    );
    println!(
        "  socket {}: recv {} ({:.1}%), lost {}",
        sock_b,
        stats_b.recv,
        (100.0 * (stats_b.recv as f64)) / (total as f64),
        stats_b.lost
    );

    let group = engine.group_stats(sock_a, gid)?;
    println!(
        "  group {}: recv {}, drop {}, frwd {}, kern {}",
        gid,
        group.recv,
        group.drop,
        group.frwd,
        group.kern
    );

    engine.shutdown();
    Ok(())
}
