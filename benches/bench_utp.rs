//! uTP benchmark - handshake latency and bulk-transfer throughput over a
//! real loopback UDP socket pair, in the shape of `kaos-rudp`'s
//! `bench_rudp` (drive both ends from the same thread, spin on `poll`).

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use kaos_utp::UtpManager;
use std::time::{Duration, Instant};

fn drive_handshake() -> Duration {
    let mut server = UtpManager::bind("127.0.0.1:0").unwrap();
    let mut client = UtpManager::bind("127.0.0.1:0").unwrap();
    let server_addr = server.local_addr();

    let start = Instant::now();
    let client_key = client.connect(server_addr).unwrap();

    loop {
        server.poll().unwrap();
        client.poll().unwrap();
        server.tick(Instant::now());
        client.tick(Instant::now());

        if server.accept().is_some()
            && client
                .connection(client_key)
                .map(|c| c.state == kaos_utp::State::Connected)
                .unwrap_or(false)
        {
            break;
        }
        if start.elapsed() > Duration::from_secs(2) {
            panic!("handshake did not complete");
        }
    }
    start.elapsed()
}

fn drive_bulk_transfer(total_bytes: usize) -> (f64, usize) {
    let mut server = UtpManager::bind("127.0.0.1:0").unwrap();
    let mut client = UtpManager::bind("127.0.0.1:0").unwrap();
    let server_addr = server.local_addr();

    let client_key = client.connect(server_addr).unwrap();
    let mut server_key = None;

    let chunk = vec![0x42u8; 1024];
    let mut sent = 0usize;
    let mut received = 0usize;

    let start = Instant::now();
    while received < total_bytes {
        client.poll().unwrap();
        server.poll().unwrap();

        if server_key.is_none() {
            server_key = server.accept();
        }

        if client
            .connection(client_key)
            .map(|c| c.state == kaos_utp::State::Connected)
            .unwrap_or(false)
            && sent < total_bytes
        {
            let take = chunk.len().min(total_bytes - sent);
            client.queue_write(client_key, &chunk[..take]);
            sent += take;
        }
        client.pump_writes();

        if let Some(key) = server_key {
            for drained in server.drain_readable() {
                if drained == key {
                    if let Some(conn) = server.connection_mut(key) {
                        received += conn.drain_received().len();
                    }
                }
            }
        }

        client.tick(Instant::now());
        server.tick(Instant::now());

        if start.elapsed() > Duration::from_secs(10) {
            break;
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    (received as f64 / elapsed / 1_000_000.0, received)
}

fn benchmark_handshake(c: &mut Criterion) {
    let mut group = c.benchmark_group("uTP handshake");
    group.bench_function("connect+accept", |b| {
        b.iter(drive_handshake);
    });
    group.finish();
}

fn benchmark_bulk_transfer(c: &mut Criterion) {
    const BYTES: usize = 2_000_000;
    let mut group = c.benchmark_group("uTP bulk transfer (2MB)");
    group.throughput(Throughput::Bytes(BYTES as u64));
    group.sample_size(10);

    group.bench_function("localhost", |b| {
        b.iter(|| {
            let (throughput_mb_s, received) = drive_bulk_transfer(BYTES);
            assert!(received >= BYTES * 99 / 100, "lost >1% of bytes");
            assert!(throughput_mb_s > 0.0, "throughput should be positive");
            BYTES
        })
    });
    group.finish();
}

criterion_group!(benches, benchmark_handshake, benchmark_bulk_transfer);
criterion_main!(benches);
