//! uTP echo server
//!
//! Run: cargo run --example echo_server -- 127.0.0.1:20001

use kaos_utp::UtpManager;
use std::time::{Duration, Instant};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("uTP Echo Server");
    println!("====================");

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:20001".to_string());
    let mut manager = UtpManager::bind(&bind_addr)?;
    println!("Listening on: {}", manager.local_addr());

    loop {
        manager.poll()?;

        while let Some(key) = manager.accept() {
            println!("accepted connection from {:?}", key.0);
        }

        for key in manager.drain_readable() {
            let echoed = match manager.connection_mut(key) {
                Some(conn) if conn.receive_buffer_size() > 0 => Some(conn.drain_received()),
                _ => None,
            };
            if let Some(bytes) = echoed {
                println!("echoing {} bytes back to {:?}", bytes.len(), key.0);
                manager.queue_write(key, &bytes);
            }
        }

        manager.pump_writes();
        manager.tick(Instant::now());
        std::thread::sleep(Duration::from_millis(1));
    }
}
