//! uTP echo client
//!
//! Run: cargo run --example echo_client -- 127.0.0.1:20001

use kaos_utp::{Stream, UtpManager};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("uTP Echo Client");
    println!("====================");

    let server_addr: std::net::SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:20001".to_string())
        .parse()?;

    let mut manager = UtpManager::bind("127.0.0.1:0")?;
    println!("Client: {}", manager.local_addr());
    println!("Server: {}", server_addr);

    let key = manager.connect(server_addr)?;
    let mut stream = Stream::new(key);

    let connected = Rc::new(RefCell::new(false));
    let c = connected.clone();
    stream.set_connect_handler(move |_mgr, result| {
        *c.borrow_mut() = result.is_ok();
        match result {
            Ok(()) => println!("connected"),
            Err(e) => println!("connect failed: {}", e),
        }
    });

    let start = Instant::now();
    let duration = Duration::from_secs(5);
    let mut sent = 0u64;
    let mut wrote_one = false;

    while start.elapsed() < duration {
        manager.poll()?;
        stream.service(&mut manager);

        if *connected.borrow() && !wrote_one {
            let msg = format!("message {}", sent);
            stream.add_write_buffer(msg.into_bytes());
            stream.set_write_handler(|_mgr, result| match result {
                Ok(n) => println!("wrote {} bytes", n),
                Err(e) => println!("write error: {}", e),
            });
            stream.add_read_buffer(0);
            stream.set_read_handler(|_mgr, result| match result {
                Ok(bytes) => println!("echo: {}", String::from_utf8_lossy(&bytes)),
                Err(e) => println!("read error: {}", e),
            });
            sent += 1;
            wrote_one = true;
        }

        manager.tick(Instant::now());
        std::thread::sleep(Duration::from_millis(1));
    }

    println!("sent {} messages over {:.2}s", sent, start.elapsed().as_secs_f64());
    stream.destroy(&mut manager);
    Ok(())
}
