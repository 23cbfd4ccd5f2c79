//! Integration tests for kaos-utp: two managers driven from the same
//! thread against real loopback UDP sockets (no mocked transport), the
//! way `kaos-rudp`'s examples drive a client/server pair.

use kaos_utp::{Stream, UtpManager};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn connect_pair() -> (UtpManager, UtpManager, kaos_utp::ConnKey, kaos_utp::ConnKey) {
    let mut server = UtpManager::bind("127.0.0.1:0").unwrap();
    let mut client = UtpManager::bind("127.0.0.1:0").unwrap();
    let server_addr = server.local_addr();

    let client_key = client.connect(server_addr).unwrap();

    let mut server_key = None;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        server.poll().unwrap();
        client.poll().unwrap();
        if server_key.is_none() {
            server_key = server.accept();
        }
        let now = Instant::now();
        server.tick(now);
        client.tick(now);
        let client_connected = client
            .connection(client_key)
            .map(|c| c.state == kaos_utp::State::Connected)
            .unwrap_or(false);
        if client_connected && server_key.is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "handshake did not complete");
        std::thread::sleep(Duration::from_millis(1));
    }
    (server, client, server_key.unwrap(), client_key)
}

#[test]
fn handshake_connect_disconnect() {
    // S1 - connect/disconnect
    let (mut server, mut client, server_key, client_key) = connect_pair();
    assert_eq!(client.connection(client_key).unwrap().state, kaos_utp::State::Connected);
    assert_eq!(server.connection(server_key).unwrap().state, kaos_utp::State::Connected);

    client.queue_write(client_key, b"hi");
    client.pump_writes();

    let deadline = Instant::now() + Duration::from_secs(5);
    while server
        .connection(server_key)
        .map(|c| c.receive_buffer_size() < 2)
        .unwrap_or(true)
    {
        server.poll().unwrap();
        client.poll().unwrap();
        let now = Instant::now();
        server.tick(now);
        client.tick(now);
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(1));
    }
    let received = server.connection_mut(server_key).unwrap().drain_received();
    assert_eq!(received, b"hi");

    client.close(client_key);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !server.connection(server_key).map(|c| c.eof).unwrap_or(false) {
        server.poll().unwrap();
        client.poll().unwrap();
        let now = Instant::now();
        server.tick(now);
        client.tick(now);
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(server.connection(server_key).unwrap().eof);
}

#[test]
fn bulk_transfer_preserves_byte_order() {
    let (mut server, mut client, server_key, client_key) = connect_pair();

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    client.queue_write(client_key, &payload);

    let deadline = Instant::now() + Duration::from_secs(15);
    let mut received = Vec::new();
    while received.len() < payload.len() {
        client.poll().unwrap();
        server.poll().unwrap();
        client.pump_writes();
        for key in server.drain_readable() {
            if key == server_key {
                if let Some(conn) = server.connection_mut(key) {
                    received.extend(conn.drain_received());
                }
            }
        }
        let now = Instant::now();
        client.tick(now);
        server.tick(now);
        assert!(Instant::now() < deadline, "bulk transfer stalled");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(received, payload);
}

#[test]
fn stream_facade_round_trip() {
    let (mut server, mut client, server_key, client_key) = connect_pair();
    let mut client_stream = Stream::new(client_key);

    client_stream.add_write_buffer(b"round trip".to_vec());
    let wrote = Rc::new(RefCell::new(None));
    let w = wrote.clone();
    client_stream.set_write_handler(move |_mgr, result| {
        *w.borrow_mut() = Some(result.unwrap_or(0));
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while wrote.borrow().is_none() {
        server.poll().unwrap();
        client.poll().unwrap();
        client_stream.service(&mut client);
        let now = Instant::now();
        server.tick(now);
        client.tick(now);
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(wrote.borrow().unwrap(), b"round trip".len());

    let deadline = Instant::now() + Duration::from_secs(5);
    while server
        .connection(server_key)
        .map(|c| c.receive_buffer_size() < b"round trip".len())
        .unwrap_or(true)
    {
        server.poll().unwrap();
        client.poll().unwrap();
        let now = Instant::now();
        server.tick(now);
        client.tick(now);
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(1));
    }
    let received = server.connection_mut(server_key).unwrap().drain_received();
    assert_eq!(received, b"round trip");

    client_stream.destroy(&mut client);
}

#[test]
fn reset_on_unmatched_datagram_does_not_crash_sender() {
    // A STATE/DATA packet to a connection id nobody owns gets an
    // ST_RESET reply (§4.F) rather than silently vanishing or panicking.
    let mut server = UtpManager::bind("127.0.0.1:0").unwrap();
    let responder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    responder.set_nonblocking(true).unwrap();

    let header = kaos_utp::Header {
        packet_type: kaos_utp::PacketType::Data,
        extension: 0,
        connection_id: 0xdead,
        timestamp_microseconds: 0,
        timestamp_difference_microseconds: 0,
        wnd_size: 0,
        seq_nr: 1,
        ack_nr: 0,
    };
    let mut buf = Vec::new();
    header.encode(&mut buf);
    responder.send_to(&buf, server.local_addr()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut got_reset = false;
    let mut recv_buf = [0u8; 64];
    while Instant::now() < deadline && !got_reset {
        server.poll().unwrap();
        if let Ok((len, _)) = responder.recv_from(&mut recv_buf) {
            if let Ok((h, _)) = kaos_utp::Header::decode(&recv_buf[..len]) {
                got_reset = h.packet_type == kaos_utp::PacketType::Reset;
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(got_reset, "expected an ST_RESET reply to an unmatched datagram");
    assert_eq!(server.connection_count(), 0);
}
