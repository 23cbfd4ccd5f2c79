//! The uTP socket manager (§4.F): the single owner of the UDP socket and
//! the demultiplexer that routes datagrams to the right [`Connection`] by
//! `(remote, connection_id)`. Mirrors `RudpServer`'s shape — one
//! `HashMap`-keyed table, a batch `poll()`, a pull-style `accept()` — but
//! demuxes on the uTP connection id instead of the source address alone,
//! since several connections can share a peer address.
//!
//! Everything here runs on one thread (§5): no lock ever guards
//! `connections`, so there is no back-pressure between connections beyond
//! what a single `poll()`/`tick()` pass naturally provides.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Instant;

use crate::connection::{Connection, State};
use crate::header::{Header, PacketType};
use crate::pool::PacketPool;
use crate::settings::Settings;
use crate::{trace_debug, trace_warn};

/// Socket buffers large enough to absorb a burst without the kernel
/// dropping datagrams before `poll()` gets to drain them.
const SOCKET_BUFFER_SIZE: i32 = 4 * 1024 * 1024;
const RECV_BUFFER_SIZE: usize = 64 * 1024;
/// How often `tick()` lets the packet pool shed one spare buffer per slab.
const POOL_DECAY_EVERY_TICKS: u32 = 64;

/// Identifies one connection: the peer address plus *our* `recv_id`,
/// which is exactly the value every post-handshake packet from that peer
/// carries in its `connection_id` field.
pub type ConnKey = (SocketAddr, u16);

/// Owns the UDP socket and every live [`Connection`]; the thing an
/// application binds once and drives from its own event loop via
/// [`poll`](UtpManager::poll) and [`tick`](UtpManager::tick).
pub struct UtpManager {
    socket: UdpSocket,
    local_addr: SocketAddr,
    settings: Settings,
    pool: PacketPool,
    epoch: Instant,
    connections: HashMap<ConnKey, Connection>,
    /// Connections whose `on_incoming` set `deferred_ack`, flushed once per
    /// `poll()` batch rather than per datagram (§9 "batches deferred acks").
    deferred_ack: HashSet<ConnKey>,
    /// Connections that just delivered new bytes; surfaced to the caller
    /// via [`drain_readable`](UtpManager::drain_readable) so it can drive
    /// whatever stream facade it built on top.
    drained: HashSet<ConnKey>,
    /// Datagrams that hit `WouldBlock` on `send_to` and need a retry once
    /// the socket is writable again.
    stalled_send: HashMap<ConnKey, Vec<u8>>,
    writable: VecDeque<ConnKey>,
    pending_accepts: VecDeque<ConnKey>,
    recv_buf: Vec<u8>,
    tick_count: u32,
}

/// Ask the kernel to set the DF bit and report path-MTU-exceeded back to
/// us as `EMSGSIZE` instead of silently fragmenting (§6.3 `dont_fragment`,
/// §4.E "Path-MTU discovery"). `IP_MTU_DISCOVER`/`IP_PMTUDISC_DO` is
/// Linux-specific; other unix kernels expose the same behaviour under
/// `IP_DONTFRAG`, which this crate doesn't target yet.
#[cfg(target_os = "linux")]
fn set_dont_fragment(fd: std::os::unix::io::RawFd) {
    let val: libc::c_int = libc::IP_PMTUDISC_DO;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as u32,
        );
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_dont_fragment(_fd: std::os::unix::io::RawFd) {}

impl UtpManager {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::bind_with_settings(addr, Settings::default())
    }

    pub fn bind_with_settings<A: ToSocketAddrs>(addr: A, settings: Settings) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        let local_addr = socket.local_addr()?;
        socket.set_nonblocking(true)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = socket.as_raw_fd();
            let buffer_size = SOCKET_BUFFER_SIZE;
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_SNDBUF,
                    &buffer_size as *const i32 as *const libc::c_void,
                    std::mem::size_of::<i32>() as u32,
                );
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &buffer_size as *const i32 as *const libc::c_void,
                    std::mem::size_of::<i32>() as u32,
                );
            }
            if settings.dont_fragment {
                set_dont_fragment(fd);
            }
        }

        Ok(UtpManager {
            socket,
            local_addr,
            settings,
            pool: PacketPool::new(),
            epoch: Instant::now(),
            connections: HashMap::new(),
            deferred_ack: HashSet::new(),
            drained: HashSet::new(),
            stalled_send: HashMap::new(),
            writable: VecDeque::new(),
            pending_accepts: VecDeque::new(),
            recv_buf: vec![0u8; RECV_BUFFER_SIZE],
            tick_count: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Begin an outbound connection. The SYN is sent immediately; the
    /// returned key identifies the connection for every later call.
    pub fn connect(&mut self, remote: SocketAddr) -> io::Result<ConnKey> {
        let now = Instant::now();
        let (conn, syn) = Connection::connect(remote, now, self.epoch, &self.settings);
        let key = (remote, conn.recv_id);
        self.connections.insert(key, conn);
        self.send_now(key, syn)?;
        Ok(key)
    }

    /// Pop one pending inbound connection accepted during the last
    /// [`poll`](UtpManager::poll), if any (mirrors `RudpServer::accept`).
    pub fn accept(&mut self) -> Option<ConnKey> {
        self.pending_accepts.pop_front()
    }

    pub fn connection(&self, key: ConnKey) -> Option<&Connection> {
        self.connections.get(&key)
    }

    pub fn connection_mut(&mut self, key: ConnKey) -> Option<&mut Connection> {
        self.connections.get_mut(&key)
    }

    pub fn pool_mut(&mut self) -> &mut PacketPool {
        &mut self.pool
    }

    /// Drain the set of connections that delivered new in-order bytes
    /// since the last call. The caller drives whatever read-completion
    /// policy it wants on top (see [`crate::stream::Stream`]).
    pub fn drain_readable(&mut self) -> Vec<ConnKey> {
        self.drained.drain().collect()
    }

    /// Queue bytes on `key`'s write buffer; actual packetisation happens
    /// in [`poll`](UtpManager::poll)/[`tick`](UtpManager::tick).
    pub fn queue_write(&mut self, key: ConnKey, data: &[u8]) {
        if let Some(conn) = self.connections.get_mut(&key) {
            conn.queue_write(data);
        }
    }

    pub fn close(&mut self, key: ConnKey) {
        let now = Instant::now();
        if let Some(conn) = self.connections.get_mut(&key) {
            if let Some(bytes) = conn.close(now, self.epoch, &self.settings, &mut self.pool) {
                let _ = self.send_now(key, bytes);
            }
        }
    }

    /// §5 "Cancellation": detach the connection from its owning stream
    /// facade. The connection itself lingers until `stalled` clears or it
    /// has no more work, at which point [`tick`](UtpManager::tick) reaps it.
    pub fn destroy(&mut self, key: ConnKey) {
        if let Some(conn) = self.connections.get_mut(&key) {
            conn.destroy();
        }
    }

    /// Drain every datagram currently queued on the socket, route each to
    /// its connection, then flush deferred acks for the whole batch.
    ///
    /// Collects `(src, datagram)` pairs before dispatching so routing
    /// never holds a borrow of `self.connections` across the `recv_from`
    /// loop (same shape as `RudpServer::poll_data_socket`).
    pub fn poll(&mut self) -> io::Result<()> {
        let mut incoming: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((len, src)) => incoming.push((src, self.recv_buf[..len].to_vec())),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        for (src, datagram) in incoming {
            self.dispatch(src, &datagram);
        }

        self.flush_deferred_acks();
        self.retry_stalled_sends();
        Ok(())
    }

    fn dispatch(&mut self, src: SocketAddr, datagram: &[u8]) {
        let (header, first_ext) = match Header::decode(datagram) {
            Ok(parsed) => parsed,
            Err(_) => {
                trace_debug!("utp: dropping unparseable datagram from {}", src);
                return;
            }
        };
        let rest = &datagram[crate::header::HEADER_SIZE..];
        let ext_consumed = match crate::header::parse_extensions(first_ext, rest) {
            Ok((_, consumed)) => consumed,
            Err(_) => {
                trace_debug!("utp: dropping datagram with bad extension chain from {}", src);
                return;
            }
        };
        let ext_payload = rest;
        let payload = &rest[ext_consumed..];

        // A SYN's `connection_id` carries the initiator's `recv_id`; the
        // established connection it would belong to (if any) is keyed one
        // higher, by our own `recv_id` on that flow.
        let established_key = if header.packet_type == PacketType::Syn {
            (src, header.connection_id.wrapping_add(1))
        } else {
            (src, header.connection_id)
        };

        if let Some(conn) = self.connections.get_mut(&established_key) {
            let now = Instant::now();
            let outcome = conn.on_incoming(&header, ext_payload, payload, now, self.epoch, &self.settings, &mut self.pool);
            let dropped_or_failed = outcome.dropped || outcome.newly_failed;
            let deferred_ack = conn.deferred_ack;
            let subscribe_drained = conn.subscribe_drained;
            conn.subscribe_drained = false;

            if let Some(reply) = outcome.immediate_reply {
                let _ = self.send_now(established_key, reply);
            }
            if dropped_or_failed {
                return;
            }
            if deferred_ack {
                self.deferred_ack.insert(established_key);
            }
            if subscribe_drained && outcome.delivered_bytes > 0 {
                self.drained.insert(established_key);
            }
            return;
        }

        if header.packet_type == PacketType::Syn {
            let now = Instant::now();
            let (conn, ack) = Connection::accept(src, &header, now, self.epoch);
            let key = (src, conn.recv_id);
            self.connections.insert(key, conn);
            self.pending_accepts.push_back(key);
            let _ = self.send_now(key, ack);
            return;
        }

        trace_debug!("utp: unmatched non-SYN datagram from {}, sending ST_RESET", src);
        self.send_reset(src, header.connection_id);
    }

    fn send_reset(&mut self, remote: SocketAddr, connection_id: u16) {
        let header = Header {
            packet_type: PacketType::Reset,
            extension: 0,
            connection_id,
            timestamp_microseconds: crate::connection::now_micros(Instant::now(), self.epoch),
            timestamp_difference_microseconds: 0,
            wnd_size: 0,
            seq_nr: 1,
            ack_nr: 0,
        };
        let mut buf = Vec::with_capacity(crate::header::HEADER_SIZE);
        header.encode(&mut buf);
        let _ = self.socket.send_to(&buf, remote);
    }

    fn flush_deferred_acks(&mut self) {
        let keys: Vec<ConnKey> = self.deferred_ack.drain().collect();
        if !keys.is_empty() {
            trace_debug!("utp: flushing {} deferred ack(s)", keys.len());
        }
        let now = Instant::now();
        for key in keys {
            if let Some(conn) = self.connections.get_mut(&key) {
                if let Some(bytes) = conn.send_packet(true, false, now, self.epoch, &self.settings, &mut self.pool) {
                    let _ = self.send_now(key, bytes);
                }
            }
        }
    }

    /// Flush as much queued write data as the congestion window allows
    /// for every connection (call after `queue_write`, or let `poll`/`tick`
    /// pick it up on the next pass).
    pub fn pump_writes(&mut self) {
        let keys: Vec<ConnKey> = self.connections.keys().copied().collect();
        let now = Instant::now();
        for key in keys {
            loop {
                let sent = {
                    let conn = match self.connections.get_mut(&key) {
                        Some(c) => c,
                        None => break,
                    };
                    if conn.write_buffer_size() == 0 {
                        break;
                    }
                    conn.send_packet(false, false, now, self.epoch, &self.settings, &mut self.pool)
                };
                match sent {
                    Some(bytes) => {
                        if self.send_now(key, bytes).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    fn send_now(&mut self, key: ConnKey, bytes: Vec<u8>) -> io::Result<()> {
        let remote = key.0;
        match self.socket.send_to(&bytes, remote) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Some(conn) = self.connections.get_mut(&key) {
                    conn.mark_stalled();
                }
                self.stalled_send.insert(key, bytes);
                self.writable.push_back(key);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn retry_stalled_sends(&mut self) {
        let pending: Vec<ConnKey> = self.writable.drain(..).collect();
        for key in pending {
            if let Some(bytes) = self.stalled_send.remove(&key) {
                match self.socket.send_to(&bytes, key.0) {
                    Ok(_) => {
                        if let Some(conn) = self.connections.get_mut(&key) {
                            conn.clear_stalled();
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.stalled_send.insert(key, bytes);
                        self.writable.push_back(key);
                    }
                    Err(e) => {
                        trace_warn!("utp: dropping stalled datagram to {:?}: {}", key.0, e);
                    }
                }
            }
        }
    }

    /// Per-tick maintenance (§4.F): drive every connection's RTO/keepalive
    /// timer, reap anything that reached DELETE, and occasionally let the
    /// packet pool shed a spare buffer.
    pub fn tick(&mut self, now: Instant) {
        let keys: Vec<ConnKey> = self.connections.keys().copied().collect();
        for key in &keys {
            let outgoing = match self.connections.get_mut(key) {
                Some(conn) => conn.tick(now, self.epoch, &self.settings, &mut self.pool),
                None => None,
            };
            if let Some(bytes) = outgoing {
                let _ = self.send_now(*key, bytes);
            }
        }

        self.connections.retain(|_, conn| !conn.is_terminal() && !conn.should_delete());

        self.tick_count = self.tick_count.wrapping_add(1);
        if self.tick_count % POOL_DECAY_EVERY_TICKS == 0 {
            self.pool.decay();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_picks_an_ephemeral_port() {
        let mgr = UtpManager::bind("127.0.0.1:0").unwrap();
        assert_ne!(mgr.local_addr().port(), 0);
    }

    #[test]
    fn connect_registers_a_pending_connection() {
        let mut mgr = UtpManager::bind("127.0.0.1:0").unwrap();
        let remote: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let key = mgr.connect(remote).unwrap();
        assert_eq!(mgr.connection_count(), 1);
        assert!(mgr.connection(key).is_some());
    }

    #[test]
    fn handshake_between_two_managers_completes() {
        let mut server = UtpManager::bind("127.0.0.1:0").unwrap();
        let mut client = UtpManager::bind("127.0.0.1:0").unwrap();
        let server_addr = server.local_addr();

        let client_key = client.connect(server_addr).unwrap();

        // client's SYN -> server
        server.poll().unwrap();
        let server_key = *server.pending_accepts.front().unwrap();
        assert_eq!(server.accept(), Some(server_key));

        // server's ST_STATE -> client
        std::thread::sleep(std::time::Duration::from_millis(5));
        client.poll().unwrap();

        assert_eq!(client.connection(client_key).unwrap().state, State::Connected);
        assert_eq!(server.connection(server_key).unwrap().state, State::Connected);
    }
}
