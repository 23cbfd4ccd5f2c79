//! The uTP connection state machine (§3 "Connection", §4.E) — the core
//! of the subsystem. Owns send/receive reorder buffers, the LEDBAT
//! congestion window, RTO timers, SACK processing and MTU discovery for
//! one flow. Never touches the UDP socket directly: every method that
//! needs to put bytes on the wire returns the serialised datagram and
//! leaves the actual `send_to` to the manager (§5: only the manager
//! writes to the shared socket).

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::buffer::PacketBuffer;
use crate::error::ErrorKind;
use crate::header::{
    encode_sack_extension, parse_extensions, Header, PacketType, EXT_SELECTIVE_ACK, HEADER_SIZE,
    SACK_MAX_BYTES,
};
use crate::packet::Packet;
use crate::pool::{PacketPool, MTU_CEILING_PAYLOAD, MTU_FLOOR_PAYLOAD};
use crate::seq::{diff, less_wrap, SEQ_MASK};
use crate::settings::Settings;
use crate::stats::{SlidingAverage, TimestampHistory};
use crate::{trace_debug, trace_warn};

/// Reorder buffers are sized to outlive `max_packets_reorder` (§9,
/// libtorrent `max_packets_reorder = 512`) while staying power-of-two.
const REORDER_CAPACITY: usize = 1024;
const MAX_REORDER_AHEAD: u16 = 512;
const DUP_ACK_LIMIT: u32 = 3;
const SACK_RESEND_LIMIT: u32 = 1;
const NUM_DELAY_HIST: usize = 3;
/// Rotate the base-delay history at most this often (§4.E step 3).
const DELAY_BASE_HISTORY_STEP: Duration = Duration::from_secs(60);
const LARGE_READ_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    None,
    SynSent,
    Connected,
    FinSent,
    ErrorWait,
    Delete,
}

/// Outcome of feeding one inbound datagram to a connection (§4.E
/// "Incoming packet processing").
#[derive(Default)]
pub struct IncomingOutcome {
    /// Newly in-order bytes appended to `receive_buffer`.
    pub delivered_bytes: usize,
    /// A reply the caller should send back immediately (e.g. the
    /// ST_STATE acking a SYN — §9 "mixes an immediate-ack on SYN with a
    /// deferred-ack on data").
    pub immediate_reply: Option<Vec<u8>>,
    /// The packet was dropped (malformed, out of window, duplicate SYN).
    pub dropped: bool,
    /// The connection just transitioned to a terminal error state.
    pub newly_failed: bool,
}

pub struct Connection {
    // --- identity & state (§3) ---
    pub remote: SocketAddr,
    pub send_id: u16,
    pub recv_id: u16,
    pub state: State,
    pub error: Option<ErrorKind>,
    pub eof: bool,
    pub attached: bool,
    pub nagle: bool,
    pub slow_start: bool,
    pub cwnd_full: bool,
    pub deferred_ack: bool,
    pub subscribe_drained: bool,
    pub stalled: bool,

    // --- sequencing (§3) ---
    pub seq_nr: u16,
    pub acked_seq_nr: u16,
    pub ack_nr: u16,
    pub fast_resend_seq_nr: u16,
    pub eof_seq_nr: u16,
    pub loss_seq_nr: u16,
    pub mtu_seq: u16,
    /// Seq of our own outbound ST_FIN, 0 if none sent yet. Mirrors
    /// `mtu_seq`'s sentinel convention; watched in the `acked_seq_nr`
    /// advance loop to detect the FIN_SENT -> ERROR_WAIT(eof) transition
    /// (§4.E).
    pub fin_seq: u16,

    // --- windows & timers (§3) ---
    /// 16.16 fixed point, i.e. `cwnd >> 16` is the byte count.
    pub cwnd: i64,
    pub ssthres: i64,
    pub adv_wnd: u32,
    pub bytes_in_flight: u32,
    pub mtu: usize,
    pub mtu_floor: usize,
    pub mtu_ceiling: usize,
    pub timeout: Instant,
    last_history_step: Instant,
    pub reply_micro: u32,
    rtt: SlidingAverage<16>,
    our_histo: TimestampHistory,
    their_histo: TimestampHistory,
    last_delays: [u32; NUM_DELAY_HIST],
    last_delay_idx: usize,
    pub duplicate_acks: u32,
    pub num_timeouts: u32,
    /// Deadline for the initial handshake (§6.3 `connect_timeout`); `None`
    /// once connected or for an accepted (server-side) connection, which
    /// never waited on one.
    connect_deadline: Option<Instant>,
    /// When `deferred_ack` first became true, so `tick()` can force a
    /// standalone ST_STATE once `delayed_ack_ms` elapses without a reply
    /// having piggy-backed on outgoing data (§6.3 `delayed_ack`).
    deferred_ack_since: Option<Instant>,

    // --- queues (§3) ---
    pub outbuf: PacketBuffer,
    pub inbuf: PacketBuffer,
    /// In-order bytes delivered but not yet drained by the stream facade.
    pub receive_buffer: Vec<u8>,
    /// Bytes queued by the user, not yet copied into a DATA packet.
    pub write_queue: std::collections::VecDeque<u8>,
    /// Cumulative count of bytes handed to a DATA packet (§4.G "written").
    pub written: u64,
    /// Cumulative count of bytes delivered into `receive_buffer` (§4.G "read"
    /// in the sense of bytes made available to read).
    pub read: u64,
    /// Advertised receive-window budget (mirrors `SO_RCVBUF`-like cap).
    pub in_buf_size: u32,
    /// Bytes currently buffered in `inbuf` awaiting reassembly.
    pub buffered_incoming_bytes: u32,
    /// Partially filled outbound packet waiting for more data (§"Nagle packet").
    nagle_packet: Option<Vec<u8>>,
    nagle_seq: u16,

    created_syn: bool,
}

/// Random-ish seed, no external RNG dependency needed for a connection id.
fn weak_random_u16() -> u16 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0xdead_beef);
    let mut x = (nanos as u64) ^ 0x9E3779B97F4A7C15;
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58476D1CE4E5B9);
    x ^= x >> 27;
    (x & 0xffff) as u16
}

pub(crate) fn now_micros(now: Instant, epoch: Instant) -> u32 {
    now.saturating_duration_since(epoch).as_micros() as u32
}

impl Connection {
    fn base(remote: SocketAddr, send_id: u16, recv_id: u16, now: Instant) -> Self {
        Connection {
            remote,
            send_id,
            recv_id,
            state: State::None,
            error: None,
            eof: false,
            attached: true,
            nagle: true,
            slow_start: true,
            cwnd_full: false,
            deferred_ack: false,
            subscribe_drained: false,
            stalled: false,

            seq_nr: 1,
            acked_seq_nr: 0,
            ack_nr: 0,
            fast_resend_seq_nr: 1,
            eof_seq_nr: 0,
            loss_seq_nr: 0,
            mtu_seq: 0,
            fin_seq: 0,

            cwnd: (MTU_FLOOR_PAYLOAD as i64) << 16,
            ssthres: i64::MAX,
            adv_wnd: 1 << 20,
            bytes_in_flight: 0,
            mtu: MTU_FLOOR_PAYLOAD + HEADER_SIZE,
            mtu_floor: MTU_FLOOR_PAYLOAD,
            mtu_ceiling: MTU_CEILING_PAYLOAD,
            timeout: now + Duration::from_millis(3000),
            last_history_step: now,
            reply_micro: 0,
            rtt: SlidingAverage::new(),
            our_histo: TimestampHistory::new(),
            their_histo: TimestampHistory::new(),
            last_delays: [0; NUM_DELAY_HIST],
            last_delay_idx: 0,
            duplicate_acks: 0,
            num_timeouts: 0,
            connect_deadline: None,
            deferred_ack_since: None,

            outbuf: PacketBuffer::new(REORDER_CAPACITY),
            inbuf: PacketBuffer::new(REORDER_CAPACITY),
            receive_buffer: Vec::new(),
            write_queue: std::collections::VecDeque::new(),
            written: 0,
            read: 0,
            in_buf_size: 1 << 20,
            buffered_incoming_bytes: 0,
            nagle_packet: None,
            nagle_seq: 0,

            created_syn: false,
        }
    }

    /// NONE -> SYN_SENT: user `connect()`. The uTP quirk noted in §4.E:
    /// the SYN's connection-id field carries `recv_id`, not `send_id`.
    pub fn connect(
        remote: SocketAddr,
        now: Instant,
        epoch: Instant,
        settings: &Settings,
    ) -> (Connection, Vec<u8>) {
        let recv_id = weak_random_u16();
        let send_id = recv_id.wrapping_add(1);
        let mut conn = Connection::base(remote, send_id, recv_id, now);
        conn.state = State::SynSent;
        conn.seq_nr = weak_random_u16().max(1);
        conn.acked_seq_nr = conn.seq_nr.wrapping_sub(1);
        conn.timeout = now + Duration::from_millis(3000);
        conn.connect_deadline = Some(now + Duration::from_millis(settings.connect_timeout_ms as u64));
        let syn_seq = conn.seq_nr;
        let syn = conn.build_syn(now, epoch);
        // tracked in outbuf like any other outstanding packet, so tick()'s
        // RTO walk finds it and resend_packet() can actually retransmit
        // the SYN rather than falling through to a bare ST_STATE (§4.E
        // "Resend").
        let mut syn_pkt = Packet::new(syn_seq, HEADER_SIZE, Vec::new(), now);
        syn_pkt.packet_type = PacketType::Syn;
        syn_pkt.num_transmissions = 1;
        let _ = conn.outbuf.insert(syn_seq, syn_pkt);
        // the SYN consumes this sequence number (§4.E: the acceptor sets
        // ack_nr = syn.seq_nr directly, not seq_nr - 1), so the next packet
        // we send must use seq_nr + 1.
        conn.seq_nr = conn.seq_nr.wrapping_add(1);
        conn.fast_resend_seq_nr = conn.seq_nr;
        (conn, syn)
    }

    fn build_syn(&mut self, now: Instant, epoch: Instant) -> Vec<u8> {
        let header = Header {
            packet_type: PacketType::Syn,
            extension: 0,
            connection_id: self.recv_id,
            timestamp_microseconds: now_micros(now, epoch),
            timestamp_difference_microseconds: self.reply_micro,
            wnd_size: self.in_buf_size,
            seq_nr: self.seq_nr,
            ack_nr: self.ack_nr,
        };
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);
        self.created_syn = true;
        buf
    }

    /// NONE -> CONNECTED: manager received a SYN with an unknown
    /// connection id and is instantiating a new connection for it.
    pub fn accept(
        remote: SocketAddr,
        syn: &Header,
        now: Instant,
        epoch: Instant,
    ) -> (Connection, Vec<u8>) {
        let send_id = syn.connection_id;
        let recv_id = send_id.wrapping_add(1);
        let mut conn = Connection::base(remote, send_id, recv_id, now);
        conn.state = State::Connected;
        conn.ack_nr = syn.seq_nr;
        conn.seq_nr = weak_random_u16().max(1);
        conn.acked_seq_nr = conn.seq_nr.wrapping_sub(1);
        conn.fast_resend_seq_nr = conn.seq_nr;
        let ack = conn.build_state(now, epoch);
        (conn, ack)
    }

    fn build_state(&mut self, now: Instant, epoch: Instant) -> Vec<u8> {
        let header = Header {
            packet_type: PacketType::State,
            extension: 0,
            connection_id: self.send_id,
            timestamp_microseconds: now_micros(now, epoch),
            timestamp_difference_microseconds: self.reply_micro,
            wnd_size: self.advertised_window(),
            seq_nr: self.seq_nr,
            ack_nr: self.ack_nr,
        };
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);
        buf
    }

    fn advertised_window(&self) -> u32 {
        let used = self.buffered_incoming_bytes + self.receive_buffer.len() as u32;
        self.in_buf_size.saturating_sub(used).max(0)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, State::Delete)
    }

    pub fn should_delete(&self) -> bool {
        matches!(self.state, State::ErrorWait | State::None) && !self.attached && !self.stalled
    }

    fn fail(&mut self, kind: ErrorKind) {
        if self.state != State::ErrorWait {
            trace_warn!("utp: {:?} -> ERROR_WAIT ({})", self.remote, kind);
            self.state = State::ErrorWait;
            self.error = Some(kind);
        }
    }

    // ---------------------------------------------------------------
    // Incoming packet processing (§4.E)
    // ---------------------------------------------------------------

    pub fn on_incoming(
        &mut self,
        header: &Header,
        ext_payload: &[u8],
        payload: &[u8],
        now: Instant,
        epoch: Instant,
        settings: &Settings,
        pool: &mut PacketPool,
    ) -> IncomingOutcome {
        let mut outcome = IncomingOutcome::default();
        let now_us = now_micros(now, epoch);

        // step 2: stamp the echo delay for our next send
        self.reply_micro = now_us.wrapping_sub(header.timestamp_microseconds);

        // step 3: update our-delay history, possibly stepping the baseline
        let step = now.saturating_duration_since(self.last_history_step) >= DELAY_BASE_HISTORY_STEP;
        let one_way_delay = self
            .our_histo
            .add_sample(header.timestamp_difference_microseconds, step);
        if step {
            self.last_history_step = now;
        }
        self.last_delays[self.last_delay_idx % NUM_DELAY_HIST] = one_way_delay;
        self.last_delay_idx = self.last_delay_idx.wrapping_add(1);

        if header.packet_type == PacketType::Syn {
            // any -> already established: duplicate SYN, state machine and logging
            // stay quiet but the peer still needs a reply or it will keep
            // retransmitting the SYN forever (§4.E).
            if self.state != State::None {
                outcome.immediate_reply = Some(self.build_state(now, epoch));
                outcome.dropped = true;
                return outcome;
            }
        }

        // step 4: reject ack_nr ahead of anything we've sent
        if header.packet_type != PacketType::Syn
            && less_wrap(self.seq_nr.wrapping_sub(1), header.ack_nr, SEQ_MASK)
        {
            outcome.dropped = true;
            return outcome;
        }

        // step 5
        if header.packet_type == PacketType::Reset {
            self.fail(ErrorKind::ConnectionReset);
            outcome.newly_failed = true;
            return outcome;
        }

        // step 1 (connection-id check is done by the manager before dispatch)

        // step 6: selective-ack extension
        let mut acked_bytes = 0u32;
        if header.extension == EXT_SELECTIVE_ACK {
            if let Ok((exts, _consumed)) = parse_extensions(header.extension, ext_payload) {
                for ext in exts {
                    if ext.id == EXT_SELECTIVE_ACK {
                        acked_bytes += self.parse_sack(header.ack_nr, ext.data, settings, pool);
                    }
                }
            }
        }

        // step 7: advance acked_seq_nr, update RTT / bytes_in_flight
        let prev_in_flight = self.bytes_in_flight;
        let mut cumulative_delay_sample: Option<i64> = None;
        while self.acked_seq_nr != header.ack_nr
            && less_wrap(self.acked_seq_nr, header.ack_nr, SEQ_MASK)
        {
            let next = self.acked_seq_nr.wrapping_add(1);
            if let Some(p) = self.outbuf.remove(next) {
                let payload_len = p.payload.len() as u32;
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(payload_len);
                acked_bytes += payload_len;
                let rtt_sample = now.saturating_duration_since(p.send_time).as_micros() as i64;
                self.rtt.add_sample(rtt_sample);
                cumulative_delay_sample = Some(rtt_sample);
                if self.fin_seq != 0 && next == self.fin_seq {
                    self.fin_seq = 0;
                    self.fail(ErrorKind::Eof);
                }
                if p.mtu_probe {
                    self.on_mtu_probe_acked(p.size());
                }
                pool.release(p.payload);
            }
            self.acked_seq_nr = next;
        }

        if acked_bytes > 0 {
            let delay = cumulative_delay_sample.unwrap_or(one_way_delay as i64);
            let clamped_delay = *self.last_delays.iter().min().unwrap_or(&(delay as u32)) as i64;
            self.do_ledbat(
                acked_bytes,
                clamped_delay.min(delay),
                prev_in_flight,
                now,
                settings,
            );
        }

        // step 8: duplicate-ack / fast retransmit
        let mut fast_resend: Option<u16> = None;
        if header.ack_nr == self.acked_seq_nr && !self.outbuf.is_empty() {
            self.duplicate_acks += 1;
            if self.duplicate_acks >= DUP_ACK_LIMIT
                && self.acked_seq_nr.wrapping_add(1) == self.fast_resend_seq_nr
            {
                fast_resend = Some(self.fast_resend_seq_nr);
                self.fast_resend_seq_nr = self.fast_resend_seq_nr.wrapping_add(1);
            }
        } else {
            self.duplicate_acks = 0;
        }
        if let Some(seq) = fast_resend {
            trace_debug!("utp: {:?} fast-retransmit seq {}", self.remote, seq);
            self.experienced_loss(seq, settings.loss_multiplier);
            if let Some(p) = self.outbuf.at_mut(seq) {
                p.need_resend = true;
            }
        }

        self.adv_wnd = header.wnd_size;

        // SYN_SENT -> CONNECTED
        if self.state == State::SynSent && header.packet_type == PacketType::State {
            trace_debug!("utp: {:?} SYN_SENT -> CONNECTED", self.remote);
            self.state = State::Connected;
            self.ack_nr = header.seq_nr.wrapping_sub(1);
            self.connect_deadline = None;
        }

        // step 9: deliver or reorder ST_DATA
        if header.packet_type == PacketType::Data && !payload.is_empty() {
            if header.seq_nr == self.ack_nr.wrapping_add(1) {
                self.ack_nr = header.seq_nr;
                outcome.delivered_bytes += payload.len();
                self.receive_buffer.extend_from_slice(payload);
                self.read += payload.len() as u64;
                // drain any contiguous follow-on packets from the reorder buffer
                loop {
                    let next = self.ack_nr.wrapping_add(1);
                    match self.inbuf.remove(next) {
                        Some(p) => {
                            self.ack_nr = next;
                            self.buffered_incoming_bytes =
                                self.buffered_incoming_bytes.saturating_sub(p.size() as u32);
                            outcome.delivered_bytes += p.payload.len();
                            self.receive_buffer.extend_from_slice(&p.payload);
                            self.read += p.payload.len() as u64;
                            pool.release(p.payload);
                        }
                        None => break,
                    }
                }
            } else if less_wrap(self.ack_nr, header.seq_nr, SEQ_MASK)
                && diff(header.seq_nr, self.ack_nr) as u16 <= MAX_REORDER_AHEAD
                && !self.inbuf.contains(header.seq_nr)
            {
                let mut buf = pool.acquire(payload.len());
                buf.extend_from_slice(payload);
                let size = HEADER_SIZE as u32 + buf.len() as u32;
                let pkt = Packet::new(header.seq_nr, HEADER_SIZE, buf, now);
                if self.inbuf.insert(header.seq_nr, pkt).is_ok() {
                    self.buffered_incoming_bytes += size;
                }
            }
            // else: duplicate or too-far-ahead, drop silently
        } else if header.packet_type == PacketType::Fin {
            if !self.eof {
                self.eof = true;
                self.eof_seq_nr = header.seq_nr;
            }
            if header.seq_nr == self.ack_nr.wrapping_add(1) {
                self.ack_nr = header.seq_nr;
                // drain any contiguous follow-on packets already reordered in
                loop {
                    let next = self.ack_nr.wrapping_add(1);
                    match self.inbuf.remove(next) {
                        Some(p) => {
                            self.ack_nr = next;
                            self.buffered_incoming_bytes =
                                self.buffered_incoming_bytes.saturating_sub(p.size() as u32);
                            outcome.delivered_bytes += p.payload.len();
                            self.receive_buffer.extend_from_slice(&p.payload);
                            self.read += p.payload.len() as u64;
                            pool.release(p.payload);
                        }
                        None => break,
                    }
                }
            }
            if self.ack_nr == header.seq_nr {
                // all preceding data consumed: move toward FIN_SENT
                if self.state == State::Connected {
                    trace_debug!("utp: {:?} CONNECTED -> FIN_SENT (peer FIN)", self.remote);
                    self.state = State::FinSent;
                }
            }
        }

        // step 10: ack policy
        if outcome.delivered_bytes > 0 {
            if !self.deferred_ack {
                self.deferred_ack_since = Some(now);
            }
            self.deferred_ack = true;
        }

        // step 11
        self.subscribe_drained = true;

        if header.packet_type == PacketType::Syn && self.state == State::None {
            // handled by manager via `accept`; nothing else to do here.
        }

        outcome
    }

    /// `parse_sack`: remove acked packets per set bit, trigger loss
    /// recovery if ≥3 SACK-indicated packets are missing past
    /// `fast_resend_seq_nr`.
    fn parse_sack(
        &mut self,
        base_ack_nr: u16,
        bitmap: &[u8],
        settings: &Settings,
        pool: &mut PacketPool,
    ) -> u32 {
        let mut acked_bytes = 0u32;
        let mut dups_past_fast_resend = 0u32;
        for (byte_idx, byte) in bitmap.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    let seq = base_ack_nr
                        .wrapping_add(2)
                        .wrapping_add((byte_idx * 8 + bit) as u16);
                    if let Some(p) = self.outbuf.remove(seq) {
                        acked_bytes += p.payload.len() as u32;
                        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(p.payload.len() as u32);
                        if p.mtu_probe {
                            self.on_mtu_probe_acked(p.size());
                        }
                        pool.release(p.payload);
                    }
                    if less_wrap(self.fast_resend_seq_nr.wrapping_sub(1), seq, SEQ_MASK) {
                        dups_past_fast_resend += 1;
                    }
                }
            }
        }
        if dups_past_fast_resend >= DUP_ACK_LIMIT {
            let resend_seq = self.fast_resend_seq_nr;
            self.experienced_loss(resend_seq, settings.loss_multiplier);
            let mut seq = resend_seq;
            for _ in 0..SACK_RESEND_LIMIT {
                if let Some(p) = self.outbuf.at_mut(seq) {
                    p.need_resend = true;
                }
                seq = seq.wrapping_add(1);
            }
        }
        // advance acked_seq_nr across any now-empty prefix (a run of
        // positions SACK'd out of outbuf, not just a fully-drained buffer)
        while !self
            .outbuf
            .contains(self.acked_seq_nr.wrapping_add(1))
            && less_wrap(self.acked_seq_nr, self.seq_nr.wrapping_sub(1), SEQ_MASK)
        {
            self.acked_seq_nr = self.acked_seq_nr.wrapping_add(1);
        }
        acked_bytes
    }

    /// Cut cwnd on loss, at most once per RTT (§4.E "Loss detection").
    fn experienced_loss(&mut self, seq: u16, loss_multiplier: u32) {
        if less_wrap(seq, self.loss_seq_nr, SEQ_MASK) || seq == self.loss_seq_nr {
            return;
        }
        self.slow_start = false;
        self.ssthres = self.cwnd >> 16;
        let floor = (self.mtu as i64) << 16;
        let before = self.cwnd >> 16;
        self.cwnd = ((self.cwnd * loss_multiplier as i64 / 100).max(floor)).max(0);
        trace_debug!(
            "utp: {:?} loss at seq {}: cwnd {} -> {} bytes",
            self.remote,
            seq,
            before,
            self.cwnd >> 16
        );
        self.loss_seq_nr = self.seq_nr;
    }

    /// LEDBAT congestion control (§4.E "do_ledbat").
    fn do_ledbat(
        &mut self,
        acked_bytes: u32,
        delay_us: i64,
        prev_in_flight: u32,
        _now: Instant,
        settings: &Settings,
    ) {
        self.do_ledbat_tunable(
            acked_bytes,
            delay_us,
            prev_in_flight,
            settings.target_delay_us as i64,
            settings.gain_factor,
        )
    }

    fn do_ledbat_tunable(
        &mut self,
        acked_bytes: u32,
        delay_us: i64,
        prev_in_flight: u32,
        target_delay_us: u32,
        gain_factor: i64,
    ) {
        if prev_in_flight == 0 {
            return;
        }
        let target_delay = target_delay_us as i64;
        let window_factor = ((acked_bytes as i64) << 16) / (prev_in_flight as i64);
        let delay_factor = ((target_delay - delay_us) << 16) / target_delay.max(1);
        let linear_gain = (window_factor * delay_factor / 65536) * gain_factor / 65536;

        if delay_us >= target_delay && self.slow_start {
            self.slow_start = false;
            self.ssthres = self.cwnd >> 16;
        }

        let saturated =
            self.bytes_in_flight as i64 + acked_bytes as i64 + self.mtu as i64 > (self.cwnd >> 16);

        let gain = if saturated {
            if self.slow_start {
                let exponential_gain = (acked_bytes as i64) << 16;
                if (self.cwnd + exponential_gain) >> 16 > self.ssthres {
                    self.slow_start = false;
                    linear_gain
                } else {
                    exponential_gain.max(linear_gain)
                }
            } else {
                linear_gain
            }
        } else {
            0
        };

        self.cwnd = (self.cwnd + gain).max(0);

        let window_left = (self.cwnd >> 16) - self.bytes_in_flight as i64;
        if window_left >= self.mtu as i64 {
            self.cwnd_full = false;
        }

        if (self.cwnd >> 16) >= self.adv_wnd as i64 {
            self.slow_start = false;
        }
    }

    // ---------------------------------------------------------------
    // Outgoing (§4.E "Sending a packet")
    // ---------------------------------------------------------------

    pub fn queue_write(&mut self, data: &[u8]) {
        self.write_queue.extend(data.iter().copied());
    }

    pub fn write_buffer_size(&self) -> usize {
        self.write_queue.len()
    }

    /// Drain delivered, in-order bytes for the stream facade.
    pub fn drain_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.receive_buffer)
    }

    pub fn receive_buffer_size(&self) -> usize {
        self.receive_buffer.len()
    }

    /// Build and return the next datagram to transmit, or `None` if
    /// there's nothing to send right now (and `force` was false).
    pub fn send_packet(
        &mut self,
        force_ack: bool,
        force_fin: bool,
        now: Instant,
        epoch: Instant,
        settings: &Settings,
        pool: &mut PacketPool,
    ) -> Option<Vec<u8>> {
        let now_us = now_micros(now, epoch);

        // step 1: resend anything marked need_resend
        let mut seq = self.acked_seq_nr.wrapping_add(1);
        while less_wrap(seq, self.seq_nr, SEQ_MASK) {
            let needs = self.outbuf.at(seq).map(|p| p.need_resend).unwrap_or(false);
            if needs {
                if let Some(bytes) = self.resend_packet(seq, now, epoch, settings) {
                    return Some(bytes);
                }
            }
            seq = seq.wrapping_add(1);
        }

        // step 2/3: sack size and header size
        let sack_bitmap = self.build_sack_bitmap();
        let header_size = HEADER_SIZE + if sack_bitmap.is_empty() { 0 } else { sack_bitmap.len() + 2 };
        let available = self.mtu.saturating_sub(header_size);
        let mut payload_size = self.write_queue.len().min(available);

        // step 4: congestion gate
        let window_cap = ((self.cwnd >> 16) as u32).min(self.adv_wnd);
        let budget = window_cap.saturating_sub(self.bytes_in_flight);
        if (self.bytes_in_flight + payload_size as u32) > window_cap {
            self.cwnd_full = true;
            if !force_ack && !force_fin {
                return None;
            }
            payload_size = (budget as usize).min(payload_size);
        }

        let has_payload = payload_size > 0;
        let packet_type = if force_fin {
            PacketType::Fin
        } else if has_payload {
            PacketType::Data
        } else {
            PacketType::State
        };

        // step 5: nagle coalescing — only for pure data sends, not acks/fin
        if packet_type == PacketType::Data && !force_ack {
            let other_in_flight = self.bytes_in_flight > 0;
            let nagle_is_full = self
                .nagle_packet
                .as_ref()
                .map(|b| b.len() >= self.mtu.saturating_sub(HEADER_SIZE))
                .unwrap_or(false);
            if self.nagle && other_in_flight && !nagle_is_full && self.nagle_packet.is_some() {
                // accumulate more bytes into the pending nagle packet instead of flushing
                let room = self.mtu.saturating_sub(HEADER_SIZE)
                    - self.nagle_packet.as_ref().unwrap().len();
                let take = self.write_queue.len().min(room);
                if take > 0 {
                    let mut extra = Vec::with_capacity(take);
                    for _ in 0..take {
                        extra.push(self.write_queue.pop_front().unwrap());
                    }
                    self.written += extra.len() as u64;
                    self.nagle_packet.as_mut().unwrap().extend_from_slice(&extra);
                }
                return None;
            }
        }

        let mut payload = pool.acquire(payload_size);
        for _ in 0..payload_size {
            if let Some(b) = self.write_queue.pop_front() {
                payload.push(b);
            }
        }
        if let Some(pending) = self.nagle_packet.take() {
            let mut combined = pending;
            combined.extend_from_slice(&payload);
            payload = combined;
        }
        self.written += payload_size as u64;

        // step 6: MTU probe eligibility
        let is_probe = self.mtu_seq == 0 && header_size + payload.len() > self.mtu_floor + HEADER_SIZE;

        // step 7: fill header
        let seq_for_packet = self.seq_nr;
        let header = Header {
            packet_type,
            extension: if sack_bitmap.is_empty() { 0 } else { EXT_SELECTIVE_ACK },
            connection_id: self.send_id,
            timestamp_microseconds: now_us,
            timestamp_difference_microseconds: self.reply_micro,
            wnd_size: self.advertised_window(),
            seq_nr: seq_for_packet,
            ack_nr: self.ack_nr,
        };

        let mut datagram = Vec::with_capacity(header_size + payload.len());
        header.encode(&mut datagram);
        if !sack_bitmap.is_empty() {
            encode_sack_extension(&mut datagram, 0, &sack_bitmap);
        }
        datagram.extend_from_slice(&payload);

        if has_payload || packet_type == PacketType::Fin {
            if is_probe {
                self.mtu_seq = seq_for_packet;
            }
            let mut pkt = Packet::new(seq_for_packet, header_size, payload, now);
            pkt.mtu_probe = is_probe;
            pkt.packet_type = packet_type;
            pkt.num_transmissions = 1;
            self.bytes_in_flight += pkt.payload.len() as u32;
            let _ = self.outbuf.insert(seq_for_packet, pkt);
            self.seq_nr = self.seq_nr.wrapping_add(1);
            if packet_type == PacketType::Fin {
                self.state = State::FinSent;
                self.fin_seq = seq_for_packet;
            }
        } else {
            pool.release(payload);
        }

        self.deferred_ack = false;
        self.deferred_ack_since = None;
        self.timeout = now + self.packet_timeout(settings);
        Some(datagram)
    }

    fn build_sack_bitmap(&self) -> Vec<u8> {
        if self.inbuf.is_empty() {
            return Vec::new();
        }
        let span = self.inbuf.span();
        let bytes = ((span + 7) / 8).min(SACK_MAX_BYTES).max(1);
        let mut bitmap = vec![0u8; bytes];
        for i in 0..(bytes * 8) {
            let seq = self.ack_nr.wrapping_add(2).wrapping_add(i as u16);
            if self.inbuf.contains(seq) {
                bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        bitmap
    }

    fn resend_packet(
        &mut self,
        seq: u16,
        now: Instant,
        epoch: Instant,
        settings: &Settings,
    ) -> Option<Vec<u8>> {
        let now_us = now_micros(now, epoch);
        let sack_bitmap = self.build_sack_bitmap();
        let (packet_type, header_size, payload_bytes) = {
            let p = self.outbuf.at_mut(seq)?;
            p.need_resend = false;
            p.num_transmissions += 1;
            p.send_time = now;
            (p.packet_type, p.header_size, p.payload.clone())
        };

        let limit = match packet_type {
            PacketType::Syn => settings.syn_resends,
            PacketType::Fin => settings.fin_resends,
            _ => settings.num_resends,
        };
        if self.outbuf.at(seq).map(|p| p.num_transmissions).unwrap_or(0) > limit {
            self.fail(ErrorKind::TimedOut);
            return None;
        }

        // the SYN quirk (§4.E) carries recv_id, not send_id, on the wire.
        let connection_id = if packet_type == PacketType::Syn {
            self.recv_id
        } else {
            self.send_id
        };
        let header = Header {
            packet_type,
            extension: if sack_bitmap.is_empty() { 0 } else { EXT_SELECTIVE_ACK },
            connection_id,
            timestamp_microseconds: now_us,
            timestamp_difference_microseconds: self.reply_micro,
            wnd_size: self.advertised_window(),
            seq_nr: seq,
            ack_nr: self.ack_nr,
        };
        let mut datagram = Vec::with_capacity(header_size + payload_bytes.len());
        header.encode(&mut datagram);
        if !sack_bitmap.is_empty() {
            encode_sack_extension(&mut datagram, 0, &sack_bitmap);
        }
        datagram.extend_from_slice(&payload_bytes);
        self.timeout = now + self.packet_timeout(settings);
        Some(datagram)
    }

    /// ACK of an MTU probe: floor rises; timeout/ICMP: ceiling falls (§4.E
    /// "Path-MTU discovery").
    pub fn on_mtu_probe_acked(&mut self, probe_size: usize) {
        self.mtu_floor = self.mtu_floor.max(probe_size);
        if self.mtu_ceiling < self.mtu_floor {
            self.mtu_ceiling = self.mtu_floor;
        }
        self.mtu_seq = 0;
        self.recompute_mtu();
        trace_debug!(
            "utp: {:?} mtu probe {} acked, floor={} ceiling={} mtu={}",
            self.remote,
            probe_size,
            self.mtu_floor,
            self.mtu_ceiling,
            self.mtu
        );
    }

    pub fn on_message_too_big(&mut self, probe_size: usize) {
        self.mtu_ceiling = probe_size.saturating_sub(1);
        self.mtu_seq = 0;
        self.recompute_mtu();
        trace_debug!(
            "utp: {:?} mtu probe {} rejected, ceiling={} mtu={}",
            self.remote,
            probe_size,
            self.mtu_ceiling,
            self.mtu
        );
    }

    fn recompute_mtu(&mut self) {
        self.mtu = (self.mtu_floor + self.mtu_ceiling) / 2 + HEADER_SIZE;
    }

    pub fn mtu_converged(&self) -> bool {
        self.mtu_floor == self.mtu_ceiling
    }

    fn packet_timeout(&self, settings: &Settings) -> Duration {
        let floor = if self.state == State::SynSent {
            3000
        } else {
            settings.min_timeout_ms as i64
        };
        let mean = self.rtt.mean();
        let dev = self.rtt.deviation();
        let base = floor.max(mean + 2 * dev);
        let backoff = if self.num_timeouts > 0 {
            (1i64 << (self.num_timeouts - 1).min(16)) * 1000
        } else {
            0
        };
        Duration::from_millis((base + backoff).max(0) as u64)
    }

    /// Timer expiry (§4.E "RTO" / "On timer expiry (tick)").
    pub fn tick(
        &mut self,
        now: Instant,
        epoch: Instant,
        settings: &Settings,
        pool: &mut PacketPool,
    ) -> Option<Vec<u8>> {
        // §6.3 `connect_timeout`: a deadline on the handshake itself,
        // independent of the per-packet RTO the SYN retransmit limit runs on.
        if let Some(deadline) = self.connect_deadline {
            if self.state == State::SynSent && now >= deadline {
                trace_debug!("utp: {:?} connect timed out", self.remote);
                self.connect_deadline = None;
                self.fail(ErrorKind::TimedOut);
                return None;
            }
        }

        // §6.3 `delayed_ack`: force a standalone ST_STATE once an ack has
        // been waiting longer than the configured coalescing window,
        // rather than waiting indefinitely for a payload packet to
        // piggy-back it on (§4.E step 10).
        if self.deferred_ack {
            let since = self.deferred_ack_since.unwrap_or(now);
            if now.saturating_duration_since(since)
                >= Duration::from_millis(settings.delayed_ack_ms as u64)
            {
                return self.send_packet(true, false, now, epoch, settings, pool);
            }
        }

        if now < self.timeout {
            return None;
        }
        self.num_timeouts += 1;
        trace_debug!(
            "utp: {:?} RTO fired (timeout #{}), bytes_in_flight={}",
            self.remote,
            self.num_timeouts,
            self.bytes_in_flight
        );
        if self.num_timeouts as u32 > settings.num_resends as u32 {
            self.fail(ErrorKind::TimedOut);
            return None;
        }

        let only_probe_in_flight = self.mtu_seq != 0
            && self
                .outbuf
                .at(self.mtu_seq)
                .map(|_| self.bytes_in_flight as usize == self.outbuf.at(self.mtu_seq).unwrap().payload.len())
                .unwrap_or(false);

        if only_probe_in_flight {
            let size = self.outbuf.at(self.mtu_seq).map(|p| p.size()).unwrap_or(self.mtu);
            self.on_message_too_big(size);
        } else if self.bytes_in_flight == 0 && (self.cwnd >> 16) >= self.mtu as i64 {
            self.cwnd = ((self.cwnd * 2 / 3).max((self.mtu as i64) << 16)).max(0);
        } else {
            self.cwnd = (self.mtu as i64) << 16;
            self.mtu_seq = 0;
            self.loss_seq_nr = self.seq_nr;
            self.slow_start = true;
        }

        // mark every outstanding packet need_resend
        let mut seq = self.acked_seq_nr.wrapping_add(1);
        let mut first: Option<u16> = None;
        while less_wrap(seq, self.seq_nr, SEQ_MASK) || seq == self.seq_nr.wrapping_sub(1) {
            if seq == self.seq_nr {
                break;
            }
            if let Some(p) = self.outbuf.at_mut(seq) {
                p.need_resend = true;
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(p.payload.len() as u32);
                if first.is_none() {
                    first = Some(seq);
                }
            }
            seq = seq.wrapping_add(1);
        }

        self.timeout = now + self.packet_timeout(settings);

        if let Some(seq) = first {
            self.resend_packet(seq, now, epoch, settings)
        } else if self.eof {
            self.send_packet(false, true, now, epoch, settings, pool)
        } else {
            self.send_packet(true, false, now, epoch, settings, pool)
        }
    }

    /// User `close()`: emit FIN, CONNECTED -> FIN_SENT.
    pub fn close(&mut self, now: Instant, epoch: Instant, settings: &Settings, pool: &mut PacketPool) -> Option<Vec<u8>> {
        if self.state != State::Connected {
            return None;
        }
        self.send_packet(false, true, now, epoch, settings, pool)
    }

    /// Cancels pending completions synchronously and moves toward DELETE
    /// (§5 "Cancellation").
    pub fn destroy(&mut self) {
        self.attached = false;
        if !self.stalled {
            self.state = State::Delete;
        }
    }

    pub fn mark_stalled(&mut self) {
        self.stalled = true;
    }

    pub fn clear_stalled(&mut self) {
        self.stalled = false;
        if !self.attached && self.state != State::Delete {
            self.state = State::Delete;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn connect_emits_syn() {
        let now = Instant::now();
        let epoch = now;
        let settings = Settings::default();
        let (conn, syn) = Connection::connect(addr(), now, epoch, &settings);
        assert_eq!(conn.state, State::SynSent);
        assert_eq!(syn.len(), HEADER_SIZE);
        let (h, _) = Header::decode(&syn).unwrap();
        assert_eq!(h.packet_type, PacketType::Syn);
        assert_eq!(h.connection_id, conn.recv_id);
    }

    #[test]
    fn accept_replies_with_state() {
        let now = Instant::now();
        let epoch = now;
        let syn = Header {
            packet_type: PacketType::Syn,
            extension: 0,
            connection_id: 17,
            timestamp_microseconds: 0,
            timestamp_difference_microseconds: 0,
            wnd_size: 0,
            seq_nr: 1000,
            ack_nr: 0,
        };
        let (conn, reply) = Connection::accept(addr(), &syn, now, epoch);
        assert_eq!(conn.state, State::Connected);
        assert_eq!(conn.ack_nr, 1000);
        assert_eq!(conn.send_id, 17);
        assert_eq!(conn.recv_id, 18);
        let (h, _) = Header::decode(&reply).unwrap();
        assert_eq!(h.packet_type, PacketType::State);
        assert_eq!(h.ack_nr, 1000);
    }

    #[test]
    fn loss_halves_cwnd_once_per_rtt() {
        let now = Instant::now();
        let epoch = now;
        let settings = Settings::default();
        let (mut conn, _) = Connection::connect(addr(), now, epoch, &settings);
        let before = conn.cwnd;
        conn.seq_nr = 10;
        conn.experienced_loss(5, 50);
        assert!(conn.cwnd < before);
        let after_first = conn.cwnd;
        conn.experienced_loss(5, 50); // same seq, guarded
        assert_eq!(conn.cwnd, after_first);
    }

    #[test]
    fn sack_bitmap_covers_ack_nr_plus_2() {
        let now = Instant::now();
        let settings = Settings::default();
        let (mut conn, _) = Connection::connect(addr(), now, now, &settings);
        conn.ack_nr = 100;
        let mut pool = PacketPool::new();
        let mut pkt = Packet::new(102, HEADER_SIZE, vec![1, 2, 3], now);
        pkt.mtu_probe = false;
        conn.inbuf.insert(102, pkt).unwrap();
        conn.buffered_incoming_bytes = 3;
        let bitmap = conn.build_sack_bitmap();
        assert!(bitmap[0] & 0b0000_0001 != 0); // bit 0 => ack_nr + 2 == 102
        let _ = pool;
    }

    fn data_header(conn: &Connection, seq: u16) -> Header {
        Header {
            packet_type: PacketType::Data,
            extension: 0,
            connection_id: conn.recv_id,
            timestamp_microseconds: 0,
            timestamp_difference_microseconds: 0,
            wnd_size: 1 << 20,
            seq_nr: seq,
            ack_nr: conn.acked_seq_nr,
        }
    }

    #[test]
    fn out_of_order_delivery_reassembles_in_order() {
        // S2: peer sends seq+1, seq+3, seq+2 - delivery to the user is
        // still in order once the gap is filled.
        let now = Instant::now();
        let epoch = now;
        let settings = Settings::default();
        let mut pool = PacketPool::new();

        let syn = Header {
            packet_type: PacketType::Syn,
            extension: 0,
            connection_id: 17,
            timestamp_microseconds: 0,
            timestamp_difference_microseconds: 0,
            wnd_size: 0,
            seq_nr: 1001,
            ack_nr: 0,
        };
        let (mut conn, _ack) = Connection::accept(addr(), &syn, now, epoch);
        assert_eq!(conn.ack_nr, 1001);

        let h_ef = data_header(&conn, 1003);
        conn.on_incoming(&h_ef, &[], b"EF", now, epoch, &settings, &mut pool);
        assert_eq!(conn.ack_nr, 1001); // still waiting on 1002

        let h_cd = data_header(&conn, 1002);
        conn.on_incoming(&h_cd, &[], b"CD", now, epoch, &settings, &mut pool);
        assert_eq!(conn.ack_nr, 1003); // 1002 delivered, then 1003 drained from inbuf

        assert_eq!(conn.drain_received(), b"CDEF");
    }
}
