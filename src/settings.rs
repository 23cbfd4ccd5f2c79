//! Tunable settings shared by every connection a manager owns (§6.3).

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// LEDBAT target one-way queueing delay, microseconds.
    pub target_delay_us: u32,
    /// Multiplicative cwnd gain per ack.
    pub gain_factor: i64,
    /// Data retransmit limit before connection failure.
    pub num_resends: u8,
    /// SYN retransmit limit.
    pub syn_resends: u8,
    /// FIN retransmit limit.
    pub fin_resends: u8,
    /// Floor for RTO calculation, milliseconds.
    pub min_timeout_ms: u32,
    /// Initial connect deadline, milliseconds.
    pub connect_timeout_ms: u32,
    /// cwnd cut ratio on loss: `new = old * loss_multiplier / 100`.
    pub loss_multiplier: u32,
    /// Ask the OS to set the DF bit on MTU probes.
    pub dont_fragment: bool,
    /// Max delay before a forced ST_STATE, milliseconds.
    pub delayed_ack_ms: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            target_delay_us: 100_000,
            gain_factor: 3_000,
            num_resends: 6,
            syn_resends: 2,
            fin_resends: 2,
            min_timeout_ms: 500,
            connect_timeout_ms: 30_000,
            loss_multiplier: 50,
            dont_fragment: true,
            delayed_ack_ms: 100,
        }
    }
}
