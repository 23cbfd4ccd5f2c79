//! uTP (Micro Transport Protocol) — a reliable, ordered byte stream over
//! UDP with LEDBAT congestion control, targeting a fixed one-way queuing
//! delay instead of fighting loss-based flows for bandwidth.
//!
//! Top-level pieces:
//!
//! - [`Header`]/[`PacketType`] — the 20-byte wire header and the
//!   selective-ack extension.
//! - [`Connection`] — the per-flow protocol state machine: sequencing,
//!   SACK, LEDBAT, RTO, MTU discovery. Never touches a socket.
//! - [`UtpManager`] — owns the UDP socket, demultiplexes datagrams to
//!   connections by `(remote, connection_id)`, drives per-tick timers.
//! - [`Stream`] — the scatter/gather read/write facade applications use
//!   on top of a connection.
//! - [`Settings`] — tunables (RTO floor, resend limits, LEDBAT target
//!   delay, ...), defaulted the way the reference uTP implementation is.
//! - [`UtpError`] — protocol-level outcomes (timeout, reset, EOF, ...)
//!   layered over `io::Error` for genuine socket failures.
//!
//! Single-threaded by design: one `UtpManager` owns its socket and its
//! connections, and every operation runs to completion before the next
//! `poll()`/`tick()` call, so nothing here takes a lock.
//!
//! ```no_run
//! use kaos_utp::{Stream, UtpManager};
//!
//! let mut manager = UtpManager::bind("0.0.0.0:0")?;
//! let key = manager.connect("127.0.0.1:9000".parse().unwrap())?;
//! let mut stream = Stream::new(key);
//! stream.set_connect_handler(|_mgr, result| {
//!     result.expect("connect failed");
//! });
//! loop {
//!     manager.poll()?;
//!     stream.service(&mut manager);
//!     manager.tick(std::time::Instant::now());
//! }
//! # #[allow(unreachable_code)]
//! # Ok::<(), std::io::Error>(())
//! ```

mod buffer;
mod connection;
mod error;
mod header;
mod manager;
mod packet;
mod pool;
mod seq;
mod settings;
mod stats;
mod stream;

pub use connection::{Connection, IncomingOutcome, State};
pub use error::{ErrorKind, Result, UtpError};
pub use header::{Header, PacketType};
pub use manager::{ConnKey, UtpManager};
pub use settings::Settings;
pub use stream::Stream;

/// `tracing::debug!` behind the `tracing` feature, a silent no-op
/// without it — so the library never pays for logging it didn't ask for
/// and never forces the dependency on a consumer that doesn't want it.
#[cfg(feature = "tracing")]
#[macro_export]
macro_rules! trace_debug {
    ($($arg:tt)*) => { tracing::debug!($($arg)*) };
}
#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! trace_debug {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
#[macro_export]
macro_rules! trace_warn {
    ($($arg:tt)*) => { tracing::warn!($($arg)*) };
}
#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! trace_warn {
    ($($arg:tt)*) => {};
}
