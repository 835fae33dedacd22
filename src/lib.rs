//! io_uring-backed I/O adapters for a userspace VPN data plane.
//!
//! A VPN engine spends its life moving datagrams through a UDP socket and
//! raw IP frames through a TUN character device. Paying one blocking
//! syscall per packet caps throughput; the adapters here instead keep a
//! fixed pool of pre-registered buffers perpetually in flight against
//! kernel submission/completion rings and multiplex them across concurrent
//! callers:
//!
//! - [`UdpRing`] fronts an already-bound datagram socket with
//!   packet-oriented `read_from`/`write_to` calls;
//! - [`FileRing`] does the same for a character device with
//!   `readv`/`writev`;
//! - [`TunRing`] wraps the file adapter and handles the TUN device's
//!   4-byte packet-information framing.
//!
//! The accelerated path is opt-in. Constructors fail with
//! [`Error::Disabled`] unless the `URING_IO` environment variable is set to
//! `1` (or `true`), so callers keep a conventional-socket fallback ready.
//!
//! Deadlines are deliberately unsupported: a blocked read is released by
//! `close`, which cancels outstanding kernel operations, and by nothing
//! else.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;

extern crate crossbeam_channel;
extern crate failure;
extern crate libc;
extern crate nix;

#[cfg(test)]
extern crate env_logger;
#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;
#[cfg(test)]
extern crate rand;

mod addr;
pub mod error;
mod fd;
pub mod file;
pub mod probe;
mod raw;
pub mod ring;
mod slot;
pub mod tun;
pub mod udp;

pub use error::{Error, Result};
pub use file::FileRing;
pub use tun::TunRing;
pub use udp::UdpRing;

/// The maximum per-packet payload; every slot buffer is this large.
pub const MAX_SEGMENT_SIZE: usize = (1 << 16) - 1;

/// Slots kept in rotation per ring direction. The TUN read side is capped
/// at one by the device driver instead; see `file`.
pub(crate) const SLOT_COUNT: usize = 8;

/// Environment variable gating the accelerated path.
pub const ENABLE_VAR: &str = "URING_IO";

/// Whether this process has opted in to the accelerated adapters.
pub fn enabled() -> bool {
    match ::std::env::var(ENABLE_VAR) {
        Ok(v) => enabled_value(&v),
        Err(_) => false,
    }
}

fn enabled_value(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true")
}
