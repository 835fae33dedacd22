//! Process-wide io_uring opcode capability table.
//!
//! Each opcode is probed against the kernel at most once per process
//! lifetime, via a throwaway one-entry ring and `IORING_REGISTER_PROBE`;
//! both positive and negative answers are memoized so later adapter
//! constructions short-circuit without another kernel round trip.

use std::collections::BTreeMap;
use std::mem;
use std::sync::Mutex;

use libc;
use libc::c_void;
use nix::errno::Errno;

use error::{Error, Result};
use raw;
use raw::{io_uring_params, io_uring_probe};

static CACHE: Mutex<Option<BTreeMap<u8, bool>>> = Mutex::new(None);

/// Whether the running kernel handles `opcode`. Memoized.
pub fn supports(opcode: u8) -> bool {
    let mut cache = CACHE.lock().unwrap();
    let map = cache.get_or_insert_with(BTreeMap::new);
    if let Some(&known) = map.get(&opcode) {
        return known;
    }
    let answer = ask_kernel(opcode);
    debug!("kernel supports io_uring opcode {}: {}", opcode, answer);
    map.insert(opcode, answer);
    answer
}

/// Fails with the first unsupported opcode, for constructors.
pub(crate) fn require(opcodes: &[u8]) -> Result<()> {
    for &opcode in opcodes {
        if !supports(opcode) {
            return Err(Error::Unsupported { opcode });
        }
    }
    Ok(())
}

fn ask_kernel(opcode: u8) -> bool {
    let mut params = io_uring_params::default();
    // NOTE(unsafe) the kernel only writes into `params`
    let fd = unsafe { raw::io_uring_setup(1, &mut params) };
    if fd < 0 {
        // no io_uring at all; every opcode is unsupported
        debug!("io_uring_setup failed while probing: {}", Errno::last());
        return false;
    }

    // NOTE(unsafe) all-zero is the expected input state for the probe struct
    let mut probe: io_uring_probe = unsafe { mem::zeroed() };
    let ret = unsafe {
        raw::io_uring_register(
            fd,
            raw::IORING_REGISTER_PROBE,
            &mut probe as *mut io_uring_probe as *mut c_void,
            probe.ops.len() as u32,
        )
    };
    let errno = Errno::last();
    // NOTE(unsafe) fd came from io_uring_setup above
    unsafe {
        libc::close(fd);
    }
    if ret < 0 {
        // no probe interface: answer conservatively rather than guess from
        // kernel version
        debug!("IORING_REGISTER_PROBE failed: {}", errno);
        return false;
    }

    opcode <= probe.last_op
        && probe.ops[opcode as usize].flags & raw::IO_URING_OP_SUPPORTED != 0
}

#[cfg(test)]
pub(crate) fn cached(opcode: u8) -> Option<bool> {
    let cache = CACHE.lock().unwrap();
    cache.as_ref().and_then(|map| map.get(&opcode).cloned())
}
