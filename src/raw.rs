//! Checked-in io_uring ABI: the structs the kernel shares with us over mmap,
//! the setup/enter/register syscall wrappers, and the handful of constants we
//! use. Layouts mirror `<linux/io_uring.h>` and are size-asserted in the
//! tests below.

#![allow(non_camel_case_types)]
#![allow(unused)]

use libc::{c_int, c_long, c_uint, c_void, sigset_t, syscall, SYS_io_uring_enter,
           SYS_io_uring_register, SYS_io_uring_setup};

pub const IORING_OP_NOP: u8 = 0;
pub const IORING_OP_READV: u8 = 1;
pub const IORING_OP_WRITEV: u8 = 2;
pub const IORING_OP_SENDMSG: u8 = 9;
pub const IORING_OP_RECVMSG: u8 = 10;
pub const IORING_OP_ASYNC_CANCEL: u8 = 14;

/// mmap offset selecting the submission queue ring.
pub const IORING_OFF_SQ_RING: i64 = 0;
/// mmap offset selecting the completion queue ring.
pub const IORING_OFF_CQ_RING: i64 = 0x8000000;
/// mmap offset selecting the submission entry array.
pub const IORING_OFF_SQES: i64 = 0x10000000;

pub const IORING_REGISTER_PROBE: c_uint = 8;
/// Set in `io_uring_probe_op.flags` when the kernel handles the opcode.
pub const IO_URING_OP_SUPPORTED: u16 = 1 << 0;

bitflags! {
    /// io_uring_enter() flags.
    pub struct EnterFlags: u32 {
        /// `IORING_ENTER_GETEVENTS`: block until `min_complete` completions
        /// are available.
        const GETEVENTS = 1 << 0;
        /// `IORING_ENTER_SQ_WAKEUP`: wake a sleeping SQPOLL thread.
        const SQ_WAKEUP = 1 << 1;
    }
}

bitflags! {
    /// io_uring_setup() flags. We always pass an empty set; the variants are
    /// kept so the params struct round-trips losslessly.
    pub struct SetupFlags: u32 {
        /// `IORING_SETUP_IOPOLL`
        const IOPOLL = 1 << 0;
        /// `IORING_SETUP_SQPOLL`
        const SQPOLL = 1 << 1;
        /// `IORING_SETUP_SQ_AFF`
        const SQ_AFF = 1 << 2;
    }
}

/// C: `struct io_sqring_offsets`. Field offsets into the SQ ring mmap.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct io_sqring_offsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// C: `struct io_cqring_offsets`. Field offsets into the CQ ring mmap.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct io_cqring_offsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// C: `struct io_uring_params`. Passed to io_uring_setup(2); the kernel
/// fills in the output fields on success.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct io_uring_params {
    /// (output) allocated submission queue entries
    pub sq_entries: u32,
    /// (output) allocated completion queue entries
    pub cq_entries: u32,
    /// (input) `SetupFlags`
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    /// (output) `IORING_FEAT_*` bits
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: io_sqring_offsets,
    pub cq_off: io_cqring_offsets,
}

/// C: `struct io_uring_sqe`, with the kernel's unions flattened to the
/// members this crate submits (the unused arms are plain integers of the
/// same width, so the layout is unchanged).
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct io_uring_sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    /// msg_flags / rw_flags / cancel_flags, depending on `opcode`.
    pub op_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub __pad2: [u64; 2],
}

/// C: `struct io_uring_cqe`.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct io_uring_cqe {
    pub user_data: u64,
    /// The operation's syscall-style return value: byte count, or negated
    /// errno.
    pub res: i32,
    pub flags: u32,
}

/// C: `struct io_uring_probe_op`.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct io_uring_probe_op {
    pub op: u8,
    pub resv: u8,
    pub flags: u16,
    pub resv2: u32,
}

/// C: `struct io_uring_probe`. The kernel declares `ops` as a flexible
/// array; 256 entries covers every opcode expressible in the u8 `last_op`.
#[repr(C)]
pub struct io_uring_probe {
    pub last_op: u8,
    pub ops_len: u8,
    pub resv: u16,
    pub resv2: [u32; 3],
    pub ops: [io_uring_probe_op; 256],
}

pub unsafe fn io_uring_setup(entries: u32, params: *mut io_uring_params) -> c_int {
    syscall(SYS_io_uring_setup, entries as c_long, params as usize as c_long) as c_int
}

pub unsafe fn io_uring_enter(fd: c_int, to_submit: u32, min_complete: u32, flags: u32) -> c_int {
    syscall(
        SYS_io_uring_enter,
        fd as c_long,
        to_submit as c_long,
        min_complete as c_long,
        flags as c_long,
        // no signal mask; the kernel ignores the size when sig is null
        0 as c_long,
        ::std::mem::size_of::<sigset_t>() as c_long,
    ) as c_int
}

pub unsafe fn io_uring_register(fd: c_int, opcode: c_uint, arg: *mut c_void, nr_args: c_uint) -> c_int {
    syscall(
        SYS_io_uring_register,
        fd as c_long,
        opcode as c_long,
        arg as usize as c_long,
        nr_args as c_long,
    ) as c_int
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    // The kernel rejects a params struct of the wrong size outright, and a
    // mis-sized sqe/cqe would corrupt the rings silently, so pin them here.
    #[test]
    fn abi_layouts() {
        assert_eq!(size_of::<io_uring_params>(), 120);
        assert_eq!(size_of::<io_sqring_offsets>(), 40);
        assert_eq!(size_of::<io_cqring_offsets>(), 40);
        assert_eq!(size_of::<io_uring_sqe>(), 64);
        assert_eq!(size_of::<io_uring_cqe>(), 16);
        assert_eq!(size_of::<io_uring_probe_op>(), 8);
        assert_eq!(size_of::<io_uring_probe>(), 16 + 256 * 8);
    }
}
