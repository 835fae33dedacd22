//! Pre-allocated request slots.
//!
//! A slot is created once per adapter direction and recycled through the
//! ring for the adapter's whole life: buffer, scatter/gather descriptor,
//! inline peer-address storage and message header all live at fixed heap
//! addresses the kernel can hold pointers into while an operation is in
//! flight.

use std::mem;
use std::os::unix::io::RawFd;
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};

use libc::{c_void, iovec, msghdr, sockaddr_storage, socklen_t};

use raw;
use raw::io_uring_sqe;
use MAX_SEGMENT_SIZE;

pub(crate) struct Slot {
    buf: *mut u8,
    iov: *mut iovec,
    addr: *mut sockaddr_storage,
    hdr: *mut msghdr,
    /// Bytes of `addr` the kernel should read or write; fixed at
    /// construction from the bound socket family. Zero for file slots.
    namelen: socklen_t,
    /// Number of operations currently lodged in the kernel against this
    /// slot. While it is non-zero the buffer belongs to the ring.
    in_kernel: AtomicU32,
}

// NOTE(unsafe) a slot's pointed-to memory is only touched by the single
// caller holding its completion (or by the kernel while `in_kernel` is
// non-zero); the adapters uphold that protocol.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

impl Slot {
    pub(crate) fn new(namelen: socklen_t) -> Slot {
        let buf = Box::into_raw(vec![0u8; MAX_SEGMENT_SIZE].into_boxed_slice()) as *mut u8;
        // NOTE(unsafe) all-zero is a valid value for each of these C structs
        let iov = Box::into_raw(Box::new(unsafe { mem::zeroed::<iovec>() }));
        let addr = Box::into_raw(Box::new(unsafe { mem::zeroed::<sockaddr_storage>() }));
        let hdr = Box::into_raw(Box::new(unsafe { mem::zeroed::<msghdr>() }));

        // NOTE(unsafe) wiring freshly-allocated, exclusively-owned records
        unsafe {
            (*iov).iov_base = buf as *mut c_void;
            (*iov).iov_len = MAX_SEGMENT_SIZE;
            (*hdr).msg_name = addr as *mut c_void;
            (*hdr).msg_namelen = namelen;
            (*hdr).msg_iov = iov;
            (*hdr).msg_iovlen = 1;
        }

        Slot {
            buf,
            iov,
            addr,
            hdr,
            namelen,
            in_kernel: AtomicU32::new(0),
        }
    }

    /// Marks the slot as lodged in the kernel. Must happen before the sqe is
    /// submitted; the completion can land before submit returns.
    pub(crate) fn enter_kernel(&self) {
        self.in_kernel.fetch_add(1, Ordering::AcqRel);
    }

    /// Records that this slot's completion has been reaped.
    pub(crate) fn leave_kernel(&self) {
        self.in_kernel.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn pending(&self) -> u32 {
        self.in_kernel.load(Ordering::Acquire)
    }

    /// The slot's data buffer.
    ///
    /// NOTE(unsafe) callers must hold the slot's completion (or be the sole
    /// pre-submission owner); the kernel writes here while `pending() > 0`.
    pub(crate) unsafe fn bytes(&self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.buf, MAX_SEGMENT_SIZE)
    }

    /// The slot's inline peer-address record.
    ///
    /// NOTE(unsafe) same ownership rule as `bytes`.
    pub(crate) unsafe fn peer(&self) -> &mut sockaddr_storage {
        &mut *self.addr
    }

    /// A recvmsg sqe reading into this slot, re-arming the fields the kernel
    /// may have rewritten on the previous pass.
    pub(crate) fn recvmsg_sqe(&self, fd: RawFd, tag: u64) -> io_uring_sqe {
        // NOTE(unsafe) caller holds the slot per the `bytes` rule
        unsafe {
            (*self.iov).iov_len = MAX_SEGMENT_SIZE;
            (*self.hdr).msg_namelen = self.namelen;
            (*self.hdr).msg_flags = 0;
            (*self.hdr).msg_control = ::std::ptr::null_mut();
            (*self.hdr).msg_controllen = 0;
        }
        self.msg_sqe(raw::IORING_OP_RECVMSG, fd, tag)
    }

    /// A sendmsg sqe transmitting `len` bytes already copied into the slot
    /// buffer, addressed by `namelen` bytes of the slot's address record.
    pub(crate) fn sendmsg_sqe(
        &self,
        fd: RawFd,
        len: usize,
        namelen: socklen_t,
        tag: u64,
    ) -> io_uring_sqe {
        // NOTE(unsafe) caller holds the slot per the `bytes` rule
        unsafe {
            (*self.iov).iov_len = len;
            (*self.hdr).msg_namelen = namelen;
            (*self.hdr).msg_flags = 0;
            (*self.hdr).msg_control = ::std::ptr::null_mut();
            (*self.hdr).msg_controllen = 0;
        }
        self.msg_sqe(raw::IORING_OP_SENDMSG, fd, tag)
    }

    fn msg_sqe(&self, opcode: u8, fd: RawFd, tag: u64) -> io_uring_sqe {
        io_uring_sqe {
            opcode,
            fd,
            addr: self.hdr as u64,
            len: 1,
            user_data: tag,
            ..io_uring_sqe::default()
        }
    }

    /// A readv sqe reading into this slot's full buffer.
    pub(crate) fn readv_sqe(&self, fd: RawFd, tag: u64) -> io_uring_sqe {
        // NOTE(unsafe) caller holds the slot per the `bytes` rule
        unsafe {
            (*self.iov).iov_len = MAX_SEGMENT_SIZE;
        }
        self.vec_sqe(raw::IORING_OP_READV, fd, tag)
    }

    /// A writev sqe transmitting `len` bytes already copied into the buffer.
    pub(crate) fn writev_sqe(&self, fd: RawFd, len: usize, tag: u64) -> io_uring_sqe {
        // NOTE(unsafe) caller holds the slot per the `bytes` rule
        unsafe {
            (*self.iov).iov_len = len;
        }
        self.vec_sqe(raw::IORING_OP_WRITEV, fd, tag)
    }

    fn vec_sqe(&self, opcode: u8, fd: RawFd, tag: u64) -> io_uring_sqe {
        io_uring_sqe {
            opcode,
            fd,
            addr: self.iov as u64,
            len: 1,
            user_data: tag,
            ..io_uring_sqe::default()
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // Adapters declare their rings before their slot arrays, so the ring
        // fds are already closed (and in-flight ops quiesced) by the time
        // this runs.
        unsafe {
            drop(Box::from_raw(slice::from_raw_parts_mut(
                self.buf,
                MAX_SEGMENT_SIZE,
            ) as *mut [u8]));
            drop(Box::from_raw(self.iov));
            drop(Box::from_raw(self.hdr));
            drop(Box::from_raw(self.addr));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use libc::{iovec, msghdr, sockaddr_in, sockaddr_in6};

    use super::*;

    #[test]
    fn recvmsg_sqe_is_wired_to_the_slot() {
        let slot = Slot::new(mem::size_of::<sockaddr_in>() as socklen_t);
        let sqe = slot.recvmsg_sqe(3, 5);

        assert_eq!(sqe.opcode, raw::IORING_OP_RECVMSG);
        assert_eq!(sqe.fd, 3);
        assert_eq!(sqe.len, 1);
        assert_eq!(sqe.user_data, 5);

        // NOTE(unsafe) nothing was submitted; we are the only owner
        unsafe {
            let hdr = &*(sqe.addr as *const msghdr);
            assert_eq!(hdr.msg_iovlen, 1);
            assert_eq!(hdr.msg_namelen, mem::size_of::<sockaddr_in>() as socklen_t);
            let iov = &*(hdr.msg_iov as *const iovec);
            assert_eq!(iov.iov_len, MAX_SEGMENT_SIZE);
            assert_eq!(iov.iov_base, slot.bytes().as_mut_ptr() as *mut _);
        }
    }

    #[test]
    fn send_sqes_carry_the_payload_length() {
        let slot = Slot::new(mem::size_of::<sockaddr_in6>() as socklen_t);
        let sqe = slot.sendmsg_sqe(9, 1200, 28, 2);
        assert_eq!(sqe.opcode, raw::IORING_OP_SENDMSG);
        // NOTE(unsafe) nothing was submitted; we are the only owner
        unsafe {
            let hdr = &*(sqe.addr as *const msghdr);
            assert_eq!(hdr.msg_namelen, 28);
            assert_eq!((*hdr.msg_iov).iov_len, 1200);
        }

        let sqe = slot.writev_sqe(9, 64, 4);
        assert_eq!(sqe.opcode, raw::IORING_OP_WRITEV);
        assert_eq!(sqe.user_data, 4);
        unsafe {
            assert_eq!((*(sqe.addr as *const iovec)).iov_len, 64);
        }
    }

    #[test]
    fn in_kernel_count_tracks_enter_and_leave() {
        let slot = Slot::new(0);
        assert_eq!(slot.pending(), 0);
        slot.enter_kernel();
        slot.enter_kernel();
        assert_eq!(slot.pending(), 2);
        slot.leave_kernel();
        assert_eq!(slot.pending(), 1);
        slot.leave_kernel();
        assert_eq!(slot.pending(), 0);
    }
}
