//! Low-level binding to one io_uring submission/completion queue pair.
//!
//! Each adapter owns two of these, one per transfer direction, so a
//! completion never has to be demultiplexed by operation type: everything
//! reaped from a ring belongs to that ring's direction.

use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use libc;
use libc::{c_void, MAP_FAILED, MAP_POPULATE, MAP_SHARED, PROT_READ, PROT_WRITE};
use nix::errno::Errno;

use error::{Error, Result};
use raw;
use raw::{io_uring_cqe, io_uring_params, io_uring_sqe, EnterFlags};

/// One completion, as reaped from the CQ ring.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Completion {
    /// Syscall-style result: byte count, or negated errno.
    pub res: i32,
    /// The user-data tag supplied at submission.
    pub tag: u64,
}

pub(crate) struct Uring {
    fd: RawFd,
    sq: Mutex<Sq>,
    cq: Mutex<Cq>,
    // regions unmap on drop, after the fd is closed
    sq_ring: Mapping,
    cq_ring: Mapping,
    sqe_ring: Mapping,
}

// NOTE(unsafe) the raw pointers below all target the three mmaps, which live
// until Drop; the per-queue mutexes serialize every access through them.
unsafe impl Send for Uring {}
unsafe impl Sync for Uring {}

struct Sq {
    khead: *const AtomicU32,
    ktail: *const AtomicU32,
    ring_mask: u32,
    ring_entries: u32,
    sqes: *mut io_uring_sqe,
}

struct Cq {
    khead: *const AtomicU32,
    ktail: *const AtomicU32,
    ring_mask: u32,
    cqes: *const io_uring_cqe,
}

struct Mapping {
    base: *mut c_void,
    len: usize,
}

impl Mapping {
    fn new(
        fd: RawFd,
        len: usize,
        offset: i64,
        which: &'static str,
    ) -> ::std::result::Result<Self, SetupError> {
        // NOTE(unsafe) a fresh shared mapping against our own ring fd
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_SHARED | MAP_POPULATE,
                fd,
                offset,
            )
        };
        if base == MAP_FAILED {
            return Err(SetupError::Mmap {
                which,
                errno: Errno::last(),
            });
        }
        Ok(Mapping { base, len })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

impl Uring {
    /// Sets up a ring of at least `entries` submission slots and maps its
    /// three shared regions. Uses the original double-mmap layout, which
    /// every io_uring kernel accepts.
    pub(crate) fn new(entries: u32) -> Result<Self> {
        let mut params = io_uring_params::default();
        // NOTE(unsafe) the kernel only writes into `params`
        let fd = unsafe { raw::io_uring_setup(entries, &mut params) };
        if fd < 0 {
            return Err(SetupError::from(Errno::last()).into());
        }

        let sq_ring_len =
            params.sq_off.array as usize + params.sq_entries as usize * size_of::<u32>();
        let cq_ring_len =
            params.cq_off.cqes as usize + params.cq_entries as usize * size_of::<io_uring_cqe>();
        let sqe_ring_len = params.sq_entries as usize * size_of::<io_uring_sqe>();

        let close_on_err = |e: SetupError| {
            // NOTE(unsafe) fd came from io_uring_setup just above
            unsafe {
                libc::close(fd);
            }
            Error::from(e)
        };
        let sq_ring = Mapping::new(fd, sq_ring_len, raw::IORING_OFF_SQ_RING, "submission ring")
            .map_err(&close_on_err)?;
        let cq_ring = Mapping::new(fd, cq_ring_len, raw::IORING_OFF_CQ_RING, "completion ring")
            .map_err(&close_on_err)?;
        let sqe_ring = Mapping::new(fd, sqe_ring_len, raw::IORING_OFF_SQES, "sqe array")
            .map_err(&close_on_err)?;

        // NOTE(unsafe) all offsets come from the kernel and land inside the
        // regions sized above
        let (sq, cq) = unsafe {
            let base = sq_ring.base as *mut u8;
            let array = base.add(params.sq_off.array as usize) as *mut u32;
            // identity-map the index array once: ring position i always
            // refers to sqe slot i
            for i in 0..params.sq_entries {
                *array.add(i as usize) = i;
            }
            let sq = Sq {
                khead: base.add(params.sq_off.head as usize) as *const AtomicU32,
                ktail: base.add(params.sq_off.tail as usize) as *const AtomicU32,
                ring_mask: *(base.add(params.sq_off.ring_mask as usize) as *const u32),
                ring_entries: *(base.add(params.sq_off.ring_entries as usize) as *const u32),
                sqes: sqe_ring.base as *mut io_uring_sqe,
            };

            let base = cq_ring.base as *mut u8;
            let cq = Cq {
                khead: base.add(params.cq_off.head as usize) as *const AtomicU32,
                ktail: base.add(params.cq_off.tail as usize) as *const AtomicU32,
                ring_mask: *(base.add(params.cq_off.ring_mask as usize) as *const u32),
                cqes: base.add(params.cq_off.cqes as usize) as *const io_uring_cqe,
            };
            (sq, cq)
        };

        debug!(
            "io_uring fd {} ready with {} sq / {} cq entries",
            fd, params.sq_entries, params.cq_entries
        );

        Ok(Uring {
            fd,
            sq: Mutex::new(sq),
            cq: Mutex::new(cq),
            sq_ring,
            cq_ring,
            sqe_ring,
        })
    }

    /// Enqueues one prepared sqe and hands it to the kernel.
    ///
    /// Any slot the sqe points into must be marked in-kernel *before* this
    /// call: the completion can be delivered before submit returns.
    pub(crate) fn submit(&self, sqe: &io_uring_sqe) -> Result<()> {
        let sq = self.sq.lock().unwrap();
        // NOTE(unsafe) the lock makes us the only tail writer; pointers are
        // valid for the life of the mmaps
        unsafe {
            let head = (*sq.khead).load(Ordering::Acquire);
            let tail = (*sq.ktail).load(Ordering::Relaxed);
            if tail.wrapping_sub(head) >= sq.ring_entries {
                // transient: the kernel has not yet consumed earlier entries
                return Err(Error::Ring {
                    errno: Errno::EBUSY,
                });
            }
            ptr::write(sq.sqes.add((tail & sq.ring_mask) as usize), *sqe);
            (*sq.ktail).store(tail.wrapping_add(1), Ordering::Release);
        }
        loop {
            // NOTE(unsafe) plain syscall on our own fd
            let ret = unsafe { raw::io_uring_enter(self.fd, 1, 0, 0) };
            if ret >= 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => return Err(Error::Ring { errno }),
            }
        }
    }

    /// Fetches one completion. With `block` set, suspends until one arrives;
    /// otherwise returns `None` when the queue is empty right now.
    pub(crate) fn reap(&self, block: bool) -> Result<Option<Completion>> {
        let cq = self.cq.lock().unwrap();
        loop {
            // NOTE(unsafe) the lock makes us the only head writer; pointers
            // are valid for the life of the mmaps
            unsafe {
                let head = (*cq.khead).load(Ordering::Relaxed);
                let tail = (*cq.ktail).load(Ordering::Acquire);
                if head != tail {
                    let cqe = ptr::read(cq.cqes.add((head & cq.ring_mask) as usize));
                    (*cq.khead).store(head.wrapping_add(1), Ordering::Release);
                    return Ok(Some(Completion {
                        res: cqe.res,
                        tag: cqe.user_data,
                    }));
                }
            }
            if !block {
                return Ok(None);
            }
            let ret =
                unsafe { raw::io_uring_enter(self.fd, 0, 1, EnterFlags::GETEVENTS.bits()) };
            if ret < 0 {
                match Errno::last() {
                    Errno::EINTR | Errno::EAGAIN => continue,
                    errno => return Err(Error::Ring { errno }),
                }
            }
        }
    }
}

impl Drop for Uring {
    fn drop(&mut self) {
        // Closing the fd makes the kernel cancel and drain anything still in
        // flight before the mappings and the slot buffers go away.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Builds an `IORING_OP_ASYNC_CANCEL` sqe targeting the operation that was
/// submitted under `target`. The cancellation completes with a cqe of its
/// own, tagged `tag`.
pub(crate) fn cancel_sqe(target: u64, tag: u64) -> io_uring_sqe {
    io_uring_sqe {
        opcode: raw::IORING_OP_ASYNC_CANCEL,
        fd: -1,
        addr: target,
        user_data: tag,
        ..io_uring_sqe::default()
    }
}

#[derive(Debug, Fail)]
pub enum SetupError {
    #[fail(display = "params is outside the accessible address space")]
    ParamsBadAddress,
    #[fail(
        display = "entries is out of bounds, flags contains an unsupported value, or the resv
        array contains non-zero data"
    )]
    InvalidArgs,
    #[fail(
        display = "The per-process limit on the number of open file descriptors has been
        reached."
    )]
    TooManyOpenFiles,
    #[fail(display = "The system-wide limit on the total number of open files has been reached.")]
    FileTableFull,
    #[fail(
        display = "Insufficient kernel resources are available, or the caller's locked-memory
        limit would be exceeded."
    )]
    NoMemory,
    #[fail(
        display = "io_uring is disallowed for this process by policy, or a polling ring was
        requested without sufficient privilege."
    )]
    NotPermitted,
    #[fail(display = "The kernel was built without io_uring support.")]
    NoKernelSupport,
    #[fail(display = "failed to map the {} region: {}", which, errno)]
    Mmap {
        which: &'static str,
        errno: Errno,
    },
    #[fail(display = "failed to duplicate the caller's descriptor: {}", errno)]
    Descriptor { errno: Errno },
    #[fail(display = "failed to inspect the caller's socket: {}", errno)]
    Socket { errno: Errno },
    #[fail(display = "The kernel returned an unexpected error code: {}", errno)]
    Unknown { errno: Errno },
}

impl From<Errno> for SetupError {
    fn from(errno: Errno) -> SetupError {
        match errno {
            Errno::EFAULT => SetupError::ParamsBadAddress,
            Errno::EINVAL => SetupError::InvalidArgs,
            Errno::EMFILE => SetupError::TooManyOpenFiles,
            Errno::ENFILE => SetupError::FileTableFull,
            Errno::ENOMEM => SetupError::NoMemory,
            Errno::EPERM => SetupError::NotPermitted,
            Errno::ENOSYS => SetupError::NoKernelSupport,
            _ => SetupError::Unknown { errno },
        }
    }
}

/// Builds a no-op sqe. Completes immediately with `res == 0`; the adapters
/// use it to wake readers parked in a blocking reap during close.
pub(crate) fn nop_sqe(tag: u64) -> io_uring_sqe {
    io_uring_sqe {
        opcode: raw::IORING_OP_NOP,
        fd: -1,
        user_data: tag,
        ..io_uring_sqe::default()
    }
}
