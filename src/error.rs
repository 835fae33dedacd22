use nix::errno::Errno;

use ring::SetupError;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    /// Construction-time only: the accelerated path is opt-in so callers can
    /// fall back to a conventional socket when this fires.
    #[fail(display = "io_uring adapters are disabled; set URING_IO=1 to enable them")]
    Disabled,
    /// Construction-time only: the running kernel does not handle one of the
    /// opcodes the adapter needs.
    #[fail(display = "kernel does not support io_uring opcode {}", opcode)]
    Unsupported { opcode: u8 },
    /// Construction-time only: ring or slot initialization failed.
    #[fail(display = "failed to set up an io_uring: {}", inner)]
    Setup { inner: SetupError },
    /// The adapter was closed; every later call returns this verbatim.
    #[fail(display = "adapter is already closed")]
    Closed,
    /// The kernel executed the operation and it failed. Inbound slots are
    /// resubmitted best-effort before this surfaces; outbound failures show
    /// up on the next write that has to wait for a slot.
    #[fail(display = "operation failed in the kernel: {}", errno)]
    Syscall { errno: Errno },
    /// Reaping the completion queue itself failed; fatal for the call, and
    /// the caller is expected to close and rebuild the adapter.
    #[fail(display = "completion ring failed: {}", errno)]
    Ring { errno: Errno },
    /// Only produced while close is cancelling outstanding reads.
    #[fail(display = "operation cancelled during close: {}", errno)]
    Cancelled { errno: Errno },
    /// The descriptor handed to the constructor is not a datagram socket.
    #[fail(display = "descriptor is not a datagram socket")]
    SocketType,
    /// The peer address family does not match the bound socket's family.
    #[fail(display = "peer address family does not match the bound socket")]
    AddrFamily,
    #[fail(display = "payload of {} bytes exceeds the {} byte segment limit", len, limit)]
    PayloadTooBig { len: usize, limit: usize },
}

impl From<SetupError> for Error {
    fn from(inner: SetupError) -> Self {
        Error::Setup { inner }
    }
}
