//! The datagram adapter.
//!
//! Two rings front one UDP socket: eight recv slots live in the kernel at
//! all times, and eight send slots rotate through a free-slot queue so a
//! writer only pays for a blocking reap when every slot is in flight.

use std::cmp;
use std::fmt;
use std::mem;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use libc;
use libc::{sockaddr_storage, socklen_t, SOCK_DGRAM, SOL_SOCKET, SO_TYPE};
use nix::errno::Errno;

use addr;
use error::{Error, Result};
use fd::OwnedFd;
use probe;
use raw;
use ring::{cancel_sqe, nop_sqe, SetupError, Uring};
use slot::Slot;
use SLOT_COUNT;

/// Tag bit distinguishing the close path's cancel operations from the recv
/// completions they cancel.
const CANCEL_TAG: u64 = 1 << 63;

pub struct UdpRing {
    // The rings are declared ahead of the slot arrays: their Drop closes the
    // ring fds, which quiesces the kernel before the buffers are freed.
    recv_ring: Uring,
    send_ring: Uring,
    recv_slots: Vec<Slot>,
    send_slots: Vec<Slot>,
    free_send: (Sender<usize>, Receiver<usize>),
    local: SocketAddr,
    fd: OwnedFd,
    closed: AtomicBool,
    reads: AtomicUsize,
}

impl UdpRing {
    /// Builds an adapter over an already-bound datagram socket. The socket's
    /// descriptor is duplicated and the duplicate owned here, so the caller
    /// may drop `socket` whenever it likes.
    pub fn from_socket(socket: &UdpSocket) -> Result<UdpRing> {
        UdpRing::from_raw_fd(socket.as_raw_fd())
    }

    /// Like `from_socket` for a raw descriptor. Rejects anything that is not
    /// an IP datagram socket before touching the descriptor's state.
    pub fn from_raw_fd(fd: RawFd) -> Result<UdpRing> {
        if !::enabled() {
            return Err(Error::Disabled);
        }
        if socket_type(fd)? != SOCK_DGRAM {
            return Err(Error::SocketType);
        }
        probe::require(&[
            raw::IORING_OP_RECVMSG,
            raw::IORING_OP_SENDMSG,
            raw::IORING_OP_ASYNC_CANCEL,
        ])?;

        let local = local_addr_of(fd)?;
        let namelen = addr::namelen_for(&local);
        let fd = OwnedFd::dup_of(fd)?;

        let adapter = UdpRing {
            recv_ring: Uring::new(SLOT_COUNT as u32)?,
            send_ring: Uring::new(SLOT_COUNT as u32)?,
            recv_slots: (0..SLOT_COUNT).map(|_| Slot::new(namelen)).collect(),
            send_slots: (0..SLOT_COUNT).map(|_| Slot::new(namelen)).collect(),
            free_send: bounded(SLOT_COUNT),
            local,
            fd,
            closed: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        };

        for idx in 0..SLOT_COUNT {
            adapter.release_send_slot(idx);
        }
        // park every recv slot in the kernel before the first read arrives;
        // an error here drops the partially-armed adapter, whose ring Drops
        // quiesce whatever was already submitted
        for (idx, slot) in adapter.recv_slots.iter().enumerate() {
            slot.enter_kernel();
            if let Err(e) = adapter
                .recv_ring
                .submit(&slot.recvmsg_sqe(adapter.fd.as_raw_fd(), idx as u64))
            {
                slot.leave_kernel();
                return Err(e);
            }
        }

        debug!("udp adapter ready on {}", adapter.local);
        Ok(adapter)
    }

    /// The socket's bound address, cached at construction.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Receives one datagram, blocking until a completion is available, and
    /// returns the byte count and peer address. Unblocked by `close`.
    pub fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        // The increment must precede the closed check: once the closer has
        // stored the flag and then observes reads == 0, no reader can be
        // holding or about to hold a slot.
        self.reads.fetch_add(1, Ordering::SeqCst);
        let res = self.read_from_slot(buf);
        self.reads.fetch_sub(1, Ordering::SeqCst);
        res
    }

    fn read_from_slot(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        loop {
            let completion = match self.recv_ring.reap(true)? {
                Some(c) => c,
                None => continue,
            };
            if completion.tag & CANCEL_TAG != 0 {
                // a close-path cancel or wake-up op completing, not a
                // datagram; there can be more parked readers than slots, so
                // this may be our only chance to notice the close
                if self.closed.load(Ordering::SeqCst) {
                    return Err(Error::Closed);
                }
                continue;
            }
            let idx = completion.tag as usize;
            let slot = &self.recv_slots[idx];
            slot.leave_kernel();

            if completion.res < 0 {
                let errno = Errno::from_i32(-completion.res);
                match errno {
                    Errno::ECANCELED => return Err(Error::Cancelled { errno }),
                    Errno::EAGAIN => {
                        // retried transparently; the slot goes straight back
                        self.resubmit_recv(idx);
                        continue;
                    }
                    _ => {
                        // return the slot to rotation before surfacing
                        self.resubmit_recv(idx);
                        return Err(Error::Syscall { errno });
                    }
                }
            }

            // NOTE(unsafe) we hold this slot's completion
            let decoded = addr::decode(unsafe { slot.peer() });
            let peer = match decoded {
                Some(peer) => peer,
                None => {
                    warn!("recv completion without a peer address on slot {}", idx);
                    self.resubmit_recv(idx);
                    continue;
                }
            };
            let n = cmp::min(completion.res as usize, buf.len());
            // NOTE(unsafe) we hold this slot's completion
            buf[..n].copy_from_slice(unsafe { &slot.bytes()[..n] });
            self.resubmit_recv(idx);
            return Ok((n, peer));
        }
    }

    /// Returns a recv slot to the kernel, counted under the same discipline
    /// as the initial submission. Best-effort: on failure the slot merely
    /// leaves rotation until close.
    fn resubmit_recv(&self, idx: usize) {
        let slot = &self.recv_slots[idx];
        slot.enter_kernel();
        if let Err(e) = self
            .recv_ring
            .submit(&slot.recvmsg_sqe(self.fd.as_raw_fd(), idx as u64))
        {
            slot.leave_kernel();
            warn!("could not return recv slot {} to the kernel: {}", idx, e);
        }
    }

    /// Queues one datagram for transmission and returns the full payload
    /// length. UDP semantics: a kernel-level failure of this send surfaces
    /// on a later write that has to wait for a free slot.
    pub fn write_to(&self, buf: &[u8], peer: &SocketAddr) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if buf.len() > ::MAX_SEGMENT_SIZE {
            return Err(Error::PayloadTooBig {
                len: buf.len(),
                limit: ::MAX_SEGMENT_SIZE,
            });
        }
        if !addr::family_matches(&self.local, peer) {
            return Err(Error::AddrFamily);
        }

        let idx = match self.free_send.1.try_recv() {
            Ok(idx) => idx,
            Err(TryRecvError::Empty) => self.reclaim_send_slot()?,
            Err(TryRecvError::Disconnected) => return Err(Error::Closed),
        };

        let slot = &self.send_slots[idx];
        // NOTE(unsafe) the slot came off the free queue; we are its only user
        let namelen = addr::encode(peer, unsafe { slot.peer() });
        unsafe {
            slot.bytes()[..buf.len()].copy_from_slice(buf);
        }
        slot.enter_kernel();
        if let Err(e) = self
            .send_ring
            .submit(&slot.sendmsg_sqe(self.fd.as_raw_fd(), buf.len(), namelen, idx as u64))
        {
            slot.leave_kernel();
            self.release_send_slot(idx);
            return Err(e);
        }

        // opportunistically bank one completed slot so the next writer can
        // skip the blocking reap
        if let Ok(Some(completion)) = self.send_ring.reap(false) {
            let idx = completion.tag as usize;
            self.send_slots[idx].leave_kernel();
            if completion.res < 0 {
                debug!(
                    "banked send slot {} carried a stale error: {}",
                    idx,
                    Errno::from_i32(-completion.res)
                );
            }
            self.release_send_slot(idx);
        }

        Ok(buf.len())
    }

    /// Blocks for one send completion and hands its slot to the caller.
    /// This is where an earlier send's failure comes home to roost.
    fn reclaim_send_slot(&self) -> Result<usize> {
        let completion = loop {
            if let Some(c) = self.send_ring.reap(true)? {
                break c;
            }
        };
        let idx = completion.tag as usize;
        self.send_slots[idx].leave_kernel();
        if completion.res < 0 {
            let errno = Errno::from_i32(-completion.res);
            if errno != Errno::EAGAIN {
                self.release_send_slot(idx);
                return Err(Error::Syscall { errno });
            }
        }
        Ok(idx)
    }

    fn release_send_slot(&self, idx: usize) {
        self.free_send
            .0
            .try_send(idx)
            .expect("free queue capacity equals the slot count");
    }

    /// Closes the adapter. After this returns every subsequent read and
    /// write fails with `Closed`, and every reader that was parked in a reap
    /// has been unblocked by cancellation. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing udp adapter bound to {}", self.local);
        // Readers that raced past the closed check are parked in a blocking
        // reap, so cancellation is the only way to unblock them; keep
        // cancelling each still-lodged recv until every reader has consumed
        // a completion and dropped its in-progress count. (A reader/writer
        // lock cannot express this: readers would hold the shared side
        // across the blocking reap, and the exclusive side could then never
        // submit the cancel that lets them go.)
        while self.reads.load(Ordering::SeqCst) != 0 {
            for (idx, slot) in self.recv_slots.iter().enumerate() {
                if slot.pending() > 0 {
                    let sqe = cancel_sqe(idx as u64, CANCEL_TAG | idx as u64);
                    if let Err(e) = self.recv_ring.submit(&sqe) {
                        debug!("cancel submit for recv slot {}: {}", idx, e);
                    }
                }
            }
            // a reader parked without a recv of its own (more readers than
            // slots) is only reachable through a fresh completion
            if let Err(e) = self.recv_ring.submit(&nop_sqe(CANCEL_TAG)) {
                debug!("wake-up submit: {}", e);
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.fd.close();
    }

    #[cfg(test)]
    pub(crate) fn send_slot_accounting(&self) -> (usize, u32) {
        let free = self.free_send.1.len();
        let lodged = self.send_slots.iter().map(Slot::pending).sum();
        (free, lodged)
    }
}

impl Drop for UdpRing {
    fn drop(&mut self) {
        self.close();
        // Nothing else can reach the rings now. Cancel whatever recvs are
        // still armed and reap both rings until every slot is accounted
        // for, so teardown does not run with a buffer lodged in the kernel.
        for _ in 0..50 {
            for (idx, slot) in self.recv_slots.iter().enumerate() {
                if slot.pending() > 0 {
                    let _ = self
                        .recv_ring
                        .submit(&cancel_sqe(idx as u64, CANCEL_TAG | idx as u64));
                }
            }
            while let Ok(Some(c)) = self.recv_ring.reap(false) {
                if c.tag & CANCEL_TAG == 0 {
                    self.recv_slots[c.tag as usize].leave_kernel();
                }
            }
            while let Ok(Some(c)) = self.send_ring.reap(false) {
                self.send_slots[c.tag as usize].leave_kernel();
            }
            let idle = self
                .recv_slots
                .iter()
                .chain(self.send_slots.iter())
                .all(|s| s.pending() == 0);
            if idle {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        // the ring fds close next, which force-cancels the stragglers
        warn!("tearing down udp adapter with slots still lodged in the kernel");
    }
}

impl fmt::Debug for UdpRing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UdpRing")
            .field("local", &self.local)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn socket_type(fd: RawFd) -> Result<libc::c_int> {
    let mut ty: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as socklen_t;
    // NOTE(unsafe) out-params are sized right above
    let ret = unsafe {
        libc::getsockopt(
            fd,
            SOL_SOCKET,
            SO_TYPE,
            &mut ty as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(SetupError::Socket {
            errno: Errno::last(),
        }.into());
    }
    Ok(ty)
}

fn local_addr_of(fd: RawFd) -> Result<SocketAddr> {
    // NOTE(unsafe) zeroed storage is a valid out-param for getsockname
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(SetupError::Socket {
            errno: Errno::last(),
        }.into());
    }
    // a datagram socket that is not IPv4/IPv6 (e.g. unix) is still the
    // wrong kind of descriptor for this adapter
    addr::decode(&storage).ok_or(Error::SocketType)
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, UdpSocket};
    use std::os::unix::io::AsRawFd;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use rand::{self, Rng};

    use super::*;

    fn init() {
        let _ = ::env_logger::Builder::from_default_env().try_init();
        ::std::env::set_var(::ENABLE_VAR, "1");
    }

    /// Binds a socket and adapts it, or skips the test when the host kernel
    /// has no usable io_uring (or no IPv6).
    fn adapter_for(bind: &str) -> Option<UdpRing> {
        init();
        let socket = match UdpSocket::bind(bind) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("skipping udp test, cannot bind {}: {}", bind, e);
                return None;
            }
        };
        match UdpRing::from_socket(&socket) {
            Ok(a) => Some(a),
            Err(Error::Unsupported { .. }) | Err(Error::Setup { .. }) => {
                eprintln!("skipping udp test: no usable io_uring on this host");
                None
            }
            Err(e) => panic!("constructing adapter: {}", e),
        }
    }

    #[test]
    fn v4_self_echo_round_trips_payload_and_peer() {
        let ring = match adapter_for("127.0.0.1:0") {
            Some(r) => r,
            None => return,
        };
        let local = ring.local_addr();
        assert_eq!(ring.write_to(b"ping", &local).unwrap(), 4);

        let mut buf = [0u8; 64];
        let (n, peer) = ring.read_from(&mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(peer, local);
    }

    #[test]
    fn v6_self_echo_round_trips_a_full_sized_datagram() {
        let ring = match adapter_for("[::1]:0") {
            Some(r) => r,
            None => return,
        };
        let local = ring.local_addr();
        let payload = vec![b'x'; 1200];
        assert_eq!(ring.write_to(&payload, &local).unwrap(), 1200);

        let mut buf = vec![0u8; 2048];
        let (n, peer) = ring.read_from(&mut buf).unwrap();
        assert_eq!(n, 1200);
        assert_eq!(&buf[..n], &payload[..]);
        assert_eq!(peer, local);
        assert!(peer.ip().is_loopback());
        match peer {
            ::std::net::SocketAddr::V6(v6) => assert_eq!(v6.ip().octets().len(), 16),
            other => panic!("v6 socket yielded {:?}", other),
        }
    }

    #[test]
    fn random_payloads_survive_the_trip_intact() {
        let ring = match adapter_for("127.0.0.1:0") {
            Some(r) => r,
            None => return,
        };
        let local = ring.local_addr();
        let mut rng = rand::thread_rng();
        for _ in 0..10 {
            let mut payload = vec![0u8; 1 + rng.gen::<usize>() % 4096];
            rng.fill(&mut payload[..]);
            assert_eq!(ring.write_to(&payload, &local).unwrap(), payload.len());
            let mut buf = vec![0u8; 8192];
            let (n, _) = ring.read_from(&mut buf).unwrap();
            assert_eq!(&buf[..n], &payload[..]);
        }
    }

    #[test]
    fn close_unblocks_every_parked_reader() {
        let ring = match adapter_for("127.0.0.1:0") {
            Some(r) => r,
            None => return,
        };
        let ring = Arc::new(ring);

        let mut readers = Vec::new();
        for _ in 0..8 {
            let ring = Arc::clone(&ring);
            readers.push(thread::spawn(move || {
                let mut buf = [0u8; 32];
                ring.read_from(&mut buf)
            }));
        }
        // let the readers park in their blocking reaps
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        ring.close();
        for reader in readers {
            match reader.join().unwrap() {
                Err(Error::Closed) | Err(Error::Cancelled { .. }) => {}
                other => panic!("parked reader returned {:?}", other),
            }
        }
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "close took {:?} to unblock the readers",
            started.elapsed()
        );

        let mut buf = [0u8; 32];
        match ring.read_from(&mut buf) {
            Err(Error::Closed) => {}
            other => panic!("read after close returned {:?}", other),
        }
    }

    #[test]
    fn close_is_idempotent_and_sticky() {
        let ring = match adapter_for("127.0.0.1:0") {
            Some(r) => r,
            None => return,
        };
        ring.close();
        ring.close();
        assert!(ring.is_closed());

        let mut buf = [0u8; 16];
        match ring.read_from(&mut buf) {
            Err(Error::Closed) => {}
            other => panic!("read after close returned {:?}", other),
        }
        match ring.write_to(b"x", &ring.local_addr()) {
            Err(Error::Closed) => {}
            other => panic!("write after close returned {:?}", other),
        }
    }

    #[test]
    fn a_burst_of_writes_conserves_every_send_slot() {
        let ring = match adapter_for("127.0.0.1:0") {
            Some(r) => r,
            None => return,
        };
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = sink.local_addr().unwrap();

        let mut payload = [0u8; 512];
        rand::thread_rng().fill(&mut payload[..]);
        for _ in 0..64 {
            assert_eq!(ring.write_to(&payload, &peer).unwrap(), 512);
        }

        // every slot is either banked in the free queue or still lodged in
        // the kernel; none were lost or duplicated along the way
        let (free, lodged) = ring.send_slot_accounting();
        assert_eq!(free + lodged as usize, SLOT_COUNT);
    }

    #[test]
    fn tcp_descriptors_are_rejected_untouched() {
        init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        match UdpRing::from_raw_fd(listener.as_raw_fd()) {
            Err(Error::SocketType) => {}
            other => panic!("expected SocketType, got {:?}", other),
        }
        // the listener is still usable
        assert!(listener.local_addr().is_ok());
    }

    #[test]
    fn cross_family_writes_are_rejected_without_consuming_a_slot() {
        let ring = match adapter_for("127.0.0.1:0") {
            Some(r) => r,
            None => return,
        };
        match ring.write_to(b"x", &"[::1]:9".parse().unwrap()) {
            Err(Error::AddrFamily) => {}
            other => panic!("expected AddrFamily, got {:?}", other),
        }
        let (free, _) = ring.send_slot_accounting();
        assert_eq!(free, SLOT_COUNT);
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let ring = match adapter_for("127.0.0.1:0") {
            Some(r) => r,
            None => return,
        };
        let huge = vec![0u8; ::MAX_SEGMENT_SIZE + 1];
        match ring.write_to(&huge, &ring.local_addr()) {
            Err(Error::PayloadTooBig { len, .. }) => assert_eq!(len, ::MAX_SEGMENT_SIZE + 1),
            other => panic!("expected PayloadTooBig, got {:?}", other),
        }
    }
}
