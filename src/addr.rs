//! Bit-exact conversion between `std::net::SocketAddr` and the kernel's
//! socket-address layouts.
//!
//! v4: 2-byte family, 2-byte port (network order), 4-byte address (network
//! order), 8 bytes of zero padding. v6: 2-byte family, 2-byte port (network
//! order), 4-byte flow info, 16-byte address, 4-byte scope id.

use std::mem::size_of;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;

use libc::{sa_family_t, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t, AF_INET,
           AF_INET6};

/// Serializes `addr` into `storage` and returns the number of meaningful
/// bytes, i.e. the `msg_namelen` to hand the kernel.
pub(crate) fn encode(addr: &SocketAddr, storage: &mut sockaddr_storage) -> socklen_t {
    match *addr {
        SocketAddr::V4(v4) => {
            // NOTE(unsafe) sockaddr_in is a strict prefix of sockaddr_storage
            let sin = unsafe { &mut *(storage as *mut sockaddr_storage as *mut sockaddr_in) };
            sin.sin_family = AF_INET as sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            sin.sin_zero = [0; 8];
            size_of::<sockaddr_in>() as socklen_t
        }
        SocketAddr::V6(v6) => {
            // NOTE(unsafe) sockaddr_in6 is a strict prefix of sockaddr_storage
            let sin6 = unsafe { &mut *(storage as *mut sockaddr_storage as *mut sockaddr_in6) };
            sin6.sin6_family = AF_INET6 as sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            size_of::<sockaddr_in6>() as socklen_t
        }
    }
}

/// Reads the peer address the kernel left in `storage`. `None` when the
/// family byte is neither AF_INET nor AF_INET6 (nothing was received).
pub(crate) fn decode(storage: &sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        AF_INET => {
            // NOTE(unsafe) family says the prefix holds a sockaddr_in
            let sin = unsafe { ptr::read(storage as *const sockaddr_storage as *const sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        AF_INET6 => {
            // NOTE(unsafe) family says the prefix holds a sockaddr_in6
            let sin6 =
                unsafe { ptr::read(storage as *const sockaddr_storage as *const sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// The `msg_namelen` an adapter bound to `addr`'s family should pre-arm its
/// recv slots with.
pub(crate) fn namelen_for(addr: &SocketAddr) -> socklen_t {
    match *addr {
        SocketAddr::V4(_) => size_of::<sockaddr_in>() as socklen_t,
        SocketAddr::V6(_) => size_of::<sockaddr_in6>() as socklen_t,
    }
}

/// `true` when `peer` can be sent from a socket bound to `local`'s family.
pub(crate) fn family_matches(local: &SocketAddr, peer: &SocketAddr) -> bool {
    local.is_ipv4() == peer.is_ipv4()
}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::slice;

    use super::*;

    fn bytes_of(storage: &sockaddr_storage, len: usize) -> &[u8] {
        // NOTE(unsafe) reading the prefix of plain old data
        unsafe { slice::from_raw_parts(storage as *const sockaddr_storage as *const u8, len) }
    }

    #[test]
    fn v4_layout_is_bit_exact() {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let addr = "1.2.3.4:513".parse().unwrap();
        let len = encode(&addr, &mut storage);

        assert_eq!(len as usize, 16);
        let mut expected = Vec::new();
        expected.extend_from_slice(&(AF_INET as u16).to_ne_bytes());
        // port 513 = 0x0201, network byte order
        expected.extend_from_slice(&[0x02, 0x01]);
        expected.extend_from_slice(&[1, 2, 3, 4]);
        expected.extend_from_slice(&[0; 8]);
        assert_eq!(bytes_of(&storage, 16), &expected[..]);
    }

    #[test]
    fn v6_layout_is_bit_exact() {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let addr = "[2001:db8::42]:4242".parse().unwrap();
        let len = encode(&addr, &mut storage);

        assert_eq!(len as usize, 28);
        let mut expected = Vec::new();
        expected.extend_from_slice(&(AF_INET6 as u16).to_ne_bytes());
        expected.extend_from_slice(&4242u16.to_be_bytes());
        expected.extend_from_slice(&[0; 4]); // flow info
        expected.extend_from_slice(&[
            0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x42,
        ]);
        expected.extend_from_slice(&[0; 4]); // scope id
        assert_eq!(bytes_of(&storage, 28), &expected[..]);
    }

    #[test]
    fn round_trips_both_families() {
        for addr in &["127.0.0.1:6000", "[::1]:53", "255.255.255.255:65535"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
            encode(&addr, &mut storage);
            assert_eq!(decode(&storage), Some(addr));
        }
    }

    #[test]
    fn an_empty_record_decodes_to_none() {
        let storage: sockaddr_storage = unsafe { mem::zeroed() };
        assert_eq!(decode(&storage), None);
    }

    #[test]
    fn namelen_tracks_the_family() {
        let v4: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let v6: SocketAddr = "[::]:0".parse().unwrap();
        assert_eq!(namelen_for(&v4) as usize, mem::size_of::<sockaddr_in>());
        assert_eq!(namelen_for(&v6) as usize, mem::size_of::<sockaddr_in6>());
        assert!(family_matches(&v4, &"9.9.9.9:1".parse().unwrap()));
        assert!(!family_matches(&v4, &v6));
    }
}
