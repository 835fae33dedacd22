//! Packet-information framing over the file adapter.
//!
//! The TUN device brackets every layer-3 frame with a 4-byte PI header:
//! two flag bytes (always zero here) followed by a big-endian ethertype.
//! Callers lay their packets out with `PI_LEN` bytes of headroom so the
//! header can be stamped and stripped in place, without an extra copy.

use std::fs::File;
use std::os::unix::io::RawFd;

use error::Result;
use file::FileRing;

/// Headroom the caller must reserve in front of `offset`.
pub const PI_LEN: usize = 4;

const ETH_P_IP: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86dd;

#[derive(Debug)]
pub struct TunRing {
    file: FileRing,
}

impl TunRing {
    /// Wraps an already-open TUN character device.
    pub fn from_file(file: &File) -> Result<TunRing> {
        Ok(TunRing {
            file: FileRing::from_file(file)?,
        })
    }

    pub fn from_raw_fd(fd: RawFd) -> Result<TunRing> {
        Ok(TunRing {
            file: FileRing::from_raw_fd(fd)?,
        })
    }

    /// Reads one IP frame into `buf[offset..]`, discarding the device's PI
    /// header (it lands in the headroom and is not counted in the returned
    /// length). A device closed mid-read reports `Closed`, never an I/O
    /// failure.
    pub fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        assert!(
            offset >= PI_LEN,
            "callers must reserve {} bytes of headroom",
            PI_LEN
        );
        let n = self.file.read(&mut buf[offset - PI_LEN..])?;
        Ok(n.saturating_sub(PI_LEN))
    }

    /// Writes the IP frame at `buf[offset..]`, stamping the PI header the
    /// device expects into the headroom first. Returns the frame length.
    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        assert!(
            offset >= PI_LEN && offset <= buf.len(),
            "callers must reserve {} bytes of headroom",
            PI_LEN
        );
        let first = buf.get(offset).cloned().unwrap_or(0);
        buf[offset - PI_LEN..offset].copy_from_slice(&pi_header(first));
        let n = self.file.write(&buf[offset - PI_LEN..])?;
        Ok(n.saturating_sub(PI_LEN))
    }

    pub fn close(&self) {
        self.file.close();
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_closed()
    }
}

/// The PI prefix for a frame whose first payload byte is `first`: the
/// ethertype follows the IP version nibble, everything that is not v6 goes
/// out as v4.
fn pi_header(first: u8) -> [u8; 4] {
    let proto = if first >> 4 == 6 { ETH_P_IPV6 } else { ETH_P_IP };
    let proto = proto.to_be_bytes();
    [0, 0, proto[0], proto[1]]
}
