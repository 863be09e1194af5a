//! Raw `struct ifreq` plumbing for TUN device-control requests.
//!
//! The kernel's ifreq carries an interface name and a union of request
//! payloads. The union is modeled as a byte scratch with typed accessors;
//! it is zeroed before every write of a different shape so stale bytes
//! from a previous request never reach the kernel.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// Kernel interface-name size, including the trailing NUL.
pub const IFNAMSIZ: usize = 16;

/// Size of the ifreq union payload.
const IFRU_SIZE: usize = 24;

// TUN ioctl request numbers (linux/if_tun.h); not exported by libc.
pub const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
pub const TUNSETOWNER: libc::c_ulong = 0x4004_54cc;
pub const TUNSETGROUP: libc::c_ulong = 0x4004_54ce;

/// Interface-request scratch buffer reused across device-control calls.
#[repr(C)]
#[derive(Clone)]
pub struct Ifreq {
    ifrn: [u8; IFNAMSIZ],
    ifru: [u8; IFRU_SIZE],
}

impl Ifreq {
    /// Build an ifreq for `name`, rejecting names that do not leave room
    /// for the terminating NUL.
    pub fn new(name: &str) -> Result<Ifreq> {
        let bytes = name.as_bytes();
        if bytes.len() >= IFNAMSIZ || bytes.contains(&0) {
            return Err(Error::Device {
                message: format!("invalid interface name {:?}", name),
            });
        }
        let mut ifr = Ifreq {
            ifrn: [0; IFNAMSIZ],
            ifru: [0; IFRU_SIZE],
        };
        ifr.ifrn[..bytes.len()].copy_from_slice(bytes);
        Ok(ifr)
    }

    /// The interface name currently stored, NUL-terminated.
    pub fn name(&self) -> String {
        let end = self.ifrn.iter().position(|b| *b == 0).unwrap_or(IFNAMSIZ);
        String::from_utf8_lossy(&self.ifrn[..end]).into_owned()
    }

    /// Zero the union payload.
    pub fn clear(&mut self) {
        self.ifru = [0; IFRU_SIZE];
    }

    /// Read the union as a C short (interface flags).
    pub fn uint16(&self) -> u16 {
        u16::from_ne_bytes([self.ifru[0], self.ifru[1]])
    }

    /// Store a C short (interface flags) in the union.
    pub fn set_uint16(&mut self, v: u16) {
        self.clear();
        self.ifru[..2].copy_from_slice(&v.to_ne_bytes());
    }

    /// Store a C int (MTU, metric, ifindex) in the union.
    pub fn set_uint32(&mut self, v: u32) {
        self.clear();
        self.ifru[..4].copy_from_slice(&v.to_ne_bytes());
    }

    /// Store an AF_INET sockaddr holding `octets` in the union.
    pub fn set_inet4_addr(&mut self, octets: [u8; 4]) {
        self.clear();
        let family = (libc::AF_INET as u16).to_ne_bytes();
        self.ifru[..2].copy_from_slice(&family);
        // sin_port stays zero; sin_addr starts at offset 4.
        self.ifru[4..8].copy_from_slice(&octets);
    }
}

/// Issue an ioctl carrying an ifreq for input and/or output.
pub fn ioctl_ifreq(fd: RawFd, request: libc::c_ulong, ifr: &mut Ifreq) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(fd, request as _, ifr as *mut Ifreq) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Issue an ioctl carrying a plain integer argument (owner/group requests).
pub fn ioctl_int(fd: RawFd, request: libc::c_ulong, arg: libc::c_ulong) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(fd, request as _, arg) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trips() {
        let ifr = Ifreq::new("tun0").expect("ifreq");
        assert_eq!(ifr.name(), "tun0");
    }

    #[test]
    fn name_at_limit_is_rejected() {
        // 15 bytes fit (room for the NUL), 16 do not.
        assert!(Ifreq::new("abcdefghijklmno").is_ok());
        assert!(Ifreq::new("abcdefghijklmnop").is_err());
        assert!(Ifreq::new("bad\0name").is_err());
    }

    #[test]
    fn set_uint16_clears_previous_payload() {
        let mut ifr = Ifreq::new("tun0").expect("ifreq");
        ifr.set_uint32(0xdead_beef);
        ifr.set_uint16(0x0001);
        assert_eq!(ifr.uint16(), 0x0001);
        // Bytes beyond the short must have been zeroed.
        assert!(ifr.ifru[2..].iter().all(|b| *b == 0));
    }

    #[test]
    fn inet4_addr_layout() {
        let mut ifr = Ifreq::new("tun0").expect("ifreq");
        ifr.set_inet4_addr([192, 168, 99, 185]);
        let family = u16::from_ne_bytes([ifr.ifru[0], ifr.ifru[1]]);
        assert_eq!(family, libc::AF_INET as u16);
        assert_eq!(&ifr.ifru[2..4], &[0, 0], "sin_port must be zero");
        assert_eq!(&ifr.ifru[4..8], &[192, 168, 99, 185]);
    }
}
