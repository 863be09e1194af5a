//! Linux TUN device driver.
//!
//! Creates and configures TUN interfaces through device-control requests,
//! the same ioctl surface `ip tuntap`/`ip addr` use underneath. Creation
//! and configuration require an effective UID of 0 (or CAP_NET_ADMIN);
//! callers hold the privilege gate across these calls.

mod ifreq;

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::Arc;

use ipnet::IpNet;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use tokio::io::unix::AsyncFd;
use tracing::debug;

use crate::constants::DEV_NET_TUN;
use crate::error::{Error, Result};
use crate::pump::PacketIo;

pub use ifreq::{Ifreq, IFNAMSIZ};

use ifreq::{ioctl_ifreq, ioctl_int, TUNSETGROUP, TUNSETIFF, TUNSETOWNER};

/// An open TUN interface.
///
/// The descriptor and the async I/O handle refer to the same kernel
/// object; `close` releases it exactly once and a second call errors.
pub struct TunDevice {
    name: String,
    fd: RawFd,
    ifreq: Ifreq,
    closed: bool,
}

impl TunDevice {
    /// Create a TUN device named `name` in no-packet-info mode.
    ///
    /// `mtu`, `uid` and `gid` are applied when above zero. The kernel may
    /// assign a different name than requested (e.g. for `tun%d` patterns);
    /// `name()` reports the canonical one.
    pub fn create(name: &str, mtu: i32, uid: u32, gid: u32) -> Result<TunDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(DEV_NET_TUN)
            .map_err(|e| Error::Device {
                message: format!("open {}: {}", DEV_NET_TUN, e),
            })?;
        let fd = file.into_raw_fd();

        match Self::init(fd, name, mtu, uid, gid) {
            Ok(dev) => Ok(dev),
            Err(e) => {
                let _ = nix::unistd::close(fd);
                Err(e)
            }
        }
    }

    fn init(fd: RawFd, name: &str, mtu: i32, uid: u32, gid: u32) -> Result<TunDevice> {
        let mut ifr = Ifreq::new(name)?;
        ifr.set_uint16((libc::IFF_TUN | libc::IFF_NO_PI) as u16);
        ioctl_ifreq(fd, TUNSETIFF, &mut ifr).map_err(|e| Error::Device {
            message: format!("ioctl TUNSETIFF: {}", e),
        })?;

        let mut dev = TunDevice {
            name: ifr.name(),
            fd,
            ifreq: ifr,
            closed: false,
        };
        debug!(requested = name, actual = %dev.name, fd, "Created TUN device");

        if mtu > 0 {
            dev.set_mtu(mtu)?;
        }
        if uid > 0 {
            ioctl_int(fd, TUNSETOWNER, uid as libc::c_ulong).map_err(|e| Error::Device {
                message: format!("ioctl TUNSETOWNER: {}", e),
            })?;
        }
        if gid > 0 {
            ioctl_int(fd, TUNSETGROUP, gid as libc::c_ulong).map_err(|e| Error::Device {
                message: format!("ioctl TUNSETGROUP: {}", e),
            })?;
        }
        Ok(dev)
    }

    /// The canonical interface name assigned by the kernel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw device descriptor.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Set the interface MTU.
    pub fn set_mtu(&mut self, mtu: i32) -> Result<()> {
        let sock = inet_dgram_socket()?;
        self.ifreq.set_uint32(mtu as u32);
        ioctl_ifreq(sock.as_raw_fd(), libc::SIOCSIFMTU as libc::c_ulong, &mut self.ifreq)
            .map_err(|e| Error::Device {
                message: format!("failed to set MTU of TUN device: {}", e),
            })
    }

    /// Assign the IPv4 address and netmask from `A.B.C.D/N`.
    ///
    /// Idempotent: a later call replaces the previous values.
    pub fn configure_interface(&mut self, cidr: &str) -> Result<()> {
        let (addr, mask) = parse_ipv4_cidr(cidr)?;

        let sock = inet_dgram_socket()?;
        self.ifreq.set_inet4_addr(addr);
        ioctl_ifreq(sock.as_raw_fd(), libc::SIOCSIFADDR as libc::c_ulong, &mut self.ifreq)
            .map_err(|e| Error::Device {
                message: format!("ioctl SIOCSIFADDR: {}", e),
            })?;

        self.ifreq.set_inet4_addr(mask);
        ioctl_ifreq(sock.as_raw_fd(), libc::SIOCSIFNETMASK as libc::c_ulong, &mut self.ifreq)
            .map_err(|e| Error::Device {
                message: format!("ioctl SIOCSIFNETMASK: {}", e),
            })
    }

    /// Enable broadcast and bring the link up and running.
    pub fn link_up(&mut self) -> Result<()> {
        let sock = inet_dgram_socket()?;

        self.ifreq.clear();
        ioctl_ifreq(sock.as_raw_fd(), libc::SIOCGIFFLAGS as libc::c_ulong, &mut self.ifreq)
            .map_err(|e| Error::Device {
                message: format!("ioctl SIOCGIFFLAGS: {}", e),
            })?;

        let flags = self.ifreq.uint16()
            | (libc::IFF_BROADCAST | libc::IFF_UP | libc::IFF_RUNNING) as u16;
        self.ifreq.set_uint16(flags);
        ioctl_ifreq(sock.as_raw_fd(), libc::SIOCSIFFLAGS as libc::c_ulong, &mut self.ifreq)
            .map_err(|e| Error::Device {
                message: format!("ioctl SIOCSIFFLAGS: {}", e),
            })
    }

    /// Release the device. Errors when already closed.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Device {
                message: format!("TUN device {} already closed", self.name),
            });
        }
        self.closed = true;
        nix::unistd::close(self.fd).map_err(|e| Error::Device {
            message: format!("unable to close TUN descriptor {}: {}", self.fd, e),
        })
    }

    /// A cloneable async frame I/O handle onto the device.
    pub fn packet_io(&self) -> Result<TunIo> {
        if self.closed {
            return Err(Error::Device {
                message: format!("TUN device {} already closed", self.name),
            });
        }
        TunIo::new(self.fd)
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        if !self.closed {
            let _ = nix::unistd::close(self.fd);
        }
    }
}

/// Async frame I/O over a TUN descriptor.
///
/// Clones share one reactor registration; the descriptor's lifetime stays
/// with the owning [`TunDevice`].
#[derive(Clone)]
pub struct TunIo {
    inner: Arc<AsyncFd<RawFd>>,
}

impl TunIo {
    fn new(fd: RawFd) -> Result<TunIo> {
        Ok(TunIo {
            inner: Arc::new(AsyncFd::new(fd).map_err(|e| Error::Device {
                message: format!("failed to register TUN fd with reactor: {}", e),
            })?),
        })
    }
}

#[async_trait::async_trait]
impl PacketIo for TunIo {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                let rc = unsafe {
                    libc::read(*inner.get_ref(), buf.as_mut_ptr() as *mut _, buf.len())
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| {
                let rc = unsafe {
                    libc::write(*inner.get_ref(), buf.as_ptr() as *const _, buf.len())
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            }) {
                // TUN writes consume one frame per call; a short count is
                // not retried as the remainder would not form a frame.
                Ok(result) => return result.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }
}

fn inet_dgram_socket() -> Result<std::os::fd::OwnedFd> {
    socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| Error::Device {
        message: format!("failed to open AF_INET socket: {}", e),
    })
}

/// Parse `A.B.C.D/N` into the address and prefix-mask octets.
///
/// Anything that is not a valid IPv4 CIDR is an `invalid address`.
fn parse_ipv4_cidr(cidr: &str) -> Result<([u8; 4], [u8; 4])> {
    let net: IpNet = cidr.parse().map_err(|_| Error::InvalidAddress)?;
    match net {
        IpNet::V4(v4) => Ok((v4.addr().octets(), v4.netmask().octets())),
        IpNet::V6(_) => Err(Error::InvalidAddress),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipv4_cidr_keeps_host_bits() {
        let (addr, mask) = parse_ipv4_cidr("192.168.99.185/29").expect("parse");
        assert_eq!(addr, [192, 168, 99, 185]);
        assert_eq!(mask, [255, 255, 255, 248]);
    }

    #[test]
    fn parse_ipv4_cidr_rejects_out_of_range_octet() {
        let err = parse_ipv4_cidr("192.168.99.256/29").expect_err("must fail");
        assert!(matches!(err, Error::InvalidAddress));
    }

    #[test]
    fn parse_ipv4_cidr_rejects_ipv6_and_garbage() {
        assert!(matches!(
            parse_ipv4_cidr("fd00::1/64").expect_err("v6"),
            Error::InvalidAddress
        ));
        assert!(matches!(
            parse_ipv4_cidr("not-a-network").expect_err("garbage"),
            Error::InvalidAddress
        ));
        assert!(matches!(
            parse_ipv4_cidr("10.0.0.1").expect_err("missing prefix"),
            Error::InvalidAddress
        ));
    }

    #[test]
    fn create_rejects_overlong_name() {
        let err = TunDevice::create("interface-name-way-too-long", 0, 0, 0).expect_err("must fail");
        assert!(matches!(err, Error::Device { .. }));
    }

    // Device tests below need CAP_NET_ADMIN; run with
    // `sudo -E cargo test -- --ignored`.

    #[test]
    #[ignore = "requires root privileges"]
    fn create_configure_and_close_once() {
        let mut dev = TunDevice::create("unittest", 1500, 0, 0).expect("create");
        assert!(!dev.name().is_empty());
        assert!(dev.raw_fd() > 0);
        dev.configure_interface("192.168.99.185/29").expect("configure");
        dev.link_up().expect("link up");
        dev.close().expect("first close");
        assert!(dev.close().is_err(), "second close must fail");
    }
}
