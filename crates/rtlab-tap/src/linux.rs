//! TAP devices of the Linux kernel.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use log::debug;

use crate::backend::{FrameSink, FrameSource, TapBackend, TapPair};

const TUN_PATH: &str = "/dev/net/tun";
const IFF_TAP: i16 = 0x0002;
const IFF_NO_PI: i16 = 0x1000;
const TUNSETIFF: u64 = 0x400454ca;
const MAX_FRAME: usize = 65536;

#[repr(C)]
struct IfReqTap {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: i16,
    // struct ifreq is 40 bytes long
    _pad: [u8; 22],
}

/// Backend creating (or attaching to existing) kernel TAP devices through `/dev/net/tun`.
///
/// Frames carry no packet information header. Bringing the device up and adding it to a bridge
/// is left to the host configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxTapBackend;

impl LinuxTapBackend {
    /// Creates the backend.
    pub fn new() -> Self {
        Self
    }
}

impl TapBackend for LinuxTapBackend {
    fn open(&self, name: &str) -> io::Result<TapPair> {
        let name_bytes = name.as_bytes();
        if name_bytes.is_empty() || name_bytes.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface name '{}'", name),
            ));
        }
        let file = OpenOptions::new().read(true).write(true).open(TUN_PATH)?;
        let mut req = IfReqTap {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        req.ifr_name[..name_bytes.len()].copy_from_slice(name_bytes);

        // SAFETY: valid descriptor and a properly sized ifreq structure.
        let res = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReqTap) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        debug!(target: "tap", "Attached to TAP device {}", name);

        let writer = file.try_clone()?;
        Ok(TapPair {
            source: Box::new(TapReader {
                file,
                buf: vec![0; MAX_FRAME],
            }),
            sink: Box::new(TapWriter { file: writer }),
        })
    }
}

struct TapReader {
    file: File,
    buf: Vec<u8>,
}

impl FrameSource for TapReader {
    fn receive(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let mut fds = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        // SAFETY: single valid pollfd.
        let ready = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(err);
        }
        if ready == 0 {
            return Ok(None);
        }
        let n = self.file.read(&mut self.buf)?;
        Ok(Some(self.buf[..n].to_vec()))
    }
}

struct TapWriter {
    file: File,
}

impl FrameSink for TapWriter {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        // a tap write consumes exactly one frame
        let n = self.file.write(frame)?;
        if n != frame.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "partial frame write"));
        }
        Ok(())
    }
}
