/*!
 * Serial port transport
 *
 * Boards enumerate as USB serial adapters. The port runs raw 8N1 at
 * 115200 baud; reads time out after 100 ms so workers can poll the
 * shutdown flag between frames.
 */

use std::fs::File;
use std::io::{self, Read, Write};

use crate::device::Device;
use crate::error::{DriverError, Result};

pub const BAUD_RATE: u32 = 115_200;

/// A board behind a serial port
pub struct UartDevice {
    file: File,
    path: String,
}

impl UartDevice {
    #[cfg(unix)]
    pub fn open(path: &str) -> Result<Self> {
        use std::fs::OpenOptions;
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::io::AsRawFd;
        use tracing::warn;

        let open_error = |source: io::Error| DriverError::DeviceOpen {
            path: path.to_string(),
            source,
        };

        // Non-blocking open so a missing carrier does not hang us
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .map_err(open_error)?;
        let fd = file.as_raw_fd();

        unsafe {
            if libc::fcntl(fd, libc::F_SETFL, libc::O_RDWR) < 0 {
                return Err(open_error(io::Error::last_os_error()));
            }

            let mut tp: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut tp) < 0 {
                warn!("tcgetattr({}): {}", path, io::Error::last_os_error());
            }

            libc::cfmakeraw(&mut tp);
            libc::cfsetspeed(&mut tp, libc::B115200);
            tp.c_cc[libc::VMIN] = 0;
            tp.c_cc[libc::VTIME] = 1;

            if libc::tcsetattr(fd, libc::TCSANOW, &tp) < 0 {
                warn!("tcsetattr({}): {}", path, io::Error::last_os_error());
            }
            if libc::tcflush(fd, libc::TCIOFLUSH) < 0 {
                warn!("tcflush({}): {}", path, io::Error::last_os_error());
            }
        }

        Ok(Self {
            file,
            path: path.to_string(),
        })
    }

    #[cfg(not(unix))]
    pub fn open(path: &str) -> Result<Self> {
        Err(DriverError::DeviceOpen {
            path: path.to_string(),
            source: io::Error::new(
                io::ErrorKind::Unsupported,
                "serial ports are only supported on unix",
            ),
        })
    }
}

impl Device for UartDevice {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    #[cfg(unix)]
    fn flush(&mut self) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        if unsafe { libc::tcflush(self.file.as_raw_fd(), libc::TCIOFLUSH) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, BAUD_RATE)
    }
}
