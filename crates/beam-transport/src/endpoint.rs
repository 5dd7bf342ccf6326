use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::error::Result;
use crate::sys;

/// A descriptor used as a byte-oriented duplex endpoint.
///
/// Usually one end of a stream socket pair, but any descriptor received from
/// a peer (pipe, file, socket) can be wrapped. Reads and writes go straight to
/// the descriptor, so `&Endpoint` is usable from several threads at once.
pub struct Endpoint {
    file: File,
}

impl Endpoint {
    /// Create a connected pair of stream endpoints.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from(OwnedFd::from(a)), Self::from(OwnedFd::from(b))))
    }

    /// Half-close: the peer reads EOF, but this side can still read.
    ///
    /// Fails with `ENOTSOCK` for descriptors that are not sockets.
    pub fn shutdown_write(&self) -> Result<()> {
        sys::shutdown(self.file.as_raw_fd(), libc::SHUT_WR)?;
        Ok(())
    }

    /// Shut down both directions, waking any thread blocked on this socket.
    pub fn shutdown(&self) -> Result<()> {
        sys::shutdown(self.file.as_raw_fd(), libc::SHUT_RDWR)?;
        Ok(())
    }

    /// Duplicate the underlying descriptor.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            file: self.file.try_clone()?,
        })
    }

    /// Give up the wrapper and return the owned descriptor.
    pub fn into_owned_fd(self) -> OwnedFd {
        OwnedFd::from(self.file)
    }

    /// Raw descriptor number, for diagnostics.
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl From<OwnedFd> for Endpoint {
    fn from(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }
}

impl Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for &Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }
}

impl Write for &Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("fd", &self.file.as_raw_fd())
            .finish()
    }
}
