//! Thin wrappers over the socket syscalls std does not expose.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Socket type used for control connections.
///
/// `SOCK_SEQPACKET` keeps message boundaries and ordering on a connected
/// socket. Platforms without it for `AF_UNIX` fall back to a datagram pair,
/// which is reliable and ordered for local sockets.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub(crate) const PACKET_KIND: libc::c_int = libc::SOCK_SEQPACKET;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub(crate) const PACKET_KIND: libc::c_int = libc::SOCK_DGRAM;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const CLOEXEC_FLAG: libc::c_int = libc::SOCK_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const CLOEXEC_FLAG: libc::c_int = 0;

/// Create a connected pair of `AF_UNIX` sockets of the given type.
pub(crate) fn socketpair(kind: libc::c_int) -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    // SAFETY: `fds` is a valid two-element buffer for socketpair to fill.
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, kind | CLOEXEC_FLAG, 0, fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: on success both descriptors are open and owned by nobody else.
    let (a, b) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    if CLOEXEC_FLAG == 0 {
        set_cloexec(a.as_raw_fd())?;
        set_cloexec(b.as_raw_fd())?;
    }
    Ok((a, b))
}

/// Create an unbound `AF_UNIX` socket of the given type.
pub(crate) fn socket(kind: libc::c_int) -> io::Result<OwnedFd> {
    // SAFETY: socket(2) takes no pointers.
    let fd = unsafe { libc::socket(libc::AF_UNIX, kind | CLOEXEC_FLAG, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the descriptor was just returned by socket(2).
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    if CLOEXEC_FLAG == 0 {
        set_cloexec(owned.as_raw_fd())?;
    }
    Ok(owned)
}

/// Mark a descriptor close-on-exec.
pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFD takes no pointer argument.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: F_SETFD takes an integer flag argument.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Returns true if `fd` is open and refers to a socket.
pub(crate) fn is_socket(fd: RawFd) -> bool {
    // SAFETY: an all-zero `stat` is a valid value for fstat to overwrite.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: `st` is a valid out-pointer; fstat fails cleanly on a closed fd.
    let rc = unsafe { libc::fstat(fd, &mut st) };
    rc == 0 && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// shutdown(2) on a raw socket descriptor.
pub(crate) fn shutdown(fd: RawFd, how: libc::c_int) -> io::Result<()> {
    // SAFETY: shutdown(2) takes no pointers; a bad fd yields an error.
    if unsafe { libc::shutdown(fd, how) } < 0 {
        let err = io::Error::last_os_error();
        // Already disconnected by the peer.
        if err.raw_os_error() == Some(libc::ENOTCONN) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}
