use std::io;
use std::mem;
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::sys;

/// Descriptor number a freshly forked child finds its control connection on.
pub const INHERITED_FD: RawFd = 3;

/// Environment variable overriding [`INHERITED_FD`].
pub const INHERITED_FD_ENV: &str = "BEAM_FD";

/// Default maximum payload size for one message: 64 KiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Default number of descriptors kept per received message.
///
/// One data endpoint plus one optional metadata endpoint.
pub const DEFAULT_MAX_DESCRIPTORS: usize = 2;

/// Room reserved in the control buffer so excess descriptors can be
/// received (and closed) instead of silently dropped by the kernel.
const RECV_DESCRIPTOR_CAPACITY: usize = 16;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

static INHERITED_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Configuration for a control connection.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Largest payload accepted by `receive`. Larger messages are flagged truncated.
    pub max_payload_size: usize,
    /// Descriptors kept per message; extras are closed on receipt and refused on send.
    pub max_descriptors: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_descriptors: DEFAULT_MAX_DESCRIPTORS,
        }
    }
}

/// One message read off a [`Conn`].
#[derive(Debug)]
pub struct RawMessage {
    /// The payload bytes (possibly cut short, see `truncated`).
    pub payload: Bytes,
    /// Descriptors that rode along as ancillary data, in send order.
    pub fds: Vec<OwnedFd>,
    /// The payload did not fit the receive buffer.
    pub truncated: bool,
}

/// A connected control socket that carries payloads plus descriptors.
///
/// All methods take `&self`, so one thread may block in [`Conn::receive`]
/// while another sends.
pub struct Conn {
    sock: UnixStream,
    config: ConnConfig,
}

impl Conn {
    /// Create a connected pair (functionally a private control channel).
    pub fn pair() -> Result<(Self, Self)> {
        Self::pair_with_config(ConnConfig::default())
    }

    /// Create a connected pair with explicit configuration for both ends.
    pub fn pair_with_config(config: ConnConfig) -> Result<(Self, Self)> {
        let (a, b) = sys::socketpair(sys::PACKET_KIND)?;
        debug!(a = a.as_raw_fd(), b = b.as_raw_fd(), "created control socket pair");
        Ok((
            Self::from_owned_fd(a, config.clone()),
            Self::from_owned_fd(b, config),
        ))
    }

    /// Wrap an already-connected packet socket.
    pub fn from_owned_fd(fd: OwnedFd, config: ConnConfig) -> Self {
        Self {
            sock: UnixStream::from(fd),
            config,
        }
    }

    /// Claim the control connection inherited from the parent process.
    ///
    /// Uses descriptor [`INHERITED_FD`] unless `BEAM_FD` names another one.
    /// The descriptor must be an open socket, and it can be claimed at most
    /// once per process.
    pub fn inherited() -> Result<Self> {
        let fd = std::env::var(INHERITED_FD_ENV)
            .ok()
            .and_then(|value| value.trim().parse::<RawFd>().ok())
            .unwrap_or(INHERITED_FD);
        Self::claim_inherited(fd)
    }

    fn claim_inherited(fd: RawFd) -> Result<Self> {
        if !sys::is_socket(fd) {
            return Err(TransportError::NotASocket(fd));
        }
        if INHERITED_CLAIMED.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyClaimed(fd));
        }
        sys::set_cloexec(fd)?;
        // SAFETY: fstat proved the descriptor is an open socket, and the claim
        // flag guarantees this is the only owner created for it.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        debug!(fd, "claimed inherited control connection");
        Ok(Self::from_owned_fd(owned, ConnConfig::default()))
    }

    /// Current configuration.
    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    /// Send one message: `payload` plus `fds` as ancillary data.
    ///
    /// The descriptors are duplicated into the peer; the caller keeps (and
    /// should close) its own copies.
    pub fn send(&self, payload: &[u8], fds: &[BorrowedFd<'_>]) -> Result<()> {
        if payload.is_empty() {
            // A zero-length packet is indistinguishable from peer shutdown.
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty payload",
            )));
        }
        if fds.len() > self.config.max_descriptors {
            return Err(TransportError::TooManyDescriptors {
                count: fds.len(),
                max: self.config.max_descriptors,
            });
        }

        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let fd_bytes = mem::size_of_val(fds);
        // SAFETY: CMSG_SPACE is a pure size computation.
        let space = unsafe { libc::CMSG_SPACE(fd_bytes as libc::c_uint) } as usize;
        // u64 storage keeps the control buffer aligned for cmsghdr.
        let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

        // SAFETY: an all-zero msghdr is a valid empty header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if !fds.is_empty() {
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = space as _;
            // SAFETY: msg_control points at `space` writable bytes, enough for one
            // cmsghdr carrying `fds.len()` descriptors.
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as libc::c_uint) as _;
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for (i, fd) in fds.iter().enumerate() {
                    data.add(i).write_unaligned(fd.as_raw_fd());
                }
            }
        }

        loop {
            // SAFETY: `msg` and everything it points at outlive the call.
            let rc = unsafe { libc::sendmsg(self.sock.as_raw_fd(), &msg, SEND_FLAGS) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(TransportError::Io(err));
            }
            if (rc as usize) < payload.len() {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short packet write ({rc} of {} bytes)", payload.len()),
                )));
            }
            return Ok(());
        }
    }

    /// Receive the next message (blocking).
    ///
    /// Returns `Err(TransportError::Shutdown)` once the peer has closed.
    /// Descriptors beyond `max_descriptors` are closed before returning.
    pub fn receive(&self) -> Result<RawMessage> {
        let mut buf = vec![0u8; self.config.max_payload_size.max(1)];
        let fd_bytes = RECV_DESCRIPTOR_CAPACITY * mem::size_of::<RawFd>();
        // SAFETY: CMSG_SPACE is a pure size computation.
        let space = unsafe { libc::CMSG_SPACE(fd_bytes as libc::c_uint) } as usize;
        let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

        loop {
            let mut iov = libc::iovec {
                iov_base: buf.as_mut_ptr().cast(),
                iov_len: buf.len(),
            };
            // SAFETY: an all-zero msghdr is a valid empty header.
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = space as _;

            // SAFETY: `msg` describes buffers that stay alive for the call.
            let rc = unsafe { libc::recvmsg(self.sock.as_raw_fd(), &mut msg, RECV_FLAGS) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(TransportError::Io(err));
            }

            // SAFETY: recvmsg filled the control buffer described by `msg`.
            let mut fds = unsafe { take_descriptors(&msg) };
            let received = rc as usize;
            let truncated = msg.msg_flags & libc::MSG_TRUNC != 0;

            if received == 0 && fds.is_empty() && !truncated {
                debug!("control connection closed by peer");
                return Err(TransportError::Shutdown);
            }
            if msg.msg_flags & libc::MSG_CTRUNC != 0 {
                warn!("ancillary data truncated; some descriptors were dropped by the kernel");
            }
            if RECV_FLAGS == 0 {
                for fd in &fds {
                    sys::set_cloexec(fd.as_raw_fd())?;
                }
            }
            if fds.len() > self.config.max_descriptors {
                let excess = fds.split_off(self.config.max_descriptors);
                debug!(count = excess.len(), "closing excess descriptors");
                drop(excess);
            }

            buf.truncate(received.min(buf.len()));
            return Ok(RawMessage {
                payload: Bytes::from(buf),
                fds,
                truncated,
            });
        }
    }

    /// Shut down both directions, unblocking any thread in `send` or `receive`.
    pub fn shutdown(&self) -> Result<()> {
        match self.sock.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Get the credentials of the connected peer (Linux only).
    ///
    /// Returns `(uid, gid, pid)` via `SO_PEERCRED`, or `None` if unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and the descriptor is an open Unix socket owned by this connection.
        let rc = unsafe {
            libc::getsockopt(
                self.sock.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Get the credentials of the connected peer.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

impl AsFd for Conn {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("fd", &self.sock.as_raw_fd())
            .field("config", &self.config)
            .finish()
    }
}

/// Collect every `SCM_RIGHTS` descriptor from a received header.
///
/// # Safety
///
/// `msg` must be a header just filled in by a successful `recvmsg`.
unsafe fn take_descriptors(msg: &libc::msghdr) -> Vec<OwnedFd> {
    let mut fds = Vec::new();
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        let hdr = &*cmsg;
        if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_RIGHTS {
            let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
            let data_len = (hdr.cmsg_len as usize).saturating_sub(libc::CMSG_LEN(0) as usize);
            for i in 0..data_len / mem::size_of::<RawFd>() {
                // The kernel installed these descriptors for us alone.
                fds.push(OwnedFd::from_raw_fd(data.add(i).read_unaligned()));
            }
        }
        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }
    fds
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::time::Duration;

    use super::*;

    #[test]
    fn send_receive_payload_and_descriptor() {
        let (left, right) = Conn::pair().unwrap();
        let (ours, theirs) = UnixStream::pair().unwrap();

        left.send(b"id=1\n", &[theirs.as_fd()]).unwrap();
        drop(theirs);

        let msg = right.receive().unwrap();
        assert_eq!(msg.payload.as_ref(), b"id=1\n");
        assert_eq!(msg.fds.len(), 1);
        assert!(!msg.truncated);

        let mut received = UnixStream::from(msg.fds.into_iter().next().unwrap());
        received.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        let mut ours = ours;
        ours.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn message_boundaries_are_preserved() {
        let (left, right) = Conn::pair().unwrap();
        left.send(b"first", &[]).unwrap();
        left.send(b"second", &[]).unwrap();

        assert_eq!(right.receive().unwrap().payload.as_ref(), b"first");
        assert_eq!(right.receive().unwrap().payload.as_ref(), b"second");
    }

    #[test]
    fn excess_descriptors_are_closed() {
        let sender_cfg = ConnConfig {
            max_descriptors: 4,
            ..ConnConfig::default()
        };
        let receiver_cfg = ConnConfig {
            max_descriptors: 1,
            ..ConnConfig::default()
        };
        let (a, b) = sys::socketpair(sys::PACKET_KIND).unwrap();
        let left = Conn::from_owned_fd(a, sender_cfg);
        let right = Conn::from_owned_fd(b, receiver_cfg);

        let (attached, mut watcher) = UnixStream::pair().unwrap();
        left.send(
            b"x",
            &[attached.as_fd(), attached.as_fd(), attached.as_fd()],
        )
        .unwrap();
        drop(attached);

        let msg = right.receive().unwrap();
        assert_eq!(msg.fds.len(), 1);
        drop(msg);

        // Every copy of the peer end is closed now, so the watcher sees EOF.
        watcher
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(watcher.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn too_many_descriptors_rejected_on_send() {
        let (left, _right) = Conn::pair().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let err = left
            .send(b"x", &[a.as_fd(), a.as_fd(), a.as_fd()])
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::TooManyDescriptors { count: 3, max: 2 }
        ));
    }

    #[test]
    fn empty_payload_rejected() {
        let (left, _right) = Conn::pair().unwrap();
        let err = left.send(b"", &[]).unwrap_err();
        assert!(matches!(err, TransportError::Io(e) if e.kind() == io::ErrorKind::InvalidInput));
    }

    #[test]
    fn oversized_payload_is_flagged_truncated() {
        let cfg = ConnConfig {
            max_payload_size: 8,
            ..ConnConfig::default()
        };
        let (a, b) = sys::socketpair(sys::PACKET_KIND).unwrap();
        let left = Conn::from_owned_fd(a, ConnConfig::default());
        let right = Conn::from_owned_fd(b, cfg);

        left.send(&[0xAB; 32], &[]).unwrap();
        let msg = right.receive().unwrap();
        assert!(msg.truncated);
        assert_eq!(msg.payload.len(), 8);
    }

    #[test]
    fn peer_close_reports_shutdown() {
        let (left, right) = Conn::pair().unwrap();
        drop(left);
        let err = right.receive().unwrap_err();
        assert!(err.is_shutdown());
    }

    #[test]
    fn shutdown_unblocks_receiver() {
        let (left, right) = Conn::pair().unwrap();
        let right = std::sync::Arc::new(right);
        let blocked = {
            let right = std::sync::Arc::clone(&right);
            std::thread::spawn(move || right.receive())
        };
        std::thread::sleep(Duration::from_millis(50));
        right.shutdown().unwrap();

        let result = blocked.join().unwrap();
        assert!(result.is_err());
        drop(left);
    }

    #[test]
    fn inherited_rejects_non_socket() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let err = Conn::claim_inherited(file.as_raw_fd()).unwrap_err();
        assert!(matches!(err, TransportError::NotASocket(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn peer_credentials_report_own_process() {
        let (left, _right) = Conn::pair().unwrap();
        let (_, _, pid) = left.peer_credentials().unwrap();
        assert_eq!(pid, std::process::id());
    }
}
