use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::conn::{Conn, ConnConfig};
use crate::error::{Result, TransportError};
use crate::sys;

/// Pending-connection backlog passed to listen(2).
const LISTEN_BACKLOG: libc::c_int = 128;

/// Maximum socket path length.
/// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

/// Filesystem-path listener for packet-mode Unix domain sockets.
///
/// Every accepted connection is a [`Conn`] ready to carry messages with
/// attached descriptors. The socket file is removed on drop, unless the path
/// has since been replaced by something else.
pub struct UnixSeqpacketListener {
    fd: OwnedFd,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
    /// Whether the path should be removed on drop.
    cleanup_on_drop: bool,
    config: ConnConfig,
}

impl UnixSeqpacketListener {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    /// Bind and listen on a filesystem path.
    ///
    /// If the path already exists and is a socket, it is removed first
    /// (stale socket cleanup).
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bind_err = |source: io::Error| TransportError::Bind {
            path: path.clone(),
            source,
        };

        let addr = SocketAddr::new(&path)?;

        // Remove stale socket if it exists, but never remove non-socket files.
        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(bind_err)?;
            } else {
                return Err(bind_err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
        }

        let fd = sys::socket(libc::SOCK_SEQPACKET).map_err(bind_err)?;
        // SAFETY: `addr` holds an initialized sockaddr_un of the given length.
        let rc = unsafe { libc::bind(fd.as_raw_fd(), addr.as_ptr(), addr.len) };
        if rc < 0 {
            return Err(bind_err(io::Error::last_os_error()));
        }
        // SAFETY: listen(2) takes no pointers.
        if unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) } < 0 {
            return Err(bind_err(io::Error::last_os_error()));
        }

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let created_metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;
        let created_inode = Some((created_metadata.dev(), created_metadata.ino()));

        info!(?path, "listening on unix seqpacket socket");

        Ok(Self {
            fd,
            path,
            created_inode,
            cleanup_on_drop: true,
            config: ConnConfig::default(),
        })
    }

    /// Override the configuration handed to accepted connections.
    pub fn with_config(mut self, config: ConnConfig) -> Self {
        self.config = config;
        self
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<Conn> {
        loop {
            // SAFETY: null address pointers are allowed when the peer address is unwanted.
            let fd = unsafe {
                libc::accept(
                    self.fd.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(TransportError::Accept(err));
            }
            // SAFETY: accept(2) just returned this descriptor to us.
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
            sys::set_cloexec(owned.as_raw_fd()).map_err(TransportError::Accept)?;
            debug!(fd, "accepted connection");
            return Ok(Conn::from_owned_fd(owned, self.config.clone()));
        }
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "unix-seqpacket"
    }
}

impl Drop for UnixSeqpacketListener {
    fn drop(&mut self) {
        if self.cleanup_on_drop {
            if let Some((expected_dev, expected_ino)) = self.created_inode {
                if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
                    if metadata.file_type().is_socket()
                        && metadata.dev() == expected_dev
                        && metadata.ino() == expected_ino
                    {
                        debug!(path = ?self.path, "cleaning up socket file");
                        let _ = std::fs::remove_file(&self.path);
                    } else {
                        debug!(
                            path = ?self.path,
                            "socket path identity changed; skipping cleanup"
                        );
                    }
                }
            }
        }
    }
}

/// Connect to a listening packet socket (blocking).
pub fn connect(path: impl AsRef<Path>) -> Result<Conn> {
    connect_with_config(path, ConnConfig::default())
}

/// Connect with explicit connection configuration.
pub fn connect_with_config(path: impl AsRef<Path>, config: ConnConfig) -> Result<Conn> {
    let path = path.as_ref();
    let connect_err = |source: io::Error| TransportError::Connect {
        path: path.to_path_buf(),
        source,
    };
    let addr = SocketAddr::new(path)?;
    let fd = sys::socket(libc::SOCK_SEQPACKET).map_err(connect_err)?;
    loop {
        // SAFETY: `addr` holds an initialized sockaddr_un of the given length.
        let rc = unsafe { libc::connect(fd.as_raw_fd(), addr.as_ptr(), addr.len) };
        if rc == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(connect_err(err));
        }
    }
    debug!(?path, "connected to unix seqpacket socket");
    Ok(Conn::from_owned_fd(fd, config))
}

struct SocketAddr {
    addr: libc::sockaddr_un,
    len: libc::socklen_t,
}

impl SocketAddr {
    fn new(path: &Path) -> Result<Self> {
        let bytes = path.as_os_str().as_bytes();
        if bytes.len() >= MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path: path.to_path_buf(),
                len: bytes.len(),
                max: MAX_PATH_LEN,
            });
        }

        // SAFETY: an all-zero sockaddr_un is valid; sun_path stays NUL-terminated.
        let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        let len = mem::offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1;
        Ok(Self {
            addr,
            len: len as libc::socklen_t,
        })
    }

    fn as_ptr(&self) -> *const libc::sockaddr {
        (&self.addr as *const libc::sockaddr_un).cast()
    }
}
