use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use beam_data::Msg;
use beam_transport::Endpoint;

use crate::error::{Result, SessionError};
use crate::session::{Session, Shared};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One logical sub-channel of a [`Session`].
///
/// Cloning is cheap and yields another handle to the same stream. A stream
/// starts unregistered (id 0); it is registered when sent, or when the
/// session materializes it from an inbound frame. Once registered, its
/// identifier and headers no longer change.
///
/// Bytes are exchanged through the local endpoint with [`Read`] and
/// [`Write`], implemented for both `Stream` and `&Stream`.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    session: Weak<Shared>,
    id: AtomicU32,
    parent: Option<Weak<StreamInner>>,
    parent_id: AtomicU32,
    header: Mutex<Msg>,
    // Set by the first send; locks the header.
    claimed: AtomicBool,
    closed: AtomicBool,
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    metadata: Mutex<Option<Arc<Endpoint>>>,
    // Descriptor to transmit instead of a fresh socket pair.
    file: Mutex<Option<OwnedFd>>,
}

impl Stream {
    pub(crate) fn outbound(session: Weak<Shared>, parent: Option<&Stream>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                session,
                id: AtomicU32::new(0),
                parent: parent.map(|p| Arc::downgrade(&p.inner)),
                parent_id: AtomicU32::new(0),
                header: Mutex::new(Msg::new()),
                claimed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                endpoint: Mutex::new(None),
                metadata: Mutex::new(None),
                file: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn inbound(
        session: Weak<Shared>,
        id: u32,
        parent: Option<&Stream>,
        header: Msg,
        endpoint: Endpoint,
        metadata: Option<Endpoint>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                session,
                id: AtomicU32::new(id),
                parent: parent.map(|p| Arc::downgrade(&p.inner)),
                parent_id: AtomicU32::new(parent.map_or(0, Stream::id)),
                header: Mutex::new(header),
                claimed: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                endpoint: Mutex::new(Some(Arc::new(endpoint))),
                metadata: Mutex::new(metadata.map(Arc::new)),
                file: Mutex::new(None),
            }),
        }
    }

    /// Session-assigned identifier, 0 until registered.
    pub fn id(&self) -> u32 {
        self.inner.id.load(Ordering::Acquire)
    }

    pub fn is_registered(&self) -> bool {
        self.id() != 0
    }

    /// Identifier of the parent stream, if this stream has one.
    pub fn parent_id(&self) -> Option<u32> {
        self.inner.parent.as_ref()?;
        match self.inner.parent_id.load(Ordering::Acquire) {
            0 => self.parent().map(|p| p.id()).filter(|id| *id != 0),
            id => Some(id),
        }
    }

    /// The parent stream, while it is still alive.
    pub fn parent(&self) -> Option<Stream> {
        let inner = self.inner.parent.as_ref()?.upgrade()?;
        Some(Stream { inner })
    }

    pub(crate) fn has_parent(&self) -> bool {
        self.inner.parent.is_some()
    }

    /// A copy of the application headers.
    pub fn header(&self) -> Msg {
        lock(&self.inner.header).clone()
    }

    pub(crate) fn with_header<R>(&self, f: impl FnOnce(&Msg) -> R) -> R {
        f(&lock(&self.inner.header))
    }

    /// Replace all values of a header. A header left with no values is not
    /// transmitted.
    pub fn set_header<I, V>(&self, key: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        self.update_header(|h| h.set_all(key, values))
    }

    /// Append one header value.
    pub fn add_header(&self, key: &str, value: impl AsRef<[u8]>) -> Result<()> {
        self.update_header(|h| h.add(key, value))
    }

    /// Shorthand for setting the `name` header.
    pub fn set_name(&self, name: &str) -> Result<()> {
        self.update_header(|h| h.set("name", name))
    }

    fn update_header(&self, f: impl FnOnce(&mut Msg)) -> Result<()> {
        let mut header = lock(&self.inner.header);
        if self.inner.claimed.load(Ordering::Acquire) {
            return Err(SessionError::HeaderLocked);
        }
        f(&mut header);
        Ok(())
    }

    /// Transmit `fd` to the peer instead of a fresh socket pair.
    ///
    /// The stream then has no local endpoint on this side.
    pub fn set_file(&self, fd: OwnedFd) -> Result<()> {
        if self.inner.claimed.load(Ordering::Acquire) {
            return Err(SessionError::AlreadyRegistered);
        }
        *lock(&self.inner.file) = Some(fd);
        Ok(())
    }

    /// Create an unregistered child of this stream in the same session.
    pub fn new_child(&self) -> Result<Stream> {
        let session = self.session()?;
        Ok(session.new_stream(Some(self)))
    }

    /// Register and announce this stream to the peer.
    pub fn send(&self) -> Result<()> {
        self.session()?.send(self)
    }

    fn session(&self) -> Result<Session> {
        self.inner
            .session
            .upgrade()
            .map(Session::from_shared)
            .ok_or(SessionError::Closed)
    }

    pub(crate) fn belongs_to(&self, shared: &Arc<Shared>) -> bool {
        std::ptr::eq(self.inner.session.as_ptr(), Arc::as_ptr(shared))
    }

    /// Take the send claim. Fails if the stream was already sent.
    pub(crate) fn claim(&self) -> Result<()> {
        // Hold the header lock so a concurrent mutation can't slip past the claim.
        let _header = lock(&self.inner.header);
        if self.inner.claimed.swap(true, Ordering::AcqRel) {
            return Err(SessionError::AlreadyRegistered);
        }
        Ok(())
    }

    pub(crate) fn take_file(&self) -> Option<OwnedFd> {
        lock(&self.inner.file).take()
    }

    pub(crate) fn attach(&self, endpoint: Endpoint) {
        *lock(&self.inner.endpoint) = Some(Arc::new(endpoint));
    }

    pub(crate) fn assign(&self, id: u32, parent_id: Option<u32>) {
        self.inner.parent_id.store(parent_id.unwrap_or(0), Ordering::Release);
        self.inner.id.store(id, Ordering::Release);
    }

    fn endpoint(&self) -> io::Result<Arc<Endpoint>> {
        lock(&self.inner.endpoint).clone().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, SessionError::NoEndpoint)
        })
    }

    /// The secondary descriptor received with this stream, if any.
    pub fn metadata_endpoint(&self) -> Option<Arc<Endpoint>> {
        lock(&self.inner.metadata).clone()
    }

    /// Half-close: the peer reads EOF, this side can still read.
    pub fn close_write(&self) -> Result<()> {
        let endpoint = self.endpoint().map_err(|_| SessionError::NoEndpoint)?;
        endpoint.shutdown_write()?;
        Ok(())
    }

    /// Release the local endpoints. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // The descriptor closes once in-flight reads drop their handles.
        lock(&self.inner.endpoint).take();
        lock(&self.inner.metadata).take();
        lock(&self.inner.file).take();
        Ok(())
    }

    /// Take ownership of the local endpoint, detaching it from the stream.
    pub fn hijack(&self) -> Result<Endpoint> {
        let endpoint = lock(&self.inner.endpoint)
            .take()
            .ok_or(SessionError::NoEndpoint)?;
        match Arc::try_unwrap(endpoint) {
            Ok(endpoint) => Ok(endpoint),
            // A reader on another thread still holds a handle.
            Err(shared) => Ok(shared.try_clone()?),
        }
    }

    /// Copy every non-empty line read from the stream to `dst`, prefixed.
    pub fn tail_to<W: Write>(&self, mut dst: W, prefix: &str) -> io::Result<()> {
        let reader = BufReader::new(self);
        for line in reader.split(b'\n') {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            dst.write_all(prefix.as_bytes())?;
            dst.write_all(&line)?;
            dst.write_all(b"\n")?;
        }
        dst.flush()
    }

    /// Whether two handles refer to the same stream.
    pub fn same_as(&self, other: &Stream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Read for &Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let endpoint = self.endpoint()?;
        (&*endpoint).read(buf)
    }
}

impl Write for &Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let endpoint = self.endpoint()?;
        (&*endpoint).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(id={}", self.id())?;
        if let Some(parent) = self.parent_id() {
            write!(f, " parent={parent}")?;
        }
        write!(f, " headers={})", lock(&self.inner.header).short_string())
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("parent_id", &self.parent_id())
            .field("header", &lock(&self.inner.header).short_string())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}
