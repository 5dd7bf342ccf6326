use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;

use bytes::Bytes;
use tracing::{debug, info, warn};

use beam_data::{DataError, Msg};
use beam_transport::{Conn, ConnConfig, Endpoint, RawMessage, TransportError};

use crate::error::{IdError, Result, SessionError};
use crate::id::{IdAllocator, Role};
use crate::router::{Router, StreamReceiver, StreamSender};
use crate::stream::Stream;

/// Default capacity of the inbound stream queue.
pub const DEFAULT_RECEIVE_BACKLOG: usize = 4096;

/// Info-message key carrying the stream identifier.
pub const KEY_ID: &str = "id";
/// Info-message key carrying the parent stream identifier.
pub const KEY_PARENT_ID: &str = "parent-id";
/// Info-message key carrying the nested application headers.
pub const KEY_HEADER: &str = "header";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Configuration for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Limits applied to connections the session opens itself.
    pub conn: ConnConfig,
    /// Inbound streams queued for [`Session::receive`] before the inbound
    /// loop stops reading. Default: 4096.
    pub receive_backlog: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            conn: ConnConfig::default(),
            receive_backlog: DEFAULT_RECEIVE_BACKLOG,
        }
    }
}

/// How the session ended.
#[derive(Debug, Clone)]
enum Terminal {
    Eof,
    Failed(String),
}

impl Terminal {
    fn error(&self) -> SessionError {
        match self {
            Terminal::Eof => SessionError::Closed,
            Terminal::Failed(reason) => SessionError::ConnectionLost(reason.clone()),
        }
    }
}

struct SendRequest {
    stream: Stream,
    parent_id: Option<u32>,
    header: Option<Bytes>,
    fd: OwnedFd,
    reply: SyncSender<Result<()>>,
}

struct Table {
    streams: HashMap<u32, Stream>,
    outbound: IdAllocator,
    inbound: IdAllocator,
}

pub(crate) struct Shared {
    role: Role,
    conn: Conn,
    table: Mutex<Table>,
    outbound: Mutex<Option<Sender<SendRequest>>>,
    // Dropped on local close so an inbound loop parked on a full queue wakes.
    inbound: Mutex<Option<Receiver<Stream>>>,
    router: RwLock<Option<Arc<Router>>>,
    terminal: Mutex<Option<Terminal>>,
    closed: AtomicBool,
    closed_locally: AtomicBool,
}

/// One end of a multiplexed beam connection.
///
/// A session owns the connection and runs two worker threads: the outbound
/// worker, which assigns identifiers and writes stream announcements in
/// order, and the inbound loop, which validates announcements from the peer
/// and hands the resulting streams to [`Session::receive`] or to an
/// installed [`Router`].
///
/// `Session` is a cheap handle; clones share the same connection. The
/// workers keep running until [`Session::close`] is called or the
/// connection ends.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Wrap a connected transport.
    pub fn new(conn: Conn, role: Role) -> Result<Self> {
        Self::with_config(conn, role, SessionConfig::default())
    }

    pub fn with_config(conn: Conn, role: Role, config: SessionConfig) -> Result<Self> {
        Self::start(conn, role, config, None)
    }

    /// Wrap a connected transport, dispatching every inbound stream to
    /// `router` from the first frame on.
    pub fn with_router(
        conn: Conn,
        role: Role,
        config: SessionConfig,
        router: Arc<Router>,
    ) -> Result<Self> {
        Self::start(conn, role, config, Some(router))
    }

    fn start(
        conn: Conn,
        role: Role,
        config: SessionConfig,
        router: Option<Arc<Router>>,
    ) -> Result<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel();
        let (inbound_tx, inbound_rx) = mpsc::sync_channel(config.receive_backlog.max(1));

        let shared = Arc::new(Shared {
            role,
            conn,
            table: Mutex::new(Table {
                streams: HashMap::new(),
                outbound: IdAllocator::new(role.parity()),
                inbound: IdAllocator::new(role.peer().parity()),
            }),
            outbound: Mutex::new(Some(outbound_tx)),
            inbound: Mutex::new(Some(inbound_rx)),
            router: RwLock::new(router),
            terminal: Mutex::new(None),
            closed: AtomicBool::new(false),
            closed_locally: AtomicBool::new(false),
        });

        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name("beam-outbound".into())
            .spawn(move || worker.outbound_worker(outbound_rx))
            .map_err(SessionError::Spawn)?;

        let reader = Arc::clone(&shared);
        if let Err(err) = thread::Builder::new()
            .name("beam-inbound".into())
            .spawn(move || reader.inbound_loop(inbound_tx))
        {
            shared.terminate(Terminal::Eof);
            return Err(SessionError::Spawn(err));
        }

        debug!(%role, "session started");
        Ok(Self { shared })
    }

    /// Two sessions connected to each other: an initiator and an acceptor.
    pub fn pair() -> Result<(Self, Self)> {
        Self::pair_with_config(SessionConfig::default())
    }

    pub fn pair_with_config(config: SessionConfig) -> Result<(Self, Self)> {
        let (a, b) = Conn::pair_with_config(config.conn.clone())?;
        let initiator = Self::with_config(a, Role::Initiator, config.clone())?;
        let acceptor = Self::with_config(b, Role::Acceptor, config)?;
        Ok((initiator, acceptor))
    }

    /// Connect to a listening socket as the initiator.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with_config(path, SessionConfig::default())
    }

    pub fn connect_with_config(path: impl AsRef<Path>, config: SessionConfig) -> Result<Self> {
        let conn = beam_transport::uds::connect_with_config(path, config.conn.clone())?;
        Self::with_config(conn, Role::Initiator, config)
    }

    /// Build a session on the connection inherited from the parent process.
    pub fn inherited(role: Role) -> Result<Self> {
        Self::new(Conn::inherited()?, role)
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Create an unregistered stream. Nothing is sent.
    pub fn new_stream(&self, parent: Option<&Stream>) -> Stream {
        Stream::outbound(Arc::downgrade(&self.shared), parent)
    }

    /// Register `stream` and announce it to the peer.
    ///
    /// Blocks until the outbound worker has written the announcement. Unless
    /// a descriptor was attached with [`Stream::set_file`], a socket pair is
    /// created: one end stays with the stream, the other goes to the peer.
    pub fn send(&self, stream: &Stream) -> Result<()> {
        if let Some(err) = self.shared.terminal_error() {
            return Err(err);
        }
        if !stream.belongs_to(&self.shared) {
            return Err(SessionError::ForeignStream);
        }

        if let Some(parent) = stream.parent() {
            if !parent.belongs_to(&self.shared) {
                return Err(SessionError::ForeignStream);
            }
        }
        let parent_id = if stream.has_parent() {
            Some(stream.parent_id().ok_or(SessionError::ParentNotRegistered)?)
        } else {
            None
        };
        let header = stream.header();
        let header = if header.is_empty() {
            None
        } else {
            Some(header.encode()?)
        };

        stream.claim()?;
        let fd = match stream.take_file() {
            Some(fd) => fd,
            None => {
                let (local, remote) = Endpoint::pair()?;
                stream.attach(local);
                remote.into_owned_fd()
            }
        };

        let (reply, response) = mpsc::sync_channel(1);
        let request = SendRequest {
            stream: stream.clone(),
            parent_id,
            header,
            fd,
            reply,
        };
        let outbound = lock(&self.shared.outbound).clone();
        let Some(outbound) = outbound else {
            return Err(self.shared.terminal_or_closed());
        };
        outbound
            .send(request)
            .map_err(|_| self.shared.terminal_or_closed())?;
        response
            .recv()
            .unwrap_or_else(|_| Err(self.shared.terminal_or_closed()))
    }

    /// Wait for the next stream announced by the peer.
    ///
    /// When the queue is full the inbound loop stops reading frames until a
    /// stream is taken, so no validated stream is ever dropped.
    ///
    /// Streams that arrived before the peer went away are still handed out;
    /// after that, and at once after a local close, every call returns the
    /// terminal error.
    pub fn receive(&self) -> Result<Stream> {
        if self.shared.closed_locally.load(Ordering::Acquire) {
            return Err(self.shared.terminal_or_closed());
        }
        let inbound = lock(&self.shared.inbound);
        match inbound.as_ref() {
            Some(queue) => queue.recv().map_err(|_| self.shared.terminal_or_closed()),
            None => Err(self.shared.terminal_or_closed()),
        }
    }

    /// Close the connection and stop both workers. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed_locally.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.terminate(Terminal::Eof);
        // Any receive holding the lock returns promptly: either the queue is
        // non-empty or the inbound loop has stopped and dropped its sender.
        lock(&self.shared.inbound).take();
        info!(role = %self.shared.role, "session closed");
        Ok(())
    }

    /// Dispatch every later inbound stream to `router` instead of the
    /// receive queue. Streams already queued stay there.
    pub fn install_router(&self, router: Arc<Router>) {
        let mut slot = self
            .shared
            .router
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(router);
    }

    /// Identifiers of every stream registered in this session, ascending.
    pub fn streams(&self) -> Vec<u32> {
        let table = lock(&self.shared.table);
        let mut ids: Vec<u32> = table.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Look up a registered stream.
    pub fn get(&self, id: u32) -> Option<Stream> {
        lock(&self.shared.table).streams.get(&id).cloned()
    }

    /// The underlying connection.
    pub fn conn(&self) -> &Conn {
        &self.shared.conn
    }
}

impl StreamReceiver for Session {
    fn receive(&self) -> Result<Stream> {
        Session::receive(self)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Why an inbound frame was skipped.
#[derive(Debug, thiserror::Error)]
enum Rejected {
    #[error("frame carries no descriptor")]
    NoDescriptor,
    #[error("payload truncated")]
    Truncated,
    #[error("undecodable info-message: {0}")]
    Decode(#[from] DataError),
    #[error("id rejected: {0}")]
    Id(#[from] IdError),
    #[error("id 0 is reserved")]
    ZeroId,
    #[error("id {0} out of range")]
    IdRange(u64),
    #[error("unknown parent {0}")]
    UnknownParent(u64),
    #[error("duplicate id {0}")]
    Duplicate(u32),
}

impl Shared {
    fn terminal_error(&self) -> Option<SessionError> {
        lock(&self.terminal).as_ref().map(Terminal::error)
    }

    fn terminal_or_closed(&self) -> SessionError {
        self.terminal_error().unwrap_or(SessionError::Closed)
    }

    /// Record how the session ended and stop both workers.
    ///
    /// The first recorded state wins.
    fn terminate(&self, state: Terminal) {
        {
            let mut terminal = lock(&self.terminal);
            if terminal.is_none() {
                *terminal = Some(state);
            }
        }
        self.closed.store(true, Ordering::Release);
        lock(&self.outbound).take();
        if let Err(err) = self.conn.shutdown() {
            debug!(error = %err, "connection shutdown failed");
        }
    }

    fn outbound_worker(&self, requests: Receiver<SendRequest>) {
        for request in requests {
            let result = self.transmit(&request);
            // The caller may have given up waiting.
            let _ = request.reply.send(result);
        }
        debug!(role = %self.role, "outbound worker stopped");
    }

    fn transmit(&self, request: &SendRequest) -> Result<()> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }

        let id = {
            let mut table = lock(&self.table);
            let id = table.outbound.peek()?;
            if table.streams.contains_key(&id) {
                return Err(SessionError::DuplicateId(id));
            }
            table.outbound.register(id)?;
            // Registered before the write so a child announced by the peer
            // in reply can always resolve this stream as its parent.
            table.streams.insert(id, request.stream.clone());
            request.stream.assign(id, request.parent_id);
            id
        };

        let mut info = Msg::new();
        info.set_uint(KEY_ID, u64::from(id));
        if let Some(parent_id) = request.parent_id {
            info.set_uint(KEY_PARENT_ID, u64::from(parent_id));
        }
        if let Some(header) = &request.header {
            info.set(KEY_HEADER, header);
        }
        let payload = info.encode()?;

        if let Err(err) = self.conn.send(&payload, &[request.fd.as_fd()]) {
            warn!(id, error = %err, "stream announcement failed");
            self.terminate(Terminal::Failed(err.to_string()));
            return Err(err.into());
        }
        debug!(id, parent_id = ?request.parent_id, "stream sent");
        Ok(())
    }

    fn inbound_loop(self: Arc<Self>, queue: SyncSender<Stream>) {
        loop {
            let message = match self.conn.receive() {
                Ok(message) => message,
                Err(err) => {
                    self.finish(err);
                    return;
                }
            };

            match self.accept(message) {
                Ok(stream) => self.dispatch(stream, &queue),
                Err(reason @ Rejected::NoDescriptor) => {
                    debug!(%reason, "skipping frame");
                }
                Err(reason) => {
                    warn!(%reason, "skipping frame");
                }
            }
        }
    }

    fn finish(&self, err: TransportError) {
        let state = if err.is_shutdown() || self.closed.load(Ordering::Acquire) {
            Terminal::Eof
        } else {
            Terminal::Failed(err.to_string())
        };
        info!(role = %self.role, ?state, "inbound loop stopped");
        self.terminate(state);
    }

    /// Turn a raw frame into a registered stream.
    fn accept(self: &Arc<Self>, message: RawMessage) -> std::result::Result<Stream, Rejected> {
        let RawMessage {
            payload,
            fds,
            truncated,
        } = message;
        if truncated {
            return Err(Rejected::Truncated);
        }
        let mut fds = fds.into_iter();
        let Some(data) = fds.next() else {
            return Err(Rejected::NoDescriptor);
        };
        let metadata = fds.next();

        let (info, _) = Msg::decode(&payload)?;
        let id = info.get_uint(KEY_ID)?;
        let id = u32::try_from(id).map_err(|_| Rejected::IdRange(id))?;
        if id == 0 {
            return Err(Rejected::ZeroId);
        }

        let mut table = lock(&self.table);
        let parent = match info.exists(KEY_PARENT_ID) {
            true => {
                let parent_id = info.get_uint(KEY_PARENT_ID)?;
                let parent = u32::try_from(parent_id)
                    .ok()
                    .and_then(|pid| table.streams.get(&pid))
                    .cloned()
                    .ok_or(Rejected::UnknownParent(parent_id))?;
                Some(parent)
            }
            false => None,
        };
        let header = info.get_msg(KEY_HEADER)?;
        if table.streams.contains_key(&id) {
            return Err(Rejected::Duplicate(id));
        }
        // Only a fully valid frame advances the inbound sequence.
        table.inbound.register(id)?;

        let stream = Stream::inbound(
            Arc::downgrade(self),
            id,
            parent.as_ref(),
            header,
            Endpoint::from(data),
            metadata.map(Endpoint::from),
        );
        table.streams.insert(id, stream.clone());
        Ok(stream)
    }

    fn dispatch(&self, stream: Stream, queue: &SyncSender<Stream>) {
        debug!(%stream, "stream received");
        let router = self
            .router
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(router) = router {
            if let Err(err) = router.send(stream) {
                warn!(error = %err, "router dispatch failed");
            }
            return;
        }
        let stream = match queue.try_send(stream) {
            Ok(()) => return,
            Err(TrySendError::Full(stream)) => stream,
            Err(TrySendError::Disconnected(_)) => return,
        };
        debug!(id = stream.id(), "receive backlog full, waiting for a receiver");
        if queue.send(stream).is_err() {
            debug!("session closed while waiting for a receiver");
        }
    }
}
