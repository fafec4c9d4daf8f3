//! # In-process Transport
//!
//! An addressable, in-memory, full-duplex byte stream standing in for a network socket.
//!
//! A [`MemoryNetwork`] is an address space: it hands out unique [`MemoryAddr`] tokens, binds
//! [`MemoryListener`]s to them and connects dialers to whoever is listening. Every connection is
//! a pair of [`MemoryStream`]s backed by [`tokio::io::duplex`], so reads and writes behave like
//! a socket: both directions work concurrently, and closing one end makes pending reads on the
//! other end observe a clean end-of-stream.
//!
//! ```rust
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//! use transcode_core::transport::MemoryNetwork;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let network = MemoryNetwork::new();
//! let addr = network.allocate();
//! let mut listener = network.listen(addr.clone())?;
//!
//! let mut client = network.dial(&addr).await?;
//! let mut server = listener.accept().await.expect("listener is open");
//!
//! client.write_all(b"ping").await?;
//! let mut buf = [0u8; 4];
//! server.read_exact(&mut buf).await?;
//! assert_eq!(&buf, b"ping");
//! # Ok(())
//! # }
//! ```
use futures_util::Stream;
use std::{
    collections::HashMap,
    fmt, io,
    pin::Pin,
    sync::{
        Arc, LazyLock, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    sync::mpsc,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::transport::server::Connected;

/// Size of the in-memory pipe buffer in each direction.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Number of dialed connections that may wait for `accept` before `dial` applies backpressure.
const BACKLOG: usize = 128;

static GLOBAL: LazyLock<MemoryNetwork> = LazyLock::new(MemoryNetwork::new);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Address '{0}' is already in use")]
    AddrInUse(MemoryAddr),
    #[error("Connection refused by '{0}': nothing is listening on that address")]
    ConnectionRefused(MemoryAddr),
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        let kind = match err {
            TransportError::AddrInUse(_) => io::ErrorKind::AddrInUse,
            TransportError::ConnectionRefused(_) => io::ErrorKind::ConnectionRefused,
        };
        io::Error::new(kind, err)
    }
}

/// The address of a listener on a [`MemoryNetwork`].
///
/// Addresses can only be obtained through [`MemoryNetwork::allocate`], which guarantees they are
/// unique within their network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryAddr(Arc<str>);

impl MemoryAddr {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemoryAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An in-process address space.
///
/// Cloning is cheap and clones share the same address counter and listener registry.
/// [`MemoryNetwork::global`] is the process-wide instance used unless another one is injected.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Debug, Default)]
struct NetworkInner {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<MemoryAddr, mpsc::Sender<DuplexStream>>>,
}

impl MemoryNetwork {
    /// Creates an isolated address space.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide address space, initialised on first use.
    pub fn global() -> &'static MemoryNetwork {
        &GLOBAL
    }

    /// Returns an address no other caller of this network has been or will be given.
    pub fn allocate(&self) -> MemoryAddr {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        MemoryAddr(format!("{}-{}", env!("CARGO_PKG_NAME"), id).into())
    }

    /// Binds a listener to `addr`.
    ///
    /// The address stays bound until the listener is dropped or [`MemoryNetwork::unbind`] is
    /// called.
    pub fn listen(&self, addr: MemoryAddr) -> Result<MemoryListener, TransportError> {
        let mut listeners = self.listeners();

        if listeners.contains_key(&addr) {
            return Err(TransportError::AddrInUse(addr));
        }

        let (tx, rx) = mpsc::channel(BACKLOG);
        listeners.insert(addr.clone(), tx);

        tracing::trace!(%addr, "in-memory listener bound");

        Ok(MemoryListener {
            addr,
            network: self.clone(),
            backlog: rx,
            connections: CancellationToken::new(),
        })
    }

    /// Connects to the listener bound to `addr`.
    ///
    /// Fails with [`TransportError::ConnectionRefused`] if nothing is listening. Dropping the
    /// returned future cancels the attempt.
    pub async fn dial(&self, addr: &MemoryAddr) -> Result<MemoryStream, TransportError> {
        let backlog = self.backlog(addr)?;
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);

        backlog
            .send(remote)
            .await
            .map_err(|_| TransportError::ConnectionRefused(addr.clone()))?;

        tracing::trace!(%addr, "in-memory connection established");

        Ok(MemoryStream::new(local, addr.clone(), None))
    }

    /// Removes `addr` from the network so that new dials are refused.
    ///
    /// Connections that were already dialed are unaffected, and the listener keeps yielding the
    /// ones still queued in its backlog.
    pub fn unbind(&self, addr: &MemoryAddr) {
        if self.listeners().remove(addr).is_some() {
            tracing::trace!(%addr, "in-memory listener unbound");
        }
    }

    fn backlog(&self, addr: &MemoryAddr) -> Result<mpsc::Sender<DuplexStream>, TransportError> {
        self.listeners()
            .get(addr)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionRefused(addr.clone()))
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<MemoryAddr, mpsc::Sender<DuplexStream>>> {
        // The map is never left half-updated, so a poisoned lock is still consistent.
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A listener bound to a [`MemoryAddr`].
///
/// Besides [`MemoryListener::accept`], the listener is a [`Stream`] of connections so it can be
/// handed to `tonic::transport::Server::serve_with_incoming`.
#[derive(Debug)]
pub struct MemoryListener {
    addr: MemoryAddr,
    network: MemoryNetwork,
    backlog: mpsc::Receiver<DuplexStream>,
    connections: CancellationToken,
}

impl MemoryListener {
    pub fn local_addr(&self) -> &MemoryAddr {
        &self.addr
    }

    /// Waits for the next dialed connection.
    ///
    /// Returns `None` once the address has been unbound and every queued connection was taken.
    pub async fn accept(&mut self) -> Option<MemoryStream> {
        let io = self.backlog.recv().await?;
        Some(self.accepted(io))
    }

    /// Aborts every connection accepted by this listener, now or in the future.
    ///
    /// Pending and future reads and writes on those streams fail with
    /// [`io::ErrorKind::ConnectionAborted`]. The peers see their pipe closed.
    pub fn close_connections(&self) {
        self.connections.cancel();
    }

    pub(crate) fn connections_token(&self) -> CancellationToken {
        self.connections.clone()
    }

    fn accepted(&self, io: DuplexStream) -> MemoryStream {
        MemoryStream::new(io, self.addr.clone(), Some(self.connections.clone()))
    }
}

impl Stream for MemoryListener {
    type Item = io::Result<MemoryStream>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.backlog
            .poll_recv(cx)
            .map(|io| io.map(|io| Ok(self.accepted(io))))
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.unbind(&self.addr);
    }
}

/// One end of an in-memory connection.
pub struct MemoryStream {
    io: DuplexStream,
    addr: MemoryAddr,
    aborted: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

impl MemoryStream {
    fn new(io: DuplexStream, addr: MemoryAddr, abort: Option<CancellationToken>) -> Self {
        Self {
            io,
            addr,
            aborted: abort.map(|token| Box::pin(token.cancelled_owned())),
        }
    }

    /// The address of the listener this connection was made to.
    pub fn addr(&self) -> &MemoryAddr {
        &self.addr
    }

    fn poll_aborted(&mut self, cx: &mut Context<'_>) -> bool {
        match self.aborted.as_mut() {
            Some(aborted) => aborted.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }
}

impl fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStream")
            .field("addr", &self.addr)
            .field("abortable", &self.aborted.is_some())
            .finish()
    }
}

fn connection_aborted() -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "in-memory connection aborted",
    )
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.poll_aborted(cx) {
            return Poll::Ready(Err(connection_aborted()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.poll_aborted(cx) {
            return Poll::Ready(Err(connection_aborted()));
        }
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.poll_aborted(cx) {
            return Poll::Ready(Err(connection_aborted()));
        }
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl Connected for MemoryStream {
    type ConnectInfo = MemoryAddr;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.addr.clone()
    }
}
