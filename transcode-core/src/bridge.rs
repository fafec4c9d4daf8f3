//! # Transcoding Bridge
//!
//! The [`Bridge`] owns a private `tonic` server and a private `tonic` client connected to it
//! over the in-process [`transport`](crate::transport). It exposes the server's routes for
//! service registration, and the client through the [`Transcoder`], which turns HTTP+JSON
//! requests into gRPC calls.
//!
//! ## Lifecycle
//!
//! A bridge is created with every option applied once by [`BridgeBuilder::build`]. Services are
//! registered before [`Bridge::start`], which hands back the serve task. That task runs until
//! the bridge is stopped or the server fails, so the caller has to spawn it:
//!
//! ```rust,no_run
//! use transcode_core::Bridge;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut bridge = Bridge::builder().build()?;
//! // bridge.add_service(MyServiceServer::new(MyService));
//! let serving = tokio::spawn(bridge.start()?);
//!
//! // ... hand `bridge.transcoder()` to the HTTP server ...
//!
//! bridge.graceful_stop().await;
//! serving.await??;
//! # Ok(())
//! # }
//! ```
pub mod transcoder;

pub use transcoder::{TranscodeError, Transcoder};

use crate::{
    BoxError,
    codec::{PassthroughCodec, Target},
    logger::{ErrorLogger, NullLogger},
    transport::{MemoryAddr, MemoryListener, MemoryNetwork, TransportError},
};
use bytes::Bytes;
use http_body::Body as HttpBody;
use hyper_util::rt::TokioIo;
use std::{future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;
use tonic::{
    client::Grpc,
    server::NamedService,
    service::RoutesBuilder,
    transport::{Channel, Endpoint, Server},
};
use tower::service_fn;

/// Errors that can occur while constructing or starting a [`Bridge`].
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to create in-memory listener: '{0}'")]
    Listen(#[source] TransportError),
    #[error("Failed to create gRPC client for '{address}': '{source}'")]
    InvalidEndpoint {
        address: MemoryAddr,
        source: tonic::transport::Error,
    },
    #[error("The bridge server has already been started")]
    AlreadyStarted,
}

/// Run state of the bridge's private server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Serving,
    Stopped,
}

type ClientOption = Box<dyn FnOnce(Endpoint) -> Endpoint + Send>;
type CallOption = Box<dyn FnOnce(Grpc<Channel>) -> Grpc<Channel> + Send>;

/// Configures a [`Bridge`]. Every option is applied exactly once, by [`BridgeBuilder::build`].
pub struct BridgeBuilder {
    network: MemoryNetwork,
    server: Server,
    client_options: Vec<ClientOption>,
    call_options: Vec<CallOption>,
    logger: Arc<dyn ErrorLogger>,
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self {
            network: MemoryNetwork::global().clone(),
            server: Server::builder(),
            client_options: Vec::new(),
            call_options: Vec::new(),
            logger: Arc::new(NullLogger),
        }
    }
}

impl BridgeBuilder {
    /// Adds options to the private client's [`Endpoint`] (timeouts, window sizes, ...).
    ///
    /// Can be called several times, the options are applied in order.
    pub fn configure_client(
        mut self,
        options: impl FnOnce(Endpoint) -> Endpoint + Send + 'static,
    ) -> Self {
        self.client_options.push(Box::new(options));
        self
    }

    /// Adds per-call options to the private client: message size limits and compression.
    ///
    /// Responses are decoded with `tonic`'s default 4 MiB limit unless raised here, e.g.
    /// `configure_calls(|grpc| grpc.max_decoding_message_size(16 * 1024 * 1024))`.
    pub fn configure_calls(
        mut self,
        options: impl FnOnce(Grpc<Channel>) -> Grpc<Channel> + Send + 'static,
    ) -> Self {
        self.call_options.push(Box::new(options));
        self
    }

    /// Adds options to the private [`Server`] (concurrency limits, keepalive, ...).
    pub fn configure_server(mut self, options: impl FnOnce(Server) -> Server) -> Self {
        self.server = options(self.server);
        self
    }

    /// Sets the logger receiving every per-request error. Errors are discarded by default.
    pub fn error_logger(mut self, logger: impl ErrorLogger) -> Self {
        self.logger = Arc::new(logger);
        self
    }

    /// Sets the address space the bridge's transport lives in.
    ///
    /// Defaults to [`MemoryNetwork::global`].
    pub fn network(mut self, network: MemoryNetwork) -> Self {
        self.network = network;
        self
    }

    /// Creates the bridge: binds a fresh in-memory address, prepares the server and connects a
    /// client to it.
    ///
    /// The client connects lazily on the first request. This must be called from within a
    /// Tokio runtime.
    pub fn build(self) -> Result<Bridge, BridgeError> {
        let address = self.network.allocate();
        let listener = self
            .network
            .listen(address.clone())
            .map_err(BridgeError::Listen)?;

        let mut endpoint = Endpoint::from_shared(format!("http://{}", address)).map_err(
            |source| BridgeError::InvalidEndpoint {
                address: address.clone(),
                source,
            },
        )?;
        for options in self.client_options {
            endpoint = options(endpoint);
        }

        let network = self.network.clone();
        let dial_address = address.clone();
        let connector = service_fn(move |_: http::Uri| {
            let network = network.clone();
            let address = dial_address.clone();
            async move { network.dial(&address).await.map(TokioIo::new) }
        });
        let channel = endpoint.connect_with_connector_lazy(connector);

        let mut client = Grpc::new(channel);
        for options in self.call_options {
            client = options(client);
        }

        let codec = PassthroughCodec::default().decoding(Target::Frame);
        let transcoder = Transcoder::new(client, codec, self.logger);

        tracing::debug!(%address, codec = %transcoder.codec_identity(), "transcoding bridge created");

        Ok(Bridge {
            connections: listener.connections_token(),
            pending: Some(PendingServer {
                server: self.server,
                listener,
            }),
            address,
            network: self.network,
            routes: RoutesBuilder::default(),
            transcoder,
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
        })
    }
}

struct PendingServer {
    server: Server,
    listener: MemoryListener,
}

/// A private gRPC server and client pair transcoding HTTP+JSON requests into gRPC calls.
pub struct Bridge {
    address: MemoryAddr,
    network: MemoryNetwork,
    routes: RoutesBuilder,
    pending: Option<PendingServer>,
    transcoder: Transcoder,
    connections: CancellationToken,
    shutdown: CancellationToken,
    finished: CancellationToken,
}

impl Bridge {
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::default()
    }

    /// Creates a bridge with the default options.
    pub fn new() -> Result<Self, BridgeError> {
        Self::builder().build()
    }

    /// The in-memory address the private server listens on.
    pub fn address(&self) -> &MemoryAddr {
        &self.address
    }

    pub fn state(&self) -> RunState {
        if self.finished.is_cancelled() {
            RunState::Stopped
        } else if self.pending.is_some() {
            if self.shutdown.is_cancelled() {
                RunState::Stopped
            } else {
                RunState::NotStarted
            }
        } else {
            RunState::Serving
        }
    }

    /// The routes of the private server.
    ///
    /// Services must be registered before [`Bridge::start`]; later registrations are ignored.
    pub fn routes_mut(&mut self) -> &mut RoutesBuilder {
        &mut self.routes
    }

    /// Registers a service on the private server.
    pub fn add_service<S>(&mut self, service: S) -> &mut Self
    where
        S: tower::Service<
                http::Request<tonic::body::Body>,
                Response = http::Response<tonic::body::Body>,
                Error = std::convert::Infallible,
            > + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        tracing::debug!(address = %self.address, service = S::NAME, "service registered on bridge");
        self.routes.add_service(service);
        self
    }

    /// Returns the task serving the private server.
    ///
    /// The task runs until [`Bridge::stop`] or [`Bridge::graceful_stop`] is called, or the server
    /// fails. It must be spawned by the caller, who observes how it ends. Calling this twice
    /// fails with [`BridgeError::AlreadyStarted`].
    pub fn start(
        &mut self,
    ) -> Result<
        impl Future<Output = Result<(), tonic::transport::Error>> + Send + use<>,
        BridgeError,
    > {
        let PendingServer {
            mut server,
            listener,
        } = self.pending.take().ok_or(BridgeError::AlreadyStarted)?;

        let routes = std::mem::take(&mut self.routes).routes();
        let shutdown = self.shutdown.clone();
        // Armed before the first poll, so dropping the task unpolled still counts as stopped.
        let finished = self.finished.clone().drop_guard();
        let address = self.address.clone();

        Ok(async move {
            let _finished = finished;

            tracing::debug!(%address, "bridge server started");
            let result = server
                .add_routes(routes)
                .serve_with_incoming_shutdown(listener, shutdown.cancelled_owned())
                .await;
            tracing::debug!(%address, ok = result.is_ok(), "bridge server stopped");

            result
        })
    }

    /// Stops the server immediately.
    ///
    /// New calls are refused and every private connection is aborted, failing the calls in
    /// flight.
    pub fn stop(&self) {
        tracing::debug!(address = %self.address, "stopping bridge server");
        self.network.unbind(&self.address);
        self.shutdown.cancel();
        self.connections.cancel();
    }

    /// Stops the server once the calls in flight have finished.
    ///
    /// New calls are refused as soon as this is called. The returned future resolves when the
    /// serve task has ended, or right away if the bridge was never started.
    pub fn graceful_stop(&self) -> impl Future<Output = ()> + Send + use<> {
        tracing::debug!(address = %self.address, "gracefully stopping bridge server");
        self.network.unbind(&self.address);
        self.shutdown.cancel();

        let started = self.pending.is_none();
        let finished = self.finished.clone();
        async move {
            if started {
                finished.cancelled().await;
            }
        }
    }

    /// The HTTP side of the bridge, cheap to clone.
    pub fn transcoder(&self) -> Transcoder {
        self.transcoder.clone()
    }

    /// Transcodes one HTTP request into a gRPC call on the private server.
    ///
    /// See [`Transcoder::handle`].
    pub fn handle<B>(
        &self,
        request: http::Request<B>,
    ) -> impl Future<Output = http::Response<tonic::body::Body>> + Send + use<B>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let transcoder = self.transcoder.clone();
        async move { transcoder.handle(request).await }
    }
}
