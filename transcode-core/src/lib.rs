//! # Transcode Core
//!
//! `transcode-core` lets a single process serve one `tonic` service implementation over two
//! wire formats at once: native gRPC over HTTP/2, and plain HTTP+JSON. Business logic is
//! registered once, and no second network port is opened.
//!
//! ## Key Components
//!
//! * **[`Bridge`]:** Owns a private gRPC server and a private gRPC client connected to each
//!   other through an in-memory transport. Services are registered on the bridge like on any
//!   `tonic` server, and HTTP requests are handed to it through [`Bridge::handle`] or the
//!   [`Transcoder`] service.
//! * **[`Transcoder`]:** The HTTP side of the bridge. Each HTTP request becomes one
//!   server-streaming call whose method is the request path (`/package.Service/Method`); every
//!   response message is written back as one line of JSON.
//!
//! ## Building blocks
//!
//! * **[`transport`]:** An addressable, in-process, full-duplex byte stream standing in for a
//!   socket. The bridge's client and server talk through it without touching the kernel network
//!   stack.
//! * **[`codec`]:** A schema-agnostic wire codec. Raw frames flow through it untouched while
//!   typed messages are delegated to a fallback codec (JSON by default).
//!
//! ## Example
//!
//! ```rust,no_run
//! use transcode_core::Bridge;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut bridge = Bridge::new()?;
//! // bridge.add_service(MyServiceServer::new(MyService));
//! tokio::spawn(bridge.start()?);
//!
//! let request = http::Request::post("/my.package.MyService/MyMethod")
//!     .body(http_body_util::Full::new(bytes::Bytes::from(r#"{"name":"x"}"#)))?;
//! let response = bridge.handle(request).await;
//! assert_eq!(response.status(), http::StatusCode::OK);
//! # Ok(())
//! # }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports `tonic` so that consumers register services built against a
//! compatible version.
pub mod bridge;
pub mod codec;
pub mod logger;
pub mod transport;

pub use bridge::{Bridge, BridgeBuilder, BridgeError, RunState, TranscodeError, Transcoder};
pub use logger::{ErrorLogger, NullLogger, TracingLogger};

// Re-exports
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
