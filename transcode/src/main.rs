//! # Transcode Demo Server
//!
//! Serves the echo service on a single TCP port in two flavours:
//!
//! 1. **Native gRPC**: HTTP/2 requests with an `application/grpc` content type are handled by a
//!    regular `tonic` router.
//! 2. **HTTP+JSON**: every other request goes through a [`transcode_core::Bridge`], e.g.
//!
//! ```bash
//! curl -d '{"message":"hello"}' http://127.0.0.1:9090/echo.EchoService/ServerStreamingEcho
//! ```
//!
//! Both flavours share one service implementation. `Ctrl-C` stops the server once the calls in
//! flight on the bridge have finished.

mod cli;
mod dispatch;
mod service;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use dispatch::Dispatch;
use echo_service::EchoServiceServer;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use service::Echo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tonic::service::RoutesBuilder;
use tracing_subscriber::EnvFilter;
use transcode_core::{Bridge, TracingLogger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();
    let echo = Arc::new(Echo);

    let mut native = RoutesBuilder::default();
    native.add_service(EchoServiceServer::from_arc(echo.clone()));

    let mut bridge = Bridge::builder()
        .error_logger(TracingLogger)
        .build()
        .context("failed to create the transcoding bridge")?;
    bridge.add_service(EchoServiceServer::from_arc(echo));
    let serving = tokio::spawn(bridge.start()?);

    let dispatch = Dispatch::new(native.routes(), bridge.transcoder());

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    tracing::info!(address = %args.listen, bridge = %bridge.address(), "listening");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        };

        let service = TowerToHyperService::new(dispatch.clone());
        tokio::spawn(async move {
            let builder = auto::Builder::new(TokioExecutor::new());
            if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
                tracing::debug!(%peer, error = %e, "connection closed with an error");
            }
        });
    }

    tracing::info!("shutting down");
    bridge.graceful_stop().await;
    serving
        .await
        .context("bridge serve task panicked")?
        .context("bridge server failed")?;

    Ok(())
}
