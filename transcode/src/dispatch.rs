//! Splits the traffic of one port between native gRPC and the transcoding bridge.
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Version, header::CONTENT_TYPE};
use http_body::Body;
use std::{
    convert::Infallible,
    task::{Context, Poll},
};
use tonic::service::Routes;
use tower::ServiceExt;
use transcode_core::Transcoder;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Routes HTTP/2 requests carrying an `application/grpc*` content type to the native gRPC
/// routes and everything else to the [`Transcoder`].
#[derive(Clone)]
pub struct Dispatch {
    grpc: Routes,
    transcoder: Transcoder,
}

impl Dispatch {
    pub fn new(grpc: Routes, transcoder: Transcoder) -> Self {
        Self { grpc, transcoder }
    }
}

fn is_grpc<B>(request: &http::Request<B>) -> bool {
    request.version() == Version::HTTP_2
        && request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|content_type| content_type.starts_with("application/grpc"))
}

impl<B> tower::Service<http::Request<B>> for Dispatch
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        if is_grpc(&request) {
            tracing::debug!(path = request.uri().path(), "native gRPC request");
            Box::pin(self.grpc.clone().oneshot(request))
        } else {
            tracing::debug!(path = request.uri().path(), "HTTP+JSON request");
            Box::pin(self.transcoder.clone().oneshot(request))
        }
    }
}
