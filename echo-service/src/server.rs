//! Server side of `echo.EchoService`, shaped like `tonic` generated code.
use crate::pb::{EchoRequest, EchoResponse};
use futures_util::{Stream, future::BoxFuture};
use http_body::Body;
use std::{
    convert::Infallible,
    sync::Arc,
    task::{Context, Poll},
};
use tonic::{
    Request, Response, Status, Streaming,
    server::{
        ClientStreamingService, Grpc, NamedService, ServerStreamingService, StreamingService,
        UnaryService,
    },
};
use transcode_core::codec::JsonCodec;

pub const SERVICE_NAME: &str = "echo.EchoService";

type EchoCodec = JsonCodec<EchoResponse, EchoRequest>;
type StdError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[tonic::async_trait]
pub trait EchoService: Send + Sync + 'static {
    type ServerStreamingEchoStream: Stream<Item = Result<EchoResponse, Status>> + Send + 'static;
    type BidirectionalEchoStream: Stream<Item = Result<EchoResponse, Status>> + Send + 'static;

    async fn unary_echo(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<EchoResponse>, Status>;

    async fn server_streaming_echo(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<Self::ServerStreamingEchoStream>, Status>;

    async fn client_streaming_echo(
        &self,
        request: Request<Streaming<EchoRequest>>,
    ) -> Result<Response<EchoResponse>, Status>;

    async fn bidirectional_echo(
        &self,
        request: Request<Streaming<EchoRequest>>,
    ) -> Result<Response<Self::BidirectionalEchoStream>, Status>;
}

#[derive(Debug)]
pub struct EchoServiceServer<T> {
    inner: Arc<T>,
}

impl<T> EchoServiceServer<T> {
    pub fn new(inner: T) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    pub fn from_arc(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

impl<T> Clone for EchoServiceServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> NamedService for EchoServiceServer<T> {
    const NAME: &'static str = SERVICE_NAME;
}

struct UnaryEchoSvc<T>(Arc<T>);

impl<T: EchoService> UnaryService<EchoRequest> for UnaryEchoSvc<T> {
    type Response = EchoResponse;
    type Future = BoxFuture<'static, Result<Response<EchoResponse>, Status>>;

    fn call(&mut self, request: Request<EchoRequest>) -> Self::Future {
        let inner = self.0.clone();
        Box::pin(async move { inner.unary_echo(request).await })
    }
}

struct ServerStreamingEchoSvc<T>(Arc<T>);

impl<T: EchoService> ServerStreamingService<EchoRequest> for ServerStreamingEchoSvc<T> {
    type Response = EchoResponse;
    type ResponseStream = T::ServerStreamingEchoStream;
    type Future = BoxFuture<'static, Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<EchoRequest>) -> Self::Future {
        let inner = self.0.clone();
        Box::pin(async move { inner.server_streaming_echo(request).await })
    }
}

struct ClientStreamingEchoSvc<T>(Arc<T>);

impl<T: EchoService> ClientStreamingService<EchoRequest> for ClientStreamingEchoSvc<T> {
    type Response = EchoResponse;
    type Future = BoxFuture<'static, Result<Response<EchoResponse>, Status>>;

    fn call(&mut self, request: Request<Streaming<EchoRequest>>) -> Self::Future {
        let inner = self.0.clone();
        Box::pin(async move { inner.client_streaming_echo(request).await })
    }
}

struct BidirectionalEchoSvc<T>(Arc<T>);

impl<T: EchoService> StreamingService<EchoRequest> for BidirectionalEchoSvc<T> {
    type Response = EchoResponse;
    type ResponseStream = T::BidirectionalEchoStream;
    type Future = BoxFuture<'static, Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<EchoRequest>>) -> Self::Future {
        let inner = self.0.clone();
        Box::pin(async move { inner.bidirectional_echo(request).await })
    }
}

impl<T, B> tower::Service<http::Request<B>> for EchoServiceServer<T>
where
    T: EchoService,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let inner = self.inner.clone();

        match req.uri().path() {
            "/echo.EchoService/UnaryEcho" => Box::pin(async move {
                let mut grpc = Grpc::new(EchoCodec::default());
                Ok(grpc.unary(UnaryEchoSvc(inner), req).await)
            }),
            "/echo.EchoService/ServerStreamingEcho" => Box::pin(async move {
                let mut grpc = Grpc::new(EchoCodec::default());
                Ok(grpc.server_streaming(ServerStreamingEchoSvc(inner), req).await)
            }),
            "/echo.EchoService/ClientStreamingEcho" => Box::pin(async move {
                let mut grpc = Grpc::new(EchoCodec::default());
                Ok(grpc.client_streaming(ClientStreamingEchoSvc(inner), req).await)
            }),
            "/echo.EchoService/BidirectionalEcho" => Box::pin(async move {
                let mut grpc = Grpc::new(EchoCodec::default());
                Ok(grpc.streaming(BidirectionalEchoSvc(inner), req).await)
            }),
            _ => Box::pin(async move { Ok(Status::unimplemented("").into_http()) }),
        }
    }
}
