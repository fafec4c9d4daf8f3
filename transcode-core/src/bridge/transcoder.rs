//! # HTTP <-> gRPC Transcoder
//!
//! Translates one HTTP request into one server-streaming gRPC call on the bridge's private
//! server, and the resulting stream back into an HTTP response.
//!
//! ## How it works
//!
//! 1. The whole request body is read and wrapped, untouched, in a [`Payload::Frame`].
//! 2. Every request header becomes call metadata. The call is marked as carrying JSON in its
//!    frames under [`CONTENT_TYPE_MARKER`].
//! 3. The request path is used verbatim as the gRPC method path (`/package.Service/Method`).
//! 4. Response metadata is copied to the HTTP response headers and `content-type` is forced to
//!    `application/json`.
//! 5. Every response message is written as its raw bytes followed by `\n`.
//!
//! The response status is held back until the first message (or the end of the stream) has
//! arrived, so a call failing before producing anything is answered with an error status and a
//! plain-text body. Once a message has been written the `200` is committed: a later failure can
//! only abort the response body.
use crate::{
    BoxError,
    codec::{Payload, PassthroughCodec, WireCodec},
    logger::ErrorLogger,
};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{
    StreamExt,
    future::{self, BoxFuture},
    stream,
};
use http::{
    HeaderMap, HeaderName, HeaderValue, StatusCode,
    header::{self, CONTENT_TYPE},
    uri::PathAndQuery,
};
use http_body::{Body as HttpBody, Frame};
use http_body_util::{BodyExt, Full, StreamBody};
use std::{
    convert::Infallible,
    error::Error,
    str::FromStr,
    sync::Arc,
    task::{Context, Poll},
};
use tonic::{
    Status, Streaming, body::Body, client::Grpc, metadata::MetadataMap, transport::Channel,
};
use tracing::Instrument;

/// Call metadata key carrying the content type of the bytes inside the call's frames.
///
/// `tonic` reserves the `content-type` metadata key for the gRPC framing itself, so the
/// JSON-in-frame marker travels under this key instead.
pub const CONTENT_TYPE_MARKER: &str = "x-content-type";

const JSON_CONTENT_TYPE: &str = "application/json";
const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Request headers that are never forwarded as call metadata.
///
/// Connection-level headers cannot appear on an HTTP/2 request, and `content-type` is replaced
/// by the [`CONTENT_TYPE_MARKER`].
const EXCLUDED_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "host",
    "content-length",
    "content-type",
];

/// Errors turned into an HTTP error response by the [`Transcoder`].
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("failed to read request body: {0}")]
    ReadBody(#[source] BoxError),
    #[error("request path '{path}' is not a valid gRPC method path: {source}")]
    InvalidPath {
        path: String,
        source: http::uri::InvalidUri,
    },
    #[error("failed to create client stream: {0}")]
    ClientNotReady(#[source] BoxError),
    #[error("failed to receive response headers: {}", .0.message())]
    Call(#[source] Status),
    #[error("failed to receive grpc message: {}", .0.message())]
    Receive(#[source] Status),
}

impl TranscodeError {
    /// The HTTP status answering a request that failed with this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TranscodeError::ReadBody(_) => StatusCode::BAD_REQUEST,
            TranscodeError::InvalidPath { .. } | TranscodeError::ClientNotReady(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            TranscodeError::Call(_) | TranscodeError::Receive(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// What the transcoder was doing when it failed.
    pub fn context(&self) -> &'static str {
        match self {
            TranscodeError::ReadBody(_) => "failed to read request body",
            TranscodeError::InvalidPath { .. } => "invalid gRPC method path",
            TranscodeError::ClientNotReady(_) => "failed to create client stream",
            TranscodeError::Call(_) => "failed to receive response headers",
            TranscodeError::Receive(_) => "failed to receive grpc message",
        }
    }
}

/// The HTTP handling surface of a [`Bridge`](super::Bridge).
///
/// Cheap to clone: every clone shares the bridge's private client connection.
#[derive(Clone)]
pub struct Transcoder {
    client: Grpc<Channel>,
    codec: PassthroughCodec,
    marker: HeaderValue,
    logger: Arc<dyn ErrorLogger>,
}

impl Transcoder {
    pub(crate) fn new(
        client: Grpc<Channel>,
        codec: PassthroughCodec,
        logger: Arc<dyn ErrorLogger>,
    ) -> Self {
        let marker = codec.content_subtype_marker().unwrap_or_else(|err| {
            tracing::warn!(
                error = %err,
                codec = %codec.identity(),
                "codec name is not a valid content type, marking calls as plain gRPC"
            );
            HeaderValue::from_static("application/grpc")
        });

        Self {
            client,
            codec,
            marker,
            logger,
        }
    }

    /// The identity of the codec used for every call, e.g. `proxy>json`.
    pub fn codec_identity(&self) -> String {
        self.codec.identity()
    }

    /// Transcodes one HTTP request into a gRPC call and its result into an HTTP response.
    ///
    /// Never fails: errors are reported to the bridge's [`ErrorLogger`] and answered with an
    /// error status and a plain-text body. Dropping the returned future, or the response body,
    /// cancels the call.
    pub async fn handle<B>(&self, request: http::Request<B>) -> http::Response<Body>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let span = tracing::debug_span!(
            "transcode",
            method = %request.method(),
            path = request.uri().path(),
            codec = %self.codec.identity(),
        );

        async move {
            match self.transcode(request).await {
                Ok(response) => response,
                Err(err) => {
                    self.report(&err);
                    error_response(&err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn transcode<B>(
        &self,
        request: http::Request<B>,
    ) -> Result<http::Response<Body>, TranscodeError>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = request.into_parts();

        let body = body
            .collect()
            .await
            .map_err(|e| TranscodeError::ReadBody(e.into()))?
            .to_bytes();

        let path = PathAndQuery::from_str(parts.uri.path()).map_err(|source| {
            TranscodeError::InvalidPath {
                path: parts.uri.path().to_string(),
                source,
            }
        })?;

        let mut call = tonic::Request::new(Payload::Frame(body));
        *call.metadata_mut() = self.outbound_metadata(&parts.headers);

        let mut client = self.client.clone();
        client
            .ready()
            .await
            .map_err(|e| TranscodeError::ClientNotReady(e.into()))?;

        tracing::trace!("opening server streaming call");

        let (metadata, mut stream, _) = client
            .server_streaming(call, path, self.codec.clone())
            .await
            .map_err(TranscodeError::Call)?
            .into_parts();

        let mut headers = metadata.into_headers();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));

        // Nothing has been written yet, so a failure here can still change the status.
        let body = match stream.message().await.map_err(TranscodeError::Receive)? {
            None => Body::empty(),
            Some(first) => {
                let first = self.line(first).map_err(TranscodeError::Receive)?;
                Body::new(StreamBody::new(self.remaining_lines(first, stream)))
            }
        };

        let mut response = http::Response::new(body);
        *response.headers_mut() = headers;
        Ok(response)
    }

    fn outbound_metadata(&self, headers: &HeaderMap) -> MetadataMap {
        let mut forwarded = HeaderMap::with_capacity(headers.len() + 1);

        for (name, value) in headers {
            if !EXCLUDED_HEADERS.contains(&name.as_str()) {
                forwarded.append(name.clone(), value.clone());
            }
        }

        forwarded.insert(
            HeaderName::from_static(CONTENT_TYPE_MARKER),
            self.marker.clone(),
        );

        MetadataMap::from_headers(forwarded)
    }

    /// Streams `first` followed by every message still to come, one line each.
    ///
    /// A receive error is reported and ends the body with that error, which aborts the
    /// response.
    fn remaining_lines(
        &self,
        first: Bytes,
        rest: Streaming<Payload<serde_json::Value>>,
    ) -> impl futures_util::Stream<Item = Result<Frame<Bytes>, Status>> + Send + use<> {
        let this = self.clone();

        let rest = rest.map(move |message| {
            message.and_then(|payload| this.line(payload)).inspect_err(|status| {
                this.report(&TranscodeError::Receive(status.clone()));
            })
        });

        stream::once(future::ready(Ok(first)))
            .chain(rest)
            .map(|line| line.map(Frame::data))
    }

    /// The bytes of one response message, newline terminated.
    fn line(&self, payload: Payload<serde_json::Value>) -> Result<Bytes, Status> {
        let mut line = BytesMut::new();
        match payload {
            Payload::Frame(frame) => line.extend_from_slice(&frame),
            Payload::Message(message) => self.codec.fallback().encode(message, &mut line)?,
        }
        line.put_u8(b'\n');
        Ok(line.freeze())
    }

    fn report(&self, err: &TranscodeError) {
        tracing::debug!(error = %err, "transcoding failed");
        let cause: &(dyn Error + 'static) = err.source().unwrap_or(err);
        self.logger.log(err.context(), cause);
    }
}

fn error_response(err: &TranscodeError) -> http::Response<Body> {
    let body = Full::new(Bytes::from(format!("{}\n", err)));

    let mut response = http::Response::new(Body::new(body));
    *response.status_mut() = err.status_code();

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_CONTENT_TYPE));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );

    response
}

impl<B> tower::Service<http::Request<B>> for Transcoder
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        let transcoder = self.clone();
        Box::pin(async move { Ok(transcoder.handle(request).await) })
    }
}
