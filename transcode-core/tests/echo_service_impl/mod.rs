use echo_service::EchoService;
use echo_service::pb::{EchoRequest, EchoResponse};
use futures_util::{Stream, StreamExt, stream};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Request, Response, Status, Streaming};
use transcode_core::bridge::transcoder::CONTENT_TYPE_MARKER;

type EchoStream = Pin<Box<dyn Stream<Item = Result<EchoResponse, Status>> + Send>>;

/// Echo implementation whose behaviour is driven by the request message:
///
/// * `""` fails the unary call.
/// * `fail-first` streams an error as its first item.
/// * `fail-mid-stream` streams one message, then an error.
/// * `forever` streams one message, then never ends.
/// * `empty` streams nothing.
/// * `large` streams a single message of [`LARGE_MESSAGE_LEN`] bytes.
#[derive(Debug, Default, Clone)]
pub struct EchoServiceImpl {
    calls: Arc<AtomicUsize>,
    dropped_streams: Arc<AtomicUsize>,
}

/// Larger than the 4 MiB `tonic` decodes by default.
pub const LARGE_MESSAGE_LEN: usize = 5 * 1024 * 1024;

/// Counts the `forever` streams released by the server.
struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl EchoServiceImpl {
    /// Number of calls that reached the service.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `forever` streams the server has dropped.
    pub fn dropped_streams(&self) -> usize {
        self.dropped_streams.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn response(message: String) -> EchoResponse {
    EchoResponse { message }
}

/// Reflects a few request headers back as response metadata.
fn reflect_metadata(request: &MetadataMap, response: &mut MetadataMap) {
    response.insert("x-served-by", MetadataValue::from_static("echo-service"));

    if let Some(request_id) = request.get("x-request-id") {
        response.insert("x-request-id", request_id.clone());
    }

    if let Some(marker) = request.get(CONTENT_TYPE_MARKER) {
        response.insert("x-echo-marker", marker.clone());
    }

    let tags: Vec<&str> = request
        .get_all("x-tag")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    if !tags.is_empty() {
        response.insert("x-echo-tags", tags.join(",").parse().unwrap());
    }
}

#[tonic::async_trait]
impl EchoService for EchoServiceImpl {
    type ServerStreamingEchoStream = EchoStream;
    type BidirectionalEchoStream = EchoStream;

    async fn unary_echo(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<EchoResponse>, Status> {
        self.record_call();

        let message = request.get_ref().message.clone();
        if message.is_empty() {
            return Err(Status::invalid_argument("message must not be empty"));
        }

        let mut response = Response::new(EchoResponse { message });
        reflect_metadata(request.metadata(), response.metadata_mut());
        Ok(response)
    }

    async fn server_streaming_echo(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<Self::ServerStreamingEchoStream>, Status> {
        self.record_call();

        let msg = request.get_ref().message.clone();
        let first = || Ok(response(format!("{} - seq 0", msg)));

        let stream: EchoStream = match msg.as_str() {
            "fail-first" => Box::pin(stream::iter([Err(Status::internal(
                "stream failed before the first message",
            ))])),
            "fail-mid-stream" => Box::pin(stream::iter([
                first(),
                Err(Status::internal("stream broke")),
            ])),
            "forever" => {
                let counter = DropCounter(self.dropped_streams.clone());
                Box::pin(
                    stream::iter([first()])
                        .chain(stream::pending())
                        .inspect(move |_| {
                            let _alive = &counter;
                        }),
                )
            }
            "empty" => Box::pin(stream::empty()),
            "large" => Box::pin(stream::iter([Ok(response("x".repeat(LARGE_MESSAGE_LEN)))])),
            _ => Box::pin(stream::iter(
                (0..3)
                    .map(|i| Ok(response(format!("{} - seq {}", msg, i))))
                    .collect::<Vec<_>>(),
            )),
        };

        let mut response = Response::new(stream);
        reflect_metadata(request.metadata(), response.metadata_mut());
        Ok(response)
    }

    async fn client_streaming_echo(
        &self,
        request: Request<Streaming<EchoRequest>>,
    ) -> Result<Response<EchoResponse>, Status> {
        self.record_call();

        let mut stream = request.into_inner();
        let mut full_msg = String::new();

        while let Some(req) = stream.next().await {
            full_msg.push_str(&req?.message);
        }

        Ok(Response::new(response(full_msg)))
    }

    async fn bidirectional_echo(
        &self,
        request: Request<Streaming<EchoRequest>>,
    ) -> Result<Response<Self::BidirectionalEchoStream>, Status> {
        self.record_call();

        let stream = request
            .into_inner()
            .map(|req| req.map(|req| response(format!("echo: {}", req.message))));

        Ok(Response::new(Box::pin(stream)))
    }
}
