//! # Passthrough Codec
//!
//! This module implements `tonic::codec::Codec` so that the bridge can move gRPC messages it
//! knows nothing about.
//!
//! ## How it works
//!
//! Every value crossing the codec is a [`Payload`]:
//!
//! - **[`Payload::Frame`]**: raw message bytes. Encoding copies them to the wire untouched and
//!   decoding hands them back without parsing. Neither direction can fail.
//! - **[`Payload::Message`]**: a typed message, delegated to a fallback [`WireCodec`]
//!   ([`JsonCodec`] by default), errors included.
//!
//! What the decoder produces is fixed per codec instance by its [`Target`]: the bridge's
//! client decodes into frames, while a service that wants typed messages keeps the default.
//!
//! [`JsonCodec`] is also usable on its own as the codec of a `tonic` service, which is how
//! services registered on the bridge read the JSON bodies it forwards.
use bytes::{Buf, BufMut, Bytes};
use http::{HeaderValue, header::InvalidHeaderValue};
use serde::{Serialize, de::DeserializeOwned};
use std::{fmt, marker::PhantomData};
use tonic::{
    Status,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};

const PASSTHROUGH_NAME: &str = "proxy";

/// A message encoding: how typed messages become bytes and back.
///
/// Unlike `tonic::codec::Codec`, implementations work on plain [`Buf`]/[`BufMut`] buffers, so
/// they can be composed and exercised outside of a gRPC call.
pub trait WireCodec: Clone + Send + 'static {
    /// The message type written by [`WireCodec::encode`].
    type Encode: Send + 'static;
    /// The message type produced by [`WireCodec::decode`].
    type Decode: Send + 'static;

    /// The name of the encoding, e.g. `json`.
    fn name(&self) -> String;

    fn encode<B: BufMut>(&self, item: Self::Encode, dst: &mut B) -> Result<(), Status>;

    fn decode<B: Buf>(&self, src: &mut B) -> Result<Self::Decode, Status>;
}

/// A `serde_json` codec writing `E` and reading `D`.
pub struct JsonCodec<E, D>(PhantomData<(fn(E), fn() -> D)>);

impl<E, D> JsonCodec<E, D> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E, D> Default for JsonCodec<E, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, D> Clone for JsonCodec<E, D> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E, D> fmt::Debug for JsonCodec<E, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<E, D> WireCodec for JsonCodec<E, D>
where
    E: Serialize + Send + 'static,
    D: DeserializeOwned + Send + 'static,
{
    type Encode = E;
    type Decode = D;

    fn name(&self) -> String {
        "json".to_string()
    }

    fn encode<B: BufMut>(&self, item: E, dst: &mut B) -> Result<(), Status> {
        serde_json::to_writer(BufMut::writer(dst), &item)
            .map_err(|e| Status::internal(format!("Failed to encode message as JSON: {}", e)))
    }

    fn decode<B: Buf>(&self, src: &mut B) -> Result<D, Status> {
        let bytes = src.copy_to_bytes(src.remaining());
        serde_json::from_slice(&bytes)
            .map_err(|e| Status::invalid_argument(format!("Failed to decode JSON message: {}", e)))
    }
}

impl<E, D> Codec for JsonCodec<E, D>
where
    E: Serialize + Send + 'static,
    D: DeserializeOwned + Send + 'static,
{
    type Encode = E;
    type Decode = D;

    type Encoder = WireEncoder<Self>;
    type Decoder = WireDecoder<Self>;

    fn encoder(&mut self) -> WireEncoder<Self> {
        WireEncoder(self.clone())
    }

    fn decoder(&mut self) -> WireDecoder<Self> {
        WireDecoder(self.clone())
    }
}

/// A value crossing the [`PassthroughCodec`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<T> {
    /// Undecoded message bytes, forwarded as they are.
    Frame(Bytes),
    /// A typed message handled by the fallback codec.
    Message(T),
}

/// What a [`PassthroughCodec`] decodes incoming bytes into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Target {
    /// Raw [`Payload::Frame`]s, without looking at the bytes.
    Frame,
    /// Typed [`Payload::Message`]s, through the fallback codec.
    #[default]
    Message,
}

/// A codec forwarding raw frames unmodified and delegating everything else to a fallback.
#[derive(Debug, Clone)]
pub struct PassthroughCodec<C = JsonCodec<serde_json::Value, serde_json::Value>> {
    fallback: C,
    target: Target,
}

impl<C: WireCodec> PassthroughCodec<C> {
    /// Creates a codec delegating typed messages to `fallback`.
    ///
    /// The codec decodes into [`Target::Message`] until told otherwise with
    /// [`PassthroughCodec::decoding`].
    pub fn new(fallback: C) -> Self {
        Self {
            fallback,
            target: Target::Message,
        }
    }

    pub fn decoding(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn fallback(&self) -> &C {
        &self.fallback
    }

    /// The composite codec name, e.g. `proxy>json`.
    pub fn identity(&self) -> String {
        format!("{}>{}", PASSTHROUGH_NAME, self.fallback.name())
    }

    /// The gRPC content type of the bytes carried in frames, e.g. `application/grpc+json`.
    ///
    /// Fails when the fallback's name cannot appear in a header value.
    pub fn content_subtype_marker(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&format!("application/grpc+{}", self.fallback.name()))
    }
}

impl<C: WireCodec + Default> Default for PassthroughCodec<C> {
    fn default() -> Self {
        Self::new(C::default())
    }
}

impl<C: WireCodec> WireCodec for PassthroughCodec<C> {
    type Encode = Payload<C::Encode>;
    type Decode = Payload<C::Decode>;

    fn name(&self) -> String {
        self.identity()
    }

    fn encode<B: BufMut>(&self, item: Payload<C::Encode>, dst: &mut B) -> Result<(), Status> {
        match item {
            Payload::Frame(bytes) => {
                dst.put(bytes);
                Ok(())
            }
            Payload::Message(message) => self.fallback.encode(message, dst),
        }
    }

    fn decode<B: Buf>(&self, src: &mut B) -> Result<Payload<C::Decode>, Status> {
        match self.target {
            Target::Frame => Ok(Payload::Frame(src.copy_to_bytes(src.remaining()))),
            Target::Message => self.fallback.decode(src).map(Payload::Message),
        }
    }
}

impl<C: WireCodec> Codec for PassthroughCodec<C> {
    type Encode = Payload<C::Encode>;
    type Decode = Payload<C::Decode>;

    type Encoder = WireEncoder<Self>;
    type Decoder = WireDecoder<Self>;

    fn encoder(&mut self) -> WireEncoder<Self> {
        WireEncoder(self.clone())
    }

    fn decoder(&mut self) -> WireDecoder<Self> {
        WireDecoder(self.clone())
    }
}

/// Adapts a [`WireCodec`] to `tonic`'s [`Encoder`].
#[derive(Debug)]
pub struct WireEncoder<C>(C);

impl<C: WireCodec> Encoder for WireEncoder<C> {
    type Item = C::Encode;
    type Error = Status;

    fn encode(&mut self, item: C::Encode, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        WireCodec::encode(&self.0, item, dst)
    }
}

/// Adapts a [`WireCodec`] to `tonic`'s [`Decoder`].
#[derive(Debug)]
pub struct WireDecoder<C>(C);

impl<C: WireCodec> Decoder for WireDecoder<C> {
    type Item = C::Decode;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<C::Decode>, Status> {
        WireCodec::decode(&self.0, src).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use serde::Deserialize;
    use serde_json::{Value, json};
    use tonic::Code;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct HelloRequest {
        name: String,
    }

    fn payloads() -> Vec<Bytes> {
        vec![
            Bytes::new(),
            Bytes::from_static(br#"{"name":"x"}"#),
            Bytes::from_static(b"not json at all"),
            Bytes::from(vec![0u8, 159, 146, 150, 255]),
            Bytes::from(vec![b'a'; 1 << 16]),
        ]
    }

    fn encode<C: WireCodec>(codec: &C, item: C::Encode) -> Result<Bytes, Status> {
        let mut dst = BytesMut::new();
        codec.encode(item, &mut dst)?;
        Ok(dst.freeze())
    }

    #[test]
    fn test_frames_pass_through_unchanged() {
        let codec = PassthroughCodec::<JsonCodec<Value, Value>>::default().decoding(Target::Frame);

        for payload in payloads() {
            let encoded = encode(&codec, Payload::Frame(payload.clone())).unwrap();
            assert_eq!(encoded, payload);

            let decoded = codec.decode(&mut payload.clone()).unwrap();
            assert_eq!(decoded, Payload::Frame(payload.clone()));

            let reencoded = encode(&codec, decoded).unwrap();
            assert_eq!(reencoded, payload);
        }
    }

    #[test]
    fn test_frame_decode_consumes_the_whole_buffer() {
        let codec = PassthroughCodec::<JsonCodec<Value, Value>>::default().decoding(Target::Frame);
        let mut src = Bytes::from_static(b"abc");

        codec.decode(&mut src).unwrap();

        assert!(src.is_empty());
    }

    #[test]
    fn test_messages_are_encoded_like_the_fallback() {
        let fallback = JsonCodec::<HelloRequest, HelloRequest>::new();
        let codec = PassthroughCodec::new(fallback.clone());

        let expected = encode(&fallback, HelloRequest { name: "x".into() }).unwrap();
        let actual = encode(&codec, Payload::Message(HelloRequest { name: "x".into() })).unwrap();

        assert_eq!(actual, expected);
        assert_eq!(actual, Bytes::from_static(br#"{"name":"x"}"#));
    }

    #[test]
    fn test_messages_are_decoded_like_the_fallback() {
        let codec = PassthroughCodec::new(JsonCodec::<Value, HelloRequest>::new());
        assert_eq!(codec.target(), Target::Message);

        let decoded = codec
            .decode(&mut Bytes::from_static(br#"{"name":"x"}"#))
            .unwrap();

        assert_eq!(decoded, Payload::Message(HelloRequest { name: "x".into() }));
    }

    #[test]
    fn test_fallback_errors_propagate_unchanged() {
        let fallback = JsonCodec::<Value, HelloRequest>::new();
        let codec = PassthroughCodec::new(fallback.clone());

        let expected = fallback
            .decode(&mut Bytes::from_static(b"{\"name\":"))
            .unwrap_err();
        let actual = codec
            .decode(&mut Bytes::from_static(b"{\"name\":"))
            .unwrap_err();

        assert_eq!(actual.code(), Code::InvalidArgument);
        assert_eq!(actual.code(), expected.code());
        assert_eq!(actual.message(), expected.message());
    }

    #[test]
    fn test_identity_names_the_fallback() {
        let codec = PassthroughCodec::<JsonCodec<Value, Value>>::default();
        assert_eq!(codec.identity(), "proxy>json");
        assert_eq!(codec.name(), "proxy>json");
        assert_eq!(
            codec.content_subtype_marker().unwrap(),
            "application/grpc+json"
        );

        let nested = PassthroughCodec::new(codec);
        assert_eq!(nested.identity(), "proxy>proxy>json");
    }

    #[test]
    fn test_json_codec_round_trips_values() {
        let codec = JsonCodec::<Value, Value>::new();
        let value = json!({ "name": "x", "tags": ["a", "b"], "count": 3 });

        let mut encoded = encode(&codec, value.clone()).unwrap();
        assert_eq!(codec.decode(&mut encoded).unwrap(), value);
    }

    /// A JSON codec advertising a name that cannot travel in a header.
    #[derive(Clone)]
    struct Misnamed(JsonCodec<Value, Value>);

    impl WireCodec for Misnamed {
        type Encode = Value;
        type Decode = Value;

        fn name(&self) -> String {
            "json\nv2".to_string()
        }

        fn encode<B: BufMut>(&self, item: Value, dst: &mut B) -> Result<(), Status> {
            self.0.encode(item, dst)
        }

        fn decode<B: Buf>(&self, src: &mut B) -> Result<Value, Status> {
            self.0.decode(src)
        }
    }

    #[test]
    fn test_marker_rejects_names_invalid_in_headers() {
        let codec = PassthroughCodec::new(Misnamed(JsonCodec::new()));

        assert_eq!(codec.identity(), "proxy>json\nv2");
        assert!(codec.content_subtype_marker().is_err());
    }
}
