//! # Echo Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide a gRPC service definition for
//! integration testing `transcode-core` and for the `transcode` demo server.
//! It is not intended for production use.
//!
//! The service speaks JSON on the wire through [`transcode_core::codec::JsonCodec`], so it can
//! be registered on a bridge as well as on a regular `tonic` server.

pub mod pb {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct EchoRequest {
        pub message: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct EchoResponse {
        pub message: String,
    }
}

mod server;

pub use server::{EchoService, EchoServiceServer, SERVICE_NAME};
