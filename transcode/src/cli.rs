//! # CLI
//!
//! Command-line interface of the `transcode` demo server.
use clap::Parser;
use std::net::SocketAddr;

#[derive(Parser)]
#[command(
    name = "transcode",
    version,
    about = "Serve one gRPC service as native gRPC and HTTP+JSON on a single port"
)]
pub struct Cli {
    /// Address to listen on for both gRPC and HTTP+JSON traffic
    #[arg(long, default_value = "127.0.0.1:9090")]
    pub listen: SocketAddr,
}
