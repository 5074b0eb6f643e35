//! gRPC protocol definitions for tcpprobe
//!
//! Defines:
//! - `TcpProbe` - control-plane service (Add/Delete/Get)
//! - `Target`, `Response`, `Stats` message types
//!
//! Generated from `proto/tcpprobe.proto`.

pub mod v1 {
    tonic::include_proto!("tcpprobe.v1");
}

pub use v1::tcp_probe_client::TcpProbeClient;
pub use v1::tcp_probe_server::{TcpProbe, TcpProbeServer};
pub use v1::*;
