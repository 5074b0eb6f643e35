pub mod cli;
pub mod config;
pub mod error;
pub mod k8s;
pub mod metrics;
pub mod output;
pub mod probe;
pub mod rpc;
pub mod supervisor;
pub mod update;

pub use error::{Result, TcpProbeError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Release page probed by `--check-update`.
pub const RELEASE_URL: &str = "https://github.com/mehrdadrad/tcpprobe/releases/latest";
