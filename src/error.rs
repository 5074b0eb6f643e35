use thiserror::Error;

#[derive(Error, Debug)]
pub enum TcpProbeError {
    #[error("invalid target address: {0}")]
    InvalidTarget(String),

    #[error("ip address not available")]
    AddrNotAvailable,

    #[error("dns resolve error: {0}")]
    Resolve(String),

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("probe cancelled")]
    Cancelled,

    #[error("tls error: {0}")]
    Tls(String),

    #[error("{0} has been redirected")]
    Redirected(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("{op} error: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("kubernetes error: {0}")]
    Kubernetes(String),

    #[error("the target already exist")]
    TargetExist,

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TcpProbeError>;
