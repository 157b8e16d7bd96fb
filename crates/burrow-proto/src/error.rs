use thiserror::Error;

/// Errors produced while parsing forwarding rules or channel targets
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("Invalid remote '{0}': expected between 1 and 4 segments")]
    InvalidRemote(String),

    #[error("Invalid host '{0}'")]
    InvalidHost(String),

    #[error("Missing ports in remote '{0}'")]
    MissingPorts(String),

    #[error("Ambiguous remote '{0}': too many ports or hosts")]
    Ambiguous(String),

    #[error("'socks' incompatible with reverse port forwarding")]
    SocksReverse,

    #[error("Unix domain sockets are only supported on unix systems")]
    UnixSocketUnsupported,

    #[error("Unix domain socket {0} does not exist")]
    UnixSocketMissing(String),

    #[error("Invalid channel target '{0}'")]
    InvalidTarget(String),
}
