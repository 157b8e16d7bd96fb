//! Remote target carried as the payload of a channel-open request

use std::fmt;
use std::str::FromStr;

use crate::error::EndpointError;

pub(crate) const SOCKS_TOKEN: &str = "socks";
pub(crate) const UDS_SCHEME: &str = "unix";
pub(crate) const SCHEME_SEPARATOR: &str = "://";

/// Where the far side of a channel should connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTarget {
    /// A fixed `host:port`
    Tcp { host: String, port: String },
    /// A Unix-domain socket path
    Unix(String),
    /// Resolved per connection by a SOCKS server on the far side
    Socks,
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteTarget::Tcp { host, port } => write!(f, "{}:{}", host, port),
            RemoteTarget::Unix(path) => write!(f, "{}{}{}", UDS_SCHEME, SCHEME_SEPARATOR, path),
            RemoteTarget::Socks => f.write_str(SOCKS_TOKEN),
        }
    }
}

impl FromStr for RemoteTarget {
    type Err = EndpointError;

    /// Decode a channel payload produced by [`RemoteTarget`]'s `Display`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == SOCKS_TOKEN {
            return Ok(RemoteTarget::Socks);
        }

        if let Some((scheme, path)) = s.split_once(SCHEME_SEPARATOR) {
            if scheme == UDS_SCHEME && !path.is_empty() {
                return Ok(RemoteTarget::Unix(path.to_string()));
            }
            return Err(EndpointError::InvalidTarget(s.to_string()));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && is_port(port) => Ok(RemoteTarget::Tcp {
                host: host.to_string(),
                port: port.to_string(),
            }),
            _ => Err(EndpointError::InvalidTarget(s.to_string())),
        }
    }
}

pub(crate) fn is_port(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
