//! Forwarding rule shorthand
//!
//! A rule is written as up to four colon-separated segments, optionally
//! prefixed with `R:` for reverse forwarding. Segments are read right to left
//! so that ports and the trailing mode token are settled before anything is
//! treated as a host:
//!
//! ```text
//! 3000                           local 0.0.0.0:3000     remote 0.0.0.0:3000
//! foobar.com:3000                local 0.0.0.0:3000     remote foobar.com:3000
//! 3000:google.com:80             local 0.0.0.0:3000     remote google.com:80
//! 192.168.0.1:3000:google.com:80 local 192.168.0.1:3000 remote google.com:80
//! 3000:unix:///tmp/mysql.sock    local 0.0.0.0:3000     remote unix:///tmp/mysql.sock
//! unix:///tmp/app.sock:3000      local unix /tmp/app.sock remote 0.0.0.0:3000
//! socks                          local 127.0.0.1:1080   remote socks
//! 5000:socks                     local 127.0.0.1:5000   remote socks
//! R:2222:localhost:22            reverse, listens on 0.0.0.0:2222
//! ```

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::EndpointError;
use crate::target::{is_port, RemoteTarget, SCHEME_SEPARATOR, SOCKS_TOKEN, UDS_SCHEME};
use crate::{DEFAULT_HOST, DEFAULT_SOCKS_HOST, DEFAULT_SOCKS_PORT};

const REVERSE_PREFIX: &str = "R:";
const MAX_SEGMENTS: usize = 4;

/// A parsed forwarding rule
///
/// When `local_host` is `unix`, `local_port` holds the path of the
/// Unix-domain socket to listen on. When the remote side is a Unix-domain
/// socket, `remote_port` holds its path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct RemoteEndpoint {
    local_host: String,
    local_port: String,
    remote_host: String,
    remote_port: String,
    socks: bool,
    uds: bool,
    reverse: bool,
}

impl RemoteEndpoint {
    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    pub fn local_port(&self) -> &str {
        &self.local_port
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> &str {
        &self.remote_port
    }

    /// The remote side is a SOCKS server instead of a fixed target
    pub fn is_socks(&self) -> bool {
        self.socks
    }

    /// The remote target is a Unix-domain socket
    pub fn is_uds(&self) -> bool {
        self.uds
    }

    /// The listening side is the remote system
    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    /// Whether the listening side binds a Unix-domain socket
    pub fn listens_on_unix(&self) -> bool {
        self.local_host == UDS_SCHEME
    }

    pub fn target(&self) -> RemoteTarget {
        if self.socks {
            RemoteTarget::Socks
        } else if self.uds {
            RemoteTarget::Unix(self.remote_port.clone())
        } else {
            RemoteTarget::Tcp {
                host: self.remote_host.clone(),
                port: self.remote_port.clone(),
            }
        }
    }

    /// Canonical remote encoding, sent as the channel-open payload
    pub fn remote(&self) -> String {
        self.target().to_string()
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reverse {
            f.write_str(REVERSE_PREFIX)?;
        }
        write!(
            f,
            "{}:{}=>{}",
            self.local_host,
            self.local_port,
            self.target()
        )
    }
}

impl FromStr for RemoteEndpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (reverse, rest) = match s.strip_prefix(REVERSE_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let segments = split_segments(rest);
        if segments.is_empty() || segments.len() > MAX_SEGMENTS {
            return Err(EndpointError::InvalidRemote(s.to_string()));
        }

        let mut draft = Draft {
            reverse,
            ..Draft::default()
        };
        let last = segments.len() - 1;

        for (i, segment) in segments.iter().enumerate().rev() {
            match *segment {
                Segment::Plain(p) if i == last && p == SOCKS_TOKEN => {
                    if reverse {
                        return Err(EndpointError::SocksReverse);
                    }
                    draft.socks = true;
                }
                Segment::Plain(p) if is_port(p) => draft.port(p, s)?,
                Segment::Unix(path) => {
                    if reverse {
                        check_unix_socket(path)?;
                    }
                    if i == last {
                        draft.uds = true;
                        draft.remote_host = Some(UDS_SCHEME.to_string());
                        draft.remote_port = Some(path.to_string());
                    } else if i == 0 && !draft.local_port_explicit {
                        draft.local_host = Some(UDS_SCHEME.to_string());
                        draft.local_port = Some(path.to_string());
                        draft.local_port_explicit = true;
                    } else {
                        return Err(EndpointError::Ambiguous(s.to_string()));
                    }
                }
                Segment::Plain(p) => draft.host(p, s)?,
            }
        }

        draft.finish(s)
    }
}

impl TryFrom<String> for RemoteEndpoint {
    type Error = EndpointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Plain(&'a str),
    /// `unix://<path>`, stored without the scheme
    Unix(&'a str),
}

/// Split on `:` while keeping `unix://<path>` together
fn split_segments(s: &str) -> Vec<Segment<'_>> {
    let parts: Vec<&str> = s.split(':').collect();
    let mut segments = Vec::with_capacity(parts.len());
    let mut i = 0;
    while i < parts.len() {
        let part = parts[i];
        if part == UDS_SCHEME && i + 1 < parts.len() {
            if let Some(path) = parts[i + 1].strip_prefix(&SCHEME_SEPARATOR[1..]) {
                if !path.is_empty() {
                    segments.push(Segment::Unix(path));
                    i += 2;
                    continue;
                }
            }
        }
        segments.push(Segment::Plain(part));
        i += 1;
    }
    segments
}

fn is_host(s: &str) -> bool {
    url::Host::parse(s).is_ok()
}

fn check_unix_socket(path: &str) -> Result<(), EndpointError> {
    if !cfg!(unix) {
        return Err(EndpointError::UnixSocketUnsupported);
    }
    match std::fs::metadata(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(EndpointError::UnixSocketMissing(path.to_string()))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Default)]
struct Draft {
    local_host: Option<String>,
    local_port: Option<String>,
    local_port_explicit: bool,
    remote_host: Option<String>,
    remote_port: Option<String>,
    socks: bool,
    uds: bool,
    reverse: bool,
}

impl Draft {
    /// The first port seen from the right is both remote and local; the next
    /// one to its left overrides the local side.
    fn port(&mut self, port: &str, input: &str) -> Result<(), EndpointError> {
        if !self.socks && self.remote_port.is_none() {
            self.remote_port = Some(port.to_string());
            self.local_port = Some(port.to_string());
        } else if self.local_port_explicit {
            return Err(EndpointError::Ambiguous(input.to_string()));
        } else {
            self.local_port = Some(port.to_string());
            self.local_port_explicit = true;
        }
        Ok(())
    }

    fn host(&mut self, host: &str, input: &str) -> Result<(), EndpointError> {
        if !self.socks && self.remote_port.is_none() && self.local_port.is_none() {
            return Err(EndpointError::MissingPorts(input.to_string()));
        }
        if !is_host(host) {
            return Err(EndpointError::InvalidHost(host.to_string()));
        }
        if !self.socks && self.remote_host.is_none() {
            self.remote_host = Some(host.to_string());
        } else if self.local_host.is_some() {
            return Err(EndpointError::Ambiguous(input.to_string()));
        } else {
            self.local_host = Some(host.to_string());
        }
        Ok(())
    }

    fn finish(self, input: &str) -> Result<RemoteEndpoint, EndpointError> {
        let local_host = self.local_host.unwrap_or_else(|| {
            if self.socks {
                DEFAULT_SOCKS_HOST.to_string()
            } else {
                DEFAULT_HOST.to_string()
            }
        });

        let local_port = match self.local_port {
            Some(port) => port,
            None if self.socks => DEFAULT_SOCKS_PORT.to_string(),
            None => return Err(EndpointError::MissingPorts(input.to_string())),
        };

        let remote_host = match self.remote_host {
            Some(host) => host,
            None if self.socks => String::new(),
            None => DEFAULT_HOST.to_string(),
        };

        Ok(RemoteEndpoint {
            local_host,
            local_port,
            remote_host,
            remote_port: self.remote_port.unwrap_or_default(),
            socks: self.socks,
            uds: self.uds,
            reverse: self.reverse,
        })
    }
}
