//! Forwarding configuration

use std::path::{Path, PathBuf};

use burrow_proto::RemoteEndpoint;
use burrow_transport::SessionAccessor;
use serde::Deserialize;
use thiserror::Error;
use tracing::Span;

use crate::proxy::TunnelProxy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Forwarding rules, one proxy per entry
///
/// ```yaml
/// remotes:
///   - "3000"
///   - "8080:example.com:80"
///   - "R:2222:localhost:22"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardConfig {
    #[serde(default)]
    pub remotes: Vec<RemoteEndpoint>,
}

impl ForwardConfig {
    pub fn new(remotes: Vec<RemoteEndpoint>) -> Self {
        Self { remotes }
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Build one proxy per rule, in file order
    pub fn proxies(&self, logger: &Span, session: SessionAccessor) -> Vec<TunnelProxy> {
        self.remotes
            .iter()
            .enumerate()
            .map(|(index, endpoint)| {
                TunnelProxy::new(logger, session.clone(), index, endpoint.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn test_from_yaml() {
        let config = ForwardConfig::from_yaml_str(
            r#"
remotes:
  - "3000"
  - "8080:example.com:80"
"#,
        )
        .unwrap();

        assert_eq!(config.remotes.len(), 2);
        assert_eq!(config.remotes[0].local_port(), "3000");
        assert_eq!(config.remotes[1].remote(), "example.com:80");
    }

    #[test]
    fn test_empty_document_has_no_remotes() {
        let config = ForwardConfig::from_yaml_str("{}").unwrap();
        assert!(config.remotes.is_empty());
    }

    #[test]
    fn test_invalid_rule_fails_load() {
        let err = ForwardConfig::from_yaml_str("remotes: [\"1:2:3:4:5\"]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("1:2:3:4:5"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(ForwardConfig::from_yaml_str("remote: []").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "remotes:\n  - \"socks\"").unwrap();

        let config = ForwardConfig::load(file.path()).unwrap();
        assert!(config.remotes[0].is_socks());

        let missing = ForwardConfig::load("/nonexistent/burrow.yaml").unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }

    #[test]
    fn test_proxies_numbered_in_order() {
        let config = ForwardConfig::from_yaml_str("remotes: [\"3000\", \"4000\"]").unwrap();
        let proxies = config.proxies(&Span::none(), Arc::new(|| None));

        let ids: Vec<usize> = proxies.iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(proxies[1].label().starts_with("proxy#2:"));
    }
}
