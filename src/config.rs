//! Analysis settings.
//!
//! ```toml
//! hop_limit = 16
//! include_receiver = false
//! threads = 4
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Default bound on register-to-register moves followed by the resolver.
pub const DEFAULT_HOP_LIMIT: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Maximum number of moves followed before a binding is given up as unresolved
    pub hop_limit: usize,
    /// Report the receiver of instance invokes as the first binding
    pub include_receiver: bool,
    /// Worker threads used to parse units, `None` uses the global rayon pool
    pub threads: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hop_limit: DEFAULT_HOP_LIMIT,
            include_receiver: false,
            threads: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Config> {
        let config: Config = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        if config.threads == Some(0) {
            return Err(Error::Config("threads must be at least 1".to_string()));
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let s = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Config::from_toml_str(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
        assert_eq!(Config::default().hop_limit, 16);
    }

    #[test]
    fn partial_document() {
        let c = Config::from_toml_str("hop_limit = 3\nthreads = 2\n").unwrap();
        assert_eq!(c.hop_limit, 3);
        assert_eq!(c.threads, Some(2));
        assert!(!c.include_receiver);
    }

    #[test]
    fn rejects_bad_documents() {
        assert!(matches!(Config::from_toml_str("hop_limit = \"x\""), Err(Error::Config(_))));
        assert!(matches!(Config::from_toml_str("colour = true"), Err(Error::Config(_))));
        assert!(matches!(Config::from_toml_str("threads = 0"), Err(Error::Config(_))));
    }

    #[test]
    fn missing_file_is_io() {
        let e = Config::from_file(Path::new("tests/fixtures/does-not-exist.toml")).unwrap_err();
        assert!(matches!(e, Error::Io { .. }));
    }
}
