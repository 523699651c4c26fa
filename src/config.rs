//! TOML configuration.
//!
//! ```toml
//! [parser]
//! max_message_size = 1073741824
//!
//! [pool]
//! jitter_min_ms = 0
//! jitter_max_ms = 1000
//! socket_timeout_ms = 30000
//! write_queue_depth = 16
//! read_buffer_size = 8192
//! ```
//!
//! Every key is optional.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::ManagerConfig;
use crate::error::{PgWireError, PgWireResult};
use crate::protocol::parser::DEFAULT_MAX_MESSAGE_SIZE;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WireConfig {
    pub parser: ParserConfig,
    pub pool: PoolSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParserConfig {
    pub max_message_size: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    /// Absent means no inactivity timeout.
    pub socket_timeout_ms: Option<u64>,
    pub write_queue_depth: usize,
    pub read_buffer_size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let defaults = ManagerConfig::default();
        Self {
            jitter_min_ms: defaults.jitter_min.as_millis() as u64,
            jitter_max_ms: defaults.jitter_max.as_millis() as u64,
            socket_timeout_ms: defaults.socket_timeout.map(|t| t.as_millis() as u64),
            write_queue_depth: defaults.write_queue_depth,
            read_buffer_size: defaults.read_buffer_size,
        }
    }
}

impl PoolSettings {
    pub fn to_manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            jitter_min: Duration::from_millis(self.jitter_min_ms),
            jitter_max: Duration::from_millis(self.jitter_max_ms),
            socket_timeout: self.socket_timeout_ms.map(Duration::from_millis),
            write_queue_depth: self.write_queue_depth,
            read_buffer_size: self.read_buffer_size,
        }
    }
}

impl WireConfig {
    pub fn from_toml_str(content: &str) -> PgWireResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| PgWireError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or from `default_path()` when none is given.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> PgWireResult<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        let config = Self::from_toml_str(&content)
            .map_err(|e| PgWireError::config(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// `<config dir>/pgwire/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pgwire").join("config.toml"))
    }

    pub fn to_toml_string(&self) -> PgWireResult<String> {
        toml::to_string_pretty(self).map_err(|e| PgWireError::config(e.to_string()))
    }

    pub fn manager_config(&self) -> ManagerConfig {
        self.pool.to_manager_config()
    }

    fn validate(&self) -> PgWireResult<()> {
        if self.parser.max_message_size < 5 {
            return Err(PgWireError::config("parser.max_message_size must be at least 5"));
        }
        if self.pool.jitter_min_ms > self.pool.jitter_max_ms {
            return Err(PgWireError::config(
                "pool.jitter_min_ms is greater than pool.jitter_max_ms",
            ));
        }
        if self.pool.write_queue_depth == 0 {
            return Err(PgWireError::config("pool.write_queue_depth must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(WireConfig::from_toml_str("").unwrap(), WireConfig::default());
    }

    #[test]
    fn test_partial_document() {
        let config = WireConfig::from_toml_str(
            r#"
            [pool]
            jitter_max_ms = 250
            socket_timeout_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.parser, ParserConfig::default());
        let manager = config.manager_config();
        assert_eq!(manager.jitter_min, Duration::ZERO);
        assert_eq!(manager.jitter_max, Duration::from_millis(250));
        assert_eq!(manager.socket_timeout, Some(Duration::from_secs(5)));
        assert_eq!(manager.write_queue_depth, 16);
    }

    #[test]
    fn test_defaults_match_manager_defaults() {
        assert_eq!(WireConfig::default().manager_config(), ManagerConfig::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        for doc in [
            "[pool]\njitter_min_ms = 10\njitter_max_ms = 5",
            "[pool]\nwrite_queue_depth = 0",
            "[parser]\nmax_message_size = 4",
            "[pool]\nunknown_key = 1",
        ] {
            let err = WireConfig::from_toml_str(doc).unwrap_err();
            assert!(matches!(err, PgWireError::Config(_)), "{doc}: {err}");
        }
    }

    #[test]
    fn test_missing_file_is_default() {
        let path = std::env::temp_dir().join("pgwire-config-does-not-exist.toml");
        assert_eq!(WireConfig::load(Some(&path)).unwrap(), WireConfig::default());
    }

    #[test]
    fn test_load_and_render() {
        let path = std::env::temp_dir().join(format!("pgwire-config-{}.toml", std::process::id()));
        fs::write(&path, "[parser]\nmax_message_size = 65536\n").unwrap();
        let config = WireConfig::load(Some(&path)).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(config.parser.max_message_size, 65536);

        let rendered = config.to_toml_string().unwrap();
        assert_eq!(WireConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
