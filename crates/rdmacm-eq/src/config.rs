//! Event queue configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EqError, EqResult};

/// Wait object used to block in `sread`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitObj {
    /// No wait object requested; normalised to `Fd`.
    None,
    /// Provider's choice; normalised to `Fd`.
    Unspec,
    /// Single readiness descriptor.
    Fd,
    /// Poll set of descriptors.
    PollFd,
    /// Mutex plus condition variable. Not supported.
    MutexCond,
    /// Busy yield. Not supported.
    Yield,
}

impl WaitObj {
    /// Normalises the requested wait object, rejecting unsupported kinds.
    pub fn normalize(self) -> EqResult<WaitObj> {
        match self {
            WaitObj::None | WaitObj::Unspec | WaitObj::Fd => Ok(WaitObj::Fd),
            WaitObj::PollFd => Ok(WaitObj::PollFd),
            other => Err(EqError::NotSupported(format!("wait object {:?}", other))),
        }
    }
}

/// XRC connection setup knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XrcConfig {
    /// Transparent retries of an active-side connect error before it surfaces.
    pub max_connect_retries: u32,
    /// Bits of a connection tag used for the table index; the rest carry the
    /// slot generation.
    pub conn_tag_index_bits: u8,
}

impl Default for XrcConfig {
    fn default() -> Self {
        Self {
            max_connect_retries: 16,
            conn_tag_index_bits: 18,
        }
    }
}

/// Event queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EqConfig {
    /// Allow application writes into the queue.
    pub writable: bool,
    /// Wait object for blocking reads.
    pub wait_obj: WaitObj,
    /// Address and route resolution timeout in milliseconds.
    pub resolve_timeout_ms: u64,
    /// XRC settings.
    pub xrc: XrcConfig,
}

impl Default for EqConfig {
    fn default() -> Self {
        Self {
            writable: false,
            wait_obj: WaitObj::Unspec,
            resolve_timeout_ms: 2000,
            xrc: XrcConfig::default(),
        }
    }
}

impl EqConfig {
    /// Resolution timeout as a duration.
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: EqConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: EqConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = EqConfig::default();
        assert!(!config.writable);
        assert_eq!(config.wait_obj, WaitObj::Unspec);
        assert_eq!(config.resolve_timeout(), Duration::from_secs(2));
        assert_eq!(config.xrc.max_connect_retries, 16);
        assert_eq!(config.xrc.conn_tag_index_bits, 18);
    }

    #[test]
    fn test_wait_obj_normalize() {
        assert_eq!(WaitObj::None.normalize().unwrap(), WaitObj::Fd);
        assert_eq!(WaitObj::Unspec.normalize().unwrap(), WaitObj::Fd);
        assert_eq!(WaitObj::PollFd.normalize().unwrap(), WaitObj::PollFd);
        assert!(matches!(
            WaitObj::MutexCond.normalize(),
            Err(EqError::NotSupported(_))
        ));
        assert!(WaitObj::Yield.normalize().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
writable = true
wait_obj = "poll_fd"

[xrc]
max_connect_retries = 2
"#
        )
        .unwrap();

        let config = EqConfig::from_file(file.path()).unwrap();
        assert!(config.writable);
        assert_eq!(config.wait_obj, WaitObj::PollFd);
        assert_eq!(config.xrc.max_connect_retries, 2);
        assert_eq!(config.xrc.conn_tag_index_bits, 18);
        assert_eq!(config.resolve_timeout_ms, 2000);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"resolve_timeout_ms": 500}}"#).unwrap();

        let config = EqConfig::from_file(file.path()).unwrap();
        assert_eq!(config.resolve_timeout_ms, 500);
        assert!(!config.writable);
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(EqConfig::from_file(file.path()).is_err());
    }
}
