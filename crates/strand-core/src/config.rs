//! Runtime configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const MIN_STACK_SIZE: usize = 64 * 1024;

/// Configuration passed explicitly into a [`crate::Runtime`].
///
/// Every field has a default, so `{}` is a valid config document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads are named `<prefix>-<n>`.
    pub thread_name_prefix: String,

    /// Stack size for worker threads, in bytes. `None` uses the platform default.
    pub stack_size: Option<usize>,

    /// How long `spawn` waits for a module's `init` before giving up, in milliseconds.
    /// `None` waits indefinitely.
    pub init_timeout_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "strand-worker".to_string(),
            stack_size: None,
            init_timeout_ms: None,
        }
    }
}

impl RuntimeConfig {
    /// Parses a config from JSON and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// JSON ファイルから読み込む
    ///
    /// # 実装
    /// 1. ファイルを文字列として読む
    /// 2. `from_json_str` で parse + validate
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// `None` means spawn waits for `init` without bound.
    pub fn init_timeout(&self) -> Option<Duration> {
        self.init_timeout_ms.map(Duration::from_millis)
    }

    /// Rejects an empty thread name prefix and a too-small stack size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_name_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "thread_name_prefix",
                message: "must not be empty".to_string(),
            });
        }
        if let Some(size) = self.stack_size
            && size < MIN_STACK_SIZE
        {
            return Err(ConfigError::Invalid {
                field: "stack_size",
                message: format!("must be at least {MIN_STACK_SIZE} bytes, got {size}"),
            });
        }
        if self.init_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "init_timeout_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
