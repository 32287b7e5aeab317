//! Engine-wide configuration
//!
//! One value constructed before any tensor or executor activity and passed
//! by reference wherever allocation or dispatch decisions need it. It is
//! plain data; nothing mutates it once the engine is running.

use serde::Deserialize;

use crate::device::DeviceKind;
use crate::error::Result;

/// Knobs read by the weight store and the executor
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Worker threads for the row-quantization pool on the save path
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Defer embedding payloads at load time, keeping only file offsets
    #[serde(default)]
    pub low_mem: bool,
    /// Pin sequentially-extended caches to host memory during dispatch
    #[serde(default)]
    pub cache_on_host: bool,
    /// Dispatch target when operand placement does not decide one
    #[serde(default)]
    pub device: DeviceKind,
}

fn default_threads() -> usize {
    8
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            low_mem: false,
            cache_on_host: false,
            device: DeviceKind::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a config from JSON; absent fields take their defaults.
    ///
    /// # Errors
    /// Returns [`crate::Error::Json`] on malformed input.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.threads, 8);
        assert!(!cfg.low_mem);
        assert!(!cfg.cache_on_host);
        assert_eq!(cfg.device, DeviceKind::Host);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg = EngineConfig::from_json(r#"{"threads": 2}"#).unwrap();
        assert_eq!(cfg.threads, 2);
        assert!(!cfg.low_mem);
        assert_eq!(cfg.device, DeviceKind::Host);
    }

    #[test]
    fn test_full_json() {
        let cfg = EngineConfig::from_json(
            r#"{"threads": 1, "low_mem": true, "cache_on_host": true, "device": "accel"}"#,
        )
        .unwrap();
        assert_eq!(cfg.threads, 1);
        assert!(cfg.low_mem);
        assert!(cfg.cache_on_host);
        assert_eq!(cfg.device, DeviceKind::Accel);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(EngineConfig::from_json("{").is_err());
    }
}
