use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FingerprintError, Result};
use crate::scanner::QueryAxes;

pub const DEFAULT_PORT: u16 = 53;
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_WORKERS: usize = 100;

/// Per-probe settings shared by fingerprint collection and scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub port: u16,
    pub timeout: Duration,
    /// Upper bound on probes in flight.
    pub workers: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            workers: DEFAULT_WORKERS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub holdout_fraction: f64,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            holdout_fraction: 0.2,
            seed: 1,
        }
    }
}

/// `<data dir>/dnsprint`, or `./dnsprint` where the platform has no data dir.
pub fn default_artifacts_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dnsprint")
}

/// Query axes from a JSON file; axes missing from the file keep their defaults.
pub fn load_axes(path: Option<&Path>) -> Result<QueryAxes> {
    match path {
        None => Ok(QueryAxes::default()),
        Some(path) => {
            let raw = fs::read_to_string(path).map_err(|e| FingerprintError::file(path, e))?;
            Ok(serde_json::from_str(&raw)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::wire::DnsClass;

    #[test]
    fn test_defaults() {
        let probe = ProbeConfig::default();
        assert_eq!(probe.port, 53);
        assert_eq!(probe.timeout, Duration::from_secs(5));
        assert_eq!(probe.workers, 100);
        assert_eq!(TrainConfig::default().seed, 1);
        assert!(default_artifacts_dir().ends_with("dnsprint"));
    }

    #[test]
    fn test_partial_axes_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("axes.json");
        fs::write(&path, r#"{"classes": ["IN", "CH"]}"#).unwrap();

        let axes = load_axes(Some(&path)).unwrap();
        assert_eq!(axes.classes, vec![DnsClass::IN, DnsClass::CH]);
        assert_eq!(axes.opcodes, QueryAxes::default().opcodes);
        assert_eq!(load_axes(None).unwrap(), QueryAxes::default());
    }
}
