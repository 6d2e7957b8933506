//! Engine configuration loaded from YAML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Settings used by [`crate::BpmnEngine::from_config`].
///
/// ```yaml
/// name: orders
/// machine_id: 42
/// snapshot_compression: best
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine name, stored in snapshots.
    pub name: String,
    /// Machine id for the snowflake key generator. Derived from the
    /// environment when absent.
    pub machine_id: Option<u16>,
    pub snapshot_compression: SnapshotCompression,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "bpmn-engine".to_string(),
            machine_id: None,
            snapshot_compression: SnapshotCompression::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Parsing engine configuration")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }
}

/// DEFLATE level for definition sources embedded in snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotCompression {
    Fast,
    #[default]
    Default,
    Best,
}

impl SnapshotCompression {
    pub fn level(self) -> flate2::Compression {
        match self {
            Self::Fast => flate2::Compression::fast(),
            Self::Default => flate2::Compression::default(),
            Self::Best => flate2::Compression::best(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let config = EngineConfig::from_yaml_str("machine_id: 7\n").unwrap();
        assert_eq!(config.name, "bpmn-engine");
        assert_eq!(config.machine_id, Some(7));
        assert_eq!(config.snapshot_compression, SnapshotCompression::Default);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name: orders\nsnapshot_compression: best").unwrap();
        let config = EngineConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.name, "orders");
        assert_eq!(config.machine_id, None);
        assert_eq!(config.snapshot_compression, SnapshotCompression::Best);
    }

    #[test]
    fn test_unknown_compression_is_rejected() {
        let err = EngineConfig::from_yaml_str("snapshot_compression: turbo").unwrap_err();
        assert!(err.to_string().contains("Parsing engine configuration"));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = EngineConfig::load_from_file(Path::new("/nonexistent/engine.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/engine.yaml"));
    }
}
