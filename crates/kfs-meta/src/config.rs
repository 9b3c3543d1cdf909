//! Metaserver log configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where and how the operation log and checkpoints are kept.
///
/// `log_dir` is fixed before the log worker starts and is not changed while
/// logging is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Directory holding `log.<n>` files.
    pub log_dir: PathBuf,
    /// Directory holding `chkpt.<seqno>` files.
    pub checkpoint_dir: PathBuf,
    /// Seconds between periodic checkpoints.
    pub checkpoint_interval_secs: u64,
    /// Call `sync_data` after every appended record.
    pub sync_on_commit: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("/var/lib/kfs/logs"),
            checkpoint_dir: PathBuf::from("/var/lib/kfs/checkpoints"),
            checkpoint_interval_secs: 600,
            sync_on_commit: true,
        }
    }
}

impl LoggerConfig {
    /// A configuration rooted at `dir`, with `logs/` and `checkpoints/` below it.
    pub fn with_root(dir: &Path) -> Self {
        Self {
            log_dir: dir.join("logs"),
            checkpoint_dir: dir.join("checkpoints"),
            ..Self::default()
        }
    }

    /// Loads a TOML or JSON configuration, chosen by file extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_default_values() {
        let config = LoggerConfig::default();
        assert_eq!(config.log_dir, PathBuf::from("/var/lib/kfs/logs"));
        assert_eq!(config.checkpoint_interval_secs, 600);
        assert!(config.sync_on_commit);
    }

    #[test]
    fn test_with_root() {
        let config = LoggerConfig::with_root(Path::new("/tmp/kfs"));
        assert_eq!(config.log_dir, PathBuf::from("/tmp/kfs/logs"));
        assert_eq!(config.checkpoint_dir, PathBuf::from("/tmp/kfs/checkpoints"));
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
log_dir = "/data/kfs/logs"
checkpoint_dir = "/data/kfs/cp"
checkpoint_interval_secs = 30
            "#
        )
        .unwrap();

        let config = LoggerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.log_dir, PathBuf::from("/data/kfs/logs"));
        assert_eq!(config.checkpoint_dir, PathBuf::from("/data/kfs/cp"));
        assert_eq!(config.checkpoint_interval_secs, 30);
        assert!(config.sync_on_commit);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(
            file,
            r#"{{ "log_dir": "/j/logs", "sync_on_commit": false }}"#
        )
        .unwrap();

        let config = LoggerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.log_dir, PathBuf::from("/j/logs"));
        assert!(!config.sync_on_commit);
        assert_eq!(config.checkpoint_interval_secs, 600);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(LoggerConfig::from_file(file.path()).is_err());
    }
}
