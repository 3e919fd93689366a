// src/config.rs

use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default analyzer timeout per file.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Name of the optional config file looked up in the source work tree.
pub const CONFIG_FILE_NAME: &str = ".gradon.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {}: {error}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("invalid config file {}: {error}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        error: toml::de::Error,
    },

    #[error("invalid exclude pattern '{pattern}': {error}")]
    Pattern {
        pattern: String,
        #[source]
        error: regex::Error,
    },
}

/// Settings read from `.gradon.toml`. Every field is optional; command
/// line flags take precedence.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub destination: Option<PathBuf>,
    pub ledger: Option<PathBuf>,
    pub range: Option<String>,
    pub extensions: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub jobs: Option<usize>,
    pub analyzer: Option<AnalyzerConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AnalyzerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_path_buf(),
            error,
        })?;
        toml::from_str(&text).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    /// Loads `path` if given, else `<root>/.gradon.toml` when it exists.
    pub fn discover(path: Option<&Path>, root: Option<&Path>) -> Result<Self, ConfigError> {
        match (path, root) {
            (Some(path), _) => Self::load(path),
            (None, Some(root)) if root.join(CONFIG_FILE_NAME).is_file() => {
                Self::load(&root.join(CONFIG_FILE_NAME))
            }
            _ => Ok(Self::default()),
        }
    }
}

/// Decides which source files get statistics.
#[derive(Debug, Clone)]
pub struct TrackingRules {
    extensions: Vec<String>,
    exclude: Vec<Regex>,
}

impl Default for TrackingRules {
    fn default() -> Self {
        TrackingRules {
            extensions: vec!["py".to_string()],
            exclude: Vec::new(),
        }
    }
}

impl TrackingRules {
    pub fn new<S: AsRef<str>>(extensions: &[S], exclude: &[S]) -> Result<Self, ConfigError> {
        let exclude = exclude
            .iter()
            .map(|pattern| {
                Regex::new(pattern.as_ref()).map_err(|error| ConfigError::Pattern {
                    pattern: pattern.as_ref().to_string(),
                    error,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TrackingRules {
            extensions: extensions
                .iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_string())
                .collect(),
            exclude,
        })
    }

    /// True when `path` has a tracked extension and no exclude pattern
    /// matches it.
    pub fn is_tracked(&self, path: &str) -> bool {
        let extension = Path::new(path).extension().and_then(|e| e.to_str());
        let has_extension = extension.is_some_and(|ext| self.extensions.iter().any(|e| e == ext));
        has_extension && !self.exclude.iter().any(|re| re.is_match(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rules_track_python() {
        let rules = TrackingRules::default();
        assert!(rules.is_tracked("a/foo.py"));
        assert!(!rules.is_tracked("a/foo.rs"));
        assert!(!rules.is_tracked("a/py"));
    }

    #[test]
    fn exclude_patterns_match_full_path() {
        let rules = TrackingRules::new(&[".py", "pyi"], &["^vendor/", "ignored-file"]).unwrap();
        assert!(rules.is_tracked("src/stubs.pyi"));
        assert!(!rules.is_tracked("vendor/lib.py"));
        assert!(!rules.is_tracked("src/ignored-file.py"));
        assert!(rules.is_tracked("src/vendor/lib.py"));
    }

    #[test]
    fn bad_pattern_is_reported() {
        let err = TrackingRules::new(&["py"], &["("]).unwrap_err();
        assert!(matches!(err, ConfigError::Pattern { .. }));
    }

    #[test]
    fn parses_config_file() {
        let config: FileConfig = toml::from_str(
            r#"
            destination = "/tmp/shadow"
            extensions = ["py"]
            exclude = ["^build/"]
            jobs = 4

            [analyzer]
            command = "gradon-radon"
            args = ["--path", "{path}"]
            "#,
        )
        .unwrap();
        assert_eq!(config.destination, Some(PathBuf::from("/tmp/shadow")));
        assert_eq!(config.jobs, Some(4));
        let analyzer = config.analyzer.unwrap();
        assert_eq!(analyzer.command, "gradon-radon");
        assert_eq!(analyzer.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("destnation = \"x\"").is_err());
    }
}
