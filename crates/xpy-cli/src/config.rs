//! Configuration file parsing for xpy.toml.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use xpy_jit::JitConfig;

/// Main configuration structure.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Compiler settings
    #[serde(default)]
    pub jit: JitConfig,

    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Default `tracing` filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "warn".to_string()
}

/// Load configuration from a file or search for a default config file.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        if !path.exists() {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        return read_config(path);
    }
    match find_config_file() {
        Some(path) => read_config(&path),
        None => Ok(Config::default()),
    }
}

fn read_config(path: &Path) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))
}

/// Search for a configuration file in the current directory and its parents.
fn find_config_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    find_config_in_ancestors(&cwd)
}

fn find_config_in_ancestors(start: &Path) -> Option<PathBuf> {
    const CONFIG_NAMES: &[&str] = &["xpy.toml", ".xpy.toml"];

    let mut dir = Some(start);
    while let Some(current) = dir {
        for name in CONFIG_NAMES {
            let path = current.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        dir = current.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpy_jit::OptLevel;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.jit.verify);
        assert!(!config.jit.keep_ir);
        assert_eq!(config.log.filter, "warn");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[jit]
opt_level = "none"
keep_ir = true

[log]
filter = "xpy_jit=debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.jit.opt_level, OptLevel::None);
        assert!(config.jit.keep_ir);
        assert!(config.jit.verify);
        assert_eq!(config.log.filter, "xpy_jit=debug");
    }

    #[test]
    fn test_unknown_opt_level_is_rejected() {
        let toml = "[jit]\nopt_level = \"fastest\"\n";
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_find_config_in_parent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("xpy.toml"), "[log]\nfilter = \"info\"\n").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_in_ancestors(&nested).unwrap();
        assert_eq!(found, dir.path().join("xpy.toml"));
        let config = load_config(Some(&found)).unwrap();
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn test_missing_explicit_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
