//! Ambient configuration: worker count, debug flag, spill directory, log
//! level. Loaded from an optional TOML file, overridden by `NWORKERS`/
//! `DEBUG` environment variables, with CLI flags taking highest precedence.

use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_spill_dir() -> PathBuf {
    std::env::temp_dir().join("maprunner")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The engine's tunables, after file/env/CLI precedence has been resolved.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub nworkers: Option<usize>,
    pub debug: bool,
    pub spill_dir: PathBuf,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nworkers: None,
            debug: false,
            spill_dir: default_spill_dir(),
            log_level: default_log_level(),
        }
    }
}

/// The shape of an on-disk TOML config file. Every field is optional: a
/// file may set only the tunables it cares about.
#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
    nworkers: Option<usize>,
    debug: Option<bool>,
    spill_dir: Option<PathBuf>,
    log_level: Option<String>,
}

/// CLI-supplied overrides, highest precedence. `None` means "not given on
/// the command line", not "explicitly disabled".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub nworkers: Option<usize>,
    pub debug: Option<bool>,
    pub spill_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

/// Resolves an [`EngineConfig`] from, in ascending precedence: built-in
/// defaults, an optional TOML file, `NWORKERS`/`DEBUG` environment
/// variables, then `cli`.
pub fn load(path: Option<&Path>, cli: CliOverrides) -> anyhow::Result<EngineConfig> {
    let file = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
            toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?
        }
        None => FileConfig::default(),
    };

    let mut config = EngineConfig::default();
    if let Some(n) = file.nworkers {
        config.nworkers = Some(n);
    }
    if let Some(d) = file.debug {
        config.debug = d;
    }
    if let Some(dir) = file.spill_dir {
        config.spill_dir = dir;
    }
    if let Some(level) = file.log_level {
        config.log_level = level;
    }

    if let Ok(n) = std::env::var("NWORKERS") {
        if let Ok(n) = n.parse() {
            config.nworkers = Some(n);
        }
    }
    if let Ok(d) = std::env::var("DEBUG") {
        config.debug = d != "0" && !d.is_empty();
    }

    if let Some(n) = cli.nworkers {
        config.nworkers = Some(n);
    }
    if let Some(d) = cli.debug {
        config.debug = d;
    }
    if let Some(dir) = cli.spill_dir {
        config.spill_dir = dir;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_is_supplied() {
        std::env::remove_var("NWORKERS");
        std::env::remove_var("DEBUG");
        let config = load(None, CliOverrides::default()).unwrap();
        assert_eq!(config.nworkers, None);
        assert!(!config.debug);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn file_values_are_applied() {
        std::env::remove_var("NWORKERS");
        std::env::remove_var("DEBUG");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "nworkers = 4\nlog_level = \"debug\"\n").unwrap();
        let config = load(Some(&path), CliOverrides::default()).unwrap();
        assert_eq!(config.nworkers, Some(4));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn cli_overrides_beat_file_and_env() {
        std::env::set_var("NWORKERS", "2");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "nworkers = 4\n").unwrap();
        let cli = CliOverrides {
            nworkers: Some(8),
            ..Default::default()
        };
        let config = load(Some(&path), cli).unwrap();
        std::env::remove_var("NWORKERS");
        assert_eq!(config.nworkers, Some(8));
    }
}
