use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::SortOptions;
use library::QueryOptions;
use serde::{Deserialize, Serialize};

use crate::engine::{EngineSettings, PlayCountRule};

pub const CONFIG_VERSION: u32 = 2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub path: String,
    pub monitored: bool,
    /// Seconds between periodic rescans; 0 scans only on demand.
    pub scan_interval: u64,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            monitored: true,
            scan_interval: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicConfig {
    pub enabled: bool,
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: 5,
            timeout_secs: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub version: u32,
    pub db_path: String,
    pub session_path: String,
    pub control_socket: String,
    pub libraries: Vec<LibraryConfig>,
    pub search_fields: Vec<String>,
    pub case_sensitive: bool,
    pub sort_articles: Vec<String>,
    pub save_debounce_secs: u64,
    pub watch_debounce_secs: u64,
    pub play_count: PlayCountRule,
    pub dynamic: DynamicConfig,
    pub pipeline_tick_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            db_path: "tonearm.redb".to_string(),
            session_path: "session.json".to_string(),
            control_socket: "tonearm.sock".to_string(),
            libraries: Vec::new(),
            search_fields: QueryOptions::default().search_fields,
            case_sensitive: false,
            sort_articles: SortOptions::default().articles,
            save_debounce_secs: 5,
            watch_debounce_secs: 2,
            play_count: PlayCountRule::default(),
            dynamic: DynamicConfig::default(),
            pipeline_tick_ms: 1000,
        }
    }
}

impl PlayerConfig {
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            search_fields: self.search_fields.clone(),
            case_sensitive: self.case_sensitive,
        }
    }

    pub fn sort_options(&self) -> SortOptions {
        SortOptions {
            articles: self.sort_articles.clone(),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            play_count: self.play_count,
            dynamic_batch: self.dynamic.batch_size,
            ..EngineSettings::default()
        }
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_secs(self.save_debounce_secs)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_secs(self.watch_debounce_secs.max(1))
    }

    pub fn dynamic_timeout(&self) -> Duration {
        Duration::from_secs(self.dynamic.timeout_secs.max(1))
    }

    pub fn pipeline_tick(&self) -> Duration {
        Duration::from_millis(self.pipeline_tick_ms.max(50))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("TONEARM_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

/// Loads the config, writing defaults when the file does not exist. Older
/// files are upgraded and written back.
pub fn load_or_create_config(path: &Path) -> Result<(PlayerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: PlayerConfig = serde_yaml::from_str(&contents)?;
        let prev_version = config.version;
        if config.db_path.trim().is_empty() {
            config.db_path = "tonearm.redb".to_string();
        }
        if config.session_path.trim().is_empty() {
            config.session_path = "session.json".to_string();
        }
        if config.control_socket.trim().is_empty() {
            config.control_socket = "tonearm.sock".to_string();
        }
        if config.search_fields.is_empty() {
            config.search_fields = QueryOptions::default().search_fields;
        }
        if prev_version < 2 && config.play_count.max_secs <= 0.0 {
            config.play_count = PlayCountRule::default();
        }
        config.libraries.retain(|library| !library.path.trim().is_empty());
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
            save_config(path, &config)?;
        }
        return Ok((config, false));
    }

    let config = PlayerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &PlayerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

/// Resolves `value` against the directory holding the config file.
pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value.trim());
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/config.yaml");
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert_eq!(config, PlayerConfig::default());
        assert_eq!(config.search_fields, vec!["title", "artist", "album"]);
        let (again, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(again, config);
    }

    #[test]
    fn older_config_is_upgraded_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "version: 1\ndb_path: ''\nlibraries:\n  - path: /music\n    scan_interval: 3600\n  - path: ''\nplay_count:\n  max_secs: 0\n",
        )
        .unwrap();
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.db_path, "tonearm.redb");
        assert_eq!(config.play_count, PlayCountRule::default());
        assert_eq!(
            config.libraries,
            vec![LibraryConfig {
                path: "/music".to_string(),
                monitored: true,
                scan_interval: 3600,
            }]
        );
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("version: 2"));
    }

    #[test]
    fn relative_paths_resolve_next_to_the_config() {
        let config_path = Path::new("/etc/tonearm/config.yaml");
        assert_eq!(
            resolve_path(config_path, "tonearm.redb"),
            PathBuf::from("/etc/tonearm/tonearm.redb")
        );
        assert_eq!(resolve_path(config_path, "/var/db"), PathBuf::from("/var/db"));
        assert_eq!(
            resolve_path(Path::new("config.yaml"), "x.json"),
            PathBuf::from("./x.json")
        );
    }

    #[test]
    fn derived_settings_follow_the_config() {
        let mut config = PlayerConfig::default();
        config.case_sensitive = true;
        config.dynamic.batch_size = 9;
        assert!(config.query_options().case_sensitive);
        assert_eq!(config.engine_settings().dynamic_batch, 9);
        assert_eq!(config.sort_options().articles, vec!["the"]);
    }
}
