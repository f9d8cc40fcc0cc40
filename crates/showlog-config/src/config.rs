/// Application configuration: load, save, and sanitize.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Database file name used when none is configured.
pub const DEFAULT_DATABASE_FILE: &str = "show.db";

/// Log filter used when none is configured.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Top-level application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Show database. Relative paths resolve against the data directory.
    pub database_file: String,
    /// Max undo groups retained (`<= 0` = unbounded).
    pub group_limit: i64,
    /// Tables that get history triggers. Empty = the built-in show tables.
    pub tracked_tables: Vec<String>,
    pub enforce_foreign_keys: bool,
    /// `tracing` filter directive, e.g. `info` or `showlog_mod_history=debug`.
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_file: DEFAULT_DATABASE_FILE.to_string(),
            group_limit: 500,
            tracked_tables: Vec::new(),
            enforce_foreign_keys: true,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl AppConfig {
    /// Returns the config file path: `<config dir>/showlog/showlog.json`,
    /// or next to the executable when the platform has no config dir.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("showlog").join("showlog.json"))
            .or_else(|| {
                std::env::current_exe()
                    .ok()
                    .and_then(|p| p.parent().map(|d| d.join("showlog.json")))
            })
            .unwrap_or_else(|| PathBuf::from("showlog.json"))
    }

    /// Resolves the data directory.
    ///
    /// Resolution order:
    /// 1. `SHOWLOG_DATA_DIR` environment variable
    /// 2. `<data dir>/showlog`
    /// 3. `.data/` next to the executable
    pub fn data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("SHOWLOG_DATA_DIR") {
            return PathBuf::from(dir);
        }
        if let Some(dir) = dirs::data_dir() {
            return dir.join("showlog");
        }
        let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("."));
        exe.parent().unwrap_or(Path::new(".")).join(".data")
    }

    /// Absolute path of the show database.
    pub fn resolve_database_path(&self, data_dir: &Path) -> PathBuf {
        let file = PathBuf::from(&self.database_file);
        if file.is_absolute() {
            file
        } else {
            data_dir.join(file)
        }
    }

    /// Loads config from `path`, creating a default file if it doesn't exist.
    /// Returns defaults on any error (missing file, parse error, etc.).
    pub fn load_or_create(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
                    Ok(mut config) => {
                        config.sanitize();
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {}: {e}", path.display());
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {}: {e}", path.display());
                }
            }
            // Return defaults on error (don't overwrite broken file)
            Self::default()
        } else {
            let config = Self::default();
            if let Err(e) = config.save(path) {
                tracing::warn!("Failed to create default config at {}: {e:#}", path.display());
            }
            config
        }
    }

    /// Saves config to `path` as pretty-printed JSON, creating parent dirs.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config: {}", path.display()))
    }

    /// Resets invalid fields and cleans up the table list.
    pub fn sanitize(&mut self) {
        if self.database_file.trim().is_empty() {
            self.database_file = DEFAULT_DATABASE_FILE.to_string();
        }
        if self.log_filter.trim().is_empty() {
            self.log_filter = DEFAULT_LOG_FILTER.to_string();
        }

        // history_* tables belong to the engine and can never be tracked
        let mut seen = std::collections::HashSet::new();
        self.tracked_tables.retain(|t| {
            let t = t.trim();
            !t.is_empty() && !t.starts_with("history_") && seen.insert(t.to_string())
        });
        for table in &mut self.tracked_tables {
            *table = table.trim().to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.database_file, "show.db");
        assert_eq!(config.group_limit, 500);
        assert!(config.tracked_tables.is_empty());
        assert!(config.enforce_foreign_keys);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_sanitize_table_list() {
        let mut config = AppConfig {
            tracked_tables: vec![
                "pages".into(),
                " beats ".into(),
                "pages".into(),
                "".into(),
                "history_undo".into(),
                "beats".into(),
            ],
            ..AppConfig::default()
        };
        config.sanitize();
        assert_eq!(config.tracked_tables, vec!["pages", "beats"]);
    }

    #[test]
    fn test_sanitize_blank_fields() {
        let mut config = AppConfig {
            database_file: "  ".into(),
            log_filter: String::new(),
            ..AppConfig::default()
        };
        config.sanitize();
        assert_eq!(config.database_file, DEFAULT_DATABASE_FILE);
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_resolve_database_path() {
        let data = Path::new("/var/showlog");
        let relative = AppConfig::default();
        assert_eq!(relative.resolve_database_path(data), data.join("show.db"));

        let absolute = AppConfig {
            database_file: std::env::temp_dir().join("x.db").to_string_lossy().into_owned(),
            ..AppConfig::default()
        };
        assert_eq!(
            absolute.resolve_database_path(data),
            std::env::temp_dir().join("x.db")
        );
    }

    #[test]
    fn test_data_dir_with_env_var() {
        // Save and restore env var
        let original = std::env::var("SHOWLOG_DATA_DIR").ok();
        std::env::set_var("SHOWLOG_DATA_DIR", "/custom/path");
        assert_eq!(AppConfig::data_dir(), PathBuf::from("/custom/path"));
        // Restore
        match original {
            Some(val) => std::env::set_var("SHOWLOG_DATA_DIR", val),
            None => std::env::remove_var("SHOWLOG_DATA_DIR"),
        }
    }

    #[test]
    fn test_config_path_file_name() {
        assert!(AppConfig::config_path().ends_with("showlog.json"));
    }
}
