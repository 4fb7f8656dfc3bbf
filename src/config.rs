use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    pub catmerge: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const CATMERGE_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            catmerge: Self::CATMERGE_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.catmerge.clone();
        self.catmerge = self.catmerge.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.catmerge.as_str()) {
            eprintln!(
                "Config error: catmerge log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::CATMERGE_LEVEL
            );
            self.catmerge = Self::CATMERGE_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    batch_size: usize,
    max_unscoped_groups: usize,
    confirmation_phrase: String,
}

impl EngineConfig {
    pub const DEFAULT_BATCH_SIZE: usize = 1000;
    pub const DEFAULT_MAX_UNSCOPED_GROUPS: usize = 500;
    pub const DEFAULT_CONFIRMATION_PHRASE: &str = "MERGE WITH CONFLICTS";

    pub fn new(batch_size: usize, max_unscoped_groups: usize, confirmation_phrase: &str) -> Self {
        let mut config = EngineConfig {
            batch_size,
            max_unscoped_groups,
            confirmation_phrase: confirmation_phrase.to_owned(),
        };
        config.ensure_valid();
        config
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_unscoped_groups(&self) -> usize {
        self.max_unscoped_groups
    }

    pub fn confirmation_phrase(&self) -> &str {
        &self.confirmation_phrase
    }

    fn ensure_valid(&mut self) {
        if self.batch_size == 0 {
            eprintln!(
                "Config error: batch_size must be at least 1 - using default of '{}'",
                Self::DEFAULT_BATCH_SIZE
            );
            self.batch_size = Self::DEFAULT_BATCH_SIZE;
        }

        // The phrase is compared literally, so only blank phrases are rejected
        if self.confirmation_phrase.trim().is_empty() {
            eprintln!(
                "Config error: confirmation_phrase is empty - using default of '{}'",
                Self::DEFAULT_CONFIRMATION_PHRASE
            );
            self.confirmation_phrase = Self::DEFAULT_CONFIRMATION_PHRASE.to_owned();
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            batch_size: Self::DEFAULT_BATCH_SIZE,
            max_unscoped_groups: Self::DEFAULT_MAX_UNSCOPED_GROUPS,
            confirmation_phrase: Self::DEFAULT_CONFIRMATION_PHRASE.to_owned(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatabaseConfig {
    path: Option<String>,
    busy_timeout_ms: u64,
}

impl DatabaseConfig {
    const DB_FILENAME: &str = "catmerge.db";
    const BUSY_TIMEOUT_MS: u64 = 5000;

    fn default() -> Self {
        DatabaseConfig {
            path: None,
            busy_timeout_ms: Self::BUSY_TIMEOUT_MS,
        }
    }

    /// Explicit path if configured, otherwise the database file in the data directory
    pub fn resolve_path(&self, data_dir: &Path) -> PathBuf {
        match &self.path {
            Some(path) => PathBuf::from(path),
            None => data_dir.join(Self::DB_FILENAME),
        }
    }

    pub fn busy_timeout_ms(&self) -> u64 {
        self.busy_timeout_ms
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    pub database: DatabaseConfig,
}

impl Config {
    const ENV_PREFIX: &str = "CATMERGE_";

    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            engine: EngineConfig::default(),
            database: DatabaseConfig::default(),
        }
    }

    /// Loads the configuration from a TOML file located in the app's data directory,
    /// with `CATMERGE_` environment variables layered on top.
    /// If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");
        let default_config = Config::default();

        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                if let Err(e) = fs::write(&config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            } else {
                eprintln!("Failed to serialize default config.");
            }
        }

        Self::load_from(&config_path)
    }

    /// Defaults, then the TOML file (if present), then the environment
    pub fn load_from(config_path: &Path) -> Self {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            Config::default()
        });

        config.ensure_valid();

        config
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.engine.ensure_valid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_when_file_missing() {
        Jail::expect_with(|jail| {
            let config = Config::load_from(&jail.directory().join("config.toml"));
            assert_eq!(config.logging.catmerge, "info");
            assert_eq!(config.engine.batch_size(), 1000);
            assert_eq!(config.engine.max_unscoped_groups(), 500);
            assert_eq!(config.engine.confirmation_phrase(), "MERGE WITH CONFLICTS");
            Ok(())
        });
    }

    #[test]
    fn test_toml_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [engine]
                batch_size = 250
                confirmation_phrase = "yes really"

                [database]
                path = "/tmp/catalog.db"
                "#,
            )?;
            jail.set_env("CATMERGE_ENGINE__MAX_UNSCOPED_GROUPS", "42");

            let config = Config::load_from(&jail.directory().join("config.toml"));
            assert_eq!(config.engine.batch_size(), 250);
            assert_eq!(config.engine.max_unscoped_groups(), 42);
            assert_eq!(config.engine.confirmation_phrase(), "yes really");
            assert_eq!(
                config.database.resolve_path(Path::new("/unused")),
                PathBuf::from("/tmp/catalog.db")
            );
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [logging]
                catmerge = " LOUD "

                [engine]
                batch_size = 0
                confirmation_phrase = "   "
                "#,
            )?;

            let config = Config::load_from(&jail.directory().join("config.toml"));
            assert_eq!(config.logging.catmerge, "info");
            assert_eq!(config.engine.batch_size(), EngineConfig::DEFAULT_BATCH_SIZE);
            assert_eq!(
                config.engine.confirmation_phrase(),
                EngineConfig::DEFAULT_CONFIRMATION_PHRASE
            );
            Ok(())
        });
    }

    #[test]
    fn test_database_path_defaults_to_data_dir() {
        let config = DatabaseConfig::default();
        assert_eq!(
            config.resolve_path(Path::new("/data")),
            PathBuf::from("/data/catmerge.db")
        );
    }
}
