use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::pattern::Pattern;

pub const CONFIG_FILE_NAME: &str = "cutover.toml";
pub const ENV_PREFIX: &str = "CUTOVER_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub cutover: String,
    pub r2d2: String,
    /// Directory for rotated log files; the project data dir when unset
    pub log_dir: Option<String>,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const CUTOVER_LEVEL: &str = "info";
    const R2D2_LEVEL: &str = "warn";

    fn default() -> Self {
        LoggingConfig {
            cutover: Self::CUTOVER_LEVEL.to_owned(),
            r2d2: Self::R2D2_LEVEL.to_owned(),
            log_dir: None,
        }
    }

    /// flexi_logger spec string, e.g. `cutover=info, r2d2=warn`
    pub fn log_spec(&self) -> String {
        format!("cutover={}, r2d2={}", self.cutover, self.r2d2)
    }

    fn ensure_valid(&mut self) {
        Self::ensure_valid_level(&mut self.cutover, "cutover", Self::CUTOVER_LEVEL);
        Self::ensure_valid_level(&mut self.r2d2, "r2d2", Self::R2D2_LEVEL);
    }

    fn ensure_valid_level(level: &mut String, module: &str, default: &str) {
        let original = level.clone();
        *level = level.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&level.as_str()) {
            eprintln!(
                "Config error: {} log level of '{}' is invalid - using default of '{}'",
                module, original, default
            );
            *level = default.to_owned();
        }
    }
}

/// Connection settings for one SQLite backend
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub path: String,
    pub pool_size: u32,
    pub connection_timeout_ms: u64,
    pub busy_timeout_ms: u64,
}

impl BackendConfig {
    const POOL_SIZE: u32 = 8;
    const CONNECTION_TIMEOUT_MS: u64 = 5_000;
    const BUSY_TIMEOUT_MS: u64 = 5_000;

    fn default_for(path: &str) -> Self {
        BackendConfig {
            path: path.to_owned(),
            pool_size: Self::POOL_SIZE,
            connection_timeout_ms: Self::CONNECTION_TIMEOUT_MS,
            busy_timeout_ms: Self::BUSY_TIMEOUT_MS,
        }
    }

    fn ensure_valid(&mut self, name: &str) {
        if self.pool_size == 0 {
            eprintln!(
                "Config error: {} pool_size of 0 is invalid - using default of {}",
                name,
                Self::POOL_SIZE
            );
            self.pool_size = Self::POOL_SIZE;
        }
        if self.connection_timeout_ms == 0 {
            eprintln!(
                "Config error: {} connection_timeout_ms of 0 is invalid - using default of {}",
                name,
                Self::CONNECTION_TIMEOUT_MS
            );
            self.connection_timeout_ms = Self::CONNECTION_TIMEOUT_MS;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ValidationConfig {
    pub batch_size: i64,
    pub query_timeout_ms: u64,
}

impl ValidationConfig {
    const BATCH_SIZE: i64 = 100;
    const QUERY_TIMEOUT_MS: u64 = 1_000;

    fn default() -> Self {
        ValidationConfig {
            batch_size: Self::BATCH_SIZE,
            query_timeout_ms: Self::QUERY_TIMEOUT_MS,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    fn ensure_valid(&mut self) {
        if self.batch_size < 1 {
            eprintln!(
                "Config error: batch_size of {} is invalid - using default of {}",
                self.batch_size,
                Self::BATCH_SIZE
            );
            self.batch_size = Self::BATCH_SIZE;
        }
        if self.query_timeout_ms == 0 {
            eprintln!(
                "Config error: query_timeout_ms of 0 is invalid - using default of {}",
                Self::QUERY_TIMEOUT_MS
            );
            self.query_timeout_ms = Self::QUERY_TIMEOUT_MS;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EventsConfig {
    pub topic: String,
    pub max_attempts: u32,
}

impl EventsConfig {
    const TOPIC: &str = "inconsistent_interactive";
    const MAX_ATTEMPTS: u32 = 3;

    fn default() -> Self {
        EventsConfig {
            topic: Self::TOPIC.to_owned(),
            max_attempts: Self::MAX_ATTEMPTS,
        }
    }

    fn ensure_valid(&mut self) {
        if self.topic.trim().is_empty() {
            eprintln!(
                "Config error: empty event topic - using default of '{}'",
                Self::TOPIC
            );
            self.topic = Self::TOPIC.to_owned();
        }
        if self.max_attempts == 0 {
            eprintln!(
                "Config error: max_attempts of 0 is invalid - using default of {}",
                Self::MAX_ATTEMPTS
            );
            self.max_attempts = Self::MAX_ATTEMPTS;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub prefix: String,
}

impl ServerConfig {
    const HOST: &str = "127.0.0.1";
    const PORT: u16 = 8080;
    const PREFIX: &str = "/migrator";

    fn default() -> Self {
        ServerConfig {
            host: Self::HOST.to_owned(),
            port: Self::PORT,
            prefix: Self::PREFIX.to_owned(),
        }
    }

    fn ensure_valid(&mut self) {
        let trimmed = self.prefix.trim().trim_end_matches('/');
        // axum cannot nest at the root
        if trimmed.is_empty() {
            eprintln!(
                "Config error: server prefix '{}' is invalid - using default of '{}'",
                self.prefix,
                Self::PREFIX
            );
            self.prefix = Self::PREFIX.to_owned();
        } else if trimmed.starts_with('/') {
            self.prefix = trimmed.to_owned();
        } else {
            self.prefix = format!("/{}", trimmed);
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MigrationConfig {
    /// Pattern the dual-write pool starts in
    pub pattern: String,
}

impl MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            pattern: Pattern::SrcOnly.to_string(),
        }
    }

    pub fn pattern(&self) -> Pattern {
        // Always valid after ensure_valid
        Pattern::parse(&self.pattern).unwrap_or(Pattern::SrcOnly)
    }

    fn ensure_valid(&mut self) {
        let normalized = self.pattern.trim().to_ascii_lowercase();
        match Pattern::parse(&normalized) {
            Ok(_) => self.pattern = normalized,
            Err(e) => {
                eprintln!(
                    "Config error: {} - using default of '{}'",
                    e,
                    Pattern::SrcOnly
                );
                self.pattern = Pattern::SrcOnly.to_string();
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub source: BackendConfig,
    pub target: BackendConfig,
    pub validation: ValidationConfig,
    pub events: EventsConfig,
    pub server: ServerConfig,
    pub migration: MigrationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            source: BackendConfig::default_for("cutover-src.db"),
            target: BackendConfig::default_for("cutover-dst.db"),
            validation: ValidationConfig::default(),
            events: EventsConfig::default(),
            server: ServerConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

impl Config {
    pub fn default_path(project_dirs: &ProjectDirs) -> PathBuf {
        project_dirs.config_dir().join(CONFIG_FILE_NAME)
    }

    /// Loads the configuration: defaults, then the TOML file, then `CUTOVER_`
    /// environment variables. Writes the defaults to `config_path` if no file
    /// exists there. Anything that fails to load falls back to defaults.
    pub fn load_config(config_path: &Path) -> Self {
        if !config_path.exists() {
            Self::write_default(config_path);
        }
        Self::load_from(config_path)
    }

    fn write_default(config_path: &Path) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        match toml::to_string_pretty(&Config::default()) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(e) => eprintln!("Failed to serialize default config: {}", e),
        }
    }

    fn figment(config_path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn load_from(config_path: &Path) -> Self {
        let mut config = Self::figment(config_path).extract().unwrap_or_else(|err| {
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
        self.source.ensure_valid("source");
        self.target.ensure_valid("target");
        self.validation.ensure_valid();
        self.events.ensure_valid();
        self.server.ensure_valid();
        self.migration.ensure_valid();
    }
}
