use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

pub const DEFAULT_RESULTS_RETENTION: usize = 1000;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 32;

#[derive(Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub database_path: String,
    pub results_retention: usize,
    pub worker_concurrency: usize,
}

impl ServerConfig {
    /// Loads configuration by layering sources: file -> environment
    /// variables. Environment variables have the highest priority.
    pub fn load(config_path: Option<&str>) -> Result<Self, String> {
        let mut file_config: PartialServerConfig = if let Some(path_str) = config_path {
            let path = Path::new(path_str);
            let contents = fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config file at {path:?}: {e}"))?;
            toml::from_str(&contents)
                .map_err(|e| format!("Failed to parse TOML from config file at {path:?}: {e}"))?
        } else {
            PartialServerConfig::default()
        };

        if let Ok(val) = env::var("HOST") {
            file_config.host = Some(val);
        }
        if let Ok(val) = env::var("PORT") {
            file_config.port = Some(
                val.parse()
                    .map_err(|e| format!("Invalid PORT value `{val}`: {e}"))?,
            );
        }
        if let Ok(val) = env::var("CORS_ORIGINS") {
            file_config.cors_origins =
                Some(val.split(',').map(|s| s.trim().to_string()).collect());
        }
        if let Ok(val) = env::var("DATABASE_PATH") {
            file_config.database_path = Some(val);
        }
        if let Ok(val) = env::var("RESULTS_RETENTION") {
            file_config.results_retention = Some(
                val.parse()
                    .map_err(|e| format!("Invalid RESULTS_RETENTION value `{val}`: {e}"))?,
            );
        }
        if let Ok(val) = env::var("WORKER_CONCURRENCY") {
            file_config.worker_concurrency = Some(
                val.parse()
                    .map_err(|e| format!("Invalid WORKER_CONCURRENCY value `{val}`: {e}"))?,
            );
        }

        Ok(file_config.into())
    }
}

// A temporary structure to hold layered configuration. Fields are optional;
// everything has a workable default.
#[derive(Deserialize, Default)]
struct PartialServerConfig {
    host: Option<String>,
    port: Option<u16>,
    cors_origins: Option<Vec<String>>,
    database_path: Option<String>,
    results_retention: Option<usize>,
    worker_concurrency: Option<usize>,
}

impl From<PartialServerConfig> for ServerConfig {
    fn from(partial: PartialServerConfig) -> Self {
        ServerConfig {
            host: partial.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: partial.port.unwrap_or(8080),
            cors_origins: partial.cors_origins.unwrap_or_else(|| vec!["*".to_string()]),
            database_path: partial
                .database_path
                .unwrap_or_else(|| "pulsewatch.duckdb".to_string()),
            results_retention: partial
                .results_retention
                .unwrap_or(DEFAULT_RESULTS_RETENTION)
                .max(1),
            worker_concurrency: partial
                .worker_concurrency
                .unwrap_or(DEFAULT_WORKER_CONCURRENCY)
                .max(1),
        }
    }
}
