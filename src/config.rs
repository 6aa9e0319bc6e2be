use std::env;
use std::time::Duration;

use serde::Serialize;

pub const DEFAULT_DATABASE: &str = "mca_data";

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

#[derive(Clone, Serialize)]
pub struct WarehouseConfig {
    #[serde(skip)]
    pub token: Option<String>,
    pub database: String,
    pub slow_query_threshold: Duration,
    pub cache_ttl: Duration,
    pub boundary_cache_ttl: Duration,
    pub cache_max_entries: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            token: None,
            database: DEFAULT_DATABASE.to_string(),
            slow_query_threshold: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(3600),
            boundary_cache_ttl: Duration::from_secs(7200),
            cache_max_entries: 128,
        }
    }
}

impl WarehouseConfig {
    /// Reads `MOTHERDUCK_TOKEN`, `MOTHERDUCK_DATABASE` and the `MCA_*` tuning knobs.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            token: env_string("MOTHERDUCK_TOKEN"),
            database: env_string("MOTHERDUCK_DATABASE").unwrap_or(defaults.database),
            slow_query_threshold: Duration::from_millis(env_u64(
                "MCA_SLOW_QUERY_MS",
                defaults.slow_query_threshold.as_millis() as u64,
            )),
            cache_ttl: Duration::from_secs(env_u64(
                "MCA_CACHE_TTL_SECS",
                defaults.cache_ttl.as_secs(),
            )),
            boundary_cache_ttl: Duration::from_secs(env_u64(
                "MCA_BOUNDARY_CACHE_TTL_SECS",
                defaults.boundary_cache_ttl.as_secs(),
            )),
            cache_max_entries: env_usize("MCA_CACHE_MAX_ENTRIES", defaults.cache_max_entries),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// MotherDuck connection string; `None` when no token is configured.
    pub fn connection_string(&self) -> Option<String> {
        self.token
            .as_ref()
            .map(|token| format!("md:{}?motherduck_token={}", self.database, token))
    }
}

// The token is a bearer credential and must never reach logs.
impl std::fmt::Debug for WarehouseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseConfig")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("slow_query_threshold", &self.slow_query_threshold)
            .field("cache_ttl", &self.cache_ttl)
            .field("boundary_cache_ttl", &self.boundary_cache_ttl)
            .field("cache_max_entries", &self.cache_max_entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_includes_database_and_token() {
        let cfg = WarehouseConfig::default()
            .with_database("analytics")
            .with_token("abc");
        assert_eq!(
            cfg.connection_string().as_deref(),
            Some("md:analytics?motherduck_token=abc")
        );
        assert!(WarehouseConfig::default().connection_string().is_none());
    }

    #[test]
    fn debug_output_redacts_token() {
        let cfg = WarehouseConfig::default().with_token("secret-token");
        let printed = format!("{cfg:?}");
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("<redacted>"));
    }
}
