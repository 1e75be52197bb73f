//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
///
/// Stripe credentials and webhook tuning are read by the billing crate itself.
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // Logging
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ConfigError::Invalid("DATABASE_MAX_CONNECTIONS"))?,
            run_migrations: env::var("RUN_MIGRATIONS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .map_err(|_| ConfigError::Invalid("RUN_MIGRATIONS"))?,

            // Logging
            log_format: LogFormat::from_env(),
        })
    }
}

impl LogFormat {
    /// `LOG_FORMAT=json` switches to structured output; anything else is pretty.
    pub fn from_env() -> Self {
        match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Config tests modify shared env vars
    static CONFIG_TEST_MUTEX: Mutex<()> = Mutex::new(());

    fn cleanup_config() {
        for key in [
            "BIND_ADDRESS",
            "DATABASE_URL",
            "DATABASE_MAX_CONNECTIONS",
            "RUN_MIGRATIONS",
            "LOG_FORMAT",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_config_from_env() {
        let _guard = CONFIG_TEST_MUTEX.lock().unwrap();
        cleanup_config();

        // === Missing database URL is an error ===
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));

        // === Defaults ===
        env::set_var("DATABASE_URL", "postgres://localhost/paymirror");
        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.database_max_connections, 5);
        assert!(config.run_migrations);
        assert_eq!(config.log_format, LogFormat::Pretty);

        // === Overrides ===
        env::set_var("RUN_MIGRATIONS", "false");
        env::set_var("LOG_FORMAT", "json");
        let config = Config::from_env().unwrap();
        assert!(!config.run_migrations);
        assert_eq!(config.log_format, LogFormat::Json);

        // === Garbage is rejected, not defaulted ===
        env::set_var("DATABASE_MAX_CONNECTIONS", "many");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("DATABASE_MAX_CONNECTIONS"))
        ));

        cleanup_config();
    }
}
