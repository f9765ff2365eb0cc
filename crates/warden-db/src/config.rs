use std::env;
use std::path::{Path, PathBuf};

/// Database configuration.
///
/// Reads from the `WARDEN_DATABASE_URL` environment variable, falling back
/// to a SQLite file in the platform data directory when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full SQLite connection URL.
    pub database_url: String,
}

impl DbConfig {
    /// Build a config from the environment.
    ///
    /// Priority: `WARDEN_DATABASE_URL` env var, then the default data-dir
    /// path.
    pub fn from_env() -> Self {
        let database_url =
            env::var("WARDEN_DATABASE_URL").unwrap_or_else(|_| default_database_url());
        Self { database_url }
    }

    /// Build a config from an explicit URL (useful for tests).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Config for a private in-memory database.
    ///
    /// Each pool connection gets its own in-memory database, so the pool
    /// is capped at a single connection in [`crate::pool::create_pool`].
    pub fn in_memory() -> Self {
        Self::new("sqlite::memory:")
    }

    /// Config for a SQLite database at the given filesystem path.
    pub fn at_path(path: &Path) -> Self {
        Self::new(format!("sqlite://{}", path.display()))
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Default database URL: `<data_dir>/warden/warden.db`.
fn default_database_url() -> String {
    let dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("warden");
    format!("sqlite://{}", dir.join("warden.db").display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_url_is_preserved() {
        let config = DbConfig::new("sqlite:///tmp/test.db");
        assert_eq!(config.database_url, "sqlite:///tmp/test.db");
    }

    #[test]
    fn in_memory_url() {
        assert_eq!(DbConfig::in_memory().database_url, "sqlite::memory:");
    }

    #[test]
    fn at_path_builds_sqlite_url() {
        let config = DbConfig::at_path(Path::new("/tmp/warden-test.db"));
        assert_eq!(config.database_url, "sqlite:///tmp/warden-test.db");
    }
}
