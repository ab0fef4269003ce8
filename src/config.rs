//! Runtime configuration for the CLI.

use std::path::PathBuf;

use time::Duration;

use crate::retry::RetryPolicy;
use crate::sync::DEFAULT_FRESHNESS_WINDOW;
use crate::utils::get_database_path;

pub const LIBRARY_VAR: &str = "WEFT_LIBRARY";
pub const DATABASE_VAR: &str = "WEFT_DATABASE";
pub const TENANT_VAR: &str = "WEFT_TENANT";
pub const FRESHNESS_HOURS_VAR: &str = "WEFT_FRESHNESS_HOURS";
pub const RETRY_ATTEMPTS_VAR: &str = "WEFT_RETRY_ATTEMPTS";

const DEFAULT_RETRIES: usize = 3;
const RETRY_BASE: std::time::Duration = std::time::Duration::from_millis(250);

/// Where the library and cache live and how adapters are driven.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub library_root: PathBuf,
    pub database_path: PathBuf,
    pub tenant: Option<String>,
    pub freshness_window: Duration,
    pub retry: RetryPolicy,
}

impl Config {
    /// Builds the configuration from the process environment, after loading
    /// a `.env` file if one is present.
    ///
    /// # Environment Variables
    ///
    /// - `WEFT_LIBRARY` (path, default current directory): library root
    /// - `WEFT_DATABASE` (path, default `{data_dir}/weft/links.db`): cache file
    /// - `WEFT_TENANT` (string, unset by default): tenant prefix for canonical ids
    /// - `WEFT_FRESHNESS_HOURS` (i64, default 24): deletion freshness window
    /// - `WEFT_RETRY_ATTEMPTS` (usize, default 3): retries per adapter call
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Unparseable numbers fall
    /// back to their defaults.
    ///
    /// # Examples
    ///
    /// ```
    /// use weft::config::Config;
    ///
    /// let config = Config::from_lookup(|key| match key {
    ///     "WEFT_LIBRARY" => Some("/srv/library".to_string()),
    ///     "WEFT_DATABASE" => Some("/tmp/links.db".to_string()),
    ///     "WEFT_FRESHNESS_HOURS" => Some("48".to_string()),
    ///     _ => None,
    /// })?;
    /// assert_eq!(config.freshness_window, time::Duration::hours(48));
    /// assert_eq!(config.tenant, None);
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let library_root = present(LIBRARY_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let database_path = match present(DATABASE_VAR) {
            Some(path) => PathBuf::from(path),
            None => get_database_path()?,
        };

        let tenant = present(TENANT_VAR).map(|t| t.trim().to_string());

        let freshness_window = present(FRESHNESS_HOURS_VAR)
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|hours| *hours >= 0)
            .map(Duration::hours)
            .unwrap_or(DEFAULT_FRESHNESS_WINDOW);

        let retries = present(RETRY_ATTEMPTS_VAR)
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_RETRIES);

        Ok(Self {
            library_root,
            database_path,
            tenant,
            freshness_window,
            retry: RetryPolicy::exponential(retries, RETRY_BASE),
        })
    }

    pub fn with_library_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.library_root = root.into();
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }
}
