//! Engine settings from environment variables.

use crate::error::ConfigError;
use std::str::FromStr;

pub const DEFAULT_MAX_INCLUDE_DEPTH: usize = 3;
pub const DEFAULT_PAGE_SIZE: u64 = 100;
pub const DEFAULT_MAX_PAGE_SIZE: u64 = 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiSettings {
    /// Prefix of every generated link, without trailing slash. Empty for relative links.
    pub base_url: String,
    pub max_include_depth: usize,
    pub default_page_size: u64,
    pub max_page_size: u64,
    /// Run a count query for offset pagination and report `meta.pagination.total`.
    pub count_total: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        ApiSettings {
            base_url: String::new(),
            max_include_depth: DEFAULT_MAX_INCLUDE_DEPTH,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            count_total: false,
        }
    }
}

impl ApiSettings {
    /// Reads `.env` (if present) and then the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    /// `ARCHITECT_BASE_URL`, `ARCHITECT_MAX_INCLUDE_DEPTH`, `ARCHITECT_DEFAULT_PAGE_SIZE`,
    /// `ARCHITECT_MAX_PAGE_SIZE`, `ARCHITECT_COUNT_TOTAL`; unset variables keep defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ApiSettings::default();
        let settings = ApiSettings {
            base_url: lookup("ARCHITECT_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            max_include_depth: parsed(&lookup, "ARCHITECT_MAX_INCLUDE_DEPTH")?.unwrap_or(defaults.max_include_depth),
            default_page_size: parsed(&lookup, "ARCHITECT_DEFAULT_PAGE_SIZE")?.unwrap_or(defaults.default_page_size),
            max_page_size: parsed(&lookup, "ARCHITECT_MAX_PAGE_SIZE")?.unwrap_or(defaults.max_page_size),
            count_total: parsed(&lookup, "ARCHITECT_COUNT_TOTAL")?.unwrap_or(defaults.count_total),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_include_depth == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "ARCHITECT_MAX_INCLUDE_DEPTH",
                reason: "must be at least 1".into(),
            });
        }
        if self.default_page_size == 0 || self.max_page_size == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "ARCHITECT_DEFAULT_PAGE_SIZE",
                reason: "page sizes must be positive".into(),
            });
        }
        if self.default_page_size > self.max_page_size {
            return Err(ConfigError::InvalidSetting {
                name: "ARCHITECT_DEFAULT_PAGE_SIZE",
                reason: format!("exceeds ARCHITECT_MAX_PAGE_SIZE ({})", self.max_page_size),
            });
        }
        Ok(())
    }
}

fn parsed<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::InvalidSetting {
            name,
            reason: format!("'{}': {}", raw, e),
        }),
    }
}
