//! Engine configuration
use crate::error::EngineError;
use anyhow::Context;
use std::path::PathBuf;
use tracing::info;

const ENV_PREFIX: &str = "SWAP_ENGINE_";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    /// Discard the database when the last handle is dropped.
    pub temporary: bool,
    pub cache_capacity: u64,
    pub flush_every_ms: Option<u64>,
    /// Balance credited to a newly registered user.
    pub starting_points: u64,
    /// Points value for a listing that does not state one.
    pub default_item_points: u64,
    pub notify_seller_on_redemption: bool,
    pub notification_page_size: usize,
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("swap_engine.db"),
            temporary: false,
            cache_capacity: 64 * 1024 * 1024,
            flush_every_ms: Some(500),
            starting_points: 100,
            default_item_points: 50,
            notify_seller_on_redemption: true,
            notification_page_size: 20,
            log_filter: "swap_engine=info".to_owned(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-memory database, removed on drop. Used by tests and demos.
    pub fn temporary() -> Self {
        Self::default().set_temporary(true)
    }

    pub fn set_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }
    pub fn set_temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }
    pub fn set_cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }
    pub fn set_flush_every_ms(mut self, ms: Option<u64>) -> Self {
        self.flush_every_ms = ms;
        self
    }
    pub fn set_starting_points(mut self, points: u64) -> Self {
        self.starting_points = points;
        self
    }
    pub fn set_default_item_points(mut self, points: u64) -> Self {
        self.default_item_points = points;
        self
    }
    pub fn set_notify_seller_on_redemption(mut self, notify: bool) -> Self {
        self.notify_seller_on_redemption = notify;
        self
    }
    pub fn set_notification_page_size(mut self, size: usize) -> Self {
        self.notification_page_size = size;
        self
    }
    pub fn set_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Read `SWAP_ENGINE_*` variables on top of the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(path) = var("DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(value) = var("TEMPORARY") {
            config.temporary = value
                .parse()
                .with_context(|| format!("{ENV_PREFIX}TEMPORARY is not a bool: {value}"))?;
        }
        if let Some(value) = var("CACHE_CAPACITY") {
            config.cache_capacity = value
                .parse()
                .with_context(|| format!("{ENV_PREFIX}CACHE_CAPACITY is not a number: {value}"))?;
        }
        if let Some(value) = var("FLUSH_EVERY_MS") {
            config.flush_every_ms = match value.as_str() {
                "" | "off" => None,
                ms => Some(ms.parse().with_context(|| {
                    format!("{ENV_PREFIX}FLUSH_EVERY_MS is not a number: {value}")
                })?),
            };
        }
        if let Some(value) = var("STARTING_POINTS") {
            config.starting_points = value
                .parse()
                .with_context(|| format!("{ENV_PREFIX}STARTING_POINTS is not a number: {value}"))?;
        }
        if let Some(value) = var("DEFAULT_ITEM_POINTS") {
            config.default_item_points = value.parse().with_context(|| {
                format!("{ENV_PREFIX}DEFAULT_ITEM_POINTS is not a number: {value}")
            })?;
        }
        if let Some(value) = var("NOTIFY_SELLER_ON_REDEMPTION") {
            config.notify_seller_on_redemption = value.parse().with_context(|| {
                format!("{ENV_PREFIX}NOTIFY_SELLER_ON_REDEMPTION is not a bool: {value}")
            })?;
        }
        if let Some(value) = var("NOTIFICATION_PAGE_SIZE") {
            config.notification_page_size = value.parse().with_context(|| {
                format!("{ENV_PREFIX}NOTIFICATION_PAGE_SIZE is not a number: {value}")
            })?;
        }
        if let Some(filter) = var("LOG") {
            config.log_filter = filter;
        }

        if config.default_item_points == 0 {
            anyhow::bail!("{ENV_PREFIX}DEFAULT_ITEM_POINTS must be positive");
        }

        Ok(config)
    }

    pub fn open_db(&self) -> Result<sled::Db, EngineError> {
        let config = sled::Config::new()
            .cache_capacity(self.cache_capacity)
            .flush_every_ms(self.flush_every_ms);
        // a temporary db must keep sled's default path so it gets a unique scratch location
        let config = if self.temporary {
            config.temporary(true)
        } else {
            config.path(&self.db_path)
        };
        let db = config.open()?;

        info!(
            path = %self.db_path.display(),
            temporary = self.temporary,
            "Opened exchange database"
        );

        Ok(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_defaults() {
        let vars: HashMap<String, String> = [
            ("SWAP_ENGINE_STARTING_POINTS", "250"),
            ("SWAP_ENGINE_NOTIFY_SELLER_ON_REDEMPTION", "false"),
            ("SWAP_ENGINE_FLUSH_EVERY_MS", "off"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

        let config = EngineConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

        assert_eq!(config.starting_points, 250);
        assert!(!config.notify_seller_on_redemption);
        assert_eq!(config.flush_every_ms, None);
        assert_eq!(config.default_item_points, 50);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let result = EngineConfig::from_lookup(|key| {
            (key == "SWAP_ENGINE_STARTING_POINTS").then(|| "lots".to_owned())
        });
        assert!(result.is_err());

        let result = EngineConfig::from_lookup(|key| {
            (key == "SWAP_ENGINE_DEFAULT_ITEM_POINTS").then(|| "0".to_owned())
        });
        assert!(result.is_err());
    }
}
