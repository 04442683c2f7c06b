use std::{str::FromStr, sync::Arc, time::Duration};

use crate::{
    data_dir::DataDir,
    error::{Error, Result},
    index_db::IndexDb,
    physical::IndexProvider,
    tantivy_index::TantivyProvider,
};

/// Setting keys read from the settings table.
pub mod keys {
    pub const REGISTRY_CAPACITY: &str = "registry.capacity";
    pub const IDLE_TIMEOUT_SECS: &str = "registry.idle_timeout_secs";
    pub const WRITER_MEMORY_BUDGET: &str = "writer.memory_budget";
    pub const CONTEXT_SIZE: &str = "search.context_size";
    pub const PROVIDER: &str = "index.provider";
}

/// Which physical index implementation backs project indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Tantivy,
    /// Search is switched off; every index operation is a no-op.
    Disabled,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tantivy => f.write_str("tantivy"),
            Self::Disabled => f.write_str("disabled"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tantivy" => Ok(Self::Tantivy),
            "none" | "disabled" => Ok(Self::Disabled),
            other => {
                Err(Error::Config(format!("unknown index provider '{other}'")))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Maximum number of project indexes kept open at once.
    pub registry_capacity: usize,
    /// Close a project's index after this long without access.
    pub idle_timeout: Duration,
    /// Memory budget (in bytes) for each index writer.
    pub writer_memory_budget: usize,
    /// Tokens of context returned on each side of a hit.
    pub context_size: usize,
    pub provider: ProviderKind,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            registry_capacity: 16,
            idle_timeout: Duration::from_secs(15 * 60),
            writer_memory_budget: 15_000_000,
            context_size: 5,
            provider: ProviderKind::Tantivy,
        }
    }
}

impl IndexConfig {
    /// Load configuration, applying overrides stored in the settings table.
    pub fn load(db: &IndexDb) -> Result<Self> {
        let defaults = Self::default();

        let registry_capacity: usize = parse_setting(
            db,
            keys::REGISTRY_CAPACITY,
            defaults.registry_capacity,
        )?;
        if registry_capacity == 0 {
            return Err(Error::Config(format!(
                "{} must be at least 1",
                keys::REGISTRY_CAPACITY
            )));
        }

        let idle_secs: u64 = parse_setting(
            db,
            keys::IDLE_TIMEOUT_SECS,
            defaults.idle_timeout.as_secs(),
        )?;

        Ok(Self {
            registry_capacity,
            idle_timeout: Duration::from_secs(idle_secs),
            writer_memory_budget: parse_setting(
                db,
                keys::WRITER_MEMORY_BUDGET,
                defaults.writer_memory_budget,
            )?,
            context_size: parse_setting(
                db,
                keys::CONTEXT_SIZE,
                defaults.context_size,
            )?,
            provider: db.get_setting_or(keys::PROVIDER, "tantivy")?.parse()?,
        })
    }

    /// Build the configured provider, or `None` when search is disabled.
    pub fn build_provider(
        &self,
        data_dir: &DataDir,
    ) -> Result<Option<Arc<dyn IndexProvider>>> {
        Ok(match self.provider {
            ProviderKind::Tantivy => Some(Arc::new(TantivyProvider::on_disk(
                data_dir.indexes_dir()?,
                self,
            ))),
            ProviderKind::Disabled => None,
        })
    }
}

fn parse_setting<T>(db: &IndexDb, key: &str, default: T) -> Result<T>
where
    T: FromStr + ToString,
{
    let raw = db.get_setting_or(key, &default.to_string())?;
    raw.trim().parse().map_err(|_| {
        Error::Config(format!("invalid value for {key}: '{raw}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, IndexDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = IndexDb::open(&tmp.path().join("index.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn defaults_without_settings() {
        let (_tmp, db) = test_db();
        let config = IndexConfig::load(&db).unwrap();
        assert_eq!(config.registry_capacity, 16);
        assert_eq!(config.idle_timeout, Duration::from_secs(900));
        assert_eq!(config.provider, ProviderKind::Tantivy);
    }

    #[test]
    fn settings_override_defaults() {
        let (_tmp, db) = test_db();
        db.set_setting(keys::REGISTRY_CAPACITY, "2").unwrap();
        db.set_setting(keys::IDLE_TIMEOUT_SECS, "30").unwrap();
        db.set_setting(keys::PROVIDER, "none").unwrap();

        let config = IndexConfig::load(&db).unwrap();
        assert_eq!(config.registry_capacity, 2);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.provider, ProviderKind::Disabled);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let (_tmp, db) = test_db();
        db.set_setting(keys::CONTEXT_SIZE, "lots").unwrap();
        assert!(matches!(IndexConfig::load(&db), Err(Error::Config(_))));

        db.set_setting(keys::CONTEXT_SIZE, "3").unwrap();
        db.set_setting(keys::REGISTRY_CAPACITY, "0").unwrap();
        assert!(matches!(IndexConfig::load(&db), Err(Error::Config(_))));
    }

    #[test]
    fn disabled_provider_builds_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let config = IndexConfig {
            provider: ProviderKind::Disabled,
            ..IndexConfig::default()
        };
        assert!(config.build_provider(&data_dir).unwrap().is_none());

        let enabled = IndexConfig::default().build_provider(&data_dir).unwrap();
        assert_eq!(enabled.unwrap().id(), TantivyProvider::ID);
    }
}
