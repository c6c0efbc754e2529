use crate::db::{DbSettings, SearchSettings};

/// Application configuration loaded from environment variables
///
/// Database settings come from `DB_*` variables, search settings from `ES_*`.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DbSettings,
    pub search: SearchSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars().collect::<Vec<_>>())
    }

    /// Load configuration from an explicit set of variables
    pub fn from_vars<I>(vars: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (String, String)> + Clone,
    {
        let database = envy::prefixed("DB_")
            .from_iter::<_, DbSettings>(vars.clone())
            .map_err(|e| anyhow::anyhow!("Failed to load database config: {}", e))?;
        let search = envy::prefixed("ES_")
            .from_iter::<_, SearchSettings>(vars)
            .map_err(|e| anyhow::anyhow!("Failed to load search config: {}", e))?;

        Ok(Self { database, search })
    }
}
