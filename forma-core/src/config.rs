use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct FormaConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub generation: GenerationSettings,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationSettings {
    pub model: String,
    pub temperature: f64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            temperature: 0.7,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    /// Hard ceiling on bound parameters per INSERT statement. Postgres caps
    /// a single statement at 65535 bind parameters.
    pub insert_param_budget: usize,
    /// Whether the backing store accepts a transactional wrapper around the
    /// version-allocate / supersede / insert sequence.
    pub supports_transactions: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            insert_param_budget: 65535,
            supports_transactions: true,
        }
    }
}

impl FormaConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        s.try_deserialize()
    }
}
