use config::{Config, ConfigError, Environment};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub chain: ChainDescriptor,
    pub database: DatabaseSettings,
    pub storage: StorageSettings,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

/// Everything the pipeline needs to know about one chain. Immutable for a
/// run; chain discovery happens outside this crate.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainDescriptor {
    pub chain_registry_name: String,
    pub chain_id: String,
    pub apis: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_step_size")]
    pub step_size: usize,
    pub time_between_blocks_sec: f64,
    #[serde(default = "default_backfill_interval_sec")]
    pub backfill_interval_sec: u64,
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub db_url: String,
    #[serde(default = "default_pool_size")]
    pub db_pool_size: u32,
    pub schema_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    pub bucket_name: String,
    pub object_store_credentials_path: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible stores (minio in the test harness).
    pub endpoint: Option<String>,
}

fn default_batch_size() -> usize {
    20
}

fn default_step_size() -> usize {
    20
}

fn default_backfill_interval_sec() -> u64 {
    60
}

fn default_request_timeout_sec() -> f64 {
    10.0
}

fn default_pool_size() -> u32 {
    10
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9184".to_owned()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(Environment::default().separator("__"))
            .set_default("chain.batch_size", 20)?
            .set_default("chain.step_size", 20)?
            .set_default("database.db_pool_size", 10)?
            .build()?;

        config.try_deserialize()
    }
}
