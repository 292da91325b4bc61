use serde::Deserialize;
use std::env;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub llm: LlmConfig,
    pub task: TaskConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Engine used when the caller names none
    pub default: String,
    pub spark: SparkConfig,
    pub hive: HiveConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SparkConfig {
    pub livy_url: String,
    pub app_name: String,
    pub queue: Option<String>,
    pub executor_memory: String,
    pub executor_cores: u32,
    pub num_executors: u32,
    pub poll_interval_ms: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HiveConfig {
    pub gateway_url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
    pub poll_interval_ms: u64,
    pub fetch_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// Empty disables the LLM fallback
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub timeout_secs: u64,
    pub parallelism: u32,
    pub memory_mb: u64,
    pub max_parallelism: u32,
    pub max_memory_mb: u64,
    pub preview_rows: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogConfig {
    /// JSON catalog; the built-in sample catalog is used when unset
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(None)
    }

    /// Defaults, then the optional config file, then environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        // Pick up .env before reading variables
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("engine.default", "spark")?
            .set_default("engine.spark.livy_url", "http://localhost:8998")?
            .set_default("engine.spark.app_name", "bigdata-agent")?
            .set_default("engine.spark.executor_memory", "2g")?
            .set_default("engine.spark.executor_cores", 2)?
            .set_default("engine.spark.num_executors", 2)?
            .set_default("engine.spark.poll_interval_ms", 500)?
            .set_default("engine.spark.connect_timeout_secs", 120)?
            .set_default("engine.hive.gateway_url", "http://localhost:10099")?
            .set_default("engine.hive.database", "default")?
            .set_default("engine.hive.poll_interval_ms", 500)?
            .set_default("engine.hive.fetch_size", 1000)?
            .set_default("llm.gateway_url", "")?
            .set_default("llm.model", "default")?
            .set_default("llm.temperature", 0.1)?
            .set_default("llm.max_tokens", 800)?
            .set_default("llm.timeout_secs", 60)?
            .set_default("task.timeout_secs", 3600)?
            .set_default("task.parallelism", num_cpus::get() as i64)?
            .set_default("task.memory_mb", 4096)?
            .set_default("task.max_parallelism", 64)?
            .set_default("task.max_memory_mb", 65536)?
            .set_default("task.preview_rows", 10)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?;

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }

        if let Ok(engine) = env::var("BIGDATA_ENGINE") {
            builder = builder.set_override("engine.default", engine)?;
        }

        if let Ok(livy_url) = env::var("LIVY_URL") {
            builder = builder.set_override("engine.spark.livy_url", livy_url)?;
        }

        if let Ok(gateway_url) = env::var("HIVE_GATEWAY_URL") {
            builder = builder.set_override("engine.hive.gateway_url", gateway_url)?;
        }

        if let Ok(user) = env::var("HIVE_USER") {
            builder = builder.set_override("engine.hive.user", Some(user))?;
        }

        if let Ok(password) = env::var("HIVE_PASSWORD") {
            builder = builder.set_override("engine.hive.password", Some(password))?;
        }

        if let Ok(gateway_url) = env::var("LLM_GATEWAY_URL") {
            builder = builder.set_override("llm.gateway_url", gateway_url)?;
        }

        if let Ok(api_key) = env::var("LLM_API_KEY") {
            builder = builder.set_override("llm.api_key", Some(api_key))?;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            builder = builder.set_override("llm.model", model)?;
        }

        if let Ok(timeout) = env::var("TASK_TIMEOUT_SECS") {
            let secs = timeout.parse::<i64>().map_err(|_| {
                config::ConfigError::Message(format!("TASK_TIMEOUT_SECS is not a number: {}", timeout))
            })?;
            builder = builder.set_override("task.timeout_secs", secs)?;
        }

        if let Ok(path) = env::var("CATALOG_PATH") {
            builder = builder.set_override("catalog.path", Some(path))?;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        if let Ok(log_style) = env::var("RUST_LOG_STYLE") {
            builder = builder.set_override("logging.style", log_style)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn llm_enabled(&self) -> bool {
        !self.llm.gateway_url.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        env::remove_var("BIGDATA_ENGINE");
        env::remove_var("TASK_TIMEOUT_SECS");

        let config = Config::from_env();
        assert!(config.is_ok());

        let config = config.unwrap();
        assert_eq!(config.engine.default, "spark");
        assert_eq!(config.task.timeout_secs, 3600);
        assert_eq!(config.task.preview_rows, 10);
        assert!(config.task.parallelism >= 1);
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[task]\nmemory_mb = 8192\n\n[engine.hive]\ndatabase = \"dw\"").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.task.memory_mb, 8192);
        assert_eq!(config.engine.hive.database, "dw");
        assert_eq!(config.engine.spark.executor_cores, 2);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let missing = Path::new("/nonexistent/bigdata-agent.toml");
        assert!(Config::load(Some(missing)).is_err());
    }
}
