// Execution engines behind a common client trait
pub mod adapter;
pub mod bind;
pub mod hive;
pub mod spark;

pub use adapter::{EngineClient, EngineError, EnginePlan, EngineStatus, RawColumn, RawEngineOutput};
pub use hive::HiveRestEngine;
pub use spark::SparkLivyEngine;

use std::str::FromStr;
use url::Url;

use crate::config::EngineConfig;
use crate::error::PipelineError;

/// Engine kinds the agent ships clients for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Spark,
    Hive,
}

impl EngineKind {
    pub const ALL: [EngineKind; 2] = [EngineKind::Spark, EngineKind::Hive];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Spark => "spark",
            EngineKind::Hive => "hive",
        }
    }
}

impl FromStr for EngineKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spark" | "sparksql" | "livy" => Ok(EngineKind::Spark),
            "hive" | "hiveserver2" | "kyuubi" => Ok(EngineKind::Hive),
            _ => Err(PipelineError::UnknownEngine {
                name: s.to_string(),
                registered: EngineKind::ALL.iter().map(|k| k.as_str().to_string()).collect(),
            }),
        }
    }
}

/// Factory function to create the client for an engine kind
pub fn create_engine(
    kind: EngineKind,
    config: &EngineConfig,
) -> Result<Box<dyn EngineClient>, PipelineError> {
    let client: Box<dyn EngineClient> = match kind {
        EngineKind::Spark => Box::new(SparkLivyEngine::new(config.spark.clone()).map_err(config_error)?),
        EngineKind::Hive => Box::new(HiveRestEngine::new(config.hive.clone()).map_err(config_error)?),
    };
    Ok(client)
}

fn config_error(err: EngineError) -> PipelineError {
    PipelineError::Config(err.to_string())
}

/// URL with any user info replaced, for logging
pub fn mask_credentials(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if !url.username().is_empty() || url.password().is_some() => {
            let _ = url.set_username("***");
            let _ = url.set_password(None);
            url.to_string()
        }
        Ok(_) => raw.to_string(),
        Err(_) => "<invalid url>".to_string(),
    }
}
