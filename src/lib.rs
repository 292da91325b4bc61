pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod validation;

pub use error::PipelineError;
pub use models::*;
pub use services::*;
