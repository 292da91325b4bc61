pub mod dialect;
pub mod dispatcher;
pub mod engine; // Spark (Livy) and Hive (Kyuubi REST) clients
pub mod formatters;
pub mod intent_recognizer;
pub mod llm_service;
pub mod pipeline;
pub mod query_analyzer;
pub mod result_processor;
pub mod sql_generator;
pub mod task_builder;
pub mod text;
pub mod time_range;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::*;
pub use formatters::*;
pub use intent_recognizer::*;
pub use llm_service::*;
pub use pipeline::*;
pub use query_analyzer::*;
pub use result_processor::*;
pub use sql_generator::*;
pub use task_builder::*;
