pub mod catalog;
pub mod execution;
pub mod intent;
pub mod output;
pub mod query_spec;
pub mod sql;
pub mod task;

pub use catalog::*;
pub use execution::*;
pub use intent::*;
pub use output::*;
pub use query_spec::*;
pub use sql::*;
pub use task::*;
