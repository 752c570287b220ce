pub mod config;
pub mod history;
pub mod parser;
pub mod prompt;
pub mod report;
pub mod tool;
pub mod types;

pub use config::Config;
pub use report::{IterationLog, IterationRow, RowKind};
pub use tool::{PackageCommand, ToolOperation, ToolUsageError};
pub use types::*;
