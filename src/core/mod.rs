pub mod command;
pub mod error;

pub use command::{check_illegal, run_checked, run_with_timeout, CommandOutput, DEFAULT_TIMEOUT_MS};
pub use error::FirewallError;
