pub mod client;
pub mod core;
pub mod service;

// Re-export commonly used items
pub use client::{pick_client, FireForward, FireInfo, FirewallClient, Operation, RuleKind, Strategy};
pub use core::error::FirewallError;
pub use service::FirewallService;
