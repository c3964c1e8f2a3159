//! Pool Node Coordinator
//!
//! The node-facing half of a mining pool server:
//! - Chain-change detection by ZMQ block announcements or polling
//! - A cached, broadcast view of the node's mining state
//! - Block templates fetched once per height and shared between cooperating
//!   pool processes through a leased template store
//! - Block submission with normalized outcomes

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod notifier;
pub mod state;
pub mod store;
pub mod submission;
pub mod types;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Application information
pub const APP_NAME: &str = "pool-node-coordinator";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
