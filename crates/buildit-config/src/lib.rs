//! KDL configuration parsing for BuildIt.
//!
//! This crate handles parsing of:
//! - Project and folder definitions
//! - System configuration

pub mod error;
mod nodes;
pub mod project;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use project::{ItemBody, ItemDefinition, parse_item, parse_items};
pub use system::{
    AuthorizationConfig, ExecutorConfig, GrantConfig, SystemConfig, load_system_config, parse_system_config,
};
