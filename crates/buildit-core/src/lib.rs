//! Core domain types and traits for the BuildIt build coordinator.
//!
//! This crate contains:
//! - Resource identifiers and hierarchical item names
//! - Build records, results and causes
//! - Project configuration, triggers and label expressions
//! - Permission checks
//! - SCM, step runner and publisher traits

pub mod build;
pub mod error;
pub mod executor;
pub mod id;
pub mod label;
pub mod project;
pub mod scm;
pub mod security;
pub mod trigger;

pub use build::{Build, BuildResult, Cause};
pub use error::{Error, Result};
pub use id::{FullName, ResourceId};
pub use label::LabelExpr;
pub use project::{ItemKind, ProjectConfig, PublisherConfig, Step};
pub use trigger::{Trigger, TriggerKind, TriggerSet};
