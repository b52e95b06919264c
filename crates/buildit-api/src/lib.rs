//! HTTP API server for BuildIt.
//!
//! Exposes projects under Jenkins-style `/job/<a>/job/<b>/<action>` paths
//! plus the build queue.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
