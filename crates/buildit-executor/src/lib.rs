//! Build backends for BuildIt.
//!
//! Provides the concrete collaborators a build runs with:
//! - Shell build steps
//! - Artifact archiving after the steps
//! - A local directory as the source of a project

pub mod archive;
pub mod directory;
pub mod shell;

pub use archive::ArtifactArchiver;
pub use directory::{DirectoryScm, LocalScmProvider};
pub use shell::ShellStepRunner;
