//! BuildIt CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "buildit")]
#[command(about = "BuildIt CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate item definitions
    Validate {
        /// Path to the definition file
        #[arg(default_value = "buildit.kdl")]
        path: PathBuf,
    },
    /// Run one build of a project locally
    Build {
        /// Path to the definition file
        #[arg(default_value = "buildit.kdl")]
        path: PathBuf,
        /// Project to build when the file defines several
        #[arg(short, long)]
        project: Option<String>,
        /// Build root to keep history in; a temporary one when omitted
        #[arg(long, env = "BUILDIT_ROOT")]
        root: Option<PathBuf>,
    },
    /// List the recorded builds of a project
    History {
        /// Full name of the project
        project: String,
        /// Build root
        #[arg(long, env = "BUILDIT_ROOT", default_value = "buildit-home")]
        root: PathBuf,
        /// Print the console log of this build instead
        #[arg(long)]
        log: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Build {
            path,
            project,
            root,
        } => {
            commands::build::run_local(&path, project.as_deref(), root).await?;
        }
        Commands::History { project, root, log } => {
            commands::history::show(&root, &project, log).await?;
        }
    }

    Ok(())
}
