//! dockhand command-line interface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use dockhand_core::pipeline::{self, UpOptions, UpPipeline};
use dockhand_core::progress::ProgressReporter;
use dockhand_core::runtime::{ContainerState, DockerCli};
use dockhand_core::store::ProjectStore;
use dockhand_core::ProjectModel;

#[derive(Parser)]
#[command(name = "dockhand", version, about = "Dev environments for compose projects")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Compose manifest to operate on
    #[arg(short, long, global = true, default_value = "docker-compose.yml")]
    file: PathBuf,

    /// Project name (defaults to the manifest's directory name)
    #[arg(short, long, global = true)]
    project: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the project up, installing dependencies as needed
    Up {
        /// Run in the background
        #[arg(short, long)]
        detach: bool,

        /// Reinstall dependencies even when nothing changed
        #[arg(long)]
        reinstall: bool,

        /// Skip file watchers
        #[arg(long)]
        no_watch: bool,

        /// Instrument a service with the metrics shim (repeatable)
        #[arg(long = "instrument", value_name = "SERVICE")]
        instrument: Vec<String>,
    },

    /// Stop the project's services
    Down {
        /// Also remove the derived manifest
        #[arg(long)]
        remove_derived: bool,
    },

    /// Show container and volume state
    Status,

    /// Remove containers, volumes, networks, and saved state
    Clean,

    /// Manage the force-reinstall package registry
    Reinstall {
        /// Add a package to the registry (repeatable)
        #[arg(long, value_name = "PACKAGE")]
        add: Vec<String>,

        /// Disable a registry package (repeatable)
        #[arg(long, value_name = "PACKAGE")]
        remove: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = DockerCli::new();
    let progress = ProgressReporter::new(|line| {
        println!("{} {}", "•".cyan(), line);
    });

    match cli.command {
        Commands::Up { detach, reinstall, no_watch, instrument } => {
            let pipeline = UpPipeline::new(Arc::new(runtime), progress);
            let options = UpOptions {
                manifest_path: cli.file,
                project_name: cli.project,
                detach,
                reinstall,
                no_watch,
                instrument,
            };
            let ctx = pipeline.run(&options).await?;
            println!(
                "{} {} service(s) up",
                "✓".green().bold(),
                ctx.model.services.len()
            );
            // Attached watchers keep running until interrupted.
            if !detach && ctx.watchers.is_some() {
                tokio::signal::ctrl_c().await?;
            }
        }

        Commands::Down { remove_derived } => {
            pipeline::down(&runtime, &cli.file, cli.project.as_deref(), remove_derived).await?;
            println!("{} services stopped", "✓".green().bold());
        }

        Commands::Status => {
            let entries =
                pipeline::status(&runtime, &cli.file, cli.project.as_deref()).await?;
            for entry in entries {
                let state = match entry.state {
                    ContainerState::Running => "running".green(),
                    ContainerState::Exited => "exited".yellow(),
                    ContainerState::Missing => "missing".red(),
                };
                let volume = match (&entry.volume, entry.volume_exists) {
                    (Some(name), true) => format!("volume {name}").normal(),
                    (Some(name), false) => format!("volume {name} (absent)").yellow(),
                    (None, _) => String::new().normal(),
                };
                println!(
                    "{:<20} {:<28} {:<10} {}",
                    entry.service.bold(),
                    entry.container,
                    state,
                    volume
                );
            }
        }

        Commands::Clean => {
            pipeline::clean(&runtime, &cli.file, cli.project.as_deref(), &progress).await?;
            println!("{} project cleaned", "✓".green().bold());
        }

        Commands::Reinstall { add, remove } => {
            let model = ProjectModel::parse(&cli.file, cli.project.as_deref())?;
            let store = ProjectStore::for_project(&model.root);
            let registry = pipeline::edit_force_reinstalls(&store, &add, &remove)?;
            if registry.is_empty() {
                println!("no packages registered for forced reinstall");
            }
            for package in registry {
                let marker = if package.enabled { "✓".green() } else { "✗".red() };
                println!("{marker} {}", package.name);
            }
        }
    }

    Ok(())
}
