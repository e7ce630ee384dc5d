//! Command-line interface for atc.
//!
//! Runs the orchestrator and provides commands for managing pipelines,
//! triggering and aborting builds, and inspecting the shared store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{Config, StaticWorkerConfig};
use crate::db::Store;
use crate::domain::{version_digest, PipelineConfig};
use crate::engine::Engine;
use crate::radar::ScanOutcome;
use crate::runtime::Runtime;

/// atc - pipeline scheduling and build supervision
#[derive(Parser, Debug)]
#[command(name = "atc")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// SQLite database shared by all orchestrator processes
    #[arg(long, global = true, env = "ATC_DATABASE")]
    pub database: Option<PathBuf>,

    /// Compute schedules without checking resources or dispatching builds
    #[arg(long, global = true, env = "ATC_NOOP")]
    pub noop: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator until SIGINT (shutdown) or SIGTERM (drain)
    Run {
        #[command(flatten)]
        worker: StaticWorkerArgs,

        /// Default resource check interval in seconds
        #[arg(long, env = "ATC_CHECK_INTERVAL")]
        check_interval: Option<u64>,
    },

    /// Create or update a pipeline from a YAML file
    SetPipeline {
        /// Pipeline name
        name: String,

        /// Pipeline config file
        #[arg(short, long)]
        config: PathBuf,

        /// Owning team
        #[arg(short, long, default_value = "main")]
        team: String,

        /// Only save if the stored config version still matches (0 = new)
        #[arg(long)]
        expected_version: Option<i64>,
    },

    /// Stop scheduling a pipeline
    PausePipeline { name: String },

    /// Resume scheduling a pipeline
    UnpausePipeline { name: String },

    /// Archive a pipeline, keeping its history
    ArchivePipeline { name: String },

    /// Delete a pipeline and everything it owns
    DestroyPipeline { name: String },

    /// List pipelines
    Pipelines,

    /// List recent builds
    Builds {
        /// Only builds of this pipeline
        #[arg(short, long)]
        pipeline: Option<String>,

        /// Maximum number of builds to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Create a build of a job from the latest input versions
    Trigger { pipeline: String, job: String },

    /// Abort a pending or started build
    Abort { build_id: i64 },

    /// List registered workers
    Workers,

    /// Check a resource now, ignoring its interval
    CheckResource { pipeline: String, resource: String },

    /// List the versions of a resource, newest first
    Versions { pipeline: String, resource: String },

    /// Allow a version to be used as a build input again
    EnableVersion { version_id: i64 },

    /// Stop a version from being used as a build input
    DisableVersion { version_id: i64 },

    /// Show resolved configuration (debug)
    Config,
}

/// A worker registered by this process with no expiry
#[derive(clap::Args, Debug, Default)]
pub struct StaticWorkerArgs {
    /// Worker name
    #[arg(long = "worker-name", env = "ATC_WORKER_NAME", requires = "addr")]
    pub name: Option<String>,

    /// Worker base URL
    #[arg(long = "worker-addr", env = "ATC_WORKER_ADDR")]
    pub addr: Option<String>,

    /// Resource types the worker supports (comma-separated)
    #[arg(long = "worker-types", env = "ATC_WORKER_TYPES", value_delimiter = ',')]
    pub resource_types: Vec<String>,

    /// Restrict the worker to one team
    #[arg(long = "worker-team", env = "ATC_WORKER_TEAM")]
    pub team: Option<String>,
}

impl StaticWorkerArgs {
    fn into_config(self) -> Option<StaticWorkerConfig> {
        let name = self.name?;
        let addr = self.addr?;
        Some(StaticWorkerConfig {
            name,
            addr,
            resource_types: self.resource_types,
            team: self.team,
        })
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let mut config = Config::load()?;
        if let Some(database) = self.database {
            config.database = database;
        }
        config.noop |= self.noop;

        match self.command {
            Commands::Run {
                worker,
                check_interval,
            } => {
                if let Some(worker) = worker.into_config() {
                    config.static_worker = Some(worker);
                }
                if let Some(seconds) = check_interval {
                    config.check_interval = std::time::Duration::from_secs(seconds);
                }
                Runtime::new(config)?.run().await
            }
            Commands::SetPipeline {
                name,
                config: path,
                team,
                expected_version,
            } => set_pipeline(&open_store(&config)?, &name, &path, &team, expected_version),
            Commands::PausePipeline { name } => {
                open_store(&config)?.pause_pipeline(&name)?;
                println!("Paused {}", name);
                Ok(())
            }
            Commands::UnpausePipeline { name } => {
                open_store(&config)?.unpause_pipeline(&name)?;
                println!("Unpaused {}", name);
                Ok(())
            }
            Commands::ArchivePipeline { name } => {
                open_store(&config)?.archive_pipeline(&name)?;
                println!("Archived {}", name);
                Ok(())
            }
            Commands::DestroyPipeline { name } => {
                open_store(&config)?.destroy_pipeline(&name)?;
                println!("Destroyed {}", name);
                Ok(())
            }
            Commands::Pipelines => list_pipelines(&open_store(&config)?),
            Commands::Builds { pipeline, limit } => {
                list_builds(&open_store(&config)?, pipeline.as_deref(), limit)
            }
            Commands::Trigger { pipeline, job } => {
                let runtime = Runtime::new(config)?;
                let build = runtime
                    .scheduler()
                    .trigger_build(&pipeline, &job)
                    .with_context(|| format!("Failed to trigger {}/{}", pipeline, job))?;
                println!("Created build {} ({})", build.display_name(), build.id);
                Ok(())
            }
            Commands::Abort { build_id } => {
                let runtime = Runtime::new(config)?;
                if runtime.engine().abort(build_id).await? {
                    println!("Aborted build {}", build_id);
                } else {
                    println!("Build {} already finished", build_id);
                }
                Ok(())
            }
            Commands::Workers => list_workers(&open_store(&config)?),
            Commands::CheckResource { pipeline, resource } => {
                let runtime = Runtime::new(config)?;
                let outcome = runtime
                    .radar()
                    .check_now(&pipeline, &resource)
                    .await
                    .with_context(|| format!("Failed to check {}/{}", pipeline, resource))?;
                match outcome {
                    ScanOutcome::Checked { new_versions } => {
                        println!("Found {} new version(s)", new_versions)
                    }
                    ScanOutcome::LockHeld => println!("Resource is being checked elsewhere"),
                    ScanOutcome::Skipped => println!("Skipped (noop)"),
                    ScanOutcome::NotDue => println!("Checked recently"),
                }
                Ok(())
            }
            Commands::Versions { pipeline, resource } => {
                list_versions(&open_store(&config)?, &pipeline, &resource)
            }
            Commands::EnableVersion { version_id } => {
                open_store(&config)?.set_version_enabled(version_id, true)?;
                println!("Enabled version {}", version_id);
                Ok(())
            }
            Commands::DisableVersion { version_id } => {
                open_store(&config)?.set_version_enabled(version_id, false)?;
                println!("Disabled version {}", version_id);
                Ok(())
            }
            Commands::Config => {
                show_config(&config);
                Ok(())
            }
        }
    }
}

fn open_store(config: &Config) -> Result<Store> {
    config.ensure_home()?;
    Store::open(&config.database)
        .with_context(|| format!("Failed to open database {}", config.database.display()))
}

fn set_pipeline(
    store: &Store,
    name: &str,
    path: &Path,
    team: &str,
    expected_version: Option<i64>,
) -> Result<()> {
    let pipeline = PipelineConfig::from_file(path)?;
    let version = store
        .save_pipeline_config(name, team, &pipeline, expected_version)
        .with_context(|| format!("Failed to save pipeline {}", name))?;

    println!(
        "Saved {} (config version {}, {} resources, {} jobs)",
        name,
        version,
        pipeline.resources.len(),
        pipeline.jobs.len()
    );
    Ok(())
}

fn list_pipelines(store: &Store) -> Result<()> {
    let pipelines = store.list_pipelines()?;
    if pipelines.is_empty() {
        println!("No pipelines found");
        return Ok(());
    }

    println!("{:<24} {:<12} {:<8} {:<10}", "NAME", "TEAM", "VERSION", "STATE");
    println!("{}", "-".repeat(56));

    for pipeline in pipelines {
        let state = if pipeline.archived {
            "archived"
        } else if pipeline.paused {
            "paused"
        } else {
            "active"
        };
        println!(
            "{:<24} {:<12} {:<8} {:<10}",
            pipeline.name, pipeline.team, pipeline.config_version, state
        );
    }

    Ok(())
}

fn list_builds(store: &Store, pipeline: Option<&str>, limit: usize) -> Result<()> {
    let builds = store.list_builds(pipeline, limit)?;
    if builds.is_empty() {
        println!("No builds found");
        return Ok(());
    }

    println!("{:<8} {:<32} {:<10} {:<20}", "ID", "BUILD", "STATUS", "CREATED");
    println!("{}", "-".repeat(72));

    for build in builds {
        println!(
            "{:<8} {:<32} {:<10} {:<20}",
            build.id,
            build.display_name(),
            build.status,
            build.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &build.error {
            println!("         error: {}", error);
        }
    }

    Ok(())
}

fn list_workers(store: &Store) -> Result<()> {
    let workers = store.workers()?;
    if workers.is_empty() {
        println!("No workers registered");
        return Ok(());
    }

    println!("{:<20} {:<32} {:<10} {}", "NAME", "ADDRESS", "TEAM", "TYPES");
    println!("{}", "-".repeat(80));

    for worker in workers {
        let types: Vec<&str> = worker
            .resource_types
            .iter()
            .map(|t| t.type_.as_str())
            .collect();
        println!(
            "{:<20} {:<32} {:<10} {}",
            worker.name,
            worker.addr,
            worker.team.as_deref().unwrap_or("-"),
            types.join(",")
        );
    }

    Ok(())
}

fn list_versions(store: &Store, pipeline: &str, resource: &str) -> Result<()> {
    let record = store
        .resource(pipeline, resource)?
        .with_context(|| format!("Resource not found: {}/{}", pipeline, resource))?;

    if let Some(error) = &record.check_error {
        println!("Last check failed: {}", error);
    }

    let versions = store.versions(record.id)?;
    if versions.is_empty() {
        println!("No versions discovered");
        return Ok(());
    }

    for version in versions.iter().rev() {
        let fields: Vec<String> = version
            .version
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!(
            "{:<8} {:<10} {:<14} {}",
            version.id,
            if version.enabled { "enabled" } else { "disabled" },
            &version_digest(&version.version)[..12],
            fields.join(" ")
        );
    }

    Ok(())
}

fn show_config(config: &Config) {
    println!("atc configuration");
    println!();
    println!(
        "Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", config.home.display());
    println!("  Database: {}", config.database.display());
    println!();
    println!("Intervals:");
    println!("  Check:     {}s", config.check_interval.as_secs());
    println!("  Scheduler: {}s", config.scheduler_interval.as_secs());
    println!("  Sync:      {}s", config.sync_interval.as_secs());
    println!("  Tracker:   {}s", config.tracker_interval.as_secs());
    println!("  Build lease TTL: {}s", config.build_lease_ttl.as_secs());
    println!();
    println!("Workers:");
    println!("  Dial timeout: {}s", config.worker.dial_timeout.as_secs());
    println!("  Keep-alive:   {}s idle", config.worker.keepalive_idle.as_secs());
    println!(
        "  Retry:        {}s base, {}s max, {}s budget",
        config.worker.retry.base.as_secs(),
        config.worker.retry.max.as_secs(),
        config.worker.retry.budget.as_secs()
    );
    match &config.static_worker {
        Some(worker) => println!(
            "  Static:       {} at {} ({})",
            worker.name,
            worker.addr,
            worker.resource_types.join(",")
        ),
        None => println!("  Static:       (none)"),
    }
    println!();
    println!("Noop: {}", config.noop);
}
