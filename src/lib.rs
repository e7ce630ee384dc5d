//! atc - pipeline scheduling and build supervision
//!
//! The core of a CI/CD orchestrator: it keeps track of pipelines made of
//! resources (external version sources) and jobs (build plans triggered by
//! resource versions), and drives builds on a pool of remote workers.
//!
//! # Architecture
//!
//! Several orchestrator processes share one SQLite store. They agree on state
//! only through it:
//! - Every cross-process transition is a compare-and-swap
//! - Mutual exclusion uses leased locks stored next to the data
//! - Builds checkpoint after every step, so any process can resume them
//!
//! # Modules
//!
//! - `db`: the shared store
//! - `lock`: leased advisory locks
//! - `worker`: worker registry, selection and clients
//! - `radar`: resource version polling
//! - `scheduler`: build creation and dispatch
//! - `engine`: step-by-step build execution
//! - `pipelines`: one supervised radar/scheduler unit per active pipeline
//! - `builds`: resuming builds orphaned by a crashed process
//! - `runtime`: wiring and shutdown
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Register a pipeline
//! atc set-pipeline main --config pipeline.yaml
//!
//! # Run an orchestrator with a local worker
//! atc run --worker-name local --worker-addr http://127.0.0.1:7777 --worker-types git
//!
//! # Inspect builds
//! atc builds --pipeline main
//! ```

pub mod builds;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod lock;
pub mod pipelines;
pub mod radar;
pub mod runtime;
pub mod scheduler;
pub mod worker;

// Re-export main types at crate root for convenience
pub use config::Config;
pub use db::{Store, StoreError};
pub use domain::{Build, BuildStatus, PipelineConfig, PipelineRecord};
pub use engine::{Engine, EngineError, ExecEngine};
pub use runtime::{Runtime, Shutdown};
