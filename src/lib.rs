//! Stratum - multi-component project generation.
//!
//! Stratum creates a project made of several components (a Go backend, a
//! Next.js frontend, a Flutter or Android app, ...) in one run. Each
//! component is produced by its real toolchain when that toolchain is
//! installed and usable, and by a built-in skeleton otherwise. A run either
//! completes or leaves the output directory as it found it.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`coordinator`] - Drives the pipeline and the retry/fallback policy
//! - [`discovery`] - Registry of known tools and the executor/fallback decision
//! - [`tool_cache`] - Persistent, TTL-based cache of tool availability
//! - [`offline`] - Network reachability detection
//! - [`executor`] - Component executors and the type -> executor registry
//! - [`fallback`] - Built-in skeleton generation
//! - [`rollback`] - Backups and temp dirs for restoring on failure
//! - [`integration`] - Post-generation integration (project manifest)
//! - [`errors`] - Error taxonomy and recovery policy
//! - [`model`] - Component configuration and results
//! - [`config`] - Configuration file and environment overrides
//! - [`process`] - External process execution
//! - [`providers`] - Shared dependency injection traits
//! - [`http_client`] - HTTP client abstraction
//! - [`logging`] - Tracing subscriber setup
//!
//! # Example
//!
//! ```ignore
//! use stratum::coordinator::{Coordinator, GenerationRequest};
//! use stratum::model::ComponentConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinator = Coordinator::builder(discovery, rollback)
//!         .executors(executors)
//!         .build();
//!
//!     let request = GenerationRequest::new("shop", "./shop")
//!         .component(ComponentConfig::new("go-backend", "api"))
//!         .component(ComponentConfig::new("nextjs", "web"));
//!
//!     let report = coordinator.generate(request, Default::default()).await?;
//!     for component in &report.components {
//!         println!("{} -> {}", component.name, component.path.display());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Offline use
//!
//! When the network is unreachable (or `--offline` is given) the tool cache
//! stops expiring entries and every component is produced from its skeleton:
//!
//! ```bash
//! stratum new shop --component go-backend:api --component react:web --offline
//! ```

pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod errors;
pub mod executor;
pub mod fallback;
pub mod http_client;
pub mod integration;
pub mod logging;
pub mod model;
pub mod offline;
pub mod process;
pub mod providers;
pub mod rollback;
pub mod tool_cache;
