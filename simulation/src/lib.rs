//! # Blobsync Simulation
//!
//! Runs several sync engines in one process as if they were separate
//! servers: they share one redb database file and one in-memory bus, and
//! each owns its entities' state on its own thread.
//!
//! ## Architecture
//!
//! - **Types** (`types.rs`): the replicated document and its owner
//! - **Store** (`store.rs`): per-server handle onto the shared database
//! - **Cluster** (`cluster.rs`): servers, shared clock, tick loop
//! - **Scenarios** (`scenarios.rs`): handoff, contention and churn runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use blobsync_simulation::{ClusterOptions, run_handoff};
//!
//! let report = run_handoff(ClusterOptions::default().with_servers(3), 6).await?;
//! assert!(report.converged);
//! println!("{report}");
//! ```

pub mod cluster;
pub mod scenarios;
pub mod store;
pub mod types;

pub use cluster::{Cluster, ClusterOptions, SimServer};
pub use scenarios::{ScenarioReport, run_churn, run_contention, run_handoff};
pub use store::ProcessStore;
pub use types::{CURSOR_PREFIX, Document, DocumentOwner, SimEngine};
