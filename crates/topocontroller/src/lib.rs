//! Topology Controller Library
//!
//! Keeps NodeResourceTopology custom resources, which describe the NUMA
//! layout and resource inventory of each cluster node, in line with a
//! desired-state inventory.
//!
//! Watch events feed a local cache and a deduplicating work queue; a pool
//! of workers reconciles one key at a time against the API server using
//! optimistic concurrency.

pub mod cache;
pub mod config;
pub mod controller;
pub mod crds;
pub mod dispatcher;
pub mod inventory;
pub mod key;
pub mod observability;
pub mod queue;
pub mod store;

pub use config::ControllerConfig;
pub use controller::{Controller, ControllerError, Outcome};
pub use crds::{NodeResourceTopology, NodeResourceTopologySpec, NumaNodeResource};
