//! Custom Resource Definitions
//!
//! The NodeResourceTopology CRD and the quantity handling needed to compare
//! NUMA layouts.

pub mod node_resource_topology;
pub mod quantity;

pub use node_resource_topology::{
    sorted_by_numa_id, Layout, NodeResourceTopology, NodeResourceTopologySpec, NumaNodeResource,
    TopologyError,
};
pub use quantity::{parse_quantity, CanonicalQuantity, QuantityError};
