//! NodeResourceTopology CRD
//!
//! Defines the NodeResourceTopology custom resource: one object per cluster
//! node, describing which resources belong to which NUMA node.

use super::quantity::{CanonicalQuantity, QuantityError};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{api::ObjectMeta, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// NodeResourceTopology describes the NUMA layout of a single node.
///
/// The object name is the node name. `spec.nodes` lists the node's NUMA
/// domains and the resources local to each one.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "topocontroller.k8s.io",
    version = "v1alpha1",
    kind = "NodeResourceTopology",
    plural = "noderesourcetopologies",
    shortname = "nrt",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeResourceTopologySpec {
    /// NUMA nodes of this cluster node. `numaID` values are unique.
    #[serde(default)]
    pub nodes: Vec<NumaNodeResource>,
}

/// Resources local to one NUMA node.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NumaNodeResource {
    /// NUMA node identifier, unique within the owning resource.
    #[serde(rename = "numaID")]
    pub numa_id: u32,

    /// Resource name (e.g. `cpu`, `nic1`) to quantity.
    #[serde(default)]
    pub resources: BTreeMap<String, Quantity>,
}

impl NumaNodeResource {
    pub fn new<I, N, Q>(numa_id: u32, resources: I) -> Self
    where
        I: IntoIterator<Item = (N, Q)>,
        N: Into<String>,
        Q: Into<String>,
    {
        Self {
            numa_id,
            resources: resources
                .into_iter()
                .map(|(name, qty)| (name.into(), Quantity(qty.into())))
                .collect(),
        }
    }
}

impl NodeResourceTopology {
    /// Build a topology object for `node` in `namespace`.
    pub fn for_node(namespace: &str, node: &str, nodes: Vec<NumaNodeResource>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(node.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            spec: NodeResourceTopologySpec { nodes },
        }
    }

    /// Cache/queue key (`namespace/name`).
    pub fn key(&self) -> String {
        crate::key::key_for(&self.namespace().unwrap_or_default(), &self.name_any())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("numaID {0} appears more than once")]
    DuplicateNumaId(u32),
    #[error("invalid quantity for {resource} on numaID {numa_id}: {source}")]
    InvalidQuantity {
        numa_id: u32,
        resource: String,
        #[source]
        source: QuantityError,
    },
}

/// Order-insensitive, canonical view of a NUMA layout.
///
/// Two layouts are equal when they have the same NUMA id set and the same
/// resource amounts per NUMA node, regardless of list order or quantity
/// spelling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout(BTreeMap<u32, BTreeMap<String, CanonicalQuantity>>);

impl Layout {
    /// Validate `nodes` and build the canonical layout.
    pub fn from_nodes(nodes: &[NumaNodeResource]) -> Result<Self, TopologyError> {
        let mut layout = BTreeMap::new();
        for node in nodes {
            let resources = node
                .resources
                .iter()
                .map(|(name, qty)| {
                    CanonicalQuantity::try_from(qty)
                        .map(|canonical| (name.clone(), canonical))
                        .map_err(|source| TopologyError::InvalidQuantity {
                            numa_id: node.numa_id,
                            resource: name.clone(),
                            source,
                        })
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?;

            if layout.insert(node.numa_id, resources).is_some() {
                return Err(TopologyError::DuplicateNumaId(node.numa_id));
            }
        }
        Ok(Self(layout))
    }

    /// True when `nodes` is valid and describes this layout.
    ///
    /// An observed list that fails validation never matches, so it gets
    /// overwritten by a valid desired layout.
    pub fn matches(&self, nodes: &[NumaNodeResource]) -> bool {
        Self::from_nodes(nodes).is_ok_and(|other| other == *self)
    }
}

/// Copy of `nodes` sorted by NUMA id, the order written to the store.
pub fn sorted_by_numa_id(nodes: &[NumaNodeResource]) -> Vec<NumaNodeResource> {
    let mut sorted = nodes.to_vec();
    sorted.sort_by_key(|node| node.numa_id);
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(numa_id: u32, qty: &str) -> NumaNodeResource {
        NumaNodeResource::new(numa_id, [("cpu", qty)])
    }

    #[test]
    fn test_layout_ignores_order_and_spelling() {
        let a = vec![cpu(1, "2"), cpu(2, "4")];
        let b = vec![cpu(2, "4000m"), cpu(1, "2e0")];
        let layout = Layout::from_nodes(&a).unwrap();
        assert!(layout.matches(&b));
    }

    #[test]
    fn test_layout_detects_changes() {
        let layout = Layout::from_nodes(&[cpu(1, "2"), cpu(2, "2")]).unwrap();
        assert!(!layout.matches(&[cpu(1, "2"), cpu(2, "4")]));
        assert!(!layout.matches(&[cpu(1, "2")]));
        assert!(!layout.matches(&[cpu(1, "2"), cpu(3, "2")]));
        assert!(!layout.matches(&[
            cpu(1, "2"),
            NumaNodeResource::new(2, [("cpu", "2"), ("nic1", "1")]),
        ]));
    }

    #[test]
    fn test_layout_rejects_duplicates_and_negative() {
        assert_eq!(
            Layout::from_nodes(&[cpu(1, "2"), cpu(1, "3")]),
            Err(TopologyError::DuplicateNumaId(1))
        );
        let err = Layout::from_nodes(&[cpu(0, "-1")]).unwrap_err();
        assert!(matches!(err, TopologyError::InvalidQuantity { numa_id: 0, .. }));
    }

    #[test]
    fn test_layout_rejects_out_of_range_quantity() {
        let err = Layout::from_nodes(&[cpu(3, "1e2147483647")]).unwrap_err();
        assert_eq!(
            err,
            TopologyError::InvalidQuantity {
                numa_id: 3,
                resource: "cpu".to_string(),
                source: QuantityError::OutOfRange("1e2147483647".to_string()),
            }
        );
        let layout = Layout::from_nodes(&[cpu(3, "2")]).unwrap();
        assert!(!layout.matches(&[cpu(3, "1e2147483647")]));
    }

    #[test]
    fn test_invalid_observed_never_matches() {
        let layout = Layout::from_nodes(&[cpu(1, "2")]).unwrap();
        assert!(!layout.matches(&[cpu(1, "bogus")]));
    }

    #[test]
    fn test_spec_deserialize() {
        let json = r#"{
            "nodes": [
                { "numaID": 1, "resources": { "cpu": "2", "nic1": "3" } },
                { "numaID": 2, "resources": { "cpu": "2" } }
            ]
        }"#;
        let spec: NodeResourceTopologySpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.nodes.len(), 2);
        assert_eq!(spec.nodes[0].numa_id, 1);
        assert_eq!(spec.nodes[0].resources["nic1"], Quantity("3".to_string()));
    }

    #[test]
    fn test_spec_serialize_uses_numa_id_field() {
        let spec = NodeResourceTopologySpec {
            nodes: vec![cpu(1, "2")],
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["nodes"][0]["numaID"], 1);
        assert_eq!(json["nodes"][0]["resources"]["cpu"], "2");
    }

    #[test]
    fn test_key_and_sorting() {
        let nrt = NodeResourceTopology::for_node("default", "node-test1", vec![cpu(2, "1"), cpu(1, "1")]);
        assert_eq!(nrt.key(), "default/node-test1");
        let sorted = sorted_by_numa_id(&nrt.spec.nodes);
        assert_eq!(sorted.iter().map(|n| n.numa_id).collect::<Vec<_>>(), vec![1, 2]);
    }
}
