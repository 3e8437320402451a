//! Cluster resource totals
//!
//! Sums node `capacity` (or `allocatable`) across the nodes whose names match
//! any of a set of regex patterns. The totals size the ClusterQueue that an
//! eviction run packs (`--cores`, `--ram`, `--storage`).
//!
//! Nodes are deduplicated by UID, so overlapping patterns never count a node
//! twice. A resource that no matched node reports is left unset.

use crate::client::KubeClient;
use crate::error::{KueuerError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// CPU resource name
pub const CPU: &str = "cpu";
/// Memory resource name
pub const MEMORY: &str = "memory";
/// Ephemeral storage resource name
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";
/// NVIDIA device plugin resource name
pub const NVIDIA_GPU: &str = "nvidia.com/gpu";
/// AMD device plugin resource name
pub const AMD_GPU: &str = "amd.com/gpu";

const NODES_PATH: &str = "/api/v1/nodes";

const GIB: f64 = (1u64 << 30) as f64;

const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", (1u64 << 10) as f64),
    ("Mi", (1u64 << 20) as f64),
    ("Gi", (1u64 << 30) as f64),
    ("Ti", (1u64 << 40) as f64),
    ("Pi", (1u64 << 50) as f64),
    ("Ei", (1u64 << 60) as f64),
];

/// Node status field to total
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NodeField {
    /// `status.capacity`
    #[default]
    Capacity,
    /// `status.allocatable`
    Allocatable,
}

/// Parse a Kubernetes resource quantity (`500m`, `16Gi`, `1e3`, `2k`).
///
/// CPU quantities come out in cores, memory and storage in bytes.
pub fn parse_quantity(text: &str) -> Result<f64> {
    let text = text.trim();
    let invalid = || KueuerError::quantity(format!("invalid quantity {:?}", text));

    for (suffix, factor) in BINARY_SUFFIXES {
        if let Some(number) = text.strip_suffix(suffix) {
            return parse_number(number).map(|n| n * factor).ok_or_else(invalid);
        }
    }

    // plain and exponent forms; a bare trailing `E` is exa, not an exponent
    if let Some(number) = parse_number(text) {
        return Ok(number);
    }

    let split = text.char_indices().last().map(|(i, _)| i).ok_or_else(invalid)?;
    let (number, suffix) = text.split_at(split);
    let value = parse_number(number).ok_or_else(invalid)?;
    Ok(match suffix {
        "n" => value / 1e9,
        "u" => value / 1e6,
        "m" => value / 1e3,
        "k" => value * 1e3,
        "M" => value * 1e6,
        "G" => value * 1e9,
        "T" => value * 1e12,
        "P" => value * 1e15,
        "E" => value * 1e18,
        _ => return Err(invalid()),
    })
}

fn parse_number(text: &str) -> Option<f64> {
    text.parse::<f64>()
        .ok()
        .filter(|n| n.is_finite() && *n >= 0.0)
}

/// Resource totals over the matched nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceTotals {
    /// Matched nodes after deduplication
    pub nodes: usize,
    /// CPU in cores
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<f64>,
    /// Memory in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<f64>,
    /// Ephemeral storage in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral_storage_bytes: Option<f64>,
    /// NVIDIA GPUs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nvidia_gpus: Option<u64>,
    /// AMD GPUs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amd_gpus: Option<u64>,
}

impl ResourceTotals {
    /// Totals scaled by `fraction`, which must lie in `(0, 1]`.
    /// GPU counts round down.
    pub fn scaled(&self, fraction: f64) -> Result<Self> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(KueuerError::config(format!(
                "scale must be in (0, 1], got {}",
                fraction
            )));
        }
        let gpus = |count: Option<u64>| count.map(|c| (c as f64 * fraction).floor() as u64);
        Ok(Self {
            nodes: self.nodes,
            cpu_cores: self.cpu_cores.map(|v| v * fraction),
            memory_bytes: self.memory_bytes.map(|v| v * fraction),
            ephemeral_storage_bytes: self.ephemeral_storage_bytes.map(|v| v * fraction),
            nvidia_gpus: gpus(self.nvidia_gpus),
            amd_gpus: gpus(self.amd_gpus),
        })
    }

    /// Whole cores, as taken by `benchmark evictions --cores`
    pub fn whole_cores(&self) -> u32 {
        self.cpu_cores.map_or(0, |v| v.floor() as u32)
    }

    /// Whole GiB of memory, as taken by `benchmark evictions --ram`
    pub fn memory_gib(&self) -> u32 {
        self.memory_bytes.map_or(0, |v| (v / GIB).floor() as u32)
    }

    /// Whole GiB of ephemeral storage, as taken by `benchmark evictions --storage`
    pub fn storage_gib(&self) -> u32 {
        self.ephemeral_storage_bytes
            .map_or(0, |v| (v / GIB).floor() as u32)
    }
}

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<Node>,
}

#[derive(Debug, Deserialize)]
struct Node {
    metadata: NodeMetadata,
    #[serde(default)]
    status: Option<NodeStatus>,
}

#[derive(Debug, Deserialize)]
struct NodeMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    uid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    capacity: Option<BTreeMap<String, String>>,
    #[serde(default)]
    allocatable: Option<BTreeMap<String, String>>,
}

impl Node {
    fn quantities(&self, field: NodeField) -> Option<&BTreeMap<String, String>> {
        let status = self.status.as_ref()?;
        match field {
            NodeField::Capacity => status.capacity.as_ref(),
            NodeField::Allocatable => status.allocatable.as_ref(),
        }
    }
}

/// Compile node name patterns; an empty list matches every node
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| Ok(Regex::new(p)?))
        .collect()
}

fn node_matches(name: &str, patterns: &[Regex]) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| p.is_match(name))
}

fn sum(values: &[&String]) -> Result<Option<f64>> {
    if values.is_empty() {
        return Ok(None);
    }
    let mut total = 0.0;
    for value in values {
        total += parse_quantity(value)?;
    }
    Ok(Some(total))
}

fn sum_nodes(list: &NodeList, patterns: &[Regex], field: NodeField) -> Result<ResourceTotals> {
    let mut matched: HashMap<&str, &Node> = HashMap::new();
    for node in &list.items {
        if node_matches(&node.metadata.name, patterns) {
            let key = node.metadata.uid.as_deref().unwrap_or(&node.metadata.name);
            matched.insert(key, node);
        }
    }

    let mut by_resource: BTreeMap<&str, Vec<&String>> = BTreeMap::new();
    for node in matched.values() {
        let Some(quantities) = node.quantities(field) else {
            debug!(node = %node.metadata.name, ?field, "Node reports no resources");
            continue;
        };
        for resource in [CPU, MEMORY, EPHEMERAL_STORAGE, NVIDIA_GPU, AMD_GPU] {
            if let Some(value) = quantities.get(resource) {
                by_resource.entry(resource).or_default().push(value);
            }
        }
    }

    let total = |resource: &str| -> Result<Option<f64>> {
        by_resource.get(resource).map_or(Ok(None), |values| sum(values))
    };
    let count = |resource: &str| -> Result<Option<u64>> {
        Ok(total(resource)?.map(|v| v.floor() as u64))
    };

    Ok(ResourceTotals {
        nodes: matched.len(),
        cpu_cores: total(CPU)?,
        memory_bytes: total(MEMORY)?,
        ephemeral_storage_bytes: total(EPHEMERAL_STORAGE)?,
        nvidia_gpus: count(NVIDIA_GPU)?,
        amd_gpus: count(AMD_GPU)?,
    })
}

/// Total `field` across every node whose name matches one of `patterns`
pub async fn cluster_resources(
    client: &KubeClient,
    patterns: &[String],
    field: NodeField,
) -> Result<ResourceTotals> {
    let compiled = compile_patterns(patterns)?;
    let list: NodeList = client.get_json(NODES_PATH, &[]).await?;
    let totals = sum_nodes(&list, &compiled, field)?;

    info!(
        nodes = totals.nodes,
        listed = list.items.len(),
        ?field,
        cpu_cores = ?totals.cpu_cores,
        memory_gib = totals.memory_gib(),
        storage_gib = totals.storage_gib(),
        "Summed node resources"
    );
    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node_list() -> NodeList {
        serde_json::from_value(json!({
            "items": [
                {
                    "metadata": { "name": "worker-1", "uid": "u1" },
                    "status": {
                        "capacity": {
                            "cpu": "16",
                            "memory": "64Gi",
                            "ephemeral-storage": "100Gi",
                            "nvidia.com/gpu": "2"
                        },
                        "allocatable": {
                            "cpu": "15500m",
                            "memory": "62Gi",
                            "ephemeral-storage": "90Gi"
                        }
                    }
                },
                {
                    "metadata": { "name": "worker-2", "uid": "u2" },
                    "status": {
                        "capacity": { "cpu": "8", "memory": "32Gi", "ephemeral-storage": "50Gi" },
                        "allocatable": { "cpu": "7", "memory": "30Gi", "ephemeral-storage": "45Gi" }
                    }
                },
                {
                    "metadata": { "name": "control-plane", "uid": "u3" },
                    "status": { "capacity": { "cpu": "4", "memory": "8Gi" } }
                },
                { "metadata": { "name": "worker-3", "uid": "u4" } }
            ]
        }))
        .unwrap()
    }

    fn patterns(list: &[&str]) -> Vec<Regex> {
        let owned: Vec<String> = list.iter().map(|p| p.to_string()).collect();
        compile_patterns(&owned).unwrap()
    }

    #[test]
    fn test_parse_quantity() {
        let cases = [
            ("16", 16.0),
            ("500m", 0.5),
            ("2k", 2000.0),
            ("1Ki", 1024.0),
            ("64Gi", 64.0 * GIB),
            ("1.5G", 1.5e9),
            ("1e3", 1000.0),
            ("2E", 2e18),
            ("250u", 250e-6),
        ];
        for (text, expected) in cases {
            let value = parse_quantity(text).unwrap();
            assert!((value - expected).abs() <= expected * 1e-12, "{}", text);
        }
    }

    #[test]
    fn test_parse_quantity_rejects_garbage() {
        for text in ["", "Gi", "12Q", "-1", "abc", "nan"] {
            assert!(
                matches!(parse_quantity(text), Err(KueuerError::Quantity(_))),
                "{}",
                text
            );
        }
    }

    #[test]
    fn test_capacity_over_matched_nodes() {
        let totals = sum_nodes(&node_list(), &patterns(&["worker-.*"]), NodeField::Capacity).unwrap();

        assert_eq!(totals.nodes, 3);
        assert_eq!(totals.cpu_cores, Some(24.0));
        assert_eq!(totals.memory_gib(), 96);
        assert_eq!(totals.storage_gib(), 150);
        assert_eq!(totals.nvidia_gpus, Some(2));
        assert_eq!(totals.amd_gpus, None);
    }

    #[test]
    fn test_allocatable_and_overlapping_patterns() {
        let totals = sum_nodes(
            &node_list(),
            &patterns(&["worker-1", "worker-[12]"]),
            NodeField::Allocatable,
        )
        .unwrap();

        assert_eq!(totals.nodes, 2);
        assert_eq!(totals.cpu_cores, Some(22.5));
        assert_eq!(totals.whole_cores(), 22);
        assert_eq!(totals.memory_gib(), 92);
        assert_eq!(totals.nvidia_gpus, None);
    }

    #[test]
    fn test_empty_patterns_match_every_node() {
        let totals = sum_nodes(&node_list(), &patterns(&["", "  "]), NodeField::Capacity).unwrap();
        assert_eq!(totals.nodes, 4);
        assert_eq!(totals.cpu_cores, Some(28.0));
        // control-plane has no ephemeral-storage entry
        assert_eq!(totals.storage_gib(), 150);
    }

    #[test]
    fn test_no_match_leaves_resources_unset() {
        let totals = sum_nodes(&node_list(), &patterns(&["^gpu-"]), NodeField::Capacity).unwrap();
        assert_eq!(totals, ResourceTotals::default());

        let json = serde_json::to_value(&totals).unwrap();
        assert_eq!(json, json!({ "nodes": 0 }));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = compile_patterns(&["worker-(".to_string()]).unwrap_err();
        assert!(matches!(err, KueuerError::Pattern(_)));
    }

    #[test]
    fn test_scaled_totals() {
        let totals = sum_nodes(&node_list(), &patterns(&["worker-.*"]), NodeField::Capacity).unwrap();
        let scaled = totals.scaled(0.5).unwrap();

        assert_eq!(scaled.cpu_cores, Some(12.0));
        assert_eq!(scaled.memory_gib(), 48);
        assert_eq!(scaled.nvidia_gpus, Some(1));
        assert!(totals.scaled(0.0).is_err());
        assert!(totals.scaled(1.5).is_err());
    }
}
