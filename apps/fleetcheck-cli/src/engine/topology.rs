//! Cluster topology: node identities, roles, and SSH host attribution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Writer,
    Reader,
    Controller,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    /// Virtual cluster endpoint; a connection target, never a per-node
    /// check target.
    Cluster,
    /// Virtual reader load-balancer endpoint.
    ReaderLb,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Active,
    Down,
    Joining,
    Leaving,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Stable identity: instance id for managed nodes, broker id for
    /// Kafka, IP address for Cassandra.
    pub id: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub role: NodeRole,
    pub endpoint_type: EndpointType,
    pub state: NodeState,
    /// Free-form annotations: AZ, rack, datacenter, version.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub metadata: BTreeMap<String, String>,
}

impl NodeIdentity {
    pub fn instance(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: None,
            role: NodeRole::Unknown,
            endpoint_type: EndpointType::Instance,
            state: NodeState::Active,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_state(mut self, state: NodeState) -> Self {
        self.state = state;
        self
    }

    pub fn with_endpoint_type(mut self, endpoint_type: EndpointType) -> Self {
        self.endpoint_type = endpoint_type;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Discovered cluster membership. Node ids are unique within a topology;
/// duplicate discoveries keep the first sighting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Topology {
    nodes: Vec<NodeIdentity>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: NodeIdentity) {
        if self.nodes.iter().any(|n| n.id == node.id) {
            warn!("duplicate node id '{}' in topology, keeping first", node.id);
            return;
        }
        self.nodes.push(node);
    }

    pub fn nodes(&self) -> &[NodeIdentity] {
        &self.nodes
    }

    /// Per-node check targets: instance endpoints only. Virtual cluster
    /// and reader-LB entries never appear here.
    pub fn instances(&self) -> impl Iterator<Item = &NodeIdentity> {
        self.nodes
            .iter()
            .filter(|n| n.endpoint_type == EndpointType::Instance)
    }

    pub fn instance_count(&self) -> usize {
        self.instances().count()
    }

    pub fn writer(&self) -> Option<&NodeIdentity> {
        self.instances().find(|n| n.role == NodeRole::Writer)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Marker node id for SSH hosts that could not be attributed to a cluster
/// member. Such hosts still participate in fan-out; their output simply
/// cannot be tied to a node identity.
pub const UNMAPPED_NODE_ID: &str = "unmapped";

/// Maps configured SSH hosts to node identities: exact address match,
/// then substring match, then an optional caller-supplied mapper.
/// Unmapped hosts are retained and flagged.
pub fn map_ssh_hosts_to_nodes(
    ssh_hosts: &[String],
    topology: &Topology,
    mapper: Option<&dyn Fn(&str) -> Option<String>>,
) -> BTreeMap<String, String> {
    let mut mapping = BTreeMap::new();

    for ssh_host in ssh_hosts {
        let exact = topology
            .instances()
            .find(|n| &n.host == ssh_host)
            .map(|n| n.id.clone());

        let resolved = exact
            .or_else(|| {
                topology
                    .instances()
                    .find(|n| n.host.contains(ssh_host.as_str()) || ssh_host.contains(&n.host))
                    .map(|n| n.id.clone())
            })
            .or_else(|| mapper.and_then(|m| m(ssh_host)));

        match resolved {
            Some(node_id) => {
                info!("mapped SSH host {} to node {}", ssh_host, node_id);
                mapping.insert(ssh_host.clone(), node_id);
            }
            None => {
                warn!(
                    "SSH host {} is not a known cluster member; commands will run but output cannot be attributed",
                    ssh_host
                );
                mapping.insert(ssh_host.clone(), UNMAPPED_NODE_ID.to_string());
            }
        }
    }

    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_topology() -> Topology {
        let mut t = Topology::new();
        t.insert(
            NodeIdentity::instance("db-1", "db-1.internal.example.com").with_role(NodeRole::Writer),
        );
        t.insert(
            NodeIdentity::instance("db-2", "10.0.1.12").with_role(NodeRole::Reader),
        );
        t.insert(
            NodeIdentity::instance("cluster", "db.cluster-abc.example.com")
                .with_role(NodeRole::Writer)
                .with_endpoint_type(EndpointType::Cluster),
        );
        t
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let mut t = Topology::new();
        t.insert(NodeIdentity::instance("b-1", "host-a"));
        t.insert(NodeIdentity::instance("b-1", "host-b"));
        assert_eq!(t.nodes().len(), 1);
        assert_eq!(t.nodes()[0].host, "host-a");
    }

    #[test]
    fn test_instances_exclude_virtual_endpoints() {
        let t = sample_topology();
        assert_eq!(t.instance_count(), 2);
        assert!(
            t.instances().all(|n| n.endpoint_type == EndpointType::Instance),
            "cluster/reader_lb endpoints must never be per-node targets"
        );
    }

    #[test]
    fn test_ssh_mapping_exact_then_substring() {
        let t = sample_topology();
        let hosts = vec![
            "10.0.1.12".to_string(),            // exact
            "db-1.internal".to_string(),        // substring of node host
            "bastion.example.com".to_string(),  // unmapped
        ];
        let mapping = map_ssh_hosts_to_nodes(&hosts, &t, None);
        assert_eq!(mapping["10.0.1.12"], "db-2");
        assert_eq!(mapping["db-1.internal"], "db-1");
        assert_eq!(mapping["bastion.example.com"], UNMAPPED_NODE_ID);
        assert_eq!(mapping.len(), hosts.len(), "every host appears exactly once");
    }

    #[test]
    fn test_ssh_mapping_callback_fallback() {
        let t = sample_topology();
        let hosts = vec!["broker-9".to_string()];
        let mapper = |host: &str| host.strip_prefix("broker-").map(|id| format!("db-{id}"));
        let mapping = map_ssh_hosts_to_nodes(&hosts, &t, Some(&mapper));
        assert_eq!(mapping["broker-9"], "db-9");
    }
}
