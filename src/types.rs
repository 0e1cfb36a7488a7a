//! Core domain types shared by the allocators and the registry.
//!
//! Everything in here is persisted, so the serde shape of each type is part
//! of the on-disk format under `networks/`.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Numeric identifier of one sandbox network instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChainId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(ChainId)
            .map_err(|_| format!("invalid chain id '{}'", s))
    }
}

/// Identifier of one fixed-capacity bucket, persisted as `network_<index>`.
///
/// Indices are 1-based. Ordering follows the numeric index, so `network_10`
/// sorts after `network_9` and bucket scans stay stable past nine buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketId(pub u32);

impl BucketId {
    const PREFIX: &'static str = "network_";

    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

impl FromStr for BucketId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix(Self::PREFIX)
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .map(BucketId)
            .ok_or_else(|| format!("invalid bucket id '{}'", s))
    }
}

impl Serialize for BucketId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BucketId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// An IPv4 network in CIDR notation, e.g. `10.20.19.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
}

impl Subnet {
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Self {
        Subnet { network, prefix_len }
    }

    /// Check whether `ip` falls inside this network
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - u32::from(self.prefix_len.min(32)));
        (u32::from(ip) & mask) == (u32::from(self.network) & mask)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("subnet '{}' is missing a prefix length", s))?;
        let network = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| format!("invalid subnet address in '{}'", s))?;
        let prefix_len = prefix
            .parse::<u8>()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| format!("invalid prefix length in '{}'", s))?;
        Ok(Subnet { network, prefix_len })
    }
}

impl Serialize for Subnet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Subnet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Role a node plays inside its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Bootstrap,
    Signer,
    Member,
    Rpc,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::Bootstrap => "bootstrap",
            NodeRole::Signer => "signer",
            NodeRole::Member => "member",
            NodeRole::Rpc => "rpc",
        };
        f.write_str(name)
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bootstrap" => Ok(NodeRole::Bootstrap),
            "signer" => Ok(NodeRole::Signer),
            "member" => Ok(NodeRole::Member),
            "rpc" => Ok(NodeRole::Rpc),
            other => Err(format!(
                "unknown node role '{}' (expected bootstrap, signer, member or rpc)",
                other
            )),
        }
    }
}

/// One allocated node inside a chain's network config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    /// Account identity of the node, opaque to the allocator
    pub address: String,
    pub role: NodeRole,
    pub port: u16,
    #[serde(default)]
    pub rpc_port: Option<u16>,
    pub ip: Ipv4Addr,
}

/// Persisted per-chain network description (`networks/<chainId>/network-config.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainNetworkConfig {
    pub chain_id: ChainId,
    pub subnet: Subnet,
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    /// Values taken from dead nodes that have not reached their pools yet
    #[serde(default, skip_serializing_if = "ReclaimableResources::is_empty")]
    pub pending_release: ReclaimableResources,
}

impl ChainNetworkConfig {
    pub fn new(chain_id: ChainId, subnet: Subnet) -> Self {
        ChainNetworkConfig {
            chain_id,
            subnet,
            nodes: Vec::new(),
            pending_release: ReclaimableResources::default(),
        }
    }
}

/// Ports and addresses taken back from nodes that are no longer running.
///
/// Ports are written as decimal strings; numbers are accepted when reading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimableResources {
    #[serde(default, with = "port_strings")]
    pub available_ports: Vec<u16>,
    #[serde(default, rename = "availableIPs")]
    pub available_ips: Vec<Ipv4Addr>,
}

impl ReclaimableResources {
    pub fn is_empty(&self) -> bool {
        self.available_ports.is_empty() && self.available_ips.is_empty()
    }

    /// Append the values of `other` that are not listed yet
    pub fn merge(&mut self, other: &ReclaimableResources) {
        for port in &other.available_ports {
            if !self.available_ports.contains(port) {
                self.available_ports.push(*port);
            }
        }
        for ip in &other.available_ips {
            if !self.available_ips.contains(ip) {
                self.available_ips.push(*ip);
            }
        }
    }
}

mod port_strings {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortRepr {
        Number(u16),
        Text(String),
    }

    pub fn serialize<S: Serializer>(ports: &[u16], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(ports.iter().map(|port| port.to_string()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u16>, D::Error> {
        Vec::<PortRepr>::deserialize(deserializer)?
            .into_iter()
            .map(|repr| match repr {
                PortRepr::Number(port) => Ok(port),
                PortRepr::Text(text) => text
                    .parse()
                    .map_err(|e| D::Error::custom(format!("invalid port '{}': {}", text, e))),
            })
            .collect()
    }
}

/// The resources granted to a node by `NetworkRegistry::add_node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAllocation {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub rpc_port: u16,
}

/// Whatever an `add_node` call managed to grant before one allocator failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialGrant {
    pub ip: Option<Ipv4Addr>,
    pub port: Option<u16>,
    pub rpc_port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_ids_order_numerically() {
        let mut ids: Vec<BucketId> = ["network_10", "network_2", "network_1"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ids.sort();
        let names: Vec<String> = ids.iter().map(|b| b.to_string()).collect();
        assert_eq!(names, vec!["network_1", "network_2", "network_10"]);
    }

    #[test]
    fn test_bucket_id_rejects_garbage() {
        assert!("network_0".parse::<BucketId>().is_err());
        assert!("net_1".parse::<BucketId>().is_err());
        assert!("network_x".parse::<BucketId>().is_err());
    }

    #[test]
    fn test_subnet_contains() {
        let subnet: Subnet = "10.20.19.0/24".parse().unwrap();
        assert!(subnet.contains(Ipv4Addr::new(10, 20, 19, 7)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 20, 20, 7)));
        assert_eq!(subnet.to_string(), "10.20.19.0/24");
    }

    #[test]
    fn test_node_record_json_shape() {
        let record = NodeRecord {
            address: "0xabc".to_string(),
            role: NodeRole::Signer,
            port: 30403,
            rpc_port: Some(8575),
            ip: Ipv4Addr::new(10, 0, 0, 1),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["role"], "signer");
        assert_eq!(json["rpcPort"], 8575);
        assert_eq!(json["ip"], "10.0.0.1");
    }

    #[test]
    fn test_chain_config_tolerates_missing_rpc_port() {
        let raw = r#"{
            "chainId": 12,
            "subnet": "10.0.0.0/24",
            "nodes": [{"address": "a", "role": "member", "port": 30403, "ip": "10.0.0.1"}]
        }"#;
        let config: ChainNetworkConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.chain_id, ChainId(12));
        assert_eq!(config.nodes[0].rpc_port, None);
    }

    #[test]
    fn test_reclaimed_ports_are_strings() {
        let reclaimed = ReclaimableResources {
            available_ports: vec![30403],
            available_ips: vec![Ipv4Addr::new(10, 0, 0, 1)],
        };
        let json = serde_json::to_value(&reclaimed).unwrap();
        assert_eq!(json["availablePorts"][0], "30403");
        assert_eq!(json["availableIPs"][0], "10.0.0.1");

        let parsed: ReclaimableResources =
            serde_json::from_str(r#"{"availablePorts": ["30404", 30405], "availableIPs": []}"#).unwrap();
        assert_eq!(parsed.available_ports, vec![30404, 30405]);
        assert!(serde_json::from_str::<ReclaimableResources>(r#"{"availablePorts": ["x"]}"#).is_err());
    }

    #[test]
    fn test_merge_skips_listed_values() {
        let mut pending = ReclaimableResources { available_ports: vec![1, 2], available_ips: Vec::new() };
        pending.merge(&ReclaimableResources { available_ports: vec![2, 3], available_ips: Vec::new() });
        assert_eq!(pending.available_ports, vec![1, 2, 3]);
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("Signer".parse::<NodeRole>().unwrap(), NodeRole::Signer);
        assert!("validator".parse::<NodeRole>().is_err());
    }
}
