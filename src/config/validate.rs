use super::{Config, Node};
use crate::error::ConfigError;
use ipnet::IpNet;
use std::net::IpAddr;

impl Config {
    /// Check network ranges and node addresses. Pure; no remote access.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cluster_cidr = parse_cidr(&self.cluster.cluster_cidr, "cluster-cidr")?;
        let service_cidr = parse_cidr(&self.cluster.service_cidr, "service-cidr")?;

        if cluster_cidr == service_cidr {
            return Err(ConfigError::IdenticalCidrs(self.cluster.cluster_cidr.clone()));
        }
        if cidrs_overlap(&cluster_cidr, &service_cidr) {
            return Err(ConfigError::OverlappingCidrs {
                cluster: self.cluster.cluster_cidr.clone(),
                service: self.cluster.service_cidr.clone(),
            });
        }

        for node in &self.servers {
            validate_node_ip(node, "server")?;
        }
        for node in &self.agents {
            validate_node_ip(node, "agent")?;
        }

        Ok(())
    }
}

/// Parse CIDR notation, normalized to its network address
fn parse_cidr(value: &str, field: &'static str) -> Result<IpNet, ConfigError> {
    value
        .trim()
        .parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|source| ConfigError::InvalidCidr {
            field,
            value: value.to_string(),
            source,
        })
}

fn cidrs_overlap(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

fn validate_node_ip(node: &Node, role: &'static str) -> Result<(), ConfigError> {
    if node.ip.is_empty() {
        return Err(ConfigError::EmptyAddress {
            role,
            node: node.node_name.clone(),
        });
    }
    if node.ip.parse::<IpAddr>().is_err() {
        return Err(ConfigError::InvalidAddress {
            role,
            node: node.node_name.clone(),
            address: node.ip.clone(),
        });
    }
    Ok(())
}
