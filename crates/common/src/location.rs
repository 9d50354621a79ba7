// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

// Server location model with a selected-node cursor

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One server node of a location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node addresses (up to three, selected by `PortMapEntry::use_ip_index`)
    pub ips: Vec<String>,
    pub hostname: String,
    #[serde(default)]
    pub wg_public_key: String,
    /// WireGuard endpoint address used by static-IP locations
    #[serde(default)]
    pub wg_ip: String,
}

/// Credentials and ports attached to a static-IP location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticIpInfo {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// A location the user can connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub id: String,
    pub dns_name: String,
    #[serde(default)]
    pub verify_x509_name: String,
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_ip: Option<StaticIpInfo>,
    #[serde(default)]
    selected_node: usize,
}

impl LocationInfo {
    pub fn new(id: impl Into<String>, dns_name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            id: id.into(),
            dns_name: dns_name.into(),
            verify_x509_name: String::new(),
            nodes,
            static_ip: None,
            selected_node: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::EmptyLocation(self.id.clone()));
        }
        if let Some(node) = self.nodes.iter().find(|n| n.ips.is_empty()) {
            return Err(Error::Config(format!(
                "Node {} of location {} has no addresses",
                node.hostname, self.id
            )));
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_static_ip(&self) -> bool {
        self.static_ip.is_some()
    }

    pub fn selected_node_index(&self) -> usize {
        self.selected_node
    }

    /// Move the cursor to the next node, wrapping around
    pub fn select_next_node(&mut self) {
        if !self.nodes.is_empty() {
            self.selected_node = (self.selected_node + 1) % self.nodes.len();
        }
    }

    fn selected(&self) -> Option<&Node> {
        self.nodes.get(self.selected_node)
    }

    /// Address `index` of the selected node; falls back to the first address
    pub fn ip_for_selected_node(&self, index: usize) -> String {
        self.selected()
            .and_then(|n| n.ips.get(index).or_else(|| n.ips.first()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn hostname_for_selected_node(&self) -> String {
        self.selected().map(|n| n.hostname.clone()).unwrap_or_default()
    }

    pub fn wg_public_key_for_selected_node(&self) -> String {
        self.selected()
            .map(|n| n.wg_public_key.clone())
            .unwrap_or_default()
    }

    pub fn wg_ip_for_selected_node(&self) -> String {
        self.selected().map(|n| n.wg_ip.clone()).unwrap_or_default()
    }

    /// Every address of every node (firewall allow-list)
    pub fn all_ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = self
            .nodes
            .iter()
            .flat_map(|n| n.ips.iter().chain(std::iter::once(&n.wg_ip)))
            .filter(|ip| !ip.is_empty())
            .cloned()
            .collect();
        ips.sort();
        ips.dedup();
        ips
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8) -> Node {
        Node {
            ips: vec![format!("10.0.{n}.1"), format!("10.0.{n}.2")],
            hostname: format!("node{n}.example.net"),
            wg_public_key: format!("key{n}"),
            wg_ip: format!("10.9.{n}.1"),
        }
    }

    #[test]
    fn test_select_next_node_wraps() {
        let mut location = LocationInfo::new("de", "de.example.net", vec![node(1), node(2)]);
        assert_eq!(location.hostname_for_selected_node(), "node1.example.net");

        location.select_next_node();
        assert_eq!(location.hostname_for_selected_node(), "node2.example.net");
        assert_eq!(location.wg_public_key_for_selected_node(), "key2");

        location.select_next_node();
        assert_eq!(location.selected_node_index(), 0);
    }

    #[test]
    fn test_ip_index_falls_back_to_first() {
        let location = LocationInfo::new("de", "de.example.net", vec![node(1)]);
        assert_eq!(location.ip_for_selected_node(1), "10.0.1.2");
        assert_eq!(location.ip_for_selected_node(2), "10.0.1.1");
    }

    #[test]
    fn test_validate_rejects_empty() {
        let location = LocationInfo::new("empty", "x.example.net", vec![]);
        assert!(location.validate().is_err());
        assert_eq!(location.ip_for_selected_node(0), "");
    }

    #[test]
    fn test_all_ips_deduplicated() {
        let location = LocationInfo::new("de", "de.example.net", vec![node(1), node(1)]);
        assert_eq!(location.all_ips(), vec!["10.0.1.1", "10.0.1.2", "10.9.1.1"]);
    }
}
