//! Endpoint keys: the identity the health-check registry indexes by.
//!
//! A key covers the alias, the hostname, and every named port. Two
//! records map to the same key only when all three agree, so a node that
//! moves host or changes a port shows up as a different endpoint.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{NodeAlias, NodeRecord};

/// Comparable identity of a reachable endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointKey {
    alias: NodeAlias,
    host: String,
    /// Sorted by port name.
    ports: Vec<(String, u16)>,
}

impl EndpointKey {
    pub fn alias(&self) -> &NodeAlias {
        &self.alias
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ports(&self) -> &[(String, u16)] {
        &self.ports
    }
}

/// Rendered as `alias,host,name:port,...`.
impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.alias, self.host)?;
        for (name, port) in &self.ports {
            write!(f, ",{name}:{port}")?;
        }
        Ok(())
    }
}

/// Derive the registry key for a node record.
pub fn endpoint_key(record: &NodeRecord) -> EndpointKey {
    EndpointKey {
        alias: record.alias.clone(),
        host: record.hostname.clone(),
        // BTreeMap iteration is already ordered by name.
        ports: record
            .port_map
            .iter()
            .map(|(name, port)| (name.clone(), *port))
            .collect(),
    }
}
