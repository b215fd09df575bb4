//! Directory of known nodes
//!
//! The directory service itself lives outside this crate; the protocol
//! only needs a way to take an immutable snapshot of the currently known
//! fleet at round start.

use std::collections::HashMap;

/// Identifier of a participant, derived from its certificate.
pub type NodeId = String;

/// A known directory node as seen by the agreement protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: NodeId,
    /// `host:port` of the node's agreement endpoint.
    pub address: String,
}

impl Target {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Target {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// Supplies the current mapping of known nodes. The coordinator snapshots
/// it once per round and ignores membership changes until the next round.
pub trait Directory: Send + Sync {
    fn snapshot(&self) -> HashMap<NodeId, Target>;
}

/// Fixed fleet, configured once at startup.
pub struct StaticDirectory {
    targets: HashMap<NodeId, Target>,
}

impl StaticDirectory {
    pub fn new(targets: Vec<Target>) -> Self {
        StaticDirectory {
            targets: targets.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    /// Parses a fleet description of the form `id=host:port,id=host:port`.
    pub fn parse(raw: &str) -> Self {
        let targets = raw
            .split(',')
            .filter_map(|entry| {
                let (id, address) = entry.trim().split_once('=')?;
                Some(Target::new(id.trim(), address.trim()))
            })
            .collect();
        StaticDirectory::new(targets)
    }
}

impl Directory for StaticDirectory {
    fn snapshot(&self) -> HashMap<NodeId, Target> {
        self.targets.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fleet() {
        let directory = StaticDirectory::parse("a=127.0.0.1:8000, b=127.0.0.1:8001");
        let snapshot = directory.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["a"].address, "127.0.0.1:8000");
        assert_eq!(snapshot["b"].address, "127.0.0.1:8001");
    }

    #[test]
    fn test_parse_skips_malformed_entries() {
        let directory = StaticDirectory::parse("a=127.0.0.1:8000,broken");
        assert_eq!(directory.snapshot().len(), 1);
    }
}
