//! A single hierarchy node (§3).

use indexmap::{IndexMap, IndexSet};

use crate::hierarchy::edge::EdgeField;
use crate::nodeid::NodeId;
use crate::object::Object;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    pub detached: bool,
    pub implicit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub flags: NodeFlags,
    /// Generation stamp of the most recent traversal that visited this node.
    pub transaction_label: u64,
    pub object: Object,
    /// Outgoing edge fields, keyed by field name.
    pub edge_fields: IndexMap<String, EdgeField>,
    /// Back-references: for each field name, the set of source nodes that
    /// point at this node through that field (`origins`, §3).
    pub origins: IndexMap<String, IndexSet<NodeId>>,
    pub parents: IndexSet<NodeId>,
    pub children: IndexSet<NodeId>,
    /// Subscription marker ids attached to this node (opaque to the
    /// hierarchy; only used to gate detach preconditions, §4.6.5).
    pub markers: IndexSet<u64>,
}

impl Node {
    pub fn new(id: NodeId) -> Self {
        let mut object = Object::new();
        let _ = object.set_str("id", id.display_string());
        let _ = object.set_str("type", id.node_type().to_vec());
        let _ = object.set_ll("createdAt", 0);
        let _ = object.set_ll("updatedAt", 0);
        use crate::object::{SetValue, Value};
        let _ = object.set("aliases", Value::Set(SetValue::Str(indexmap::IndexSet::new())));

        Node {
            id,
            flags: NodeFlags::default(),
            transaction_label: 0,
            object,
            edge_fields: IndexMap::new(),
            origins: IndexMap::new(),
            parents: IndexSet::new(),
            children: IndexSet::new(),
            markers: IndexSet::new(),
        }
    }

    pub fn touch_updated_at(&mut self, now: i64) {
        let created = self.object.get("createdAt").ok().and_then(|v| v.as_ll()).unwrap_or(now);
        if created > now {
            // createdAt must never exceed updatedAt; clamp defensively.
            let _ = self.object.set_ll("createdAt", now);
        }
        let prior = self.object.get("updatedAt").ok().and_then(|v| v.as_ll()).unwrap_or(now);
        let _ = self.object.set_ll("updatedAt", now.max(prior));
    }

    pub fn has_no_incoming_edges(&self) -> bool {
        self.origins.values().all(|s| s.is_empty())
    }
}

#[cfg(test)]
mod node_tests {
    use super::*;

    #[test]
    fn new_node_carries_reserved_fields() {
        let n = Node::new(NodeId::from_str_padded("ma00000001"));
        assert!(n.object.exists("id"));
        assert!(n.object.exists("type"));
        assert!(n.object.exists("createdAt"));
        assert!(n.object.exists("updatedAt"));
        assert!(n.object.exists("aliases"));
    }

    #[test]
    fn touch_updated_at_is_monotone_non_decreasing() {
        let mut n = Node::new(NodeId::from_str_padded("ma00000001"));
        n.touch_updated_at(10);
        n.touch_updated_at(5); // out-of-order call: must not regress
        let updated = n.object.get("updatedAt").unwrap().as_ll().unwrap();
        assert_eq!(updated, 10);
    }

    #[test]
    fn created_at_never_exceeds_updated_at() {
        let n = Node::new(NodeId::from_str_padded("ma00000001"));
        let created = n.object.get("createdAt").unwrap().as_ll().unwrap();
        let updated = n.object.get("updatedAt").unwrap().as_ll().unwrap();
        assert!(created <= updated);
    }
}
