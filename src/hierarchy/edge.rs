//! Edge fields: named outgoing relations from a source node, with per-edge
//! metadata and a governing constraint (§3, §4.6.2).

use indexmap::{IndexMap, IndexSet};

use crate::nodeid::NodeId;
use crate::object::Object;

/// Per-edge metadata policy resolved from the Open Questions in §9: a
/// single shared Object for `single_ref` fields, one Object per destination
/// for default/multi-ref fields.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeMetadata {
    Single(Object),
    Multi(IndexMap<NodeId, Object>),
}

impl EdgeMetadata {
    pub fn new_for_constraint(single_ref: bool) -> Self {
        if single_ref {
            EdgeMetadata::Single(Object::new())
        } else {
            EdgeMetadata::Multi(IndexMap::new())
        }
    }

    pub fn get(&self, dst: &NodeId) -> Option<&Object> {
        match self {
            EdgeMetadata::Single(o) => Some(o),
            EdgeMetadata::Multi(m) => m.get(dst),
        }
    }

    pub fn get_or_insert_mut(&mut self, dst: NodeId) -> &mut Object {
        match self {
            EdgeMetadata::Single(o) => o,
            EdgeMetadata::Multi(m) => m.entry(dst).or_insert_with(Object::new),
        }
    }

    pub fn remove(&mut self, dst: &NodeId) {
        if let EdgeMetadata::Multi(m) = self {
            m.shift_remove(dst);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeField {
    pub name: String,
    pub single_ref: bool,
    pub bidirectional: bool,
    pub back_field_name: Option<String>,
    pub destinations: IndexSet<NodeId>,
    pub metadata: EdgeMetadata,
}

impl EdgeField {
    pub fn new(name: impl Into<String>, single_ref: bool, bidirectional: bool, back_field_name: Option<String>) -> Self {
        EdgeField {
            name: name.into(),
            single_ref,
            bidirectional,
            back_field_name,
            destinations: IndexSet::new(),
            metadata: EdgeMetadata::new_for_constraint(single_ref),
        }
    }

    /// Add `dst` as a destination. `single_ref` fields overwrite the prior
    /// destination (policy decided in §4.6.2 — "overwrite" rather than
    /// rejecting), returning the replaced id if any.
    pub fn add_destination(&mut self, dst: NodeId) -> Option<NodeId> {
        if self.single_ref {
            let prior = self.destinations.iter().next().copied();
            if prior != Some(dst) {
                self.destinations.clear();
                self.metadata = EdgeMetadata::new_for_constraint(true);
                self.destinations.insert(dst);
            }
            prior.filter(|p| *p != dst)
        } else {
            self.destinations.insert(dst);
            None
        }
    }

    pub fn remove_destination(&mut self, dst: &NodeId) -> bool {
        self.metadata.remove(dst);
        self.destinations.shift_remove(dst)
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

#[cfg(test)]
mod edge_tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::from_str_padded(s)
    }

    #[test]
    fn single_ref_overwrites_prior_destination() {
        let mut f = EdgeField::new("owner", true, false, None);
        let replaced = f.add_destination(id("ma00000001"));
        assert_eq!(replaced, None);
        let replaced = f.add_destination(id("ma00000002"));
        assert_eq!(replaced, Some(id("ma00000001")));
        assert_eq!(f.destinations.len(), 1);
        assert!(f.destinations.contains(&id("ma00000002")));
    }

    #[test]
    fn multi_ref_accumulates_distinct_destinations() {
        let mut f = EdgeField::new("children_custom", false, false, None);
        f.add_destination(id("ma00000001"));
        f.add_destination(id("ma00000002"));
        f.add_destination(id("ma00000001")); // duplicate, no-op per set semantics
        assert_eq!(f.destinations.len(), 2);
    }

    #[test]
    fn metadata_keyed_by_destination_for_multi_ref() {
        let mut f = EdgeField::new("refs", false, false, None);
        f.add_destination(id("ma00000001"));
        f.metadata.get_or_insert_mut(id("ma00000001")).set_ll("weight", 5).unwrap();
        assert_eq!(f.metadata.get(&id("ma00000001")).unwrap().get("weight").unwrap().as_ll(), Some(5));
    }

    #[test]
    fn single_ref_metadata_is_shared_not_keyed() {
        let mut f = EdgeField::new("owner", true, false, None);
        f.add_destination(id("ma00000001"));
        f.metadata.get_or_insert_mut(id("ma00000001")).set_ll("since", 1).unwrap();
        // Overwriting the destination keeps single-ref metadata semantics:
        // a fresh Object is installed for the new destination.
        f.add_destination(id("ma00000002"));
        assert!(f.metadata.get(&id("ma00000002")).unwrap().is_empty());
    }
}
