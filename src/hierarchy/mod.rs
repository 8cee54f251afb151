//! The hierarchy: node index, parent/child DAG, edge fields, traversals, and
//! detached subtree paging (§3, §4.6). The single largest subsystem in the
//! core; grounded throughout on `original_source/.../hierarchy.c` semantics,
//! expressed with a central arena owning nodes and non-owning NodeId links
//! between them (§9 "Cyclic graphs & ownership").

pub mod constraint;
pub mod detached;
pub mod edge;
pub mod find;
pub mod node;
pub mod serialize;
pub mod traversal;

use indexmap::{IndexMap, IndexSet};

use crate::error::{Result, SelvaError};
use crate::hierarchy::constraint::ConstraintRegistry;
use crate::hierarchy::detached::{DetachedBlob, DetachedStore};
use crate::hierarchy::edge::EdgeField;
use crate::hierarchy::node::Node;
use crate::nodeid::{NodeId, ROOT_ID};
use crate::object::{SetValue, Value};
use crate::subscriptions::SubscriptionSink;

bitflags::bitflags! {
    /// `delete(id, flags)` (§4.6.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeleteFlags: u8 {
        const FORCE = 0x1;
    }
}

/// Node-type registry entry: a human-readable name for a 2-byte type prefix.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    names: IndexMap<[u8; 2], String>,
}

impl TypeRegistry {
    pub fn add(&mut self, prefix: [u8; 2], name: impl Into<String>) {
        self.names.insert(prefix, name.into());
    }

    pub fn get(&self, prefix: &[u8; 2]) -> Option<&str> {
        self.names.get(prefix).map(|s| s.as_str())
    }

    pub fn remove(&mut self, prefix: &[u8; 2]) -> bool {
        self.names.shift_remove(prefix).is_some()
    }

    pub fn list(&self) -> impl Iterator<Item = (&[u8; 2], &String)> {
        self.names.iter()
    }
}

pub struct Hierarchy {
    nodes: IndexMap<NodeId, Node>,
    pub heads: IndexSet<NodeId>,
    pub constraints: ConstraintRegistry,
    pub types: TypeRegistry,
    pub detached: DetachedStore,
    /// Global alias → owning node reverse index (§4.5 alias uniqueness).
    aliases: IndexMap<Vec<u8>, NodeId>,
    /// Monotonic transaction/generation counter (§4.6.3).
    generation: u64,
    /// Set while a top-level traversal is in flight; a second attempt to
    /// start one yields `ETRMAX` (§4.6.3). Nested re-entry from inside a
    /// callback is allowed and does not touch this flag.
    traversal_in_flight: bool,
    pub sink: Box<dyn SubscriptionSink>,
}

impl Hierarchy {
    pub fn new() -> Self {
        let mut h = Hierarchy {
            nodes: IndexMap::new(),
            heads: IndexSet::new(),
            constraints: ConstraintRegistry::new(),
            types: TypeRegistry::default(),
            detached: DetachedStore::default(),
            aliases: IndexMap::new(),
            generation: 0,
            traversal_in_flight: false,
            sink: Box::new(crate::subscriptions::NullSubscriptionSink),
        };
        h.nodes.insert(ROOT_ID, Node::new(ROOT_ID));
        h.heads.insert(ROOT_ID);
        h
    }

    /// Rebuild a hierarchy from its SDB-decoded parts (§4.10): heads are
    /// recomputed from which nodes carry no parents, and the alias reverse
    /// index is rebuilt from each node's `aliases` field rather than
    /// persisted separately.
    pub(crate) fn from_snapshot_parts(
        types: TypeRegistry,
        constraints: ConstraintRegistry,
        nodes: Vec<Node>,
        detached: DetachedStore,
    ) -> Self {
        let mut nodes_map = IndexMap::new();
        let mut heads = IndexSet::new();
        let mut aliases = IndexMap::new();
        for node in nodes {
            if node.parents.is_empty() {
                heads.insert(node.id);
            }
            if let Ok(Value::Set(SetValue::Str(set))) = node.object.get("aliases") {
                for alias in set.iter() {
                    aliases.insert(alias.clone(), node.id);
                }
            }
            nodes_map.insert(node.id, node);
        }
        Hierarchy {
            nodes: nodes_map,
            heads,
            constraints,
            types,
            detached,
            aliases,
            generation: 0,
            traversal_in_flight: false,
            sink: Box::new(crate::subscriptions::NullSubscriptionSink),
        }
    }

    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn begin_traversal(&mut self) -> Result<()> {
        if self.traversal_in_flight {
            return Err(SelvaError::HierarchyEtrmax);
        }
        self.traversal_in_flight = true;
        Ok(())
    }

    pub fn end_traversal(&mut self) {
        self.traversal_in_flight = false;
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// `upsert(id)` (§4.6.1): returns existing or creates. New nodes get
    /// `implicit` set unless `explicit` is true.
    pub fn upsert(&mut self, id: NodeId, explicit: bool) -> &mut Node {
        if !self.nodes.contains_key(&id) {
            let mut node = Node::new(id);
            node.flags.implicit = !explicit;
            self.nodes.insert(id, node);
            self.heads.insert(id);
            self.sink.defer_trigger(id, crate::subscriptions::TriggerKind::Created);
        } else if explicit {
            // An explicit modify clears a prior implicit creation (§3 Lifecycle).
            self.nodes.get_mut(&id).unwrap().flags.implicit = false;
        }
        self.nodes.get_mut(&id).unwrap()
    }

    fn recompute_head_status(&mut self, id: NodeId) {
        if id == ROOT_ID {
            return;
        }
        let is_orphan = self.nodes.get(&id).map(|n| n.parents.is_empty()).unwrap_or(false);
        if is_orphan {
            self.heads.insert(id);
        } else {
            self.heads.shift_remove(&id);
        }
    }

    /// `add_children(n, [c])` / `add_parents` (§4.6.1): union with existing
    /// adjacency; already-present edges are no-ops; missing endpoints are
    /// upserted implicitly.
    pub fn add_children(&mut self, parent: NodeId, children: &[NodeId]) -> Result<()> {
        if !self.contains(&parent) {
            self.upsert(parent, false);
        }
        for &child in children {
            if !self.contains(&child) {
                self.upsert(child, false);
            }
            self.nodes.get_mut(&parent).unwrap().children.insert(child);
            self.nodes.get_mut(&child).unwrap().parents.insert(parent);
            self.recompute_head_status(child);
            self.sink.defer_hierarchy_event(child);
        }
        self.sink.defer_hierarchy_event(parent);
        Ok(())
    }

    pub fn add_parents(&mut self, child: NodeId, parents: &[NodeId]) -> Result<()> {
        for &parent in parents {
            self.add_children(parent, &[child])?;
        }
        Ok(())
    }

    /// `set_children` (§4.6.1): replaces the adjacency set wholesale.
    pub fn set_children(&mut self, parent: NodeId, children: &[NodeId]) -> Result<()> {
        if !self.contains(&parent) {
            self.upsert(parent, false);
        }
        let old_children: Vec<NodeId> = self.nodes.get(&parent).unwrap().children.iter().copied().collect();
        for old in &old_children {
            if !children.contains(old) {
                self.del_children(parent, &[*old])?;
            }
        }
        self.add_children(parent, children)?;
        Ok(())
    }

    pub fn set_parents(&mut self, child: NodeId, parents: &[NodeId]) -> Result<()> {
        if !self.contains(&child) {
            self.upsert(child, false);
        }
        let old_parents: Vec<NodeId> = self.nodes.get(&child).unwrap().parents.iter().copied().collect();
        for old in &old_parents {
            if !parents.contains(old) {
                self.del_parents(child, &[*old])?;
            }
        }
        self.add_parents(child, parents)?;
        Ok(())
    }

    /// `del_children` (§4.6.1): targeted removal. If the child's parents
    /// become empty, it becomes a head (unless it is root).
    pub fn del_children(&mut self, parent: NodeId, children: &[NodeId]) -> Result<()> {
        for &child in children {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.shift_remove(&child);
            }
            if let Some(c) = self.nodes.get_mut(&child) {
                c.parents.shift_remove(&parent);
            }
            self.recompute_head_status(child);
            self.sink.defer_hierarchy_event(child);
        }
        self.sink.defer_hierarchy_event(parent);
        Ok(())
    }

    pub fn del_parents(&mut self, child: NodeId, parents: &[NodeId]) -> Result<()> {
        for &parent in parents {
            self.del_children(parent, &[child])?;
        }
        Ok(())
    }

    /// `delete(id, flags)` (§4.6.1). Root is never freed, only cleared.
    pub fn delete(&mut self, id: NodeId, flags: DeleteFlags) -> Result<()> {
        if id == ROOT_ID {
            if let Some(root) = self.nodes.get_mut(&ROOT_ID) {
                root.object.clear();
                root.edge_fields.clear();
            }
            return Ok(());
        }
        if !self.contains(&id) {
            return Err(SelvaError::HierarchyEnoent);
        }

        let force = flags.contains(DeleteFlags::FORCE);
        let mut to_delete = vec![id];
        let mut visited = IndexSet::new();

        while let Some(cur) = to_delete.pop() {
            if !visited.insert(cur) {
                continue;
            }
            let parents: Vec<NodeId> = self.nodes.get(&cur).map(|n| n.parents.iter().copied().collect()).unwrap_or_default();
            for p in &parents {
                self.del_children(*p, &[cur])?;
            }

            let children: Vec<NodeId> = self.nodes.get(&cur).map(|n| n.children.iter().copied().collect()).unwrap_or_default();
            for c in &children {
                self.del_children(cur, &[*c])?;
                let still_has_parents = self.nodes.get(c).map(|n| !n.parents.is_empty()).unwrap_or(true);
                let has_incoming_edges = self.nodes.get(c).map(|n| !n.has_no_incoming_edges()).unwrap_or(false);
                if force || (!still_has_parents && !has_incoming_edges) {
                    to_delete.push(*c);
                }
            }

            self.remove_aliases_of(&cur);
            self.heads.shift_remove(&cur);
            self.nodes.shift_remove(&cur);
            self.sink.defer_trigger(cur, crate::subscriptions::TriggerKind::Deleted);
        }

        Ok(())
    }

    fn remove_aliases_of(&mut self, id: &NodeId) {
        let to_remove: Vec<Vec<u8>> = self
            .aliases
            .iter()
            .filter(|(_, owner)| *owner == id)
            .map(|(alias, _)| alias.clone())
            .collect();
        for alias in to_remove {
            self.aliases.shift_remove(&alias);
        }
    }

    /// Writing an alias atomically steals it from whatever node held it
    /// before (§4.5 alias uniqueness invariant).
    pub fn set_alias(&mut self, owner: NodeId, alias: Vec<u8>) -> Result<()> {
        if let Some(prior_owner) = self.aliases.get(&alias).copied() {
            if prior_owner != owner {
                if let Some(prior_node) = self.nodes.get_mut(&prior_owner) {
                    if let Some(Value::Set(SetValue::Str(mut s))) = prior_node.object.get("aliases").ok().cloned() {
                        s.shift_remove(&alias);
                        let _ = prior_node.object.set("aliases", Value::Set(SetValue::Str(s)));
                    }
                }
            }
        }
        self.aliases.insert(alias.clone(), owner);
        let node = self.nodes.get_mut(&owner).ok_or(SelvaError::HierarchyEnoent)?;
        if let Some(Value::Set(SetValue::Str(mut s))) = node.object.get("aliases").ok().cloned() {
            s.insert(alias);
            node.object.set("aliases", Value::Set(SetValue::Str(s)))?;
        }
        Ok(())
    }

    pub fn resolve_alias(&self, alias: &[u8]) -> Option<NodeId> {
        self.aliases.get(alias).copied()
    }

    /// Resolve an edge field's constraint and ensure the field exists,
    /// creating it from the constraint registry on first use (§4.6.2).
    pub fn edge_field_mut(&mut self, source: NodeId, field: &str) -> Result<&mut EdgeField> {
        let source_type = String::from_utf8_lossy(&source.node_type()).to_string();
        let constraint = self.constraints.get(&source_type, field);
        let node = self.nodes.get_mut(&source).ok_or(SelvaError::HierarchyEnoent)?;
        if !node.edge_fields.contains_key(field) {
            node.edge_fields.insert(
                field.to_string(),
                EdgeField::new(field, constraint.single_ref, constraint.bidirectional, constraint.back_field_name.clone()),
            );
        }
        Ok(node.edge_fields.get_mut(field).unwrap())
    }

    /// Add `dst` to `(source, field)`, maintaining the symmetric back
    /// field when the constraint is bidirectional (§4.6.2).
    pub fn edge_add(&mut self, source: NodeId, field: &str, dst: NodeId) -> Result<()> {
        if !self.contains(&dst) {
            self.upsert(dst, false);
        }
        let ef = self.edge_field_mut(source, field)?;
        let bidirectional = ef.bidirectional;
        let back_field_name = ef.back_field_name.clone();
        let replaced = ef.add_destination(dst);

        if let Some(old) = replaced {
            if let Some(n) = self.nodes.get_mut(&old) {
                n.origins.entry(field.to_string()).or_default().shift_remove(&source);
            }
        }
        self.nodes.get_mut(&dst).unwrap().origins.entry(field.to_string()).or_default().insert(source);

        if bidirectional {
            if let Some(back_field) = back_field_name {
                let bf = self.edge_field_mut(dst, &back_field)?;
                bf.add_destination(source);
                self.nodes.get_mut(&source).unwrap().origins.entry(back_field).or_default().insert(dst);
            }
        }

        self.sink.defer_hierarchy_event(source);
        Ok(())
    }

    pub fn edge_del(&mut self, source: NodeId, field: &str, dst: NodeId) -> Result<()> {
        let (bidirectional, back_field_name) = {
            let node = self.nodes.get(&source).ok_or(SelvaError::HierarchyEnoent)?;
            let ef = node.edge_fields.get(field).ok_or(SelvaError::HierarchyEnoent)?;
            (ef.bidirectional, ef.back_field_name.clone())
        };

        if let Some(node) = self.nodes.get_mut(&source) {
            if let Some(ef) = node.edge_fields.get_mut(field) {
                ef.remove_destination(&dst);
            }
        }
        if let Some(n) = self.nodes.get_mut(&dst) {
            n.origins.entry(field.to_string()).or_default().shift_remove(&source);
        }

        if bidirectional {
            if let Some(back_field) = back_field_name {
                if let Some(node) = self.nodes.get_mut(&dst) {
                    if let Some(bf) = node.edge_fields.get_mut(&back_field) {
                        bf.remove_destination(&source);
                    }
                }
                if let Some(n) = self.nodes.get_mut(&source) {
                    n.origins.entry(back_field).or_default().shift_remove(&dst);
                }
            }
        }

        self.sink.defer_hierarchy_event(source);
        Ok(())
    }

    pub(crate) fn insert_restored_node(&mut self, node: Node) {
        let id = node.id;
        self.nodes.insert(id, node);
    }

    pub(crate) fn take_node_subtree(&mut self, ids: &[NodeId]) -> Vec<Node> {
        ids.iter().filter_map(|id| self.nodes.shift_remove(id)).collect()
    }

    pub(crate) fn store_detached_blob(&mut self, head: NodeId, blob: DetachedBlob) {
        self.detached.insert(head, blob);
    }
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self::new()
    }
}
