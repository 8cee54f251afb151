//! Hierarchy traversal (§4.6.3): a single entry point parameterized by
//! `Direction`, visiting each node at most once per call via a generation
//! stamp, transparently restoring detached stubs it steps into.

use std::collections::VecDeque;

use crate::error::{Result, SelvaError};
use crate::hierarchy::detached::restore_subtree;
use crate::hierarchy::Hierarchy;
use crate::nodeid::NodeId;
use crate::object::SetValue;
use crate::rpn::{eval_bool, eval_set, Ctx as RpnCtx, Program};

#[derive(Debug, Clone, PartialEq)]
pub enum Direction {
    /// Just `root` itself.
    Node,
    Children,
    Parents,
    BfsAncestors,
    BfsDescendants,
    DfsAncestors,
    DfsDescendants,
    /// Both directions from `root`, i.e. the whole connected component.
    DfsFull,
    /// A named edge field's destinations, one hop.
    Ref(String),
    EdgeField(String),
    /// Repeated hops through the same-named edge field on each destination.
    BfsEdgeField(String),
    /// RPN-driven traversal (§4.7): at each node, `expr` evaluates (as a
    /// set) to the field names to follow next, mixing hierarchy
    /// pseudo-fields (`children`/`parents`) and edge field names. When
    /// present, `edge_filter` evaluates against each candidate edge's
    /// metadata Object to decide whether to include it.
    Expression { expr: Program, edge_filter: Option<Program> },
}

/// Callback bundle invoked during a traversal. `head` fires once for the
/// starting node, `node` for every node visited after it, `child` for every
/// (parent, child) edge walked while building the BFS/DFS frontier.
#[derive(Default)]
pub struct Callbacks<'a> {
    pub head: Option<Box<dyn FnMut(&Hierarchy, NodeId) -> Result<()> + 'a>>,
    pub node: Option<Box<dyn FnMut(&Hierarchy, NodeId) -> Result<()> + 'a>>,
    pub child: Option<Box<dyn FnMut(&Hierarchy, NodeId, NodeId) -> Result<()> + 'a>>,
}

impl<'a> Callbacks<'a> {
    fn fire_head(&mut self, h: &Hierarchy, n: NodeId) -> Result<()> {
        if let Some(cb) = self.head.as_mut() {
            cb(h, n)?;
        }
        Ok(())
    }

    fn fire_node(&mut self, h: &Hierarchy, n: NodeId) -> Result<()> {
        if let Some(cb) = self.node.as_mut() {
            cb(h, n)?;
        }
        Ok(())
    }

    fn fire_child(&mut self, h: &Hierarchy, parent: NodeId, child: NodeId) -> Result<()> {
        if let Some(cb) = self.child.as_mut() {
            cb(h, parent, child)?;
        }
        Ok(())
    }
}

/// Top-level entry point: gates against a second concurrent top-level
/// traversal with `ETRMAX` (§4.6.3). Call [`traverse_inner`] directly from
/// within a callback to start a nested traversal instead.
pub fn traverse(h: &mut Hierarchy, root: NodeId, dir: Direction, cb: &mut Callbacks) -> Result<()> {
    h.begin_traversal()?;
    let result = traverse_inner(h, root, dir, cb);
    h.end_traversal();
    result
}

/// Ensure `id` is resolvable, restoring it from the detached store if it is
/// currently a compressed stub.
fn ensure_live(h: &mut Hierarchy, id: NodeId) -> Result<()> {
    if !h.contains(&id) && h.detached.contains(&id) {
        restore_subtree(h, id)?;
    }
    Ok(())
}

pub fn traverse_inner(h: &mut Hierarchy, root: NodeId, dir: Direction, cb: &mut Callbacks) -> Result<()> {
    ensure_live(h, root)?;
    if !h.contains(&root) {
        return Ok(());
    }
    cb.fire_head(h, root)?;

    let generation = h.next_generation();
    mark_visited(h, root, generation);

    match dir {
        Direction::Node => {}
        Direction::Children => walk_adjacent(h, root, generation, cb, Adjacency::Children)?,
        Direction::Parents => walk_adjacent(h, root, generation, cb, Adjacency::Parents)?,
        Direction::BfsDescendants => walk_bfs(h, root, generation, cb, Adjacency::Children)?,
        Direction::BfsAncestors => walk_bfs(h, root, generation, cb, Adjacency::Parents)?,
        Direction::DfsDescendants => walk_dfs(h, root, generation, cb, Adjacency::Children)?,
        Direction::DfsAncestors => walk_dfs(h, root, generation, cb, Adjacency::Parents)?,
        Direction::DfsFull => {
            walk_dfs(h, root, generation, cb, Adjacency::Children)?;
            walk_dfs(h, root, generation, cb, Adjacency::Parents)?;
        }
        Direction::Ref(field) | Direction::EdgeField(field) => {
            let destinations: Vec<NodeId> = h
                .node(&root)
                .and_then(|n| n.edge_fields.get(&field))
                .map(|ef| ef.destinations.iter().copied().collect())
                .unwrap_or_default();
            for dst in destinations {
                ensure_live(h, dst)?;
                if mark_visited(h, dst, generation) {
                    cb.fire_child(h, root, dst)?;
                    cb.fire_node(h, dst)?;
                }
            }
        }
        Direction::BfsEdgeField(field) => {
            let mut queue = VecDeque::new();
            queue.push_back(root);
            while let Some(cur) = queue.pop_front() {
                let destinations: Vec<NodeId> = h
                    .node(&cur)
                    .and_then(|n| n.edge_fields.get(&field))
                    .map(|ef| ef.destinations.iter().copied().collect())
                    .unwrap_or_default();
                for dst in destinations {
                    ensure_live(h, dst)?;
                    if mark_visited(h, dst, generation) {
                        cb.fire_child(h, cur, dst)?;
                        cb.fire_node(h, dst)?;
                        queue.push_back(dst);
                    }
                }
            }
        }
        Direction::Expression { expr, edge_filter } => {
            walk_expression(h, root, generation, cb, &expr, edge_filter.as_ref())?;
        }
    }
    Ok(())
}

/// Walks the hierarchy following whatever field names `expr` yields at each
/// node, optionally pruned per-edge by `edge_filter` (§4.7's `expression`
/// traversal direction).
fn walk_expression(h: &mut Hierarchy, root: NodeId, generation: u64, cb: &mut Callbacks, expr: &Program, edge_filter: Option<&Program>) -> Result<()> {
    let mut queue = VecDeque::new();
    queue.push_back(root);
    while let Some(cur) = queue.pop_front() {
        for field in expression_fields(h, cur, expr)? {
            for dst in expression_destinations(h, cur, &field) {
                if let Some(filter) = edge_filter {
                    if !edge_passes_filter(h, cur, &field, dst, filter)? {
                        continue;
                    }
                }
                ensure_live(h, dst)?;
                if mark_visited(h, dst, generation) {
                    cb.fire_child(h, cur, dst)?;
                    cb.fire_node(h, dst)?;
                    queue.push_back(dst);
                }
            }
        }
    }
    Ok(())
}

fn expression_fields(h: &Hierarchy, id: NodeId, expr: &Program) -> Result<Vec<String>> {
    let object = h.node(&id).map(|n| n.object.clone());
    let ctx = RpnCtx { object, current_node: Some(id), ..RpnCtx::new() };
    match eval_set(expr, &ctx)? {
        SetValue::Str(names) => Ok(names.iter().filter_map(|n| std::str::from_utf8(n).ok().map(str::to_string)).collect()),
        _ => Err(SelvaError::RpnType),
    }
}

fn expression_destinations(h: &Hierarchy, id: NodeId, field: &str) -> Vec<NodeId> {
    match h.node(&id) {
        None => Vec::new(),
        Some(n) => match field {
            "children" => n.children.iter().copied().collect(),
            "parents" => n.parents.iter().copied().collect(),
            _ => n.edge_fields.get(field).map(|ef| ef.destinations.iter().copied().collect()).unwrap_or_default(),
        },
    }
}

fn edge_passes_filter(h: &Hierarchy, src: NodeId, field: &str, dst: NodeId, filter: &Program) -> Result<bool> {
    let metadata = h.node(&src).and_then(|n| n.edge_fields.get(field)).and_then(|ef| ef.metadata.get(&dst).cloned());
    let ctx = RpnCtx { object: metadata, current_node: Some(dst), ..RpnCtx::new() };
    eval_bool(filter, &ctx)
}

#[derive(Clone, Copy)]
enum Adjacency {
    Children,
    Parents,
}

fn neighbors(h: &Hierarchy, id: NodeId, adj: Adjacency) -> Vec<NodeId> {
    match h.node(&id) {
        Some(n) => match adj {
            Adjacency::Children => n.children.iter().copied().collect(),
            Adjacency::Parents => n.parents.iter().copied().collect(),
        },
        None => Vec::new(),
    }
}

/// Returns `true` if this call transitioned the node from unvisited to
/// visited in the current generation (i.e. it had not already been seen).
fn mark_visited(h: &mut Hierarchy, id: NodeId, generation: u64) -> bool {
    match h.node_mut(&id) {
        Some(n) if n.transaction_label != generation => {
            n.transaction_label = generation;
            true
        }
        _ => false,
    }
}

fn walk_adjacent(h: &mut Hierarchy, root: NodeId, generation: u64, cb: &mut Callbacks, adj: Adjacency) -> Result<()> {
    for next in neighbors(h, root, adj) {
        ensure_live(h, next)?;
        if mark_visited(h, next, generation) {
            cb.fire_child(h, root, next)?;
            cb.fire_node(h, next)?;
        }
    }
    Ok(())
}

fn walk_bfs(h: &mut Hierarchy, root: NodeId, generation: u64, cb: &mut Callbacks, adj: Adjacency) -> Result<()> {
    let mut queue = VecDeque::new();
    queue.push_back(root);
    while let Some(cur) = queue.pop_front() {
        for next in neighbors(h, cur, adj) {
            ensure_live(h, next)?;
            if mark_visited(h, next, generation) {
                cb.fire_child(h, cur, next)?;
                cb.fire_node(h, next)?;
                queue.push_back(next);
            }
        }
    }
    Ok(())
}

fn walk_dfs(h: &mut Hierarchy, root: NodeId, generation: u64, cb: &mut Callbacks, adj: Adjacency) -> Result<()> {
    let mut stack = vec![root];
    while let Some(cur) = stack.pop() {
        for next in neighbors(h, cur, adj) {
            ensure_live(h, next)?;
            if mark_visited(h, next, generation) {
                cb.fire_child(h, cur, next)?;
                cb.fire_node(h, next)?;
                stack.push(next);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod traversal_tests {
    use super::*;
    use crate::hierarchy::detached;
    use crate::nodeid::ROOT_ID;

    fn id(s: &str) -> NodeId {
        NodeId::from_str_padded(s)
    }

    #[test]
    fn bfs_descendants_visits_each_node_once() {
        let mut h = Hierarchy::new();
        h.add_children(ROOT_ID, &[id("ma00000001"), id("ma00000002")]).unwrap();
        h.add_children(id("ma00000001"), &[id("ma00000003")]).unwrap();
        h.add_children(id("ma00000002"), &[id("ma00000003")]).unwrap();

        let mut visited = Vec::new();
        let mut cb = Callbacks {
            node: Some(Box::new(|_, n| {
                visited.push(n);
                Ok(())
            })),
            ..Default::default()
        };
        traverse(&mut h, ROOT_ID, Direction::BfsDescendants, &mut cb).unwrap();

        assert_eq!(visited.iter().filter(|&&n| n == id("ma00000003")).count(), 1);
        assert_eq!(visited.len(), 3);
    }

    #[test]
    fn children_direction_only_visits_direct_children() {
        let mut h = Hierarchy::new();
        h.add_children(ROOT_ID, &[id("ma00000001")]).unwrap();
        h.add_children(id("ma00000001"), &[id("ma00000002")]).unwrap();

        let mut visited = Vec::new();
        let mut cb = Callbacks {
            node: Some(Box::new(|_, n| {
                visited.push(n);
                Ok(())
            })),
            ..Default::default()
        };
        traverse(&mut h, ROOT_ID, Direction::Children, &mut cb).unwrap();
        assert_eq!(visited, vec![id("ma00000001")]);
    }

    #[test]
    fn second_top_level_traversal_from_outside_yields_etrmax() {
        let mut h = Hierarchy::new();
        h.begin_traversal().unwrap();
        let mut cb = Callbacks::default();
        assert!(traverse(&mut h, ROOT_ID, Direction::Node, &mut cb).is_err());
        h.end_traversal();
    }

    #[test]
    fn traversal_transparently_restores_detached_stub() {
        let mut h = Hierarchy::new();
        h.add_children(ROOT_ID, &[id("ma00000001")]).unwrap();
        h.add_children(id("ma00000001"), &[id("ma00000002")]).unwrap();
        detached::compress_subtree(&mut h, id("ma00000001"), 6).unwrap();
        assert!(!h.contains(&id("ma00000001")));

        let mut visited = Vec::new();
        let mut cb = Callbacks {
            node: Some(Box::new(|_, n| {
                visited.push(n);
                Ok(())
            })),
            ..Default::default()
        };
        traverse(&mut h, ROOT_ID, Direction::BfsDescendants, &mut cb).unwrap();

        assert!(h.contains(&id("ma00000001")));
        assert!(visited.contains(&id("ma00000001")));
        assert!(visited.contains(&id("ma00000002")));
    }

    #[test]
    fn edge_field_direction_follows_named_field_one_hop() {
        let mut h = Hierarchy::new();
        h.upsert(id("ma00000001"), true);
        h.upsert(id("ma00000002"), true);
        h.edge_add(id("ma00000001"), "ref", id("ma00000002")).unwrap();

        let mut visited = Vec::new();
        let mut cb = Callbacks {
            node: Some(Box::new(|_, n| {
                visited.push(n);
                Ok(())
            })),
            ..Default::default()
        };
        traverse(&mut h, id("ma00000001"), Direction::EdgeField("ref".to_string()), &mut cb).unwrap();
        assert_eq!(visited, vec![id("ma00000002")]);
    }

    #[test]
    fn expression_direction_follows_rpn_emitted_field_names() {
        use crate::rpn::compile;

        let mut h = Hierarchy::new();
        h.add_children(ROOT_ID, &[id("ma00000001")]).unwrap();
        h.add_children(id("ma00000001"), &[id("ma00000002")]).unwrap();
        h.upsert(id("ma00000003"), true);
        h.edge_add(id("ma00000001"), "ref", id("ma00000003")).unwrap();

        // Always emits the single field name "children", so this behaves
        // like a plain descendants walk while exercising the RPN path.
        let expr = compile(r#"{"children"}"#).unwrap();

        let mut visited = Vec::new();
        let mut cb = Callbacks {
            node: Some(Box::new(|_, n| {
                visited.push(n);
                Ok(())
            })),
            ..Default::default()
        };
        traverse(&mut h, ROOT_ID, Direction::Expression { expr, edge_filter: None }, &mut cb).unwrap();

        assert!(visited.contains(&id("ma00000001")));
        assert!(visited.contains(&id("ma00000002")));
        assert!(!visited.contains(&id("ma00000003")));
    }

    #[test]
    fn expression_direction_edge_filter_prunes_edges() {
        use crate::rpn::compile;

        let mut h = Hierarchy::new();
        h.upsert(id("ma00000001"), true);
        h.upsert(id("ma00000002"), true);
        h.upsert(id("ma00000003"), true);
        h.edge_add(id("ma00000001"), "ref", id("ma00000002")).unwrap();
        h.edge_add(id("ma00000001"), "ref", id("ma00000003")).unwrap();
        h.edge_field_mut(id("ma00000001"), "ref")
            .unwrap()
            .metadata
            .get_or_insert_mut(id("ma00000002"))
            .set_ll("allowed", 1)
            .unwrap();

        let expr = compile(r#"{"ref"}"#).unwrap();
        let edge_filter = compile(r#""allowed" h"#).unwrap();

        let mut visited = Vec::new();
        let mut cb = Callbacks {
            node: Some(Box::new(|_, n| {
                visited.push(n);
                Ok(())
            })),
            ..Default::default()
        };
        traverse(&mut h, id("ma00000001"), Direction::Expression { expr, edge_filter: Some(edge_filter) }, &mut cb).unwrap();

        assert_eq!(visited, vec![id("ma00000002")]);
    }
}
