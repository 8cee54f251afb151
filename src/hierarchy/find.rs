//! Find, Aggregate, Update, and Inherit (§4.6.4, §4.6.6): the read/write
//! query surface layered on top of [`crate::hierarchy::traversal`].

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexSet;

use crate::error::{Result, SelvaError};
use crate::hierarchy::traversal::{traverse, Callbacks, Direction};
use crate::hierarchy::Hierarchy;
use crate::nodeid::NodeId;
use crate::object::{SetValue, Value};

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Run a traversal and collect every node it visits after the head (i.e.
/// every `node` callback firing), in visit order.
pub fn collect_direction(h: &mut Hierarchy, root: NodeId, dir: Direction) -> Result<Vec<NodeId>> {
    let results = Rc::new(RefCell::new(Vec::new()));
    let sink = results.clone();
    let mut cb = Callbacks {
        node: Some(Box::new(move |_, n| {
            sink.borrow_mut().push(n);
            Ok(())
        })),
        ..Default::default()
    };
    traverse(h, root, dir, &mut cb)?;
    Ok(Rc::try_unwrap(results).expect("callback dropped by end of traverse").into_inner())
}

/// `find(root, dir, filter, sort, offset, limit)` (§4.6.4). `filter` stands
/// in for a compiled RPN expression (§4.7); the engine itself hands this
/// layer a predicate closure.
pub fn find<F>(
    h: &mut Hierarchy,
    root: NodeId,
    dir: Direction,
    filter: F,
    sort_field: Option<&str>,
    sort_desc: bool,
    offset: usize,
    limit: Option<usize>,
) -> Result<Vec<NodeId>>
where
    F: Fn(&Hierarchy, NodeId) -> bool,
{
    let mut ids = collect_direction(h, root, dir)?;
    ids.retain(|&id| filter(h, id));

    if let Some(field) = sort_field {
        ids.sort_by(|a, b| {
            let av = h.node(a).and_then(|n| n.object.get(field).ok().and_then(|v| v.as_dbl()));
            let bv = h.node(b).and_then(|n| n.object.get(field).ok().and_then(|v| v.as_dbl()));
            av.partial_cmp(&bv).unwrap_or(std::cmp::Ordering::Equal)
        });
        if sort_desc {
            ids.reverse();
        }
    }

    let start = offset.min(ids.len());
    let end = match limit {
        Some(l) => start.saturating_add(l).min(ids.len()),
        None => ids.len(),
    };
    Ok(ids[start..end].to_vec())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateOp {
    CountNodes,
    CountUniqueField(String),
    SumField(String),
    AvgField(String),
    MinField(String),
    MaxField(String),
}

/// `aggregate(ids, op)` (§4.6.4). `CountUniqueField` is `ENOTSUP` per the
/// resolved Open Question (§9) — no unique-counting structure is carried.
pub fn aggregate(h: &Hierarchy, ids: &[NodeId], op: &AggregateOp) -> Result<f64> {
    let field_values = |field: &str| -> Vec<f64> {
        ids.iter().filter_map(|id| h.node(id).and_then(|n| n.object.get(field).ok().and_then(|v| v.as_dbl()))).collect()
    };

    match op {
        AggregateOp::CountNodes => Ok(ids.len() as f64),
        AggregateOp::CountUniqueField(_) => Err(SelvaError::Enotsup("count_unique_field".into())),
        AggregateOp::SumField(f) => Ok(field_values(f).iter().sum()),
        AggregateOp::AvgField(f) => {
            // Zero items is a real 0.0 / 0.0 division, not a special-cased
            // default — callers receive NaN (§8) rather than a sentinel 0.
            let values = field_values(f);
            Ok(values.iter().sum::<f64>() / values.len() as f64)
        }
        AggregateOp::MinField(f) => {
            let mut acc = f64::INFINITY;
            for v in field_values(f) {
                if v < acc {
                    acc = v;
                }
            }
            Ok(acc)
        }
        AggregateOp::MaxField(f) => {
            let mut acc = f64::NEG_INFINITY;
            for v in field_values(f) {
                if v > acc {
                    acc = v;
                }
            }
            Ok(acc)
        }
    }
}

pub const MAX_UPDATE_OPS: usize = 300;

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    SetDefaultLl { path: String, value: i64 },
    SetDefaultDbl { path: String, value: f64 },
    SetDefaultStr { path: String, value: Vec<u8> },
    SetLl { path: String, value: i64 },
    SetDbl { path: String, value: f64 },
    SetStr { path: String, value: Vec<u8> },
    Incr { path: String, default: i64, delta: i64 },
    Del { path: String },
    ArrayRemoveIndex { path: String, index: usize },
    ObjMeta { path: String, value: Value },
}

impl UpdateOp {
    fn path(&self) -> &str {
        match self {
            UpdateOp::SetDefaultLl { path, .. }
            | UpdateOp::SetDefaultDbl { path, .. }
            | UpdateOp::SetDefaultStr { path, .. }
            | UpdateOp::SetLl { path, .. }
            | UpdateOp::SetDbl { path, .. }
            | UpdateOp::SetStr { path, .. }
            | UpdateOp::Incr { path, .. }
            | UpdateOp::Del { path }
            | UpdateOp::ArrayRemoveIndex { path, .. }
            | UpdateOp::ObjMeta { path, .. } => path,
        }
    }
}

/// Apply `ops` is one step; returns whether anything observably changed so
/// the caller can gate subscription events on real deltas (§4.6.4, §4.8).
fn apply_one(node: &mut crate::hierarchy::node::Node, op: &UpdateOp) -> Result<bool> {
    Ok(match op {
        UpdateOp::SetDefaultLl { path, value } => {
            if !node.object.exists(path) {
                node.object.set_ll(path, *value)?;
                true
            } else {
                false
            }
        }
        UpdateOp::SetDefaultDbl { path, value } => {
            if !node.object.exists(path) {
                node.object.set_dbl(path, *value)?;
                true
            } else {
                false
            }
        }
        UpdateOp::SetDefaultStr { path, value } => {
            if !node.object.exists(path) {
                node.object.set_str(path, value.clone())?;
                true
            } else {
                false
            }
        }
        UpdateOp::SetLl { path, value } => {
            let prior = node.object.get(path).ok().and_then(|v| v.as_ll());
            if prior != Some(*value) {
                node.object.set_ll(path, *value)?;
                true
            } else {
                false
            }
        }
        UpdateOp::SetDbl { path, value } => {
            let prior = node.object.get(path).ok().and_then(|v| v.as_dbl());
            if prior != Some(*value) {
                node.object.set_dbl(path, *value)?;
                true
            } else {
                false
            }
        }
        UpdateOp::SetStr { path, value } => {
            let prior = node.object.get(path).ok().and_then(|v| v.as_str().map(|s| s.to_vec()));
            if prior.as_deref() != Some(value.as_slice()) {
                node.object.set_str(path, value.clone())?;
                true
            } else {
                false
            }
        }
        UpdateOp::Incr { path, default, delta } => {
            let before = node.object.get(path).ok().and_then(|v| v.as_ll());
            let after = node.object.incr_ll(path, *default, *delta)?;
            before != Some(after)
        }
        UpdateOp::Del { path } => match node.object.del(path) {
            Ok(()) => true,
            Err(SelvaError::Enoent) => false,
            Err(e) => return Err(e),
        },
        UpdateOp::ArrayRemoveIndex { path, index } => {
            let before_len = match node.object.get(path) {
                Ok(Value::Arr(a)) => a.len(),
                Ok(_) => return Err(SelvaError::Eintype),
                Err(e) => return Err(e),
            };
            node.object.array_remove(path, *index)?;
            let after_len = match node.object.get(path) {
                Ok(Value::Arr(a)) => a.len(),
                _ => 0,
            };
            before_len != after_len
        }
        UpdateOp::ObjMeta { path, value } => {
            let prior = node.object.get(path).ok().cloned();
            node.object.set(path, value.clone())?;
            prior.as_ref() != Some(value)
        }
    })
}

pub fn apply_update(h: &mut Hierarchy, id: NodeId, ops: &[UpdateOp]) -> Result<bool> {
    if ops.len() > MAX_UPDATE_OPS {
        return Err(SelvaError::Einval(format!("update op list exceeds {MAX_UPDATE_OPS}")));
    }
    if !h.contains(&id) {
        return Err(SelvaError::HierarchyEnoent);
    }

    let mut changed = false;
    for op in ops {
        let node = h.node_mut(&id).expect("checked contains above");
        changed |= apply_one(node, op)?;
    }

    if changed {
        let now = now_millis();
        if let Some(node) = h.node_mut(&id) {
            node.touch_updated_at(now);
        }
        h.sink.defer_hierarchy_event(id);
        for op in ops {
            h.sink.defer_field_change(id, op.path());
        }
    }
    Ok(changed)
}

fn node_id_set(ids: impl Iterator<Item = NodeId>) -> Value {
    Value::Set(SetValue::NodeId(ids.collect::<IndexSet<_>>()))
}

/// `inherit(id, types, field)` (§4.6.4, §4.6.6): the hierarchy pseudo-fields
/// short-circuit to the live relation sets (type-unfiltered, since they
/// describe `id` itself rather than an inherited value); everything else
/// walks ancestors nearest-first, starting with `id` itself, returning the
/// first node of an acceptable type that has the field. An empty `types`
/// list means every type is acceptable.
pub fn inherit(h: &mut Hierarchy, id: NodeId, types: &[[u8; 2]], field: &str) -> Result<Value> {
    if !h.contains(&id) {
        return Err(SelvaError::HierarchyEnoent);
    }
    match field {
        "parents" => return Ok(node_id_set(h.node(&id).unwrap().parents.iter().copied())),
        "children" => return Ok(node_id_set(h.node(&id).unwrap().children.iter().copied())),
        "ancestors" => {
            let ids = collect_direction(h, id, Direction::BfsAncestors)?;
            return Ok(node_id_set(ids.into_iter()));
        }
        "descendants" => {
            let ids = collect_direction(h, id, Direction::BfsDescendants)?;
            return Ok(node_id_set(ids.into_iter()));
        }
        _ => {}
    }

    let type_ok = |cand: &NodeId| types.is_empty() || types.contains(&cand.node_type());

    let mut candidates = vec![id];
    candidates.extend(collect_direction(h, id, Direction::BfsAncestors)?);
    for cand in candidates {
        if !type_ok(&cand) {
            continue;
        }
        if let Some(node) = h.node(&cand) {
            if let Ok(v) = node.object.get(field) {
                return Ok(v.clone());
            }
        }
    }
    Err(SelvaError::Enoent)
}

#[cfg(test)]
mod find_tests {
    use super::*;
    use crate::nodeid::ROOT_ID;

    fn id(s: &str) -> NodeId {
        NodeId::from_str_padded(s)
    }

    fn setup() -> Hierarchy {
        let mut h = Hierarchy::new();
        h.add_children(ROOT_ID, &[id("ma00000001"), id("ma00000002")]).unwrap();
        h.node_mut(&id("ma00000001")).unwrap().object.set_ll("score", 10).unwrap();
        h.node_mut(&id("ma00000002")).unwrap().object.set_ll("score", 20).unwrap();
        h
    }

    #[test]
    fn find_filters_and_sorts_by_field() {
        let mut h = setup();
        let result = find(&mut h, ROOT_ID, Direction::BfsDescendants, |_, _| true, Some("score"), true, 0, None).unwrap();
        assert_eq!(result, vec![id("ma00000002"), id("ma00000001")]);
    }

    #[test]
    fn find_applies_offset_and_limit() {
        let mut h = setup();
        let result = find(&mut h, ROOT_ID, Direction::BfsDescendants, |_, _| true, Some("score"), false, 1, Some(1)).unwrap();
        assert_eq!(result, vec![id("ma00000002")]);
    }

    #[test]
    fn aggregate_sum_and_minmax_seed_correctly_on_empty_input() {
        let h = Hierarchy::new();
        assert_eq!(aggregate(&h, &[], &AggregateOp::SumField("score".into())).unwrap(), 0.0);
        assert_eq!(aggregate(&h, &[], &AggregateOp::MinField("score".into())).unwrap(), f64::INFINITY);
        assert_eq!(aggregate(&h, &[], &AggregateOp::MaxField("score".into())).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn aggregate_avg_over_zero_items_is_nan() {
        let h = Hierarchy::new();
        assert!(aggregate(&h, &[], &AggregateOp::AvgField("score".into())).unwrap().is_nan());
    }

    #[test]
    fn aggregate_sum_avg_min_max_over_real_nodes() {
        let h = setup();
        let ids = vec![id("ma00000001"), id("ma00000002")];
        assert_eq!(aggregate(&h, &ids, &AggregateOp::SumField("score".into())).unwrap(), 30.0);
        assert_eq!(aggregate(&h, &ids, &AggregateOp::AvgField("score".into())).unwrap(), 15.0);
        assert_eq!(aggregate(&h, &ids, &AggregateOp::MinField("score".into())).unwrap(), 10.0);
        assert_eq!(aggregate(&h, &ids, &AggregateOp::MaxField("score".into())).unwrap(), 20.0);
    }

    #[test]
    fn aggregate_count_unique_field_is_not_supported() {
        let h = Hierarchy::new();
        assert!(matches!(
            aggregate(&h, &[], &AggregateOp::CountUniqueField("x".into())),
            Err(SelvaError::Enotsup(_))
        ));
    }

    #[test]
    fn update_reports_no_change_when_value_is_identical() {
        let mut h = setup();
        let changed = apply_update(&mut h, id("ma00000001"), &[UpdateOp::SetLl { path: "score".into(), value: 10 }]).unwrap();
        assert!(!changed);
    }

    #[test]
    fn update_reports_change_and_touches_updated_at() {
        let mut h = setup();
        let changed = apply_update(&mut h, id("ma00000001"), &[UpdateOp::SetLl { path: "score".into(), value: 99 }]).unwrap();
        assert!(changed);
        assert_eq!(h.node(&id("ma00000001")).unwrap().object.get("score").unwrap().as_ll(), Some(99));
    }

    #[test]
    fn update_rejects_op_list_over_max() {
        let mut h = setup();
        let ops: Vec<UpdateOp> = (0..(MAX_UPDATE_OPS + 1)).map(|i| UpdateOp::SetLl { path: format!("f{i}"), value: i as i64 }).collect();
        assert!(matches!(apply_update(&mut h, id("ma00000001"), &ops), Err(SelvaError::Einval(_))));
    }

    #[test]
    fn inherit_pseudo_field_children_short_circuits() {
        let mut h = setup();
        let v = inherit(&mut h, ROOT_ID, &[], "children").unwrap();
        match v {
            Value::Set(SetValue::NodeId(s)) => {
                assert!(s.contains(&id("ma00000001")));
                assert!(s.contains(&id("ma00000002")));
            }
            _ => panic!("expected nodeid set"),
        }
    }

    #[test]
    fn inherit_nearest_match_wins_over_ancestor() {
        let mut h = setup();
        h.node_mut(&ROOT_ID).unwrap().object.set_str("theme", "root-theme").unwrap();
        h.node_mut(&id("ma00000001")).unwrap().object.set_str("theme", "own-theme").unwrap();

        let own = inherit(&mut h, id("ma00000001"), &[], "theme").unwrap();
        assert_eq!(own.as_str(), Some(b"own-theme".as_slice()));

        let inherited = inherit(&mut h, id("ma00000002"), &[], "theme").unwrap();
        assert_eq!(inherited.as_str(), Some(b"root-theme".as_slice()));
    }

    #[test]
    fn inherit_missing_field_anywhere_in_chain_is_enoent() {
        let mut h = setup();
        assert!(matches!(inherit(&mut h, id("ma00000001"), &[], "nope"), Err(SelvaError::Enoent)));
    }

    #[test]
    fn inherit_skips_ancestor_of_disallowed_type() {
        let mut h = setup();
        h.node_mut(&ROOT_ID).unwrap().object.set_str("theme", "root-theme").unwrap();

        // ROOT_ID's type is "ro" (see NodeId::from_str_padded("root")); only
        // accept "ma" ancestors, so the field on the root must be skipped.
        let only_ma = inherit(&mut h, id("ma00000002"), &[*b"ma"], "theme");
        assert!(matches!(only_ma, Err(SelvaError::Enoent)));

        let any_type = inherit(&mut h, id("ma00000002"), &[], "theme").unwrap();
        assert_eq!(any_type.as_str(), Some(b"root-theme".as_slice()));
    }
}
