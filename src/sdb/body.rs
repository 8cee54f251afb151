//! SDB body (§4.10): `type_map`, `edge_constraints`, then a flat DFS node
//! stream terminated by an all-zero id sentinel. Reuses the same object /
//! edge-field / origins codec as detached subtree blobs
//! ([`crate::hierarchy::serialize`]).

use indexmap::IndexSet;

use crate::error::{Result, SelvaError};
use crate::hierarchy::constraint::{Constraint, ConstraintRegistry};
use crate::hierarchy::detached::{DetachedBlob, DetachedStore};
use crate::hierarchy::node::{Node, NodeFlags};
use crate::hierarchy::serialize::{
    deserialize_edge_fields, deserialize_object, serialize_edge_fields, serialize_object,
};
use crate::hierarchy::{Hierarchy, TypeRegistry};
use crate::nodeid::{NodeId, EMPTY_ID, NODE_ID_LEN};
use crate::object::Object;
use crate::wire::value::{encode_value, parse_vtype, WireValue};

const FLAG_IMPLICIT: u8 = 0x1;
const FLAG_DETACHED: u8 = 0x2;

const TAG_METADATA: u8 = 0;
const TAG_DETACHED_BLOB: u8 = 1;

fn node_flags_byte(flags: &NodeFlags) -> u8 {
    (flags.implicit as u8 * FLAG_IMPLICIT) | (flags.detached as u8 * FLAG_DETACHED)
}

fn node_flags_from_byte(b: u8) -> NodeFlags {
    NodeFlags {
        implicit: b & FLAG_IMPLICIT != 0,
        detached: b & FLAG_DETACHED != 0,
    }
}

fn serialize_type_map(types: &TypeRegistry, out: &mut Vec<u8>) {
    let mut obj = Object::new();
    for (prefix, name) in types.list() {
        let key = String::from_utf8_lossy(prefix).into_owned();
        let _ = obj.set_str(&key, name.clone());
    }
    serialize_object(&obj, out);
}

fn deserialize_type_map(buf: &[u8], offset: usize) -> Result<(TypeRegistry, usize)> {
    let (obj, o) = deserialize_object(buf, offset)?;
    let mut types = TypeRegistry::default();
    for (key, value) in obj.iter() {
        if let Some(name) = value.as_str() {
            let mut prefix = [0u8; 2];
            let bytes = key.as_bytes();
            prefix[..bytes.len().min(2)].copy_from_slice(&bytes[..bytes.len().min(2)]);
            types.add(prefix, String::from_utf8_lossy(name).into_owned());
        }
    }
    Ok((types, o))
}

/// `edge_constraints` is documented as "an Object of ptr values" in the
/// original in-process registry; there are no pointers to persist here, and
/// the registry's own keys (`"{type}.{field}"`) contain a dot that would be
/// misread as a nested path by [`Object`]'s dotted-path convention, so this
/// is written as a flat array of `(source_type, field, flags)` tuples
/// instead of going through the object codec.
fn serialize_edge_constraints(constraints: &ConstraintRegistry, out: &mut Vec<u8>) {
    let entries: Vec<(&str, &str, &Constraint)> = constraints
        .list()
        .filter_map(|(key, c)| key.split_once('.').map(|(t, f)| (t, f, c)))
        .collect();
    encode_value(&WireValue::Array { len: Some(entries.len() as u32) }, out);
    for (source_type, field, c) in entries {
        encode_value(&WireValue::Str { data: source_type.as_bytes().to_vec(), binary: false, deflate: false }, out);
        encode_value(&WireValue::Str { data: field.as_bytes().to_vec(), binary: false, deflate: false }, out);
        let flags = (c.single_ref as u8) | ((c.bidirectional as u8) << 1);
        out.push(flags);
        match &c.back_field_name {
            Some(b) => encode_value(&WireValue::Str { data: b.clone().into_bytes(), binary: false, deflate: false }, out),
            None => encode_value(&WireValue::Null, out),
        }
    }
}

fn deserialize_edge_constraints(buf: &[u8], offset: usize) -> Result<(ConstraintRegistry, usize)> {
    let (arr, mut o) = parse_vtype(buf, offset)?;
    let count = match arr {
        WireValue::Array { len: Some(n) } => n,
        _ => return Err(SelvaError::Ebadmsg("expected edge_constraints array header".into())),
    };
    let mut constraints = ConstraintRegistry::new();
    for _ in 0..count {
        let (type_v, next) = parse_vtype(buf, o)?;
        o = next;
        let source_type = match type_v {
            WireValue::Str { data, .. } => String::from_utf8_lossy(&data).into_owned(),
            _ => return Err(SelvaError::Ebadmsg("expected constraint source type".into())),
        };
        let (field_v, next) = parse_vtype(buf, o)?;
        o = next;
        let field = match field_v {
            WireValue::Str { data, .. } => String::from_utf8_lossy(&data).into_owned(),
            _ => return Err(SelvaError::Ebadmsg("expected constraint field name".into())),
        };
        if o >= buf.len() {
            return Err(SelvaError::Ebadmsg("truncated constraint flags".into()));
        }
        let flags = buf[o];
        o += 1;
        let single_ref = flags & 0x1 != 0;
        let bidirectional = flags & 0x2 != 0;
        let (back_v, next) = parse_vtype(buf, o)?;
        o = next;
        let back_field_name = match back_v {
            WireValue::Str { data, .. } => Some(String::from_utf8_lossy(&data).into_owned()),
            WireValue::Null => None,
            _ => return Err(SelvaError::Ebadmsg("expected back field name or null".into())),
        };
        constraints.add_dynamic(&source_type, &field, single_ref, bidirectional, back_field_name);
    }
    Ok((constraints, o))
}

fn write_node_stream(h: &Hierarchy, out: &mut Vec<u8>) {
    let mut visited: IndexSet<NodeId> = IndexSet::new();
    let mut stack: Vec<NodeId> = h.heads.iter().copied().collect();
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        if let Some(node) = h.node(&id) {
            out.extend_from_slice(id.as_bytes());
            out.push(node_flags_byte(&node.flags));
            out.push(TAG_METADATA);
            serialize_edge_fields(&node.edge_fields, out);
            serialize_object(&node.object, out);
            encode_value(&WireValue::Array { len: Some(node.children.len() as u32) }, out);
            for child in &node.children {
                out.extend_from_slice(child.as_bytes());
            }
            for child in node.children.iter().rev() {
                if !visited.contains(child) {
                    stack.push(*child);
                }
            }
        } else if let Some(blob) = h.detached.get(&id) {
            out.extend_from_slice(id.as_bytes());
            out.push(FLAG_DETACHED);
            out.push(TAG_DETACHED_BLOB);
            let (kind_tag, bytes) = blob.to_snapshot_bytes().expect("detached blob must be readable during dump");
            out.push(kind_tag);
            encode_value(&WireValue::Str { data: bytes, binary: true, deflate: false }, out);
        }
        // an id referenced as a child with neither a live node nor a
        // detached blob is a dangling reference; skip it rather than
        // corrupt the stream.
    }
    out.extend_from_slice(EMPTY_ID.as_bytes());
}

struct DecodedNode {
    node: Node,
    children: Vec<NodeId>,
}

fn read_node_stream(buf: &[u8], offset: usize) -> Result<(Vec<Node>, DetachedStore, usize)> {
    let mut o = offset;
    let mut decoded: Vec<DecodedNode> = Vec::new();
    let mut detached = DetachedStore::default();
    loop {
        if o + NODE_ID_LEN > buf.len() {
            return Err(SelvaError::Ebadmsg("truncated sdb node stream".into()));
        }
        let mut id_bytes = [0u8; NODE_ID_LEN];
        id_bytes.copy_from_slice(&buf[o..o + NODE_ID_LEN]);
        let id = NodeId::new(id_bytes);
        o += NODE_ID_LEN;
        if id == EMPTY_ID {
            break;
        }
        if o >= buf.len() {
            return Err(SelvaError::Ebadmsg("truncated sdb node flags".into()));
        }
        let flags = node_flags_from_byte(buf[o]);
        o += 1;
        if o >= buf.len() {
            return Err(SelvaError::Ebadmsg("truncated sdb node tag".into()));
        }
        let tag = buf[o];
        o += 1;
        match tag {
            TAG_METADATA => {
                let (edge_fields, next) = deserialize_edge_fields(buf, o)?;
                o = next;
                let (object, next) = deserialize_object(buf, o)?;
                o = next;
                let (arr, next) = parse_vtype(buf, o)?;
                o = next;
                let count = match arr {
                    WireValue::Array { len: Some(n) } => n,
                    _ => return Err(SelvaError::Ebadmsg("expected sdb child count".into())),
                };
                let mut children = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    if o + NODE_ID_LEN > buf.len() {
                        return Err(SelvaError::Ebadmsg("truncated sdb child id".into()));
                    }
                    let mut cid = [0u8; NODE_ID_LEN];
                    cid.copy_from_slice(&buf[o..o + NODE_ID_LEN]);
                    o += NODE_ID_LEN;
                    children.push(NodeId::new(cid));
                }
                let mut node = Node::new(id);
                node.flags = flags;
                node.object = object;
                node.edge_fields = edge_fields;
                node.children = children.iter().copied().collect();
                decoded.push(DecodedNode { node, children });
            }
            TAG_DETACHED_BLOB => {
                if o >= buf.len() {
                    return Err(SelvaError::Ebadmsg("truncated sdb blob tag".into()));
                }
                o += 1; // storage-kind tag: restored blobs always land InMemory
                let (v, next) = parse_vtype(buf, o)?;
                o = next;
                let data = match v {
                    WireValue::Str { data, .. } => data,
                    _ => return Err(SelvaError::Ebadmsg("expected detached blob bytes".into())),
                };
                detached.insert(id, DetachedBlob::from_snapshot_bytes(data));
            }
            _ => return Err(SelvaError::Ebadmsg("unknown sdb node tag".into())),
        }
    }

    // Parent links aren't persisted directly; rebuild them from the
    // children lists the way detached subtree restore already does.
    let by_id: std::collections::HashMap<NodeId, usize> = decoded.iter().enumerate().map(|(i, d)| (d.node.id, i)).collect();
    let child_links: Vec<(NodeId, Vec<NodeId>)> = decoded.iter().map(|d| (d.node.id, d.children.clone())).collect();
    let mut nodes: Vec<Node> = decoded.into_iter().map(|d| d.node).collect();
    for (parent_id, children) in child_links {
        for child in children {
            if let Some(&idx) = by_id.get(&child) {
                nodes[idx].parents.insert(parent_id);
            }
        }
    }

    Ok((nodes, detached, o))
}

pub fn encode_body(h: &Hierarchy) -> Vec<u8> {
    let mut out = Vec::new();
    serialize_type_map(&h.types, &mut out);
    serialize_edge_constraints(&h.constraints, &mut out);
    write_node_stream(h, &mut out);
    out
}

pub fn decode_body(buf: &[u8]) -> Result<Hierarchy> {
    let (types, o) = deserialize_type_map(buf, 0)?;
    let (constraints, o) = deserialize_edge_constraints(buf, o)?;
    let (nodes, detached, _) = read_node_stream(buf, o)?;
    Ok(Hierarchy::from_snapshot_parts(types, constraints, nodes, detached))
}

#[cfg(test)]
mod body_tests {
    use super::*;
    use crate::nodeid::ROOT_ID;

    fn id(s: &str) -> NodeId {
        NodeId::from_str_padded(s)
    }

    fn sample_hierarchy() -> Hierarchy {
        let mut h = Hierarchy::new();
        h.types.add(*b"ma", "article");
        h.constraints.add_dynamic("ma", "owner", true, true, Some("owns".into()));
        h.add_children(ROOT_ID, &[id("ma00000001")]).unwrap();
        h.add_children(id("ma00000001"), &[id("ma00000002")]).unwrap();
        h.node_mut(&id("ma00000002")).unwrap().object.set_str("title", "hello").unwrap();
        h.edge_add(id("ma00000001"), "owner", id("ma00000002")).unwrap();
        h
    }

    #[test]
    fn body_round_trips_nodes_types_and_constraints() {
        let h = sample_hierarchy();
        let encoded = encode_body(&h);
        let restored = decode_body(&encoded).unwrap();

        assert!(restored.contains(&id("ma00000001")));
        assert!(restored.contains(&id("ma00000002")));
        assert_eq!(restored.types.get(b"ma"), Some("article"));
        assert_eq!(restored.constraints.get("ma", "owner").back_field_name.as_deref(), Some("owns"));
        assert_eq!(
            restored.node(&id("ma00000002")).unwrap().object.get("title").unwrap().as_str(),
            Some(b"hello".as_slice())
        );
        assert!(restored.node(&id("ma00000001")).unwrap().children.contains(&id("ma00000002")));
        assert!(restored.node(&id("ma00000002")).unwrap().parents.contains(&id("ma00000001")));
    }

    #[test]
    fn body_preserves_detached_blob_without_restoring_it() {
        use crate::hierarchy::detached::compress_subtree;

        let mut h = sample_hierarchy();
        compress_subtree(&mut h, id("ma00000001"), 6).unwrap();
        assert!(!h.contains(&id("ma00000001")));

        let encoded = encode_body(&h);
        let restored = decode_body(&encoded).unwrap();
        assert!(!restored.contains(&id("ma00000001")));
        assert_eq!(restored.detached.len(), 1);
        assert!(restored.detached.get(&id("ma00000001")).is_some());
    }

    #[test]
    fn empty_sentinel_terminates_the_node_stream() {
        let h = Hierarchy::new();
        let encoded = encode_body(&h);
        assert!(encoded.ends_with(EMPTY_ID.as_bytes()));
    }
}
