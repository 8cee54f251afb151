//! Detached subtree paging (§4.6.5): a whole-tree branch can be compressed
//! to a deflate blob and swapped for a stub, then lazily restored the next
//! time a traversal tries to step into it.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use indexmap::{IndexMap, IndexSet};

use crate::error::{Result, SelvaError};
use crate::hierarchy::node::{Node, NodeFlags};
use crate::hierarchy::serialize::{
    deserialize_edge_fields, deserialize_object, deserialize_origins, serialize_edge_fields,
    serialize_object, serialize_origins,
};
use crate::hierarchy::Hierarchy;
use crate::nodeid::{NodeId, EMPTY_ID, NODE_ID_LEN};

/// Where a compressed blob's bytes actually live. `OnDisk` is a path to a
/// standalone file written at compress time; callers choose it for subtrees
/// above a size threshold to keep the live process RSS down.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageKind {
    InMemory,
    OnDisk(std::path::PathBuf),
}

#[derive(Debug, Clone)]
pub struct DetachedBlob {
    /// Deflate-compressed serialized subtree bytes. Empty when `storage_kind`
    /// is `OnDisk` and the payload instead lives at the referenced path.
    data: Vec<u8>,
    storage_kind: StorageKind,
}

impl DetachedBlob {
    fn bytes(&self) -> Result<Vec<u8>> {
        match &self.storage_kind {
            StorageKind::InMemory => Ok(self.data.clone()),
            StorageKind::OnDisk(path) => std::fs::read(path).map_err(SelvaError::from),
        }
    }

    /// Compressed payload plus a one-byte storage-kind tag, for embedding a
    /// detached head directly in an SDB snapshot (§4.10): the snapshot
    /// always carries the bytes inline regardless of where they live today.
    pub fn to_snapshot_bytes(&self) -> Result<(u8, Vec<u8>)> {
        let tag = match self.storage_kind {
            StorageKind::InMemory => 0,
            StorageKind::OnDisk(_) => 1,
        };
        Ok((tag, self.bytes()?))
    }

    /// Rebuild a blob from snapshot bytes; restored blobs always land
    /// `InMemory` (the on-disk/in-memory split is a live-process placement
    /// choice, not part of the persisted format).
    pub fn from_snapshot_bytes(data: Vec<u8>) -> Self {
        DetachedBlob { data, storage_kind: StorageKind::InMemory }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DetachedStore {
    blobs: IndexMap<NodeId, DetachedBlob>,
}

impl DetachedStore {
    pub fn insert(&mut self, head: NodeId, blob: DetachedBlob) {
        self.blobs.insert(head, blob);
    }

    pub fn contains(&self, head: &NodeId) -> bool {
        self.blobs.contains_key(head)
    }

    pub fn take(&mut self, head: &NodeId) -> Option<DetachedBlob> {
        self.blobs.shift_remove(head)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn get(&self, head: &NodeId) -> Option<&DetachedBlob> {
        self.blobs.get(head)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &DetachedBlob)> {
        self.blobs.iter()
    }
}

/// Subtree self-containment check (§4.6.5): every descendant's parents and
/// incoming edges must resolve inside the collected id set, and the shape
/// below `head` must be a tree (each descendant reachable through exactly
/// one parent already in the set).
fn collect_and_validate_subtree(h: &Hierarchy, head: NodeId) -> Result<Vec<NodeId>> {
    if head.is_root() {
        return Err(SelvaError::HierarchyEinval("cannot detach root".into()));
    }
    let mut order = Vec::new();
    let mut seen = IndexSet::new();
    let mut queue = std::collections::VecDeque::new();
    seen.insert(head);
    queue.push_back(head);

    while let Some(cur) = queue.pop_front() {
        let node = h.node(&cur).ok_or(SelvaError::HierarchyEnoent)?;
        if !node.markers.is_empty() {
            return Err(SelvaError::HierarchyEinval("node has active subscription markers".into()));
        }
        if cur != head {
            if node.parents.len() != 1 || !node.parents.iter().all(|p| seen.contains(p)) {
                return Err(SelvaError::HierarchyEinval("subtree is not tree-shaped".into()));
            }
            if !node.has_no_incoming_edges() {
                return Err(SelvaError::HierarchyEinval("node has external incoming edges".into()));
            }
        }
        order.push(cur);
        for &child in &node.children {
            if seen.insert(child) {
                queue.push_back(child);
            }
        }
    }
    Ok(order)
}

fn serialize_subtree(h: &Hierarchy, head: NodeId, order: &[NodeId]) -> Vec<u8> {
    let mut buf = Vec::new();

    let head_node = h.node(&head).expect("validated above");
    buf.extend_from_slice(&(head_node.parents.len() as u32).to_le_bytes());
    for p in &head_node.parents {
        buf.extend_from_slice(p.as_bytes());
    }

    for id in order {
        let node = h.node(id).expect("validated above");
        buf.extend_from_slice(node.id.as_bytes());
        buf.push(node.flags.implicit as u8);
        serialize_object(&node.object, &mut buf);
        serialize_edge_fields(&node.edge_fields, &mut buf);
        serialize_origins(&node.origins, &mut buf);
        buf.extend_from_slice(&(node.children.len() as u32).to_le_bytes());
        for c in &node.children {
            buf.extend_from_slice(c.as_bytes());
        }
    }
    buf.extend_from_slice(EMPTY_ID.as_bytes());
    buf
}

fn deserialize_subtree(buf: &[u8]) -> Result<(Vec<NodeId>, Vec<Node>)> {
    let mut o = 0usize;
    let need = |o: usize, n: usize| -> Result<()> {
        if o + n > buf.len() {
            Err(SelvaError::Ebadmsg("truncated detached blob".into()))
        } else {
            Ok(())
        }
    };

    need(o, 4)?;
    let head_parent_count = u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
    o += 4;
    let mut head_parents = IndexSet::new();
    for _ in 0..head_parent_count {
        need(o, NODE_ID_LEN)?;
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&buf[o..o + NODE_ID_LEN]);
        o += NODE_ID_LEN;
        head_parents.insert(NodeId::new(id));
    }

    let mut order = Vec::new();
    let mut nodes = Vec::new();
    loop {
        need(o, NODE_ID_LEN)?;
        let mut id_bytes = [0u8; NODE_ID_LEN];
        id_bytes.copy_from_slice(&buf[o..o + NODE_ID_LEN]);
        let id = NodeId::new(id_bytes);
        o += NODE_ID_LEN;
        if id == EMPTY_ID {
            break;
        }

        need(o, 1)?;
        let implicit = buf[o] != 0;
        o += 1;

        let (object, next) = deserialize_object(buf, o)?;
        o = next;
        let (edge_fields, next) = deserialize_edge_fields(buf, o)?;
        o = next;
        let (origins, next) = deserialize_origins(buf, o)?;
        o = next;

        need(o, 4)?;
        let child_count = u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        o += 4;
        let mut children = IndexSet::new();
        for _ in 0..child_count {
            need(o, NODE_ID_LEN)?;
            let mut cid = [0u8; NODE_ID_LEN];
            cid.copy_from_slice(&buf[o..o + NODE_ID_LEN]);
            o += NODE_ID_LEN;
            children.insert(NodeId::new(cid));
        }

        let mut node = Node::new(id);
        node.flags = NodeFlags { detached: false, implicit };
        node.object = object;
        node.edge_fields = edge_fields;
        node.origins = origins;
        node.children = children;
        order.push(id);
        nodes.push(node);
    }

    if let Some(head) = nodes.first_mut() {
        head.parents = head_parents;
    }
    // Rebuild non-head parent links from the tree shape: each node's
    // children list already names its descendants.
    let by_id: IndexMap<NodeId, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let child_links: Vec<(NodeId, Vec<NodeId>)> = nodes.iter().map(|n| (n.id, n.children.iter().copied().collect())).collect();
    for (parent_id, children) in child_links {
        for child in children {
            if let Some(&idx) = by_id.get(&child) {
                nodes[idx].parents.insert(parent_id);
            }
        }
    }

    Ok((order, nodes))
}

/// Compress the subtree rooted at `head` into a blob and remove its live
/// nodes, leaving `head`'s id as a stub in its former parents'/edges'
/// adjacency sets (§4.6.5).
pub fn compress_subtree(h: &mut Hierarchy, head: NodeId, compression_level: u32) -> Result<()> {
    if h.detached.contains(&head) {
        return Err(SelvaError::Eexist);
    }
    let order = collect_and_validate_subtree(h, head)?;
    let raw = serialize_subtree(h, head, &order);

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(compression_level.clamp(1, 9)));
    encoder.write_all(&raw)?;
    let compressed = encoder.finish()?;

    h.take_node_subtree(&order);
    h.store_detached_blob(head, DetachedBlob { data: compressed, storage_kind: StorageKind::InMemory });
    Ok(())
}

/// Same as [`compress_subtree`] but writes the compressed payload to `path`
/// instead of keeping it resident.
pub fn compress_subtree_to_disk(
    h: &mut Hierarchy,
    head: NodeId,
    compression_level: u32,
    path: std::path::PathBuf,
) -> Result<()> {
    if h.detached.contains(&head) {
        return Err(SelvaError::Eexist);
    }
    let order = collect_and_validate_subtree(h, head)?;
    let raw = serialize_subtree(h, head, &order);

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(compression_level.clamp(1, 9)));
    encoder.write_all(&raw)?;
    let compressed = encoder.finish()?;
    std::fs::write(&path, &compressed)?;

    h.take_node_subtree(&order);
    h.store_detached_blob(head, DetachedBlob { data: Vec::new(), storage_kind: StorageKind::OnDisk(path) });
    Ok(())
}

/// Lazily restore a previously compressed subtree back into the live node
/// map. Called from traversal/`find_node` when a stub id is encountered;
/// `inhibit_restore` callers (e.g. SDB dump) must skip this and treat the
/// stub as absent instead.
pub fn restore_subtree(h: &mut Hierarchy, head: NodeId) -> Result<()> {
    let blob = h.detached.take(&head).ok_or(SelvaError::HierarchyEnoent)?;
    let compressed = blob.bytes()?;

    let mut decoder = DeflateDecoder::new(compressed.as_slice());
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;

    let (_, nodes) = deserialize_subtree(&raw)?;
    for node in nodes {
        h.insert_restored_node(node);
    }
    Ok(())
}
