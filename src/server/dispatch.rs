//! Command dispatch (§4.4, §6): one function per registered `cmd_id`,
//! sharing the argument-parsing conventions in [`crate::server::args`] and
//! replying through a [`ResponseWriter`]. Handlers never decide replication
//! or read/write enforcement themselves — that's [`CommandRegistry`]'s mode
//! tag, consulted by the caller in `core.rs`.

use std::path::Path;

use indexmap::IndexSet;

use crate::config::Config;
use crate::error::{Result, SelvaError};
use crate::hierarchy::detached::{compress_subtree, compress_subtree_to_disk, restore_subtree};
use crate::hierarchy::find::{self, AggregateOp, UpdateOp};
use crate::hierarchy::traversal::Direction;
use crate::hierarchy::{DeleteFlags, Hierarchy};
use crate::nodeid::NodeId;
use crate::object::{SetValue, Value};
use crate::replication::RingBuffer;
use crate::rpn::{compile, eval_bool, eval_double, eval_integer, eval_set, Ctx, Program, RegValue};
use crate::sdb;
use crate::server::args::ArgReader;
use crate::server::core::CoreHandle;
use crate::server::registry::CommandRegistry;
use crate::server::response::ResponseWriter;
use crate::wire::value::WireValue;

pub struct DispatchCtx<'a> {
    pub h: &'a mut Hierarchy,
    pub cfg: &'a Config,
    pub ring: &'a RingBuffer,
    pub registry: &'a CommandRegistry,
    /// Handle back to the owning core actor, used by `replicaof` to spawn
    /// the replica-side FSM driver (§4.9) without giving every handler
    /// direct access to the actor's message channel.
    pub core: CoreHandle,
}

fn einval(msg: impl Into<String>) -> SelvaError {
    SelvaError::Einval(msg.into())
}

/// Top-level dispatch: looks up `cmd` in the registry only to reject
/// unknowns (`ENOSYS`, §4.4); execution itself is this `match`.
pub fn execute(ctx: &mut DispatchCtx, cmd: i8, payload: &[u8], resp: &mut ResponseWriter) -> Result<()> {
    if ctx.registry.get(cmd).is_none() {
        return Err(SelvaError::Enosys);
    }
    let mut args = ArgReader::new(payload);
    match cmd {
        0 => cmd_ping(resp),
        1 => cmd_echo(&mut args, resp),
        2 => cmd_lscmd(ctx, resp),
        3 => cmd_info(resp),
        14 => cmd_load(ctx.h, &mut args, resp),
        15 => cmd_save(ctx.h, &mut args, resp),
        16 => cmd_purge(&mut args, resp),
        17 => cmd_find(ctx.h, &mut args, resp),
        19 => cmd_aggregate(ctx.h, &mut args, resp),
        20 => cmd_edge_add(ctx.h, &mut args, resp),
        21 => cmd_edge_del(ctx.h, &mut args, resp),
        22 => cmd_set_alias(ctx.h, &mut args, resp),
        23 => cmd_del(ctx.h, &mut args, resp),
        24 => cmd_heads(ctx.h, resp),
        25 => cmd_parents(ctx.h, &mut args, resp),
        26 => cmd_children(ctx.h, &mut args, resp),
        27 => cmd_edge_list(ctx.h, &mut args, resp),
        28 => cmd_edge_get(ctx.h, &mut args, resp),
        29 => cmd_edge_get_metadata(ctx.h, &mut args, resp),
        30 => cmd_compress(ctx.h, ctx.cfg, &mut args, resp),
        31 => cmd_restore(ctx.h, &mut args, resp),
        32 => cmd_inherit(ctx.h, &mut args, resp),
        33 => cmd_node_type_add(ctx.h, &mut args, resp),
        34 => cmd_node_type_clear(ctx.h, &mut args, resp),
        35 => cmd_node_type_list(ctx.h, resp),
        36 => cmd_node_type_get(ctx.h, &mut args, resp),
        41 => cmd_rpn_eval_bool(ctx.h, &mut args, resp),
        42 => cmd_rpn_eval_double(ctx.h, &mut args, resp),
        43 => cmd_rpn_eval_integer(ctx.h, &mut args, resp),
        44 => cmd_rpn_eval_set(ctx.h, &mut args, resp),
        45 => cmd_object_get(ctx.h, &mut args, resp),
        46 => cmd_object_set(ctx.h, &mut args, resp),
        47 => cmd_object_del(ctx.h, &mut args, resp),
        48 => cmd_object_exists(ctx.h, &mut args, resp),
        49 => cmd_object_incr(ctx.h, &mut args, resp),
        50 => cmd_object_array_push(ctx.h, &mut args, resp),
        51 => cmd_object_array_insert(ctx.h, &mut args, resp),
        52 => cmd_object_array_remove(ctx.h, &mut args, resp),
        53..=58 => Err(SelvaError::Enotsup("subscription engine is an external collaborator (§4.8)".into())),
        63 => cmd_modify(ctx.h, &mut args, resp),
        64 => cmd_update(ctx.h, &mut args, resp),
        65 => cmd_replicainit(resp),
        66 => cmd_replicasync(ctx.h, ctx.ring, &mut args, resp),
        67 => cmd_replicaof(ctx.core.clone(), &mut args, resp),
        68 => cmd_replicainfo(ctx.ring, resp),
        _ => Err(SelvaError::Enosys),
    }
}

// --- §0: trivial & introspection ------------------------------------------

fn cmd_ping(resp: &mut ResponseWriter) -> Result<()> {
    resp.write_str("PONG");
    Ok(())
}

fn cmd_echo(args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    while !args.is_empty() {
        let v = args.next_value()?;
        resp.write_value(&v);
    }
    Ok(())
}

fn cmd_lscmd(ctx: &DispatchCtx, resp: &mut ResponseWriter) -> Result<()> {
    let entries: Vec<(i8, &str)> = ctx.registry.list().collect();
    resp.write_array_header(entries.len() as u32);
    for (id, name) in entries {
        resp.write_array_header(2);
        resp.write_ll(id as i64);
        resp.write_str(name);
    }
    Ok(())
}

fn cmd_info(resp: &mut ResponseWriter) -> Result<()> {
    resp.write_str(format!("selva-{}", env!("CARGO_PKG_VERSION")));
    Ok(())
}

// --- §4.10: persistence ----------------------------------------------------

fn cmd_load(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let filename = args.next_string()?;
    *h = sdb::load_from_file(Path::new(&filename))?;
    resp.write_str("OK");
    Ok(())
}

fn cmd_save(h: &Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let filename = args.next_string()?;
    sdb::save_to_file(h, Path::new(&filename))?;
    resp.write_str("OK");
    Ok(())
}

fn cmd_purge(args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let dir = args.next_string()?;
    let keep = args.next_ll()? as usize;
    let removed = sdb::purge(Path::new(&dir), keep)?;
    resp.write_ll(removed.len() as i64);
    Ok(())
}

// --- §4.6.3/§4.6.4: traversal, find, aggregate -----------------------------

fn parse_direction(name: &str, ref_field: Option<String>, expr: Option<Program>) -> Result<Direction> {
    Ok(match name {
        "node" => Direction::Node,
        "children" => Direction::Children,
        "parents" => Direction::Parents,
        "bfs_ancestors" => Direction::BfsAncestors,
        "bfs_descendants" => Direction::BfsDescendants,
        "dfs_ancestors" => Direction::DfsAncestors,
        "dfs_descendants" => Direction::DfsDescendants,
        "dfs_full" => Direction::DfsFull,
        "ref" => Direction::Ref(ref_field.ok_or_else(|| einval("ref direction needs a field name"))?),
        "edge_field" => Direction::EdgeField(ref_field.ok_or_else(|| einval("edge_field direction needs a field name"))?),
        "bfs_edge_field" => Direction::BfsEdgeField(ref_field.ok_or_else(|| einval("bfs_edge_field direction needs a field name"))?),
        "expression" => Direction::Expression { expr: expr.ok_or_else(|| einval("expression direction needs an expr"))?, edge_filter: None },
        other => return Err(einval(format!("unknown traversal direction {other}"))),
    })
}

/// Reads `direction [, ref_field|expr]` the same way for both `find` and
/// `aggregate`.
fn read_direction(args: &mut ArgReader) -> Result<Direction> {
    let name = args.next_string()?;
    let ref_field = matches!(name.as_str(), "ref" | "edge_field" | "bfs_edge_field").then(|| args.next_string()).transpose()?;
    let expr = if name == "expression" { Some(compile(&args.next_string()?)?) } else { None };
    parse_direction(&name, ref_field, expr)
}

/// Optional `order`/`offset`/`limit` keyword segments: each is introduced by
/// its keyword string and consumed greedily until a non-keyword token (the
/// start of the node-id array) is seen.
struct FindOptions {
    sort_field: Option<String>,
    sort_desc: bool,
    offset: usize,
    limit: Option<usize>,
}

fn read_find_options(args: &mut ArgReader) -> Result<FindOptions> {
    let mut opts = FindOptions { sort_field: None, sort_desc: false, offset: 0, limit: None };
    loop {
        if args.is_empty() {
            break;
        }
        let save = args.offset();
        let tok = args.next_string()?;
        match tok.as_str() {
            "order" => {
                opts.sort_field = Some(args.next_string()?);
                opts.sort_desc = args.next_string()? == "desc";
            }
            "offset" => opts.offset = args.next_ll()? as usize,
            "limit" => opts.limit = Some(args.next_ll()? as usize),
            _ => {
                args.rewind(save);
                break;
            }
        }
    }
    Ok(opts)
}

/// `[filter_expr, filter_args...]`: present only if the payload isn't
/// exhausted after the node-id array. Trailing args populate `Ctx.regs` for
/// every node the filter is evaluated against (§4.7).
struct FilterSpec {
    program: Program,
    regs: Vec<RegValue>,
}

fn read_optional_filter(args: &mut ArgReader) -> Result<Option<FilterSpec>> {
    if args.is_empty() {
        return Ok(None);
    }
    let program = compile(&args.next_string()?)?;
    let mut regs = Vec::new();
    while !args.is_empty() {
        regs.push(next_reg_value(args)?);
    }
    Ok(Some(FilterSpec { program, regs }))
}

fn filter_predicate(spec: &Option<FilterSpec>) -> impl Fn(&Hierarchy, NodeId) -> bool + '_ {
    move |h: &Hierarchy, id: NodeId| match spec {
        None => true,
        Some(FilterSpec { program, regs }) => {
            let mut ctx = Ctx::new();
            ctx.object = h.node(&id).map(|n| n.object.clone());
            ctx.current_node = Some(id);
            ctx.regs = regs.clone();
            eval_bool(program, &ctx).unwrap_or(false)
        }
    }
}

fn read_node_id_array(args: &mut ArgReader) -> Result<Vec<NodeId>> {
    let n = args.next_array_len()?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(args.next_node_id()?);
    }
    Ok(out)
}

/// A `inherit` acceptable-types list (§4.6.4): each element is a 2-byte
/// NodeType prefix, same encoding as the leading bytes of a NodeId.
fn read_type_array(args: &mut ArgReader) -> Result<Vec<[u8; 2]>> {
    let n = args.next_array_len()?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(prefix2(&args.next_str()?)?);
    }
    Ok(out)
}

fn cmd_find(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let _lang = args.next_string()?;
    let _hierarchy_key = args.next_string()?;
    let dir = read_direction(args)?;
    let opts = read_find_options(args)?;
    let roots = read_node_id_array(args)?;
    let filter = read_optional_filter(args)?;
    let pred = filter_predicate(&filter);

    let mut out = Vec::new();
    for root in roots {
        let ids = find::find(h, root, dir.clone(), &pred, opts.sort_field.as_deref(), opts.sort_desc, opts.offset, opts.limit)?;
        out.extend(ids);
    }
    resp.write_array_header(out.len() as u32);
    for id in &out {
        resp.write_value(&WireValue::Str { data: id.as_bytes().to_vec(), binary: true, deflate: false });
    }
    Ok(())
}

fn parse_agg_op(letter: &str, field: Option<String>) -> Result<AggregateOp> {
    Ok(match letter {
        "c" => AggregateOp::CountNodes,
        "u" => AggregateOp::CountUniqueField(field.ok_or_else(|| einval("agg_fn u needs a field"))?),
        "s" => AggregateOp::SumField(field.ok_or_else(|| einval("agg_fn s needs a field"))?),
        "a" => AggregateOp::AvgField(field.ok_or_else(|| einval("agg_fn a needs a field"))?),
        "n" => AggregateOp::MinField(field.ok_or_else(|| einval("agg_fn n needs a field"))?),
        "x" => AggregateOp::MaxField(field.ok_or_else(|| einval("agg_fn x needs a field"))?),
        other => return Err(einval(format!("unknown agg_fn {other}"))),
    })
}

fn cmd_aggregate(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let _lang = args.next_string()?;
    let _hierarchy_key = args.next_string()?;
    let agg_fn = args.next_string()?;
    let field = (agg_fn != "c").then(|| args.next_string()).transpose()?;
    let op = parse_agg_op(&agg_fn, field)?;
    let dir = read_direction(args)?;
    let roots = read_node_id_array(args)?;
    let filter = read_optional_filter(args)?;
    let pred = filter_predicate(&filter);

    let mut ids = Vec::new();
    for root in roots {
        ids.extend(find::collect_direction(h, root, dir.clone())?.into_iter().filter(|&id| pred(h, id)));
    }
    let value = find::aggregate(h, &ids, &op)?;
    resp.write_dbl(value);
    Ok(())
}

// --- §4.6.1: node/edge mutation and reads ----------------------------------

fn cmd_del(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let flags_str = args.next_string()?;
    let mut flags = DeleteFlags::empty();
    if flags_str.contains('F') {
        flags |= DeleteFlags::FORCE;
    }
    let reply_ids = flags_str.contains('I');
    let ids = args.rest_node_ids()?;
    for &id in &ids {
        h.delete(id, flags)?;
    }
    if reply_ids {
        resp.write_array_header(ids.len() as u32);
        for id in &ids {
            resp.write_value(&WireValue::Str { data: id.as_bytes().to_vec(), binary: true, deflate: false });
        }
    } else {
        resp.write_ll(ids.len() as i64);
    }
    Ok(())
}

fn write_node_id_set(resp: &mut ResponseWriter, ids: impl ExactSizeIterator<Item = NodeId>) {
    resp.write_array_header(ids.len() as u32);
    for id in ids {
        resp.write_value(&WireValue::Str { data: id.as_bytes().to_vec(), binary: true, deflate: false });
    }
}

fn cmd_heads(h: &Hierarchy, resp: &mut ResponseWriter) -> Result<()> {
    write_node_id_set(resp, h.heads.iter().copied().collect::<Vec<_>>().into_iter());
    Ok(())
}

fn cmd_parents(h: &Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let node = h.node(&id).ok_or(SelvaError::HierarchyEnoent)?;
    write_node_id_set(resp, node.parents.iter().copied().collect::<Vec<_>>().into_iter());
    Ok(())
}

fn cmd_children(h: &Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let node = h.node(&id).ok_or(SelvaError::HierarchyEnoent)?;
    write_node_id_set(resp, node.children.iter().copied().collect::<Vec<_>>().into_iter());
    Ok(())
}

fn cmd_edge_list(h: &Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let node = h.node(&id).ok_or(SelvaError::HierarchyEnoent)?;
    let names: Vec<&String> = node.edge_fields.keys().collect();
    resp.write_array_header(names.len() as u32);
    for name in names {
        resp.write_str(name.clone());
    }
    Ok(())
}

fn cmd_edge_get(h: &Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let field = args.next_string()?;
    let node = h.node(&id).ok_or(SelvaError::HierarchyEnoent)?;
    let ef = node.edge_fields.get(&field).ok_or(SelvaError::HierarchyEnoent)?;
    write_node_id_set(resp, ef.destinations.iter().copied().collect::<Vec<_>>().into_iter());
    Ok(())
}

fn cmd_edge_get_metadata(h: &Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let field = args.next_string()?;
    let dst = args.next_node_id()?;
    let node = h.node(&id).ok_or(SelvaError::HierarchyEnoent)?;
    let ef = node.edge_fields.get(&field).ok_or(SelvaError::HierarchyEnoent)?;
    match ef.metadata.get(&dst) {
        Some(obj) => resp.write_object(obj),
        None => resp.write_value(&WireValue::Null),
    }
    Ok(())
}

fn cmd_edge_add(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let field = args.next_string()?;
    let dst = args.next_node_id()?;
    h.edge_add(id, &field, dst)?;
    resp.write_str("OK");
    Ok(())
}

fn cmd_edge_del(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let field = args.next_string()?;
    let dst = args.next_node_id()?;
    h.edge_del(id, &field, dst)?;
    resp.write_str("OK");
    Ok(())
}

fn cmd_set_alias(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let owner = args.next_node_id()?;
    let alias = args.next_str()?;
    h.set_alias(owner, alias)?;
    resp.write_str("OK");
    Ok(())
}

// --- §4.6.5: detached subtrees ---------------------------------------------

fn cmd_compress(h: &mut Hierarchy, cfg: &Config, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let mode = if args.is_empty() { "mem".to_string() } else { args.next_string()? };
    match mode.as_str() {
        "mem" => compress_subtree(h, id, cfg.hierarchy_compression_level)?,
        "disk" => {
            let path = std::env::temp_dir().join(format!("{}.detached", id.display_string()));
            compress_subtree_to_disk(h, id, cfg.hierarchy_compression_level, path)?
        }
        other => return Err(einval(format!("unknown compress mode {other}"))),
    }
    resp.write_str("OK");
    Ok(())
}

fn cmd_restore(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    restore_subtree(h, id)?;
    resp.write_str("OK");
    Ok(())
}

fn cmd_inherit(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let types = read_type_array(args)?;
    let field = args.next_string()?;
    let value = find::inherit(h, id, &types, &field)?;
    resp.write_typed(&value);
    Ok(())
}

// --- node-type registry -----------------------------------------------------

fn prefix2(data: &[u8]) -> Result<[u8; 2]> {
    if data.len() != 2 {
        return Err(einval("node type prefix must be 2 bytes"));
    }
    Ok([data[0], data[1]])
}

fn cmd_node_type_add(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let prefix = prefix2(&args.next_str()?)?;
    let name = args.next_string()?;
    h.types.add(prefix, name);
    resp.write_str("OK");
    Ok(())
}

fn cmd_node_type_clear(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let prefix = prefix2(&args.next_str()?)?;
    resp.write_ll(h.types.remove(&prefix) as i64);
    Ok(())
}

fn cmd_node_type_list(h: &Hierarchy, resp: &mut ResponseWriter) -> Result<()> {
    let entries: Vec<(&[u8; 2], &String)> = h.types.list().collect();
    resp.write_array_header(entries.len() as u32);
    for (prefix, name) in entries {
        resp.write_array_header(2);
        resp.write_value(&WireValue::Str { data: prefix.to_vec(), binary: true, deflate: false });
        resp.write_str(name.clone());
    }
    Ok(())
}

fn cmd_node_type_get(h: &Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let prefix = prefix2(&args.next_str()?)?;
    let name = h.types.get(&prefix).ok_or(SelvaError::Enoent)?;
    resp.write_str(name.to_string());
    Ok(())
}

// --- §4.7: RPN evaluation ---------------------------------------------------

fn next_reg_value(args: &mut ArgReader) -> Result<RegValue> {
    match args.next_value()? {
        WireValue::Str { data, .. } => Ok(RegValue::Str(data)),
        WireValue::Double(d) => Ok(RegValue::Num(d)),
        WireValue::LongLong { value, .. } => Ok(RegValue::Num(value as f64)),
        WireValue::Array { len: Some(n) } => {
            let mut set = IndexSet::new();
            for _ in 0..n {
                set.insert(args.next_str()?);
            }
            Ok(RegValue::Set(SetValue::Str(set)))
        }
        _ => Err(einval("unsupported rpn register value")),
    }
}

fn rpn_prepare(h: &Hierarchy, args: &mut ArgReader) -> Result<(Program, Ctx)> {
    let key = args.next_node_id()?;
    let expr = args.next_string()?;
    let program = compile(&expr)?;
    let mut ctx = Ctx::new();
    ctx.object = h.node(&key).map(|n| n.object.clone());
    ctx.current_node = Some(key);
    while !args.is_empty() {
        ctx.regs.push(next_reg_value(args)?);
    }
    Ok((program, ctx))
}

fn cmd_rpn_eval_bool(h: &Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let (p, ctx) = rpn_prepare(h, args)?;
    resp.write_ll(eval_bool(&p, &ctx)? as i64);
    Ok(())
}

fn cmd_rpn_eval_double(h: &Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let (p, ctx) = rpn_prepare(h, args)?;
    resp.write_dbl(eval_double(&p, &ctx)?);
    Ok(())
}

fn cmd_rpn_eval_integer(h: &Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let (p, ctx) = rpn_prepare(h, args)?;
    resp.write_ll(eval_integer(&p, &ctx)?);
    Ok(())
}

fn cmd_rpn_eval_set(h: &Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let (p, ctx) = rpn_prepare(h, args)?;
    resp.write_set(&eval_set(&p, &ctx)?);
    Ok(())
}

// --- §4.5: object store ------------------------------------------------------

fn read_value(args: &mut ArgReader) -> Result<Value> {
    match args.next_value()? {
        WireValue::Null => Ok(Value::Null),
        WireValue::LongLong { value, .. } => Ok(Value::Ll(value)),
        WireValue::Double(d) => Ok(Value::Dbl(d)),
        WireValue::Str { data, .. } => Ok(Value::Str(data)),
        WireValue::Array { len: Some(n) } => {
            let mut items = Vec::with_capacity(n as usize);
            for _ in 0..n {
                items.push(read_value(args)?);
            }
            Ok(Value::Arr(items))
        }
        _ => Err(einval("unsupported value in request")),
    }
}

fn cmd_object_get(h: &Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let path = args.next_string()?;
    let node = h.node(&id).ok_or(SelvaError::HierarchyEnoent)?;
    let value = node.object.get(&path)?;
    resp.write_typed(value);
    Ok(())
}

fn cmd_object_set(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let path = args.next_string()?;
    let value = read_value(args)?;
    let node = h.node_mut(&id).ok_or(SelvaError::HierarchyEnoent)?;
    node.object.set(&path, value)?;
    h.sink.defer_field_change(id, &path);
    resp.write_str("OK");
    Ok(())
}

fn cmd_object_del(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let path = args.next_string()?;
    let node = h.node_mut(&id).ok_or(SelvaError::HierarchyEnoent)?;
    node.object.del(&path)?;
    resp.write_str("OK");
    Ok(())
}

fn cmd_object_exists(h: &Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let path = args.next_string()?;
    let node = h.node(&id).ok_or(SelvaError::HierarchyEnoent)?;
    resp.write_ll(node.object.exists(&path) as i64);
    Ok(())
}

fn cmd_object_incr(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let path = args.next_string()?;
    let default = args.next_ll()?;
    let delta = args.next_ll()?;
    let node = h.node_mut(&id).ok_or(SelvaError::HierarchyEnoent)?;
    let v = node.object.incr_ll(&path, default, delta)?;
    resp.write_ll(v);
    Ok(())
}

fn cmd_object_array_push(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let path = args.next_string()?;
    let value = read_value(args)?;
    let node = h.node_mut(&id).ok_or(SelvaError::HierarchyEnoent)?;
    node.object.array_push(&path, value)?;
    resp.write_str("OK");
    Ok(())
}

fn cmd_object_array_insert(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let path = args.next_string()?;
    let index = args.next_ll()? as usize;
    let value = read_value(args)?;
    let node = h.node_mut(&id).ok_or(SelvaError::HierarchyEnoent)?;
    node.object.array_insert(&path, index, value)?;
    resp.write_str("OK");
    Ok(())
}

fn cmd_object_array_remove(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let path = args.next_string()?;
    let index = args.next_ll()? as usize;
    let node = h.node_mut(&id).ok_or(SelvaError::HierarchyEnoent)?;
    node.object.array_remove(&path, index)?;
    resp.write_str("OK");
    Ok(())
}

// --- modify / update ---------------------------------------------------------

fn cmd_modify(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let id = args.next_node_id()?;
    let _flags = args.next_string()?;
    h.upsert(id, true);
    let mut modified = 0i64;
    while !args.is_empty() {
        let _type_code = args.next_string()?;
        let field = args.next_string()?;
        let value = read_value(args)?;
        let node = h.node_mut(&id).expect("just upserted");
        node.object.set(&field, value)?;
        h.sink.defer_field_change(id, &field);
        modified += 1;
    }
    h.sink.defer_hierarchy_event(id);
    resp.write_ll(modified);
    Ok(())
}

fn read_update_op(args: &mut ArgReader) -> Result<UpdateOp> {
    let op_type = args.next_string()?;
    Ok(match op_type.as_str() {
        "set_default_ll" => UpdateOp::SetDefaultLl { path: args.next_string()?, value: args.next_ll()? },
        "set_default_dbl" => UpdateOp::SetDefaultDbl { path: args.next_string()?, value: args.next_dbl()? },
        "set_default_str" => UpdateOp::SetDefaultStr { path: args.next_string()?, value: args.next_str()? },
        "set_ll" => UpdateOp::SetLl { path: args.next_string()?, value: args.next_ll()? },
        "set_dbl" => UpdateOp::SetDbl { path: args.next_string()?, value: args.next_dbl()? },
        "set_str" => UpdateOp::SetStr { path: args.next_string()?, value: args.next_str()? },
        "incr" => {
            let path = args.next_string()?;
            let default = args.next_ll()?;
            let delta = args.next_ll()?;
            UpdateOp::Incr { path, default, delta }
        }
        "del" => UpdateOp::Del { path: args.next_string()? },
        "array_remove_index" => UpdateOp::ArrayRemoveIndex { path: args.next_string()?, index: args.next_ll()? as usize },
        "obj_meta" => UpdateOp::ObjMeta { path: args.next_string()?, value: read_value(args)? },
        other => return Err(einval(format!("unknown update op {other}"))),
    })
}

fn cmd_update(h: &mut Hierarchy, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let dir = read_direction(args)?;
    let roots = read_node_id_array(args)?;
    let n_ops = args.next_ll()? as usize;
    if n_ops > find::MAX_UPDATE_OPS {
        return Err(einval(format!("update op list exceeds {}", find::MAX_UPDATE_OPS)));
    }
    let mut ops = Vec::with_capacity(n_ops);
    for _ in 0..n_ops {
        ops.push(read_update_op(args)?);
    }

    let mut touched = 0i64;
    for root in roots {
        let ids = find::collect_direction(h, root, dir.clone())?;
        for id in ids {
            if find::apply_update(h, id, &ops)? {
                touched += 1;
            }
        }
    }
    resp.write_ll(touched);
    Ok(())
}

// --- §4.9: replication --------------------------------------------------------

fn cmd_replicainit(resp: &mut ResponseWriter) -> Result<()> {
    resp.write_str("OK");
    Ok(())
}

/// `replicasync([last_known_eid])` (§4.9 "initial state sync"): with no
/// argument, or when `last_known_eid` has already fallen off the ring
/// buffer, replies a full snapshot (`replication_sdb` + the snapshot bytes).
/// Otherwise replies the buffered commands after that eid, ascending, for
/// the replica to replay directly — the ring-buffer-backed half of
/// "snapshot-then-ascending-eid catch-up".
fn cmd_replicasync(h: &Hierarchy, ring: &RingBuffer, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let last_known_eid = if args.is_empty() { None } else { Some(args.next_ll()? as u64) };
    let can_catch_up = match (last_known_eid, ring.oldest_eid()) {
        (Some(last), Some(oldest)) => last + 1 >= oldest,
        _ => false,
    };

    if can_catch_up {
        let entries = ring.entries_after(last_known_eid.unwrap());
        resp.write_array_header(entries.len() as u32);
        for (eid, record) in entries {
            let cmd_id = *record.first().unwrap_or(&0) as i8;
            let data = record.get(1..).unwrap_or(&[]).to_vec();
            resp.write_value(&WireValue::ReplicationCmd { eid, cmd_id, data });
        }
    } else {
        let snapshot = sdb::save_to_bytes(h)?;
        let eid = ring.oldest_eid().unwrap_or(0);
        resp.write_value(&WireValue::ReplicationSdb { eid, bsize: snapshot.len() as u32, pseudo: false });
        resp.write_value(&WireValue::Str { data: snapshot, binary: true, deflate: false });
    }
    Ok(())
}

/// `replicaof(host, port)` (§4.9): spawns the replica-side FSM driver, which
/// owns its own reconnect/backoff loop for the lifetime of the process —
/// this handler only starts it and returns.
fn cmd_replicaof(core: CoreHandle, args: &mut ArgReader, resp: &mut ResponseWriter) -> Result<()> {
    let host = args.next_string()?;
    let port = args.next_ll()? as u16;
    tracing::info!(host = %host, port, "replicaof requested, starting replica driver");
    tokio::spawn(crate::replication::ReplicaDriver::new(host, port, core).run());
    resp.write_str("OK");
    Ok(())
}

fn cmd_replicainfo(ring: &RingBuffer, resp: &mut ResponseWriter) -> Result<()> {
    resp.write_array_header(2);
    resp.write_ll(ring.len() as i64);
    match ring.oldest_eid() {
        Some(eid) => resp.write_ll(eid as i64),
        None => resp.write_value(&WireValue::Null),
    }
    Ok(())
}
