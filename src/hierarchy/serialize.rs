//! Shared node/Object/edge-field byte encoding used by both detached
//! subtree blobs (§4.6.5) and the SDB body (§4.10) — both are explicitly
//! "a typed value stream using the same codec" per §4.10.

use indexmap::{IndexMap, IndexSet};

use crate::error::{Result, SelvaError};
use crate::hierarchy::edge::{EdgeField, EdgeMetadata};
use crate::nodeid::{NodeId, NODE_ID_LEN};
use crate::object::{Object, SetValue, Value};
use crate::wire::value::{encode_value, parse_vtype, WireValue};

/// Precedes a nested object's own array-header byte so the decoder can tell
/// it apart from a plain array; not a `WireValue` tag, only used within this
/// module's own stream.
const NESTED_OBJECT_MARKER: u8 = 0xFE;
/// Precedes a set's array-header byte; followed by the subtype byte consumed
/// by [`deserialize_set`].
const SET_MARKER: u8 = 0xFD;

pub fn serialize_object(obj: &Object, out: &mut Vec<u8>) {
    encode_value(&WireValue::Array { len: Some(obj.len() as u32) }, out);
    for (key, value) in obj.iter() {
        encode_value(&WireValue::Str { data: key.clone().into_bytes(), binary: false, deflate: false }, out);
        serialize_value(value, out);
    }
}

fn serialize_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => encode_value(&WireValue::Null, out),
        Value::Ll(v) => encode_value(&WireValue::LongLong { value: *v, hex: false }, out),
        Value::Dbl(v) => encode_value(&WireValue::Double(*v), out),
        Value::Str(s) => encode_value(&WireValue::Str { data: s.clone(), binary: true, deflate: false }, out),
        Value::Arr(items) => {
            encode_value(&WireValue::Array { len: Some(items.len() as u32) }, out);
            for item in items {
                serialize_value(item, out);
            }
        }
        Value::Obj(o) => {
            out.push(NESTED_OBJECT_MARKER);
            serialize_object(o, out);
        }
        Value::Set(s) => {
            out.push(SET_MARKER);
            serialize_set(s, out);
        }
    }
}

fn serialize_set(set: &SetValue, out: &mut Vec<u8>) {
    match set {
        SetValue::Str(s) => {
            out.push(0);
            encode_value(&WireValue::Array { len: Some(s.len() as u32) }, out);
            for v in s {
                encode_value(&WireValue::Str { data: v.clone(), binary: true, deflate: false }, out);
            }
        }
        SetValue::Dbl(s) => {
            out.push(1);
            encode_value(&WireValue::Array { len: Some(s.len() as u32) }, out);
            for v in s {
                encode_value(&WireValue::Double(*v), out);
            }
        }
        SetValue::Ll(s) => {
            out.push(2);
            encode_value(&WireValue::Array { len: Some(s.len() as u32) }, out);
            for v in s {
                encode_value(&WireValue::LongLong { value: *v, hex: false }, out);
            }
        }
        SetValue::NodeId(s) => {
            out.push(3);
            encode_value(&WireValue::Array { len: Some(s.len() as u32) }, out);
            for v in s {
                out.extend_from_slice(v.as_bytes());
            }
        }
    }
}

pub fn deserialize_object(buf: &[u8], offset: usize) -> Result<(Object, usize)> {
    let (array, mut o) = parse_vtype(buf, offset)?;
    let len = match array {
        WireValue::Array { len: Some(n) } => n,
        _ => return Err(SelvaError::Ebadmsg("expected object array header".into())),
    };
    let mut obj = Object::new();
    for _ in 0..len {
        let (key_v, next) = parse_vtype(buf, o)?;
        o = next;
        let key = match key_v {
            WireValue::Str { data, .. } => String::from_utf8_lossy(&data).into_owned(),
            _ => return Err(SelvaError::Ebadmsg("expected field name".into())),
        };
        let (value, next) = deserialize_value(buf, o)?;
        o = next;
        obj.set(&key, value)?;
    }
    Ok((obj, o))
}

fn deserialize_value(buf: &[u8], offset: usize) -> Result<(Value, usize)> {
    if offset >= buf.len() {
        return Err(SelvaError::Ebadmsg("truncated value".into()));
    }
    match buf[offset] {
        NESTED_OBJECT_MARKER => {
            let (obj, o) = deserialize_object(buf, offset + 1)?;
            return Ok((Value::Obj(Box::new(obj)), o));
        }
        SET_MARKER => {
            let (set, o) = deserialize_set(buf, offset + 1)?;
            return Ok((Value::Set(set), o));
        }
        _ => {}
    }

    let (tag, o) = parse_vtype(buf, offset)?;
    match tag {
        WireValue::Null => Ok((Value::Null, o)),
        WireValue::LongLong { value, .. } => Ok((Value::Ll(value), o)),
        WireValue::Double(v) => Ok((Value::Dbl(v), o)),
        WireValue::Str { data, .. } => Ok((Value::Str(data), o)),
        WireValue::Array { len: Some(n) } => {
            let mut items = Vec::with_capacity(n as usize);
            let mut o = o;
            for _ in 0..n {
                let (v, next) = deserialize_value(buf, o)?;
                o = next;
                items.push(v);
            }
            Ok((Value::Arr(items), o))
        }
        _ => Err(SelvaError::Ebadmsg("unexpected value in object stream".into())),
    }
}

/// Sets are self-describing via a leading subtype byte written ahead of the
/// array header by [`serialize_set`]; decode it explicitly rather than
/// through [`deserialize_value`], which cannot tell a set from a plain array.
pub fn deserialize_set(buf: &[u8], offset: usize) -> Result<(SetValue, usize)> {
    if offset >= buf.len() {
        return Err(SelvaError::Ebadmsg("truncated set".into()));
    }
    let subtype = buf[offset];
    let (array, mut o) = parse_vtype(buf, offset + 1)?;
    let len = match array {
        WireValue::Array { len: Some(n) } => n,
        _ => return Err(SelvaError::Ebadmsg("expected set array header".into())),
    };
    let set = match subtype {
        0 => {
            let mut s = IndexSet::new();
            for _ in 0..len {
                let (v, next) = parse_vtype(buf, o)?;
                o = next;
                if let WireValue::Str { data, .. } = v {
                    s.insert(data);
                }
            }
            SetValue::Str(s)
        }
        1 => {
            let mut s = Vec::new();
            for _ in 0..len {
                let (v, next) = parse_vtype(buf, o)?;
                o = next;
                if let WireValue::Double(d) = v {
                    s.push(d);
                }
            }
            SetValue::Dbl(s)
        }
        2 => {
            let mut s = IndexSet::new();
            for _ in 0..len {
                let (v, next) = parse_vtype(buf, o)?;
                o = next;
                if let WireValue::LongLong { value, .. } = v {
                    s.insert(value);
                }
            }
            SetValue::Ll(s)
        }
        3 => {
            let mut s = IndexSet::new();
            for _ in 0..len {
                if o + NODE_ID_LEN > buf.len() {
                    return Err(SelvaError::Ebadmsg("truncated nodeid set".into()));
                }
                let mut id = [0u8; NODE_ID_LEN];
                id.copy_from_slice(&buf[o..o + NODE_ID_LEN]);
                o += NODE_ID_LEN;
                s.insert(NodeId::new(id));
            }
            SetValue::NodeId(s)
        }
        _ => return Err(SelvaError::Ebadmsg("unknown set subtype".into())),
    };
    Ok((set, o))
}

/// Edge field list for one node: `count` then `(name, single_ref,
/// bidirectional, back_field_name?, destinations..)` per field.
pub fn serialize_edge_fields(fields: &IndexMap<String, EdgeField>, out: &mut Vec<u8>) {
    encode_value(&WireValue::Array { len: Some(fields.len() as u32) }, out);
    for (name, ef) in fields {
        encode_value(&WireValue::Str { data: name.clone().into_bytes(), binary: false, deflate: false }, out);
        out.push(ef.single_ref as u8 | ((ef.bidirectional as u8) << 1));
        match &ef.back_field_name {
            Some(b) => encode_value(&WireValue::Str { data: b.clone().into_bytes(), binary: false, deflate: false }, out),
            None => encode_value(&WireValue::Null, out),
        }
        encode_value(&WireValue::Array { len: Some(ef.destinations.len() as u32) }, out);
        for dst in &ef.destinations {
            out.extend_from_slice(dst.as_bytes());
        }
        match &ef.metadata {
            EdgeMetadata::Single(o) => {
                out.push(0);
                serialize_object(o, out);
            }
            EdgeMetadata::Multi(m) => {
                out.push(1);
                encode_value(&WireValue::Array { len: Some(m.len() as u32) }, out);
                for (dst, o) in m {
                    out.extend_from_slice(dst.as_bytes());
                    serialize_object(o, out);
                }
            }
        }
    }
}

pub fn deserialize_edge_fields(buf: &[u8], offset: usize) -> Result<(IndexMap<String, EdgeField>, usize)> {
    let (array, mut o) = parse_vtype(buf, offset)?;
    let count = match array {
        WireValue::Array { len: Some(n) } => n,
        _ => return Err(SelvaError::Ebadmsg("expected edge field count".into())),
    };
    let mut fields = IndexMap::new();
    for _ in 0..count {
        let (name_v, next) = parse_vtype(buf, o)?;
        o = next;
        let name = match name_v {
            WireValue::Str { data, .. } => String::from_utf8_lossy(&data).into_owned(),
            _ => return Err(SelvaError::Ebadmsg("expected edge field name".into())),
        };
        if o >= buf.len() {
            return Err(SelvaError::Ebadmsg("truncated edge field bits".into()));
        }
        let bits = buf[o];
        o += 1;
        let single_ref = bits & 0x1 != 0;
        let bidirectional = bits & 0x2 != 0;

        let (back_v, next) = parse_vtype(buf, o)?;
        o = next;
        let back_field_name = match back_v {
            WireValue::Str { data, .. } => Some(String::from_utf8_lossy(&data).into_owned()),
            WireValue::Null => None,
            _ => return Err(SelvaError::Ebadmsg("expected back field name or null".into())),
        };

        let (dest_arr, next) = parse_vtype(buf, o)?;
        o = next;
        let dest_count = match dest_arr {
            WireValue::Array { len: Some(n) } => n,
            _ => return Err(SelvaError::Ebadmsg("expected destination count".into())),
        };
        let mut ef = EdgeField::new(name.clone(), single_ref, bidirectional, back_field_name);
        for _ in 0..dest_count {
            if o + NODE_ID_LEN > buf.len() {
                return Err(SelvaError::Ebadmsg("truncated destination id".into()));
            }
            let mut id = [0u8; NODE_ID_LEN];
            id.copy_from_slice(&buf[o..o + NODE_ID_LEN]);
            o += NODE_ID_LEN;
            ef.destinations.insert(NodeId::new(id));
        }

        if o >= buf.len() {
            return Err(SelvaError::Ebadmsg("truncated metadata kind".into()));
        }
        let metadata_kind = buf[o];
        o += 1;
        ef.metadata = match metadata_kind {
            0 => {
                let (obj, next) = deserialize_object(buf, o)?;
                o = next;
                EdgeMetadata::Single(obj)
            }
            1 => {
                let (arr, next) = parse_vtype(buf, o)?;
                o = next;
                let n = match arr {
                    WireValue::Array { len: Some(n) } => n,
                    _ => return Err(SelvaError::Ebadmsg("expected metadata map count".into())),
                };
                let mut m = IndexMap::new();
                for _ in 0..n {
                    if o + NODE_ID_LEN > buf.len() {
                        return Err(SelvaError::Ebadmsg("truncated metadata key".into()));
                    }
                    let mut id = [0u8; NODE_ID_LEN];
                    id.copy_from_slice(&buf[o..o + NODE_ID_LEN]);
                    o += NODE_ID_LEN;
                    let (obj, next) = deserialize_object(buf, o)?;
                    o = next;
                    m.insert(NodeId::new(id), obj);
                }
                EdgeMetadata::Multi(m)
            }
            _ => return Err(SelvaError::Ebadmsg("unknown edge metadata kind".into())),
        };

        fields.insert(name, ef);
    }
    Ok((fields, o))
}

/// Back-reference map for one node: `count` then `(field_name, node_ids..)`.
/// Shared by the detached-subtree and SDB encodings alongside the edge-field
/// list above.
pub fn serialize_origins(origins: &IndexMap<String, IndexSet<NodeId>>, out: &mut Vec<u8>) {
    encode_value(&WireValue::Array { len: Some(origins.len() as u32) }, out);
    for (field, ids) in origins {
        encode_value(&WireValue::Str { data: field.clone().into_bytes(), binary: false, deflate: false }, out);
        encode_value(&WireValue::Array { len: Some(ids.len() as u32) }, out);
        for id in ids {
            out.extend_from_slice(id.as_bytes());
        }
    }
}

pub fn deserialize_origins(buf: &[u8], offset: usize) -> Result<(IndexMap<String, IndexSet<NodeId>>, usize)> {
    let (array, mut o) = parse_vtype(buf, offset)?;
    let count = match array {
        WireValue::Array { len: Some(n) } => n,
        _ => return Err(SelvaError::Ebadmsg("expected origins count".into())),
    };
    let mut origins = IndexMap::new();
    for _ in 0..count {
        let (field_v, next) = parse_vtype(buf, o)?;
        o = next;
        let field = match field_v {
            WireValue::Str { data, .. } => String::from_utf8_lossy(&data).into_owned(),
            _ => return Err(SelvaError::Ebadmsg("expected origin field name".into())),
        };
        let (arr, next) = parse_vtype(buf, o)?;
        o = next;
        let n = match arr {
            WireValue::Array { len: Some(n) } => n,
            _ => return Err(SelvaError::Ebadmsg("expected origin id count".into())),
        };
        let mut ids = IndexSet::new();
        for _ in 0..n {
            if o + NODE_ID_LEN > buf.len() {
                return Err(SelvaError::Ebadmsg("truncated origin id".into()));
            }
            let mut id = [0u8; NODE_ID_LEN];
            id.copy_from_slice(&buf[o..o + NODE_ID_LEN]);
            o += NODE_ID_LEN;
            ids.insert(NodeId::new(id));
        }
        origins.insert(field, ids);
    }
    Ok((origins, o))
}

#[cfg(test)]
mod serialize_tests {
    use super::*;

    #[test]
    fn object_round_trips_scalars_and_nesting() {
        let mut obj = Object::new();
        obj.set_ll("count", 42).unwrap();
        obj.set_dbl("ratio", 1.5).unwrap();
        obj.set_str("name", "hello").unwrap();
        obj.set_str("nested.deep", "value").unwrap();

        let mut buf = Vec::new();
        serialize_object(&obj, &mut buf);
        let (decoded, consumed) = deserialize_object(&buf, 0).unwrap();

        assert_eq!(consumed, buf.len());
        assert_eq!(decoded.get("count").unwrap().as_ll(), Some(42));
        assert_eq!(decoded.get("ratio").unwrap().as_dbl(), Some(1.5));
        assert_eq!(decoded.get("name").unwrap().as_str(), Some(b"hello".as_slice()));
        assert_eq!(decoded.get("nested.deep").unwrap().as_str(), Some(b"value".as_slice()));
    }

    #[test]
    fn set_values_round_trip_by_subtype() {
        let mut s = IndexSet::new();
        s.insert(b"a".to_vec());
        s.insert(b"b".to_vec());
        let set = SetValue::Str(s);
        let mut buf = Vec::new();
        serialize_set(&set, &mut buf);
        let (decoded, consumed) = deserialize_set(&buf, 0).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, set);
    }

    #[test]
    fn origins_round_trip() {
        let mut origins = IndexMap::new();
        let mut ids = IndexSet::new();
        ids.insert(NodeId::from_str_padded("ma00000001"));
        ids.insert(NodeId::from_str_padded("ma00000002"));
        origins.insert("owner".to_string(), ids);

        let mut buf = Vec::new();
        serialize_origins(&origins, &mut buf);
        let (decoded, consumed) = deserialize_origins(&buf, 0).unwrap();

        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, origins);
    }

    #[test]
    fn edge_fields_round_trip_with_metadata() {
        let mut fields = IndexMap::new();
        let mut ef = EdgeField::new("refs", false, false, None);
        let dst = NodeId::from_str_padded("ma00000002");
        ef.add_destination(dst);
        ef.metadata.get_or_insert_mut(dst).set_ll("weight", 7).unwrap();
        fields.insert("refs".to_string(), ef);

        let mut buf = Vec::new();
        serialize_edge_fields(&fields, &mut buf);
        let (decoded, consumed) = deserialize_edge_fields(&buf, 0).unwrap();

        assert_eq!(consumed, buf.len());
        let ef = decoded.get("refs").unwrap();
        assert!(ef.destinations.contains(&dst));
        assert_eq!(ef.metadata.get(&dst).unwrap().get("weight").unwrap().as_ll(), Some(7));
    }
}
