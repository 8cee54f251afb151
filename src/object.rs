//! Object store: the recursively typed key→value document embedded in every
//! node (§4.5). Iteration order is insertion order at every level, backed by
//! `IndexMap`/`IndexSet` rather than the hash-ordered stdlib collections.

use indexmap::{IndexMap, IndexSet};
use std::fmt;

use crate::error::{Result, SelvaError};
use crate::nodeid::NodeId;

/// Reserved top-level fields guaranteed present on every node's Object (§3).
pub const RESERVED_FIELDS: &[&str] = &["id", "type", "createdAt", "updatedAt", "aliases"];

pub fn is_reserved(field: &str) -> bool {
    RESERVED_FIELDS.contains(&field)
}

/// Opaque pointer value vtable (§4.5 `ptr` tag). The original's function
/// pointers become trait methods; `reply`/`save` return the bytes a caller
/// would write to the wire or to an SDB body.
pub trait ObjectPtr: fmt::Debug + Send + Sync {
    fn reply(&self) -> Vec<u8>;
    fn save(&self) -> Vec<u8>;
    fn len(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetValue {
    Str(IndexSet<Vec<u8>>),
    Dbl(Vec<f64>),
    Ll(IndexSet<i64>),
    NodeId(IndexSet<NodeId>),
}

impl SetValue {
    pub fn len(&self) -> usize {
        match self {
            SetValue::Str(s) => s.len(),
            SetValue::Dbl(s) => s.len(),
            SetValue::Ll(s) => s.len(),
            SetValue::NodeId(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subtype_matches(&self, other: &SetValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn contains_str(&self, v: &[u8]) -> bool {
        matches!(self, SetValue::Str(s) if s.contains(v))
    }

    pub fn contains_nodeid(&self, v: &NodeId) -> bool {
        matches!(self, SetValue::NodeId(s) if s.contains(v))
    }

    /// `z` RPN operator: union two same-typed sets. Errors on subtype mismatch.
    pub fn union(&self, other: &SetValue) -> Result<SetValue> {
        if !self.subtype_matches(other) {
            return Err(SelvaError::RpnType);
        }
        Ok(match (self, other) {
            (SetValue::Str(a), SetValue::Str(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                SetValue::Str(out)
            }
            (SetValue::Ll(a), SetValue::Ll(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().copied());
                SetValue::Ll(out)
            }
            (SetValue::NodeId(a), SetValue::NodeId(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().copied());
                SetValue::NodeId(out)
            }
            (SetValue::Dbl(a), SetValue::Dbl(b)) => {
                let mut out = a.clone();
                for v in b {
                    if !out.contains(v) {
                        out.push(*v);
                    }
                }
                SetValue::Dbl(out)
            }
            _ => unreachable!("subtype_matches guards discriminants"),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Ll(i64),
    Dbl(f64),
    Str(Vec<u8>),
    Set(SetValue),
    Arr(Vec<Value>),
    Obj(Box<Object>),
}

impl Value {
    pub fn str<S: Into<Vec<u8>>>(s: S) -> Self {
        Value::Str(s.into())
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Ll(_) => "ll",
            Value::Dbl(_) => "dbl",
            Value::Str(_) => "str",
            Value::Set(_) => "set",
            Value::Arr(_) => "arr",
            Value::Obj(_) => "obj",
        }
    }

    pub fn as_ll(&self) -> Option<i64> {
        match self {
            Value::Ll(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_dbl(&self) -> Option<f64> {
        match self {
            Value::Dbl(v) => Some(*v),
            Value::Ll(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_slice()),
            _ => None,
        }
    }
}

/// A dot-free path segment; dotted paths (`a.b.c`) are split by the caller
/// before descending into nested Objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    fields: IndexMap<String, Value>,
}

impl Object {
    pub fn new() -> Self {
        Object { fields: IndexMap::new() }
    }

    fn split_path(path: &str) -> (&str, Option<&str>) {
        match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        }
    }

    pub fn get(&self, path: &str) -> Result<&Value> {
        let (head, rest) = Self::split_path(path);
        let v = self.fields.get(head).ok_or(SelvaError::Enoent)?;
        match rest {
            None => Ok(v),
            Some(rest) => match v {
                Value::Obj(o) => o.get(rest),
                _ => Err(SelvaError::Eintype),
            },
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.get(path).is_ok()
    }

    /// Lazily creates intermediate Objects along the path, then calls `f` on
    /// the final segment's slot in its parent map.
    fn with_slot_mut<R>(&mut self, path: &str, f: impl FnOnce(&mut IndexMap<String, Value>, &str) -> R) -> R {
        let (head, rest) = Self::split_path(path);
        match rest {
            None => f(&mut self.fields, head),
            Some(rest) => {
                let entry = self.fields.entry(head.to_string()).or_insert_with(|| Value::Obj(Box::new(Object::new())));
                match entry {
                    Value::Obj(o) => o.with_slot_mut(rest, f),
                    _ => {
                        *entry = Value::Obj(Box::new(Object::new()));
                        if let Value::Obj(o) = entry {
                            o.with_slot_mut(rest, f)
                        } else {
                            unreachable!()
                        }
                    }
                }
            }
        }
    }

    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        if let Value::Set(new_set) = &value {
            if let Ok(Value::Set(existing)) = self.get(path) {
                if !existing.subtype_matches(new_set) {
                    return Err(SelvaError::Eintype);
                }
            }
        }
        self.with_slot_mut(path, |m, k| {
            m.insert(k.to_string(), value);
        });
        Ok(())
    }

    pub fn set_ll(&mut self, path: &str, v: i64) -> Result<()> {
        self.set(path, Value::Ll(v))
    }

    pub fn set_dbl(&mut self, path: &str, v: f64) -> Result<()> {
        self.set(path, Value::Dbl(v))
    }

    pub fn set_str<S: Into<Vec<u8>>>(&mut self, path: &str, v: S) -> Result<()> {
        self.set(path, Value::str(v))
    }

    /// `incr_ll(path, default, delta)`: creates with `default` if missing,
    /// else adds `delta`; fails `EINVAL` if the existing value isn't `ll`.
    pub fn incr_ll(&mut self, path: &str, default: i64, delta: i64) -> Result<i64> {
        let next = match self.get(path) {
            Err(SelvaError::Enoent) => default,
            Ok(Value::Ll(v)) => v.checked_add(delta).ok_or_else(|| SelvaError::Einval("ll overflow".into()))?,
            Ok(_) => return Err(SelvaError::Einval("incr_ll on non-ll field".into())),
            Err(e) => return Err(e),
        };
        self.set_ll(path, next)?;
        Ok(next)
    }

    pub fn del(&mut self, path: &str) -> Result<()> {
        let (head, rest) = Self::split_path(path);
        match rest {
            None => {
                if is_reserved(head) {
                    return Err(SelvaError::Einval(format!("cannot delete reserved field {head}")));
                }
                self.fields.shift_remove(head).map(|_| ()).ok_or(SelvaError::Enoent)
            }
            Some(rest) => match self.fields.get_mut(head) {
                Some(Value::Obj(o)) => o.del(rest),
                Some(_) => Err(SelvaError::Eintype),
                None => Err(SelvaError::Enoent),
            },
        }
    }

    /// Clears every non-reserved top-level field. Reserved fields (§4.5) are
    /// never touched by `clear`.
    pub fn clear(&mut self) {
        self.fields.retain(|k, _| is_reserved(k));
    }

    pub fn array_push(&mut self, path: &str, value: Value) -> Result<()> {
        let arr = self.array_mut(path)?;
        arr.push(value);
        Ok(())
    }

    pub fn array_insert(&mut self, path: &str, index: usize, value: Value) -> Result<()> {
        let arr = self.array_mut(path)?;
        let idx = index.min(arr.len());
        arr.insert(idx, value);
        Ok(())
    }

    /// `remove` with an out-of-range index is a no-op (§4.5).
    pub fn array_remove(&mut self, path: &str, index: usize) -> Result<()> {
        let arr = self.array_mut(path)?;
        if index < arr.len() {
            arr.remove(index);
        }
        Ok(())
    }

    fn array_mut(&mut self, path: &str) -> Result<&mut Vec<Value>> {
        self.with_slot_mut(path, |m, k| {
            let entry = m.entry(k.to_string()).or_insert_with(|| Value::Arr(Vec::new()));
            entry
        });
        match self.get_mut(path)? {
            Value::Arr(a) => Ok(a),
            _ => Err(SelvaError::Eintype),
        }
    }

    fn get_mut(&mut self, path: &str) -> Result<&mut Value> {
        let (head, rest) = Self::split_path(path);
        let v = self.fields.get_mut(head).ok_or(SelvaError::Enoent)?;
        match rest {
            None => Ok(v),
            Some(rest) => match v {
                Value::Obj(o) => o.get_mut(rest),
                _ => Err(SelvaError::Eintype),
            },
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod object_tests {
    use super::*;

    #[test]
    fn dotted_path_lazily_creates_intermediates() {
        let mut o = Object::new();
        o.set_str("a.b.c", "hello").unwrap();
        assert_eq!(o.get("a.b.c").unwrap().as_str(), Some(b"hello".as_slice()));
    }

    #[test]
    fn get_missing_is_enoent() {
        let o = Object::new();
        assert!(matches!(o.get("missing"), Err(SelvaError::Enoent)));
    }

    #[test]
    fn incr_ll_creates_with_default_then_adds_delta() {
        let mut o = Object::new();
        assert_eq!(o.incr_ll("count", 10, 5).unwrap(), 10);
        assert_eq!(o.incr_ll("count", 10, 5).unwrap(), 15);
    }

    #[test]
    fn incr_ll_on_non_ll_is_einval() {
        let mut o = Object::new();
        o.set_str("x", "s").unwrap();
        assert!(matches!(o.incr_ll("x", 0, 1), Err(SelvaError::Einval(_))));
    }

    #[test]
    fn del_missing_returns_enoent_idempotent_semantics() {
        let mut o = Object::new();
        assert!(matches!(o.del("nope"), Err(SelvaError::Enoent)));
        o.set_ll("present", 1).unwrap();
        assert!(o.del("present").is_ok());
        assert!(matches!(o.del("present"), Err(SelvaError::Enoent)));
    }

    #[test]
    fn clear_preserves_reserved_fields() {
        let mut o = Object::new();
        o.set_str("id", "ma1").unwrap();
        o.set_str("custom", "v").unwrap();
        o.clear();
        assert!(o.exists("id"));
        assert!(!o.exists("custom"));
    }

    #[test]
    fn set_rejects_set_subtype_change() {
        let mut o = Object::new();
        o.set("s", Value::Set(SetValue::Ll(IndexSet::new()))).unwrap();
        let err = o.set("s", Value::Set(SetValue::Str(IndexSet::new())));
        assert!(matches!(err, Err(SelvaError::Eintype)));
    }

    #[test]
    fn array_push_insert_remove() {
        let mut o = Object::new();
        o.array_push("arr", Value::Ll(1)).unwrap();
        o.array_push("arr", Value::Ll(2)).unwrap();
        o.array_insert("arr", 0, Value::Ll(0)).unwrap();
        match o.get("arr").unwrap() {
            Value::Arr(a) => assert_eq!(a.len(), 3),
            _ => panic!("expected array"),
        }
        o.array_remove("arr", 99).unwrap(); // out of range: no-op
        match o.get("arr").unwrap() {
            Value::Arr(a) => assert_eq!(a.len(), 3),
            _ => panic!("expected array"),
        }
        o.array_remove("arr", 0).unwrap();
        match o.get("arr").unwrap() {
            Value::Arr(a) => assert_eq!(a.len(), 2),
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn insertion_order_preserved() {
        let mut o = Object::new();
        o.set_ll("z", 1).unwrap();
        o.set_ll("a", 2).unwrap();
        o.set_ll("m", 3).unwrap();
        let keys: Vec<&String> = o.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn set_union_merges_same_subtype() {
        let mut a = IndexSet::new();
        a.insert(1i64);
        let mut b = IndexSet::new();
        b.insert(2i64);
        let u = SetValue::Ll(a).union(&SetValue::Ll(b)).unwrap();
        assert_eq!(u.len(), 2);
    }

    #[test]
    fn set_union_rejects_mismatched_subtype() {
        let a = SetValue::Ll(IndexSet::new());
        let b = SetValue::Str(IndexSet::new());
        assert!(matches!(a.union(&b), Err(SelvaError::RpnType)));
    }
}
