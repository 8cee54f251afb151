//! Stack-based evaluation of a compiled [`Program`] (§4.7).
//!
//! Pop order mirrors the reference engine: for a binary operator the first
//! value popped (the most recently pushed, top-of-stack) is named `a`, the
//! second popped `b`, and the result is `a OP b`. For the token stream
//! `X Y B` (sub), `X` is pushed first and `Y` last, so `a = Y`, `b = X`, and
//! the result is `Y - X`, not `X - Y`.

use crate::error::{Result, SelvaError};
use crate::nodeid::NodeId;
use crate::object::{Object, SetValue, Value};
use crate::rpn::compile::{Instr, Program, RegKind};

/// Upper bound on operand stack depth; exceeding it is `BADSTK` just like
/// running out of operands.
const RPN_MAX_D: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Num(f64),
    Str(Vec<u8>),
    Set(SetValue),
}

impl Operand {
    fn as_num(&self) -> Result<f64> {
        match self {
            Operand::Num(d) => Ok(*d),
            _ => Err(SelvaError::RpnType),
        }
    }

    fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Operand::Str(s) => Ok(s),
            _ => Err(SelvaError::RpnType),
        }
    }

    fn as_set(&self) -> Result<&SetValue> {
        match self {
            Operand::Set(s) => Ok(s),
            _ => Err(SelvaError::RpnType),
        }
    }

    /// `to_bool`: a number is truthy iff its truncated integer value is
    /// nonzero; a set or string is truthy iff non-empty.
    fn to_bool(&self) -> bool {
        match self {
            Operand::Num(d) => (*d as i64) != 0,
            Operand::Str(s) => !s.is_empty(),
            Operand::Set(s) => !s.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RegValue {
    Num(f64),
    Str(Vec<u8>),
    Set(SetValue),
}

/// Evaluation context: the register bank (populated by the caller) plus
/// the "current" node/object used by field-access operators. When `object`
/// is `None` and a field-access operator runs, register 0 is consulted in
/// its place (mirroring `open_object`'s "reg[0] should contain ... a
/// node_id" fallback), but since this engine has no storage handle of its
/// own, callers are expected to set `object` directly when they have one.
#[derive(Debug, Clone, Default)]
pub struct Ctx {
    pub regs: Vec<RegValue>,
    pub object: Option<Object>,
    pub current_node: Option<NodeId>,
}

impl Ctx {
    pub fn new() -> Self {
        Ctx::default()
    }

    fn reg(&self, i: usize) -> Result<&RegValue> {
        self.regs.get(i).ok_or(SelvaError::RpnBnds)
    }
}

fn push(stack: &mut Vec<Operand>, v: Operand) -> Result<()> {
    if stack.len() >= RPN_MAX_D {
        return Err(SelvaError::RpnBadstk);
    }
    stack.push(v);
    Ok(())
}

fn pop_one(stack: &mut Vec<Operand>) -> Result<Operand> {
    stack.pop().ok_or(SelvaError::RpnBadstk)
}

/// Returns `(a, b)`: `a` is the first popped (top of stack), `b` the second.
fn pop_two(stack: &mut Vec<Operand>) -> Result<(Operand, Operand)> {
    let a = pop_one(stack)?;
    let b = pop_one(stack)?;
    Ok((a, b))
}

fn pop_three(stack: &mut Vec<Operand>) -> Result<(Operand, Operand, Operand)> {
    let a = pop_one(stack)?;
    let b = pop_one(stack)?;
    let c = pop_one(stack)?;
    Ok((a, b, c))
}

fn bool_num(b: bool) -> Operand {
    Operand::Num(if b { 1.0 } else { 0.0 })
}

fn resolve_reg(ctx: &Ctx, i: usize, kind: RegKind) -> Result<Operand> {
    let v = ctx.reg(i)?;
    match (kind, v) {
        (RegKind::Number, RegValue::Num(d)) => {
            if d.is_nan() {
                return Err(SelvaError::RpnNan);
            }
            Ok(Operand::Num(*d))
        }
        (RegKind::Str, RegValue::Str(s)) => Ok(Operand::Str(s.clone())),
        (RegKind::Set, RegValue::Set(s)) => Ok(Operand::Set(s.clone())),
        _ => Err(SelvaError::RpnType),
    }
}

fn current_object<'a>(ctx: &'a Ctx) -> Result<&'a Object> {
    ctx.object.as_ref().ok_or(SelvaError::RpnNpe)
}

/// Resolves a field's value as a set, whether the operand names a field on
/// the current object or is itself already a set (e.g. a literal or
/// register operand).
fn resolve_set_operand(ctx: &Ctx, operand: &Operand) -> Result<SetValue> {
    match operand {
        Operand::Set(s) => Ok(s.clone()),
        Operand::Str(name) => {
            let obj = current_object(ctx)?;
            let field = std::str::from_utf8(name).map_err(|_| SelvaError::RpnType)?;
            match obj.get(field) {
                Ok(Value::Set(s)) => Ok(s.clone()),
                Ok(_) => Err(SelvaError::RpnType),
                Err(SelvaError::Enoent) => Ok(SetValue::Str(Default::default())),
                Err(e) => Err(e),
            }
        }
        Operand::Num(_) => Err(SelvaError::RpnType),
    }
}

fn field_nonempty(obj: &Object, field: &str) -> bool {
    match obj.get(field) {
        Ok(Value::Str(s)) => !s.is_empty(),
        Ok(Value::Set(s)) => !s.is_empty(),
        Ok(Value::Arr(a)) => !a.is_empty(),
        Ok(Value::Null) => false,
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Applies a single operator to the stack. Returns `Err(RpnBreak)` when a
/// modal operator (`P`/`Q`) short-circuits; the driver loop intercepts that
/// and stops processing the remaining tokens, treating the stack state left
/// behind (always depth 1) as the final result.
fn apply_op(op: char, stack: &mut Vec<Operand>, ctx: &Ctx) -> Result<()> {
    match op {
        'A' => {
            let (a, b) = pop_two(stack)?;
            push(stack, Operand::Num(a.as_num()? + b.as_num()?))
        }
        'B' => {
            let (a, b) = pop_two(stack)?;
            push(stack, Operand::Num(a.as_num()? - b.as_num()?))
        }
        'C' => {
            let (a, b) = pop_two(stack)?;
            let (a, b) = (a.as_num()?, b.as_num()?);
            if b == 0.0 {
                return Err(SelvaError::RpnDiv);
            }
            push(stack, Operand::Num(a / b))
        }
        'D' => {
            let (a, b) = pop_two(stack)?;
            push(stack, Operand::Num(a.as_num()? * b.as_num()?))
        }
        'E' => {
            let (a, b) = pop_two(stack)?;
            let (a, b) = (a.as_num()? as i64, b.as_num()? as i64);
            if b == 0 {
                return Err(SelvaError::RpnDiv);
            }
            push(stack, Operand::Num((a % b) as f64))
        }
        'F' => {
            let (a, b) = pop_two(stack)?;
            push(stack, bool_num(a.as_num()? == b.as_num()?))
        }
        'G' => {
            let (a, b) = pop_two(stack)?;
            push(stack, bool_num(a.as_num()? != b.as_num()?))
        }
        'H' => {
            let (a, b) = pop_two(stack)?;
            push(stack, bool_num(a.as_num()? < b.as_num()?))
        }
        'I' => {
            let (a, b) = pop_two(stack)?;
            push(stack, bool_num(a.as_num()? > b.as_num()?))
        }
        'J' => {
            let (a, b) = pop_two(stack)?;
            push(stack, bool_num(a.as_num()? <= b.as_num()?))
        }
        'K' => {
            let (a, b) = pop_two(stack)?;
            push(stack, bool_num(a.as_num()? >= b.as_num()?))
        }
        'L' => {
            let a = pop_one(stack)?;
            push(stack, bool_num(!a.to_bool()))
        }
        'M' => {
            let (a, b) = pop_two(stack)?;
            push(stack, bool_num(a.to_bool() && b.to_bool()))
        }
        'N' => {
            let (a, b) = pop_two(stack)?;
            push(stack, bool_num(a.to_bool() || b.to_bool()))
        }
        'O' => {
            let (a, b) = pop_two(stack)?;
            push(stack, bool_num(a.to_bool() ^ b.to_bool()))
        }
        'P' => {
            let a = pop_one(stack)?;
            if !a.to_bool() {
                stack.clear();
                push(stack, Operand::Num(0.0))?;
                return Err(SelvaError::RpnBreak);
            }
            push(stack, a)
        }
        'Q' => {
            let a = pop_one(stack)?;
            if a.to_bool() {
                stack.clear();
                push(stack, Operand::Num(1.0))?;
                return Err(SelvaError::RpnBreak);
            }
            push(stack, a)
        }
        'f' => {
            let field = pop_one(stack)?;
            let name = field.as_bytes()?;
            let obj = current_object(ctx)?;
            let name = std::str::from_utf8(name).map_err(|_| SelvaError::RpnType)?;
            let v = match obj.get(name) {
                Ok(Value::Str(s)) => Operand::Str(s.clone()),
                _ => Operand::Str(Vec::new()),
            };
            push(stack, v)
        }
        'g' => {
            let field = pop_one(stack)?;
            let name = field.as_bytes()?;
            let obj = current_object(ctx)?;
            let name = std::str::from_utf8(name).map_err(|_| SelvaError::RpnType)?;
            let v = match obj.get(name) {
                Ok(Value::Dbl(d)) => *d,
                Ok(Value::Ll(i)) => *i as f64,
                _ => f64::NAN,
            };
            push(stack, Operand::Num(v))
        }
        'h' => {
            let field = pop_one(stack)?;
            let name = field.as_bytes()?;
            let obj = current_object(ctx)?;
            let name = std::str::from_utf8(name).map_err(|_| SelvaError::RpnType)?;
            push(stack, bool_num(obj.exists(name)))
        }
        'b' => {
            let a = pop_one(stack)?;
            let s = a.as_bytes()?;
            let ty = if s.len() >= 2 { s[..2].to_vec() } else { s.to_vec() };
            push(stack, Operand::Str(ty))
        }
        'c' => {
            let (a, b) = pop_two(stack)?;
            push(stack, Operand::Num(a.as_bytes()?.cmp(b.as_bytes()?) as i32 as f64))
        }
        'd' => {
            let (a, b) = pop_two(stack)?;
            push(stack, bool_num(a.as_bytes()? == b.as_bytes()?))
        }
        'e' => {
            let a = pop_one(stack)?;
            let s = a.as_bytes()?;
            let cur = ctx.current_node.ok_or(SelvaError::RpnNpe)?;
            let prefix = if s.len() >= 2 { &s[..2] } else { s };
            push(stack, bool_num(prefix == &cur.node_type()[..]))
        }
        'a' => {
            // field/set name is top of stack (popped first), mirroring f/g/h.
            let (haystack, needle) = pop_two(stack)?;
            let set = resolve_set_operand(ctx, &haystack)?;
            let found = match (&needle, &set) {
                (Operand::Str(s), SetValue::Str(set)) => set.contains(s),
                (Operand::Num(n), SetValue::Dbl(set)) => set.contains(n),
                (Operand::Num(n), SetValue::Ll(set)) => set.contains(&(*n as i64)),
                _ => false,
            };
            push(stack, bool_num(found))
        }
        'i' => {
            let (c, b, a) = pop_three(stack)?;
            let (a, b, c) = (a.as_num()?, b.as_num()?, c.as_num()?);
            push(stack, bool_num(a <= b && b <= c))
        }
        'z' => {
            let (a, b) = pop_two(stack)?;
            let u = a.as_set()?.union(b.as_set()?)?;
            push(stack, Operand::Set(u))
        }
        'j' => {
            let candidates = pop_one(stack)?;
            let names = match candidates.as_set()? {
                SetValue::Str(s) => s,
                _ => return Err(SelvaError::RpnType),
            };
            let obj = current_object(ctx)?;
            let mut found = SetValue::Str(Default::default());
            for name in names {
                let field = std::str::from_utf8(name).map_err(|_| SelvaError::RpnType)?;
                if field_nonempty(obj, field) {
                    let mut s = indexmap::IndexSet::new();
                    s.insert(name.clone());
                    found = SetValue::Str(s);
                    break;
                }
            }
            push(stack, Operand::Set(found))
        }
        'k' => {
            let candidates = pop_one(stack)?;
            let names = match candidates.as_set()? {
                SetValue::Str(s) => s.clone(),
                _ => return Err(SelvaError::RpnType),
            };
            let obj = current_object(ctx)?;
            let all = names.iter().all(|name| {
                std::str::from_utf8(name).map(|f| field_nonempty(obj, f)).unwrap_or(false)
            });
            push(stack, Operand::Set(if all { SetValue::Str(names) } else { SetValue::Str(Default::default()) }))
        }
        _ => Err(SelvaError::RpnIllopc),
    }
}

fn run(program: &Program, ctx: &Ctx) -> Result<Operand> {
    let mut stack: Vec<Operand> = Vec::new();
    for instr in &program.instrs {
        match instr {
            Instr::Lit(idx) => {
                let v = program.literals.get(*idx).ok_or(SelvaError::RpnIllopn)?.clone();
                push(&mut stack, v)?;
            }
            Instr::Reg(i, kind) => {
                let v = resolve_reg(ctx, *i, *kind)?;
                push(&mut stack, v)?;
            }
            Instr::Op(c) => match apply_op(*c, &mut stack, ctx) {
                Ok(()) => {}
                Err(SelvaError::RpnBreak) => break,
                Err(e) => return Err(e),
            },
        }
    }
    if stack.len() != 1 {
        return Err(SelvaError::RpnBadstk);
    }
    Ok(stack.pop().unwrap())
}

pub fn eval_bool(program: &Program, ctx: &Ctx) -> Result<bool> {
    Ok(run(program, ctx)?.to_bool())
}

pub fn eval_double(program: &Program, ctx: &Ctx) -> Result<f64> {
    run(program, ctx)?.as_num()
}

pub fn eval_integer(program: &Program, ctx: &Ctx) -> Result<i64> {
    Ok(run(program, ctx)?.as_num()?.round() as i64)
}

pub fn eval_set(program: &Program, ctx: &Ctx) -> Result<SetValue> {
    match run(program, ctx)? {
        Operand::Set(s) => Ok(s),
        _ => Err(SelvaError::RpnType),
    }
}

#[cfg(test)]
mod eval_tests {
    use super::*;
    use crate::rpn::compile::compile;

    #[test]
    fn sub_pop_order_is_last_minus_first_pushed() {
        // "X Y B" pushes X then Y; a = Y (top), b = X (second); result = Y - X.
        let p = compile("#10 #3 B").unwrap();
        let ctx = Ctx::new();
        assert_eq!(eval_double(&p, &ctx).unwrap(), 3.0 - 10.0);
    }

    #[test]
    fn add_is_commutative() {
        let p = compile("#2 #3 A").unwrap();
        let ctx = Ctx::new();
        assert_eq!(eval_double(&p, &ctx).unwrap(), 5.0);
    }

    #[test]
    fn div_by_zero_is_rpn_div() {
        // divisor is `b`, the second-popped (first-pushed) operand.
        let p = compile("#0 #5 C").unwrap();
        let ctx = Ctx::new();
        assert!(matches!(eval_double(&p, &ctx), Err(SelvaError::RpnDiv)));
    }

    #[test]
    fn comparisons_yield_zero_or_one() {
        let p = compile("#1 #2 H").unwrap(); // a=2 (top), b=1 -> a<b? 2<1 -> false
        let ctx = Ctx::new();
        assert_eq!(eval_double(&p, &ctx).unwrap(), 0.0);
    }

    #[test]
    fn logical_and_or_xor() {
        let ctx = Ctx::new();
        assert_eq!(eval_bool(&compile("#1 #1 M").unwrap(), &ctx).unwrap(), true);
        assert_eq!(eval_bool(&compile("#0 #1 N").unwrap(), &ctx).unwrap(), true);
        assert_eq!(eval_bool(&compile("#1 #1 O").unwrap(), &ctx).unwrap(), false);
    }

    #[test]
    fn modal_necessary_short_circuits_on_false() {
        // P pops #0 (false), breaks, leaving 0.0 as the sole result -- the
        // trailing #99 A would error if it were ever reached.
        let p = compile("#0 P #99 A").unwrap();
        let ctx = Ctx::new();
        assert_eq!(eval_double(&p, &ctx).unwrap(), 0.0);
    }

    #[test]
    fn modal_necessary_passes_through_on_true() {
        let p = compile("#7 P").unwrap();
        let ctx = Ctx::new();
        assert_eq!(eval_double(&p, &ctx).unwrap(), 7.0);
    }

    #[test]
    fn modal_possible_short_circuits_on_true() {
        let p = compile("#1 Q #99 A").unwrap();
        let ctx = Ctx::new();
        assert_eq!(eval_double(&p, &ctx).unwrap(), 1.0);
    }

    #[test]
    fn field_access_string_and_double_and_exists() {
        let mut obj = Object::new();
        obj.set_str("name", "alice").unwrap();
        obj.set_dbl("age", 30.0).unwrap();
        let ctx = Ctx { object: Some(obj), ..Ctx::new() };

        assert_eq!(eval_double(&compile(r#""age" g"#).unwrap(), &ctx).unwrap(), 30.0);
        assert_eq!(eval_bool(&compile(r#""name" h"#).unwrap(), &ctx).unwrap(), true);
        assert_eq!(eval_bool(&compile(r#""missing" h"#).unwrap(), &ctx).unwrap(), false);
    }

    #[test]
    fn missing_double_field_is_nan_not_error() {
        let obj = Object::new();
        let ctx = Ctx { object: Some(obj), ..Ctx::new() };
        assert!(eval_double(&compile(r#""nope" g"#).unwrap(), &ctx).unwrap().is_nan());
    }

    #[test]
    fn cidcmp_compares_against_current_node_type() {
        let p = compile(r#""ma" e"#).unwrap();
        let ctx = Ctx { current_node: Some(NodeId::from_str_padded("ma00000001")), ..Ctx::new() };
        assert_eq!(eval_bool(&p, &ctx).unwrap(), true);
    }

    #[test]
    fn idcmp_compares_full_id() {
        let p = compile(r#""ma00000001" "ma00000001" d"#).unwrap();
        let ctx = Ctx::new();
        assert_eq!(eval_bool(&p, &ctx).unwrap(), true);
    }

    #[test]
    fn range_checks_ordered_bounds() {
        let ctx = Ctx::new();
        assert_eq!(eval_bool(&compile("#1 #5 #10 i").unwrap(), &ctx).unwrap(), true);
        assert_eq!(eval_bool(&compile("#1 #50 #10 i").unwrap(), &ctx).unwrap(), false);
    }

    #[test]
    fn set_union_merges_literal_sets() {
        let p = compile(r#"{"a","b"} {"b","c"} z"#).unwrap();
        let ctx = Ctx::new();
        match eval_set(&p, &ctx).unwrap() {
            SetValue::Str(s) => assert_eq!(s.len(), 3),
            other => panic!("expected string set, got {other:?}"),
        }
    }

    #[test]
    fn has_checks_membership_in_set_field() {
        let mut obj = Object::new();
        obj.set("tags", Value::Set(SetValue::Str(indexmap::IndexSet::from([b"red".to_vec()])))).unwrap();
        let ctx = Ctx { object: Some(obj), ..Ctx::new() };
        assert_eq!(eval_bool(&compile(r#""red" "tags" a"#).unwrap(), &ctx).unwrap(), true);
        assert_eq!(eval_bool(&compile(r#""blue" "tags" a"#).unwrap(), &ctx).unwrap(), false);
    }

    #[test]
    fn first_non_empty_field_yields_single_element_set() {
        let mut obj = Object::new();
        obj.set_str("b", "present").unwrap();
        let ctx = Ctx { object: Some(obj), ..Ctx::new() };
        let candidates = SetValue::Str(indexmap::IndexSet::from([b"a".to_vec(), b"b".to_vec()]));
        let mut p = compile("j").unwrap();
        p.literals.push(Operand::Set(candidates));
        p.instrs.insert(0, Instr::Lit(0));
        match eval_set(&p, &ctx).unwrap() {
            SetValue::Str(s) => {
                assert_eq!(s.len(), 1);
                assert!(s.contains(&b"b".to_vec()));
            }
            other => panic!("expected string set, got {other:?}"),
        }
    }

    #[test]
    fn assert_all_non_empty_passes_through_or_empties() {
        let mut obj = Object::new();
        obj.set_str("a", "x").unwrap();
        obj.set_str("b", "y").unwrap();
        let ctx = Ctx { object: Some(obj), ..Ctx::new() };
        let candidates = SetValue::Str(indexmap::IndexSet::from([b"a".to_vec(), b"b".to_vec()]));
        let mut p = compile("k").unwrap();
        p.literals.push(Operand::Set(candidates));
        p.instrs.insert(0, Instr::Lit(0));
        match eval_set(&p, &ctx).unwrap() {
            SetValue::Str(s) => assert_eq!(s.len(), 2),
            other => panic!("expected string set, got {other:?}"),
        }
    }

    #[test]
    fn extra_operand_left_on_stack_is_badstk() {
        let p = compile("#1 #2").unwrap();
        let ctx = Ctx::new();
        assert!(matches!(eval_double(&p, &ctx), Err(SelvaError::RpnBadstk)));
    }

    #[test]
    fn operator_on_empty_stack_is_badstk() {
        let p = compile("A").unwrap();
        let ctx = Ctx::new();
        assert!(matches!(eval_double(&p, &ctx), Err(SelvaError::RpnBadstk)));
    }

    #[test]
    fn register_out_of_bounds_is_bnds() {
        let p = compile("@0").unwrap();
        let ctx = Ctx::new();
        assert!(matches!(eval_double(&p, &ctx), Err(SelvaError::RpnBnds)));
    }

    #[test]
    fn integer_entry_point_rounds() {
        let p = compile("#2 #5 C").unwrap(); // a=5(top), b=2 -> 5/2 = 2.5
        let ctx = Ctx::new();
        assert_eq!(eval_integer(&p, &ctx).unwrap(), 3);
    }

    #[test]
    fn set_entry_point_rejects_non_set_result() {
        let p = compile("#1").unwrap();
        let ctx = Ctx::new();
        assert!(matches!(eval_set(&p, &ctx), Err(SelvaError::RpnType)));
    }
}
