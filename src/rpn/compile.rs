//! Compile a postfix expression string into a [`Program`] (§4.7).
//!
//! Tokens are whitespace-separated except for the two grouping forms: a
//! `"…"` string literal and a `{…}` set literal, both of which may contain
//! embedded whitespace and are read as a single token up to their closing
//! delimiter. Literal tokens (`#…`, `"…"`, `{…}`) are evaluated once here and
//! filed into the program's literal bank rather than re-parsed on every
//! evaluation.

use indexmap::IndexSet;

use crate::error::{Result, SelvaError};
use crate::object::SetValue;
use crate::rpn::eval::Operand;

/// Single-letter operators recognized by [`crate::rpn::eval`]; compilation
/// only checks that the character is one of these, evaluation owns the
/// actual semantics.
fn is_operator(c: char) -> bool {
    matches!(
        c,
        'A'..='Q' | 'a' | 'b' | 'c' | 'd' | 'e' | 'f' | 'g' | 'h' | 'i' | 'j' | 'k' | 'z'
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegKind {
    Number,
    Str,
    Set,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Op(char),
    Reg(usize, RegKind),
    Lit(usize),
}

/// A compiled expression: a flat instruction stream plus the literal bank
/// those instructions' `Lit` entries index into.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub(crate) instrs: Vec<Instr>,
    pub(crate) literals: Vec<Operand>,
}

fn tokenize(src: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }
        if chars[i] == '"' {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i] != '"' {
                i += 1;
            }
            if i >= chars.len() {
                return Err(SelvaError::RpnEcomp("unterminated string literal".into()));
            }
            i += 1; // closing quote
            tokens.push(chars[start..i].iter().collect());
            continue;
        }
        if chars[i] == '{' {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i] != '}' {
                i += 1;
            }
            if i >= chars.len() {
                return Err(SelvaError::RpnEcomp("unterminated set literal".into()));
            }
            i += 1; // closing brace
            tokens.push(chars[start..i].iter().collect());
            continue;
        }
        let start = i;
        while i < chars.len() && !chars[i].is_whitespace() {
            i += 1;
        }
        tokens.push(chars[start..i].iter().collect());
    }
    Ok(tokens)
}

fn compile_set_literal(body: &str) -> Result<SetValue> {
    let mut out: IndexSet<Vec<u8>> = IndexSet::new();
    for item in body.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let unquoted = item.strip_prefix('"').and_then(|s| s.strip_suffix('"')).ok_or_else(|| {
            SelvaError::RpnEcomp(format!("set literal item must be quoted: {item}"))
        })?;
        out.insert(unquoted.as_bytes().to_vec());
    }
    Ok(SetValue::Str(out))
}

fn push_literal(program: &mut Program, v: Operand) -> Instr {
    program.literals.push(v);
    Instr::Lit(program.literals.len() - 1)
}

/// Compile a postfix expression string into a [`Program`]. See §4.7 for the
/// token grammar and the operator table.
pub fn compile(src: &str) -> Result<Program> {
    let mut program = Program::default();
    for raw in tokenize(src)? {
        let instr = if let Some(rest) = raw.strip_prefix('#') {
            let v: f64 = rest.parse().map_err(|_| SelvaError::RpnEcomp(format!("bad numeric literal: {raw}")))?;
            push_literal(&mut program, Operand::Num(v))
        } else if raw.starts_with('"') {
            let inner = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')).ok_or_else(|| {
                SelvaError::RpnEcomp(format!("unterminated string literal: {raw}"))
            })?;
            push_literal(&mut program, Operand::Str(inner.as_bytes().to_vec()))
        } else if raw.starts_with('{') {
            let inner = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')).ok_or_else(|| {
                SelvaError::RpnEcomp(format!("unterminated set literal: {raw}"))
            })?;
            push_literal(&mut program, Operand::Set(compile_set_literal(inner)?))
        } else if let Some(rest) = raw.strip_prefix('@') {
            Instr::Reg(parse_reg_index(rest)?, RegKind::Number)
        } else if let Some(rest) = raw.strip_prefix('$') {
            Instr::Reg(parse_reg_index(rest)?, RegKind::Str)
        } else if let Some(rest) = raw.strip_prefix('&') {
            Instr::Reg(parse_reg_index(rest)?, RegKind::Set)
        } else if raw.chars().count() == 1 && is_operator(raw.chars().next().unwrap()) {
            Instr::Op(raw.chars().next().unwrap())
        } else {
            return Err(SelvaError::RpnEcomp(format!("illegal token: {raw}")));
        };
        program.instrs.push(instr);
    }
    if program.instrs.is_empty() {
        return Err(SelvaError::RpnEcomp("empty expression".into()));
    }
    Ok(program)
}

fn parse_reg_index(s: &str) -> Result<usize> {
    s.parse().map_err(|_| SelvaError::RpnEcomp(format!("bad register index: {s}")))
}

#[cfg(test)]
mod compile_tests {
    use super::*;

    #[test]
    fn compiles_simple_arithmetic() {
        let p = compile("#1 #2 A").unwrap();
        assert_eq!(p.instrs.len(), 3);
        assert_eq!(p.literals.len(), 2);
        assert!(matches!(p.instrs[2], Instr::Op('A')));
    }

    #[test]
    fn compiles_register_operands() {
        let p = compile("@0 @1 B").unwrap();
        assert!(matches!(p.instrs[0], Instr::Reg(0, RegKind::Number)));
        assert!(matches!(p.instrs[1], Instr::Reg(1, RegKind::Number)));
    }

    #[test]
    fn compiles_string_and_set_literals_with_embedded_spaces() {
        let p = compile(r#""hello world" {"a","b c"} z"#).unwrap();
        assert_eq!(p.literals.len(), 2);
        assert!(matches!(&p.literals[0], Operand::Str(s) if s == b"hello world"));
        match &p.literals[1] {
            Operand::Set(SetValue::Str(s)) => {
                assert!(s.contains(&b"a".to_vec()));
                assert!(s.contains(&b"b c".to_vec()));
            }
            other => panic!("expected set literal, got {other:?}"),
        }
    }

    #[test]
    fn rejects_illegal_token() {
        assert!(matches!(compile("@0 ?"), Err(SelvaError::RpnEcomp(_))));
    }

    #[test]
    fn rejects_empty_expression() {
        assert!(matches!(compile("   "), Err(SelvaError::RpnEcomp(_))));
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(matches!(compile(r#""oops"#), Err(SelvaError::RpnEcomp(_))));
    }
}
