//! A format-string value extractor ("scanf-style") used by command handlers
//! to destructure a request payload succinctly (§4.1).
//!
//! The original's `%lld %lf %s %p %.*s %{ %} %,` varargs interface becomes a
//! small combinator here: each format character consumes one [`WireValue`]
//! token from the payload and the whole call returns a `Vec<ScanValue>`
//! rather than writing through output pointers.

use crate::error::{Result, SelvaError};
use crate::wire::value::{parse_vtype, WireValue};

#[derive(Debug, Clone, PartialEq)]
pub enum ScanValue {
    Ll(i64),
    Dbl(f64),
    Str(Vec<u8>),
    ArrayStart(Option<u32>),
    ArrayEnd,
}

/// Scan `buf` against `fmt`, where each character of `fmt` is one of:
/// - `d` → `%lld`, a longlong
/// - `f` → `%lf`, a double
/// - `s` → `%s` or `%.*s`, a string (binary-safe)
/// - `{` / `}` → array start / array_end markers
/// - `,` → a logical separator; consumes nothing, present only for readability
///   in call sites that mirror the original format strings
pub fn scanf(buf: &[u8], fmt: &str) -> Result<Vec<ScanValue>> {
    let mut out = Vec::new();
    let mut offset = 0usize;

    for c in fmt.chars() {
        if c == ',' || c.is_whitespace() {
            continue;
        }
        let (value, new_offset) = parse_vtype(buf, offset)?;
        offset = new_offset;
        match (c, value) {
            ('d', WireValue::LongLong { value, .. }) => out.push(ScanValue::Ll(value)),
            ('f', WireValue::Double(v)) => out.push(ScanValue::Dbl(v)),
            ('s', WireValue::Str { data, .. }) => out.push(ScanValue::Str(data)),
            ('{', WireValue::Array { len }) => out.push(ScanValue::ArrayStart(len)),
            ('}', WireValue::ArrayEnd) => out.push(ScanValue::ArrayEnd),
            (expected, actual) => {
                return Err(SelvaError::Einval(format!(
                    "scanf: expected format `{expected}`, got {actual:?}"
                )))
            }
        }
    }

    Ok(out)
}

impl ScanValue {
    pub fn into_ll(self) -> Result<i64> {
        match self {
            ScanValue::Ll(v) => Ok(v),
            _ => Err(SelvaError::Eintype),
        }
    }

    pub fn into_str(self) -> Result<Vec<u8>> {
        match self {
            ScanValue::Str(s) => Ok(s),
            _ => Err(SelvaError::Eintype),
        }
    }

    pub fn into_dbl(self) -> Result<f64> {
        match self {
            ScanValue::Dbl(v) => Ok(v),
            _ => Err(SelvaError::Eintype),
        }
    }
}

#[cfg(test)]
mod scanf_tests {
    use super::*;
    use crate::wire::value::encode_value;

    #[test]
    fn extracts_mixed_sequence() {
        let mut buf = Vec::new();
        encode_value(&WireValue::Str { data: b"ma12345678".to_vec(), binary: false, deflate: false }, &mut buf);
        encode_value(&WireValue::LongLong { value: 42, hex: false }, &mut buf);

        let scanned = scanf(&buf, "s,d").unwrap();
        assert_eq!(scanned[0].clone().into_str().unwrap(), b"ma12345678");
        assert_eq!(scanned[1].clone().into_ll().unwrap(), 42);
    }

    #[test]
    fn format_mismatch_is_einval() {
        let mut buf = Vec::new();
        encode_value(&WireValue::Double(1.0), &mut buf);
        assert!(matches!(scanf(&buf, "d"), Err(SelvaError::Einval(_))));
    }

    #[test]
    fn array_markers_round_trip() {
        let mut buf = Vec::new();
        encode_value(&WireValue::Array { len: Some(2) }, &mut buf);
        encode_value(&WireValue::LongLong { value: 1, hex: false }, &mut buf);
        encode_value(&WireValue::LongLong { value: 2, hex: false }, &mut buf);
        encode_value(&WireValue::ArrayEnd, &mut buf);

        let scanned = scanf(&buf, "{dd}").unwrap();
        assert_eq!(scanned[0], ScanValue::ArrayStart(Some(2)));
        assert_eq!(scanned[3], ScanValue::ArrayEnd);
    }
}
