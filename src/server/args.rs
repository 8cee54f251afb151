//! Positional argument parsing for command payloads (§4.4, §6): a request's
//! payload is a concatenation of `selva_proto` values, consumed in order.
//! Any decode failure or missing value becomes `EINVAL "Wrong arity"`.

use crate::error::{Result, SelvaError};
use crate::nodeid::NodeId;
use crate::wire::value::{parse_vtype, WireValue};

fn wrong_arity() -> SelvaError {
    SelvaError::Einval("Wrong arity".into())
}

pub struct ArgReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> ArgReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ArgReader { buf, offset: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.buf.len()
    }

    /// Current byte offset, saved before a speculative read so it can be
    /// [`rewind`](Self::rewind)-ed if the value turns out not to be a
    /// keyword token (used by `hierarchy.find`'s optional-segment scan).
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rewind(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub fn next_value(&mut self) -> Result<WireValue> {
        if self.is_empty() {
            return Err(wrong_arity());
        }
        let (v, o) = parse_vtype(self.buf, self.offset).map_err(|_| wrong_arity())?;
        self.offset = o;
        Ok(v)
    }

    pub fn next_str(&mut self) -> Result<Vec<u8>> {
        match self.next_value()? {
            WireValue::Str { data, .. } => Ok(data),
            _ => Err(wrong_arity()),
        }
    }

    pub fn next_string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.next_str()?).into_owned())
    }

    pub fn next_node_id(&mut self) -> Result<NodeId> {
        Ok(NodeId::from_slice(&self.next_str()?))
    }

    pub fn next_ll(&mut self) -> Result<i64> {
        match self.next_value()? {
            WireValue::LongLong { value, .. } => Ok(value),
            _ => Err(wrong_arity()),
        }
    }

    pub fn next_dbl(&mut self) -> Result<f64> {
        match self.next_value()? {
            WireValue::Double(v) => Ok(v),
            WireValue::LongLong { value, .. } => Ok(value as f64),
            _ => Err(wrong_arity()),
        }
    }

    /// Consumes an `array` header and returns its declared length (postponed
    /// arrays are rejected: request payloads never use them, §4.1).
    pub fn next_array_len(&mut self) -> Result<usize> {
        match self.next_value()? {
            WireValue::Array { len: Some(n) } => Ok(n as usize),
            _ => Err(wrong_arity()),
        }
    }

    /// Remaining node ids, one `str` value each, until the payload ends.
    pub fn rest_node_ids(&mut self) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        while !self.is_empty() {
            out.push(self.next_node_id()?);
        }
        Ok(out)
    }

    pub fn expect_exhausted(&self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(wrong_arity())
        }
    }
}

#[cfg(test)]
mod args_tests {
    use super::*;
    use crate::wire::value::encode_value;

    #[test]
    fn reads_values_in_order_and_reports_arity_on_shortfall() {
        let mut buf = Vec::new();
        encode_value(&WireValue::Str { data: b"ma00000001".to_vec(), binary: false, deflate: false }, &mut buf);
        encode_value(&WireValue::LongLong { value: 7, hex: false }, &mut buf);
        let mut r = ArgReader::new(&buf);
        assert_eq!(r.next_node_id().unwrap(), NodeId::from_str_padded("ma00000001"));
        assert_eq!(r.next_ll().unwrap(), 7);
        assert!(r.next_ll().is_err());
    }

    #[test]
    fn rest_node_ids_collects_until_payload_ends() {
        let mut buf = Vec::new();
        for s in ["ma00000001", "ma00000002"] {
            encode_value(&WireValue::Str { data: s.as_bytes().to_vec(), binary: false, deflate: false }, &mut buf);
        }
        let mut r = ArgReader::new(&buf);
        let ids = r.rest_node_ids().unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn malformed_value_is_wrong_arity_not_a_raw_decode_error() {
        let buf = [0xFFu8];
        let mut r = ArgReader::new(&buf);
        assert!(matches!(r.next_value(), Err(SelvaError::Einval(_))));
    }
}
