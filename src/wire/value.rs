//! Typed value stream encoding used both in message payloads (§4.1) and the
//! SDB body (§4.10) — both are "a typed value stream using the same codec".

use crate::error::{Result, SelvaError};

pub const T_NULL: u8 = 0;
pub const T_ERROR: u8 = 1;
pub const T_DOUBLE: u8 = 2;
pub const T_LONGLONG: u8 = 3;
pub const T_STRING: u8 = 4;
pub const T_ARRAY: u8 = 5;
pub const T_ARRAY_END: u8 = 6;
pub const T_REPLICATION_CMD: u8 = 7;
pub const T_REPLICATION_SDB: u8 = 8;

pub const STRING_FLAG_BINARY: u8 = 0x1;
pub const STRING_FLAG_DEFLATE: u8 = 0x2;
pub const LONGLONG_FLAG_HEX: u8 = 0x1;
pub const ARRAY_FLAG_POSTPONED: u8 = 0x1;

#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Null,
    Error { code: i16, msg: Vec<u8> },
    Double(f64),
    LongLong { value: i64, hex: bool },
    Str { data: Vec<u8>, binary: bool, deflate: bool },
    /// `None` length means "postponed" — terminated later by `ArrayEnd`.
    Array { len: Option<u32> },
    ArrayEnd,
    ReplicationCmd { eid: u64, cmd_id: i8, data: Vec<u8> },
    ReplicationSdb { eid: u64, bsize: u32, pseudo: bool },
}

fn need(buf: &[u8], offset: usize, n: usize) -> Result<()> {
    if offset + n > buf.len() {
        Err(SelvaError::Ebadmsg("truncated value".into()))
    } else {
        Ok(())
    }
}

/// `parse_vtype(buf, offset) → (value, new_offset)` (§4.1).
pub fn parse_vtype(buf: &[u8], offset: usize) -> Result<(WireValue, usize)> {
    need(buf, offset, 1)?;
    let tag = buf[offset];
    let mut o = offset + 1;
    let value = match tag {
        T_NULL => WireValue::Null,
        T_ERROR => {
            need(buf, o, 2 + 4)?;
            let code = i16::from_le_bytes(buf[o..o + 2].try_into().unwrap());
            o += 2;
            let msg_len = u32::from_le_bytes(buf[o..o + 4].try_into().unwrap()) as usize;
            o += 4;
            need(buf, o, msg_len)?;
            let msg = buf[o..o + msg_len].to_vec();
            o += msg_len;
            WireValue::Error { code, msg }
        }
        T_DOUBLE => {
            need(buf, o, 8)?;
            let v = f64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
            o += 8;
            WireValue::Double(v)
        }
        T_LONGLONG => {
            need(buf, o, 1 + 8)?;
            let flags = buf[o];
            o += 1;
            let v = i64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
            o += 8;
            WireValue::LongLong { value: v, hex: flags & LONGLONG_FLAG_HEX != 0 }
        }
        T_STRING => {
            need(buf, o, 1 + 4)?;
            let flags = buf[o];
            o += 1;
            let len = u32::from_le_bytes(buf[o..o + 4].try_into().unwrap()) as usize;
            o += 4;
            need(buf, o, len)?;
            let data = buf[o..o + len].to_vec();
            o += len;
            WireValue::Str {
                data,
                binary: flags & STRING_FLAG_BINARY != 0,
                deflate: flags & STRING_FLAG_DEFLATE != 0,
            }
        }
        T_ARRAY => {
            need(buf, o, 1 + 4)?;
            let flags = buf[o];
            o += 1;
            let len = u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
            o += 4;
            let len = if flags & ARRAY_FLAG_POSTPONED != 0 { None } else { Some(len) };
            WireValue::Array { len }
        }
        T_ARRAY_END => WireValue::ArrayEnd,
        T_REPLICATION_CMD => {
            need(buf, o, 8 + 1 + 4)?;
            let eid = u64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
            o += 8;
            let cmd_id = buf[o] as i8;
            o += 1;
            let bsize = u32::from_le_bytes(buf[o..o + 4].try_into().unwrap()) as usize;
            o += 4;
            need(buf, o, bsize)?;
            let data = buf[o..o + bsize].to_vec();
            o += bsize;
            WireValue::ReplicationCmd { eid, cmd_id, data }
        }
        T_REPLICATION_SDB => {
            need(buf, o, 8 + 4 + 1)?;
            let eid = u64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
            o += 8;
            let bsize = u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
            o += 4;
            let pseudo = buf[o] != 0;
            o += 1;
            WireValue::ReplicationSdb { eid, bsize, pseudo }
        }
        _ => return Err(SelvaError::Ebadmsg(format!("unknown value type {tag}"))),
    };
    Ok((value, o))
}

pub fn encode_value(v: &WireValue, out: &mut Vec<u8>) {
    match v {
        WireValue::Null => out.push(T_NULL),
        WireValue::Error { code, msg } => {
            out.push(T_ERROR);
            out.extend_from_slice(&code.to_le_bytes());
            out.extend_from_slice(&(msg.len() as u32).to_le_bytes());
            out.extend_from_slice(msg);
        }
        WireValue::Double(v) => {
            out.push(T_DOUBLE);
            out.extend_from_slice(&v.to_le_bytes());
        }
        WireValue::LongLong { value, hex } => {
            out.push(T_LONGLONG);
            out.push(if *hex { LONGLONG_FLAG_HEX } else { 0 });
            out.extend_from_slice(&value.to_le_bytes());
        }
        WireValue::Str { data, binary, deflate } => {
            out.push(T_STRING);
            let mut flags = 0u8;
            if *binary {
                flags |= STRING_FLAG_BINARY;
            }
            if *deflate {
                flags |= STRING_FLAG_DEFLATE;
            }
            out.push(flags);
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        }
        WireValue::Array { len } => {
            out.push(T_ARRAY);
            match len {
                Some(n) => {
                    out.push(0);
                    out.extend_from_slice(&n.to_le_bytes());
                }
                None => {
                    out.push(ARRAY_FLAG_POSTPONED);
                    out.extend_from_slice(&0u32.to_le_bytes());
                }
            }
        }
        WireValue::ArrayEnd => out.push(T_ARRAY_END),
        WireValue::ReplicationCmd { eid, cmd_id, data } => {
            out.push(T_REPLICATION_CMD);
            out.extend_from_slice(&eid.to_le_bytes());
            out.push(*cmd_id as u8);
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        }
        WireValue::ReplicationSdb { eid, bsize, pseudo } => {
            out.push(T_REPLICATION_SDB);
            out.extend_from_slice(&eid.to_le_bytes());
            out.extend_from_slice(&bsize.to_le_bytes());
            out.push(if *pseudo { 1 } else { 0 });
        }
    }
}

/// `parse_error(buf, offset) → (code, msg_slice)` convenience wrapper (§4.1).
pub fn parse_error(buf: &[u8], offset: usize) -> Result<(i16, Vec<u8>, usize)> {
    match parse_vtype(buf, offset)? {
        (WireValue::Error { code, msg }, o) => Ok((code, msg, o)),
        _ => Err(SelvaError::Eintype),
    }
}

#[cfg(test)]
mod value_tests {
    use super::*;

    fn round_trip(v: WireValue) {
        let mut buf = Vec::new();
        encode_value(&v, &mut buf);
        let (decoded, consumed) = parse_vtype(&buf, 0).unwrap();
        assert_eq!(decoded, v);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(WireValue::Null);
        round_trip(WireValue::Error { code: -2, msg: b"no such entry".to_vec() });
        round_trip(WireValue::Double(3.5));
        round_trip(WireValue::LongLong { value: -42, hex: false });
        round_trip(WireValue::Str { data: b"hello".to_vec(), binary: false, deflate: false });
        round_trip(WireValue::Array { len: Some(3) });
        round_trip(WireValue::Array { len: None });
        round_trip(WireValue::ArrayEnd);
        round_trip(WireValue::ReplicationCmd { eid: 7, cmd_id: 63, data: vec![1, 2, 3] });
        round_trip(WireValue::ReplicationSdb { eid: 9, bsize: 128, pseudo: true });
    }

    #[test]
    fn truncated_buffer_is_protocol_error() {
        let mut buf = Vec::new();
        encode_value(&WireValue::Str { data: b"hello".to_vec(), binary: false, deflate: false }, &mut buf);
        buf.truncate(buf.len() - 2);
        assert!(parse_vtype(&buf, 0).is_err());
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        let buf = [0xFFu8];
        assert!(parse_vtype(&buf, 0).is_err());
    }

    #[test]
    fn sequential_values_parse_with_offsets() {
        let mut buf = Vec::new();
        encode_value(&WireValue::Double(1.0), &mut buf);
        encode_value(&WireValue::LongLong { value: 2, hex: false }, &mut buf);
        let (first, o1) = parse_vtype(&buf, 0).unwrap();
        let (second, o2) = parse_vtype(&buf, o1).unwrap();
        assert_eq!(first, WireValue::Double(1.0));
        assert_eq!(second, WireValue::LongLong { value: 2, hex: false });
        assert_eq!(o2, buf.len());
    }
}
