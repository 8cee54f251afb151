//! Response-out abstraction (§4.3): buffers values into the current frame's
//! payload region and flushes complete frames to the connection's write
//! side through an mpsc channel, so a handler never touches the socket
//! directly and stream frames can interleave with later responses.

use tokio::sync::mpsc::UnboundedSender;

use crate::error::{Result, SelvaError};
use crate::hierarchy::edge::EdgeMetadata;
use crate::object::{Object, SetValue, Value};
use crate::wire::frame::{FrameHeader, FLAG_BATCH, FLAG_FIRST, FLAG_LAST, FLAG_RESPONSE, FLAG_STREAM};
use crate::wire::value::{encode_value, WireValue};

/// One outgoing response (or stream) on a connection. Framing flags are
/// state carried here rather than recomputed per frame: the first flush
/// sets `first`, the terminating one sets `last`, and a response promoted
/// to a stream via [`ResponseWriter::start_stream`] marks every frame
/// `stream` from then on.
pub struct ResponseWriter {
    cmd: i8,
    seqno: u32,
    out: UnboundedSender<Vec<u8>>,
    buf: Vec<u8>,
    sent_first: bool,
    stream: bool,
    batch: bool,
}

impl ResponseWriter {
    pub fn new(cmd: i8, seqno: u32, out: UnboundedSender<Vec<u8>>, batch: bool) -> Self {
        ResponseWriter { cmd, seqno, out, buf: Vec::new(), sent_first: false, stream: false, batch }
    }

    pub fn write_value(&mut self, v: &WireValue) {
        encode_value(v, &mut self.buf);
    }

    pub fn write_error(&mut self, err: &SelvaError) {
        self.write_value(&WireValue::Error { code: err.code(), msg: err.to_string().into_bytes() });
    }

    pub fn write_str(&mut self, s: impl Into<Vec<u8>>) {
        self.write_value(&WireValue::Str { data: s.into(), binary: false, deflate: false });
    }

    pub fn write_ll(&mut self, v: i64) {
        self.write_value(&WireValue::LongLong { value: v, hex: false });
    }

    pub fn write_dbl(&mut self, v: f64) {
        self.write_value(&WireValue::Double(v));
    }

    pub fn write_array_header(&mut self, len: u32) {
        self.write_value(&WireValue::Array { len: Some(len) });
    }

    /// Mirrors [`crate::hierarchy::serialize::serialize_object`], but
    /// through this writer's frame buffer instead of a standalone `Vec<u8>`.
    pub fn write_object(&mut self, obj: &Object) {
        self.write_array_header(obj.len() as u32);
        for (key, value) in obj.iter() {
            self.write_str(key.clone());
            self.write_value_node(value);
        }
    }

    pub fn write_typed(&mut self, v: &Value) {
        self.write_value_node(v)
    }

    fn write_value_node(&mut self, v: &Value) {
        match v {
            Value::Null => self.write_value(&WireValue::Null),
            Value::Ll(n) => self.write_ll(*n),
            Value::Dbl(d) => self.write_dbl(*d),
            Value::Str(s) => self.write_value(&WireValue::Str { data: s.clone(), binary: true, deflate: false }),
            Value::Arr(items) => {
                self.write_array_header(items.len() as u32);
                for item in items {
                    self.write_value_node(item);
                }
            }
            Value::Obj(o) => self.write_object(o),
            Value::Set(s) => self.write_set(s),
        }
    }

    pub fn write_set(&mut self, set: &SetValue) {
        self.write_array_header(set.len() as u32);
        match set {
            SetValue::Str(s) => {
                for v in s {
                    self.write_value(&WireValue::Str { data: v.clone(), binary: true, deflate: false });
                }
            }
            SetValue::Dbl(s) => {
                for v in s {
                    self.write_dbl(*v);
                }
            }
            SetValue::Ll(s) => {
                for v in s {
                    self.write_ll(*v);
                }
            }
            SetValue::NodeId(s) => {
                for v in s {
                    self.write_value(&WireValue::Str { data: v.as_bytes().to_vec(), binary: true, deflate: false });
                }
            }
        }
    }

    pub fn write_edge_metadata(&mut self, meta: &Object) {
        self.write_object(meta);
    }

    fn flags(&self, last: bool) -> u8 {
        let mut flags = FLAG_RESPONSE;
        if !self.sent_first {
            flags |= FLAG_FIRST;
        }
        if last {
            flags |= FLAG_LAST;
        }
        if self.stream {
            flags |= FLAG_STREAM;
        }
        if self.batch {
            flags |= FLAG_BATCH;
        }
        flags
    }

    /// Finalize the current frame buffer (size, CRC, first/last flags) and
    /// hand it to the write side.
    pub fn flush_frame_buf(&mut self, last: bool) -> Result<()> {
        let header = FrameHeader { cmd: self.cmd, flags: self.flags(last), seqno: self.seqno, frame_bsize: 0, msg_bsize: 0, chk: 0 };
        let frame = header.build_frame(&self.buf)?;
        self.out.send(frame).map_err(|_| SelvaError::Econnreset)?;
        self.buf.clear();
        self.sent_first = true;
        Ok(())
    }

    /// `selva_send_end`: finalize whatever is buffered as the last frame of
    /// this response.
    pub fn send_end(&mut self) -> Result<()> {
        self.flush_frame_buf(true)
    }

    /// Clone this response-out into a dedicated stream slot: same
    /// connection, same `seqno`, but its own frame buffer and `first`/`last`
    /// bookkeeping, with every subsequent frame marked `stream` (§4.3).
    pub fn start_stream(&self) -> ResponseWriter {
        ResponseWriter {
            cmd: self.cmd,
            seqno: self.seqno,
            out: self.out.clone(),
            buf: Vec::new(),
            sent_first: false,
            stream: true,
            batch: self.batch,
        }
    }
}

/// Matches `edge_field` metadata lookups, which may hand back `None` for a
/// destination with no metadata of its own (the shared single_ref Object).
pub fn edge_metadata_or_empty(meta: &EdgeMetadata, dst: &crate::nodeid::NodeId) -> Object {
    meta.get(dst).cloned().unwrap_or_default()
}
