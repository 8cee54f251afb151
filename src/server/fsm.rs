//! Connection receive-side FSM (§4.3): `NEW` expects the first frame of a
//! new message, `FRAGMENT` accumulates the rest until `last`.

use crate::error::{Result, SelvaError};
use crate::wire::frame::{FrameHeader, SELVA_PROTO_MSG_SIZE_MAX};

#[derive(Debug, Clone, PartialEq, Eq)]
enum RecvState {
    New,
    Fragment { seqno: u32, cmd: i8 },
}

/// Reassembles a sequence of frames belonging to one connection into
/// complete messages, enforcing the `NEW`/`FRAGMENT` transition rules.
/// One instance lives per connection for its whole lifetime.
pub struct Reassembler {
    state: RecvState,
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler { state: RecvState::New, buf: Vec::new() }
    }

    /// Feed one already-checksum-verified frame. Returns the completed
    /// `(cmd, message)` pair once `last` is seen, or `None` while still
    /// mid-message. A protocol violation drops the connection (§4.3, §7).
    pub fn push_frame(&mut self, header: FrameHeader, payload: &[u8]) -> Result<Option<(i8, Vec<u8>)>> {
        match self.state {
            RecvState::New => {
                if !header.is_first() {
                    return Err(SelvaError::Ebadmsg("fragment without a preceding first frame".into()));
                }
                let hint = header.msg_bsize as usize;
                if hint > SELVA_PROTO_MSG_SIZE_MAX {
                    return Err(SelvaError::Ebadmsg("msg_bsize exceeds SELVA_PROTO_MSG_SIZE_MAX".into()));
                }
                self.buf.clear();
                self.buf.reserve(hint.min(SELVA_PROTO_MSG_SIZE_MAX));
                self.accumulate(payload)?;
                if header.is_last() {
                    return Ok(Some((header.cmd, std::mem::take(&mut self.buf))));
                }
                self.state = RecvState::Fragment { seqno: header.seqno, cmd: header.cmd };
                Ok(None)
            }
            RecvState::Fragment { seqno, cmd } => {
                if header.is_first() {
                    return Err(SelvaError::Ebadmsg("unexpected first flag mid-message".into()));
                }
                if header.seqno != seqno {
                    return Err(SelvaError::Ebadmsg("seqno changed mid-message".into()));
                }
                self.accumulate(payload)?;
                if header.is_last() {
                    self.state = RecvState::New;
                    return Ok(Some((cmd, std::mem::take(&mut self.buf))));
                }
                Ok(None)
            }
        }
    }

    fn accumulate(&mut self, payload: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(payload);
        if self.buf.len() >= SELVA_PROTO_MSG_SIZE_MAX {
            return Err(SelvaError::Ebadmsg("reassembled message too large".into()));
        }
        Ok(())
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
