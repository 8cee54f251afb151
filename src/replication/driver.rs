//! Replica-side FSM driver (§4.9): the half of replication that runs on a
//! follower after it issues `replicaof`. Connects to the primary, requests a
//! sync, and drives [`ReplicaState`] over the reassembled response —
//! applying a full snapshot or replaying buffered commands in ascending eid
//! order — reconnecting with [`Backoff`] whenever a round trip fails.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, SelvaError};
use crate::server::core::CoreHandle;
use crate::wire::frame::{FrameHeader, FLAG_FIRST, FLAG_LAST, FRAME_HEADER_LEN};
use crate::wire::value::{encode_value, parse_vtype, WireValue};

use super::{Backoff, ReplicaState, ReplicationFrame, REPLICATION_REASSEMBLY_LIMIT};

/// `replicasync`'s command id (§6); the driver is itself a client of the
/// primary's ordinary request path, not a separate protocol.
const CMD_REPLICASYNC: i8 = 66;

/// Drives one `replicaof host port` relationship for the life of the
/// process: reconnect loop, initial/resync snapshot, then ascending-eid
/// command catch-up.
pub struct ReplicaDriver {
    host: String,
    port: u16,
    core: CoreHandle,
}

impl ReplicaDriver {
    pub fn new(host: String, port: u16, core: CoreHandle) -> Self {
        ReplicaDriver { host, port, core }
    }

    /// Never returns; reconnects with exponential backoff on failure and
    /// polls for fresh commands at the backoff's base interval on success.
    pub async fn run(self) {
        let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(30));
        let mut last_known_eid: Option<u64> = None;
        loop {
            match self.sync_once(last_known_eid).await {
                Ok(eid) => {
                    if eid.is_some() {
                        last_known_eid = eid;
                    }
                    backoff.reset();
                }
                Err(e) => {
                    tracing::warn!(host = %self.host, port = self.port, error = %e, "replica sync round failed");
                }
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// One request/response round trip: send `replicasync`, reassemble the
    /// reply, then apply it. Returns the highest eid applied this round.
    async fn sync_once(&self, last_known_eid: Option<u64>) -> Result<Option<u64>> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        self.send_replicasync(&mut stream, last_known_eid).await?;
        let message = self.read_message(&mut stream).await?;
        self.apply_message(&message).await
    }

    async fn send_replicasync(&self, stream: &mut TcpStream, last_known_eid: Option<u64>) -> Result<()> {
        let mut body = Vec::new();
        if let Some(eid) = last_known_eid {
            encode_value(&WireValue::LongLong { value: eid as i64, hex: false }, &mut body);
        }
        let header = FrameHeader {
            cmd: CMD_REPLICASYNC,
            flags: FLAG_FIRST | FLAG_LAST,
            seqno: 1,
            frame_bsize: 0,
            msg_bsize: body.len() as u32,
            chk: 0,
        };
        let frame = header.build_frame(&body)?;
        stream.write_all(&frame).await?;
        Ok(())
    }

    /// Reassemble the response's frames into one message buffer, enforcing
    /// [`REPLICATION_REASSEMBLY_LIMIT`] (§4.9 "1 MiB reassembly buffer").
    async fn read_message(&self, stream: &mut TcpStream) -> Result<Vec<u8>> {
        let mut message = Vec::new();
        loop {
            let mut hdr_buf = [0u8; FRAME_HEADER_LEN];
            stream.read_exact(&mut hdr_buf).await?;
            let header = FrameHeader::decode(&hdr_buf)?;
            let frame_len = header.frame_bsize as usize;
            if frame_len < FRAME_HEADER_LEN {
                return Err(SelvaError::Ebadmsg("invalid frame_bsize".into()));
            }
            let mut payload = vec![0u8; frame_len - FRAME_HEADER_LEN];
            stream.read_exact(&mut payload).await?;
            if message.len() + payload.len() > REPLICATION_REASSEMBLY_LIMIT {
                return Err(SelvaError::Enobufs);
            }
            message.extend_from_slice(&payload);
            if header.is_last() {
                return Ok(message);
            }
        }
    }

    /// Walk the reassembled message value-by-value, driving [`ReplicaState`]
    /// through header parse, receive, and exec for each replication frame it
    /// finds; non-replication values (e.g. the catch-up path's leading array
    /// header) are skipped rather than treated as a protocol error.
    async fn apply_message(&self, message: &[u8]) -> Result<Option<u64>> {
        let mut state = ReplicaState::ParseReplicationHeader;
        let mut offset = 0;
        let mut last_applied_eid = None;

        while offset < message.len() {
            let (value, new_offset) = parse_vtype(message, offset).map_err(|_| {
                state = ReplicaState::Err;
                SelvaError::Ebadmsg("malformed replication message".into())
            })?;
            offset = new_offset;

            let frame = match ReplicationFrame::from_wire(value) {
                Ok(f) => f,
                Err(_) => continue,
            };

            match frame {
                ReplicationFrame::Sdb { eid, bsize, .. } => {
                    state = ReplicaState::ReceivingSdb;
                    let (snapshot, after) = parse_vtype(message, offset).map_err(|_| {
                        state = ReplicaState::Err;
                        SelvaError::Ebadmsg("missing sdb payload".into())
                    })?;
                    offset = after;
                    let bytes = match snapshot {
                        WireValue::Str { data, .. } => data,
                        _ => {
                            state = ReplicaState::Err;
                            return Err(SelvaError::Ebadmsg("expected sdb bytes".into()));
                        }
                    };
                    if bytes.len() != bsize as usize {
                        state = ReplicaState::Err;
                        return Err(SelvaError::Ebadmsg("sdb size mismatch".into()));
                    }
                    state = ReplicaState::ExecSdb;
                    self.core.load_snapshot(bytes).await?;
                    last_applied_eid = Some(eid);
                }
                ReplicationFrame::Cmd { eid, cmd_id, data } => {
                    state = ReplicaState::ReceivingCmd;
                    state = ReplicaState::ExecCmd;
                    self.core.apply_replicated(cmd_id as i8, data).await?;
                    last_applied_eid = Some(eid);
                }
            }
            state = ReplicaState::ParseReplicationHeader;
        }

        state = ReplicaState::Fin;
        debug_assert!(state.is_terminal());
        Ok(last_applied_eid)
    }
}
