//! Replication (§4.9): the ring buffer origin-side writers drain to
//! followers, the replica-side FSM that applies a snapshot plus trailing
//! log, and the frame types that carry both over the wire.

pub mod driver;
pub mod ring;

pub use driver::ReplicaDriver;
pub use ring::{ConsumerCue, ConsumerState, RingBuffer};

use std::time::Duration;

use crate::error::{Result, SelvaError};
use crate::wire::value::WireValue;

/// A single replicated mutation as it travels from the ring buffer to a
/// follower (§4.9 "replication frame types"); thin wrapper over
/// `wire::value::WireValue`'s `ReplicationCmd`/`ReplicationSdb` variants,
/// which are what actually cross the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationFrame {
    Cmd { eid: u64, cmd_id: u8, data: Vec<u8> },
    Sdb { eid: u64, bsize: u32, pseudo: bool },
}

impl ReplicationFrame {
    pub fn to_wire(&self) -> WireValue {
        match self {
            ReplicationFrame::Cmd { eid, cmd_id, data } => WireValue::ReplicationCmd {
                eid: *eid,
                cmd_id: *cmd_id as i8,
                data: data.clone(),
            },
            ReplicationFrame::Sdb { eid, bsize, pseudo } => WireValue::ReplicationSdb {
                eid: *eid,
                bsize: *bsize,
                pseudo: *pseudo,
            },
        }
    }

    pub fn from_wire(v: WireValue) -> Result<Self> {
        match v {
            WireValue::ReplicationCmd { eid, cmd_id, data } => Ok(ReplicationFrame::Cmd {
                eid,
                cmd_id: cmd_id as u8,
                data,
            }),
            WireValue::ReplicationSdb { eid, bsize, pseudo } => {
                Ok(ReplicationFrame::Sdb { eid, bsize, pseudo })
            }
            _ => Err(SelvaError::Ebadmsg("expected a replication frame".into())),
        }
    }
}

/// Replica-side connection state machine (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    ParseReplicationHeader,
    ReceivingCmd,
    ReceivingSdb,
    ExecCmd,
    ExecSdb,
    Err,
    Fin,
}

impl ReplicaState {
    /// `Err`/`Fin` are terminal; every other state accepts further frames.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplicaState::Err | ReplicaState::Fin)
    }
}

/// Reassembly buffer size for replication frames before a complete value is
/// dispatched to the local command registry (§4.9).
pub const REPLICATION_REASSEMBLY_LIMIT: usize = 1 << 20;

/// Bounded exponential backoff for replica reconnects (§4.9, §5). The timer
/// mechanism itself is an external collaborator; this is just the schedule.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff { attempt: 0, base, max }
    }

    /// Delay before the next reconnect attempt, doubling each call up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.max).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
