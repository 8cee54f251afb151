//! Connection acceptor and core actor (§4.2-§4.4): a single task owns the
//! `Hierarchy`, ring buffer, and command registry, and processes every
//! reassembled request sequentially, in arrival order, across all
//! connections. Per-connection tasks only frame bytes — they never touch
//! hierarchy state directly — which keeps `begin_traversal`/`end_traversal`
//! bookkeeping and replication ordering free of cross-thread locking.

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::error::{Result, SelvaError};
use crate::hierarchy::Hierarchy;
use crate::replication::RingBuffer;
use crate::sdb;
use crate::server::dispatch::{self, DispatchCtx};
use crate::server::fsm::Reassembler;
use crate::server::registry::{CommandMode, CommandRegistry};
use crate::server::response::ResponseWriter;
use crate::wire::frame::{parse_frame, verify_frame_chk, FrameHeader, FRAME_HEADER_LEN, SELVA_PROTO_FRAME_SIZE_MAX};
use crate::wire::value::{parse_vtype, WireValue};

/// One reassembled request handed from a connection task to the core actor.
struct CoreRequest {
    cmd: i8,
    payload: Vec<u8>,
    seqno: u32,
    out: mpsc::UnboundedSender<Vec<u8>>,
    done: oneshot::Sender<()>,
}

enum CoreMsg {
    Request(CoreRequest),
    /// `save` issued from the shutdown path (§4.10): snapshot then let the
    /// caller exit the process once this completes.
    Shutdown { path: PathBuf, done: oneshot::Sender<Result<()>> },
    /// Replace the owned hierarchy wholesale (§4.9 `EXEC_SDB`): the replica
    /// FSM's response to a full-resync snapshot.
    LoadSnapshot { bytes: Vec<u8>, done: oneshot::Sender<Result<()>> },
}

/// Handle used by the acceptor loop, the signal-triggered shutdown path, and
/// the replica-side FSM driver to reach the core actor.
#[derive(Clone)]
pub struct CoreHandle {
    tx: mpsc::UnboundedSender<CoreMsg>,
}

impl CoreHandle {
    pub async fn shutdown(&self, path: PathBuf) -> Result<()> {
        let (done, rx) = oneshot::channel();
        if self.tx.send(CoreMsg::Shutdown { path, done }).is_err() {
            return Err(SelvaError::Econnreset);
        }
        rx.await.map_err(|_| SelvaError::Econnreset)?
    }

    /// Replay one already-decoded replicated command against the owned
    /// hierarchy (§4.9 `EXEC_CMD`), through the same request path a live
    /// client connection uses — including re-insertion into this node's own
    /// ring buffer, so a replica may itself serve sub-replicas unmodified.
    pub async fn apply_replicated(&self, cmd: i8, payload: Vec<u8>) -> Result<()> {
        let (out, mut out_rx) = mpsc::unbounded_channel();
        let (done, done_rx) = oneshot::channel();
        let req = CoreRequest { cmd, payload, seqno: 0, out, done };
        if self.tx.send(CoreMsg::Request(req)).is_err() {
            return Err(SelvaError::Econnreset);
        }
        done_rx.await.map_err(|_| SelvaError::Econnreset)?;
        if let Ok(frame) = out_rx.try_recv() {
            if let Ok((_, payload, _)) = parse_frame(&frame) {
                if let Ok((WireValue::Error { code, msg }, _)) = parse_vtype(payload, 0) {
                    tracing::warn!(cmd, code, msg = %String::from_utf8_lossy(&msg), "replicated command rejected");
                }
            }
        }
        Ok(())
    }

    pub async fn load_snapshot(&self, bytes: Vec<u8>) -> Result<()> {
        let (done, rx) = oneshot::channel();
        if self.tx.send(CoreMsg::LoadSnapshot { bytes, done }).is_err() {
            return Err(SelvaError::Econnreset);
        }
        rx.await.map_err(|_| SelvaError::Econnreset)?
    }
}

/// Read `Hierarchy` at startup (§4.10 "last-good" recovery): a corrupt or
/// missing snapshot directory is not fatal, an empty hierarchy is used.
fn startup_hierarchy(cfg: &Config) -> Hierarchy {
    sdb::load_last_good(&cfg.data_dir).unwrap_or_else(|| {
        tracing::info!(dir = ?cfg.data_dir, "no usable snapshot, starting empty");
        Hierarchy::new()
    })
}

async fn run_core_actor(cfg: Config, mut rx: mpsc::UnboundedReceiver<CoreMsg>, self_handle: CoreHandle) {
    let mut h = startup_hierarchy(&cfg);
    let ring = RingBuffer::new(cfg.ring_buffer_size);
    let registry = CommandRegistry::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            CoreMsg::Request(req) => {
                let mode = registry.get(req.cmd).map(|s| s.mode);
                let mut resp = ResponseWriter::new(req.cmd, req.seqno, req.out.clone(), false);
                let mut ctx = DispatchCtx { h: &mut h, cfg: &cfg, ring: &ring, registry: &registry, core: self_handle.clone() };
                match dispatch::execute(&mut ctx, req.cmd, &req.payload, &mut resp) {
                    Ok(()) => {
                        let _ = resp.send_end();
                        if mode == Some(CommandMode::Mutate) {
                            // Prefix the cmd id so a replica's `entries_after`
                            // read-out (§4.9) can rebuild a `ReplicationCmd`
                            // without a side channel for which handler ran.
                            let mut record = Vec::with_capacity(1 + req.payload.len());
                            record.push(req.cmd as u8);
                            record.extend_from_slice(&req.payload);
                            let _ = ring.insert(record, 0);
                        }
                    }
                    Err(err) => {
                        resp.write_error(&err);
                        let _ = resp.send_end();
                        tracing::debug!(cmd = req.cmd, error = %err, "command failed");
                    }
                }
                let _ = req.done.send(());
            }
            CoreMsg::Shutdown { path, done } => {
                let result = sdb::save_to_file(&h, &path);
                if let Err(ref e) = result {
                    tracing::error!(error = %e, "shutdown snapshot failed");
                }
                let _ = done.send(result);
            }
            CoreMsg::LoadSnapshot { bytes, done } => {
                let result = sdb::load_from_bytes(&bytes).map(|loaded| h = loaded);
                if let Err(ref e) = result {
                    tracing::error!(error = %e, "replica snapshot load failed");
                }
                let _ = done.send(result);
            }
        }
    }
}

/// Enable `SO_KEEPALIVE` on the accepted socket (§6 "ambient socket
/// tuning"); `TCP_NODELAY` is set through tokio's own API instead.
fn tune_socket(stream: &TcpStream) {
    let fd = stream.as_raw_fd();
    let enable: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of_val(&enable) as libc::socklen_t,
        );
    }
}

/// Read one complete frame off the wire: a fixed 16-byte header followed by
/// `frame_bsize - 16` payload bytes, checksum-verified together. `Ok(None)`
/// means the peer closed cleanly between messages.
async fn read_frame(stream: &mut (impl AsyncReadExt + Unpin)) -> Result<Option<(FrameHeader, Vec<u8>)>> {
    let mut hdr_buf = [0u8; FRAME_HEADER_LEN];
    match stream.read_exact(&mut hdr_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(_) => return Err(SelvaError::Econnreset),
    }
    let header = FrameHeader::decode(&hdr_buf)?;
    let frame_len = header.frame_bsize as usize;
    if frame_len < FRAME_HEADER_LEN || frame_len > SELVA_PROTO_FRAME_SIZE_MAX {
        return Err(SelvaError::Ebadmsg("invalid frame_bsize".into()));
    }
    let mut payload = vec![0u8; frame_len - FRAME_HEADER_LEN];
    stream.read_exact(&mut payload).await.map_err(|_| SelvaError::Econnreset)?;
    if !verify_frame_chk(&header, &payload) {
        return Err(SelvaError::Ebadmsg("checksum mismatch".into()));
    }
    Ok(Some((header, payload)))
}

async fn writer_loop(mut write_half: OwnedWriteHalf, mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = out_rx.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
    }
}

async fn handle_connection(stream: TcpStream, core_tx: mpsc::UnboundedSender<CoreMsg>) {
    tune_socket(&stream);
    let _ = stream.set_nodelay(true);
    let (mut read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(writer_loop(write_half, out_rx));

    let mut reassembler = Reassembler::new();
    loop {
        let (header, payload) = match read_frame(&mut read_half).await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "connection protocol error");
                break;
            }
        };
        match reassembler.push_frame(header, &payload) {
            Ok(Some((cmd, msg))) => {
                let (done, done_rx) = oneshot::channel();
                let req = CoreRequest { cmd, payload: msg, seqno: header.seqno, out: out_tx.clone(), done };
                if core_tx.send(CoreMsg::Request(req)).is_err() {
                    break;
                }
                if done_rx.await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(error = %e, "framing error, dropping connection");
                break;
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
}

/// Accept loop: binds, spawns the core actor, and hands every connection a
/// clone of the actor's channel. Returns once `listener` errors out.
pub async fn serve(cfg: Config, listener: TcpListener) -> Result<CoreHandle> {
    let (core_tx, core_rx) = mpsc::unbounded_channel::<CoreMsg>();
    let handle = CoreHandle { tx: core_tx.clone() };

    tokio::spawn(run_core_actor(cfg, core_rx, handle.clone()));

    let connection_count = Arc::new(AtomicU32::new(0));
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let n = connection_count.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(%peer, connections = n, "accepted connection");
            let tx = core_tx.clone();
            let count = Arc::clone(&connection_count);
            tokio::spawn(async move {
                handle_connection(stream, tx).await;
                count.fetch_sub(1, Ordering::Relaxed);
            });
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod core_tests {
    use super::*;
    use crate::wire::value::{encode_value, parse_vtype, WireValue};

    async fn roundtrip_ping(port: u16) -> WireValue {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut payload = Vec::new();
        let header = FrameHeader { cmd: 0, flags: 0x20 | 0x40, seqno: 1, frame_bsize: 0, msg_bsize: 0, chk: 0 };
        let frame = header.build_frame(&payload).unwrap();
        stream.write_all(&frame).await.unwrap();
        payload.clear();
        let (_, resp) = read_frame(&mut stream).await.unwrap().unwrap();
        let (value, _) = parse_vtype(&resp, 0).unwrap();
        value
    }

    #[tokio::test]
    async fn ping_round_trips_over_tcp() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut cfg = Config::default();
        cfg.data_dir = std::env::temp_dir();
        serve(cfg, listener).await.unwrap();

        let value = roundtrip_ping(port).await;
        assert_eq!(value, WireValue::Str { data: b"PONG".to_vec(), binary: false, deflate: false });
        let _ = encode_value(&WireValue::Null, &mut Vec::new());
    }
}
