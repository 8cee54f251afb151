//! End-to-end scenarios over a real TCP socket (§8): ping, create/modify/get,
//! hierarchy traversal, RPN filter, save/load, compress/restore. Each test
//! binds its own ephemeral listener and data directory so they can run
//! concurrently.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use selva::config::Config;
use selva::server;
use selva::wire::frame::{parse_frame, FrameHeader, FRAME_HEADER_LEN};
use selva::wire::value::{encode_value, WireValue};

async fn start_server(data_dir: std::path::PathBuf) -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut cfg = Config::default();
    cfg.data_dir = data_dir;
    server::serve(cfg, listener).await.unwrap();
    port
}

fn payload(values: &[WireValue]) -> Vec<u8> {
    let mut buf = Vec::new();
    for v in values {
        encode_value(v, &mut buf);
    }
    buf
}

fn str_val(s: &str) -> WireValue {
    WireValue::Str { data: s.as_bytes().to_vec(), binary: false, deflate: false }
}

fn node_val(id: &str) -> WireValue {
    let padded = selva::nodeid::NodeId::from_str_padded(id);
    WireValue::Str { data: padded.as_bytes().to_vec(), binary: true, deflate: false }
}

fn ll_val(v: i64) -> WireValue {
    WireValue::LongLong { value: v, hex: false }
}

async fn request(stream: &mut TcpStream, cmd: i8, values: &[WireValue]) -> Vec<WireValue> {
    let body = payload(values);
    let header = FrameHeader { cmd, flags: 0x20 | 0x40, seqno: 1, frame_bsize: 0, msg_bsize: body.len() as u32, chk: 0 };
    let frame = header.build_frame(&body).unwrap();
    stream.write_all(&frame).await.unwrap();

    let mut out = Vec::new();
    loop {
        let mut hdr_buf = [0u8; FRAME_HEADER_LEN];
        stream.read_exact(&mut hdr_buf).await.unwrap();
        let peek = FrameHeader::decode(&hdr_buf).unwrap();
        let mut rest = vec![0u8; peek.frame_bsize as usize - FRAME_HEADER_LEN];
        stream.read_exact(&mut rest).await.unwrap();
        let mut full = hdr_buf.to_vec();
        full.extend_from_slice(&rest);
        let (header, resp_payload, _) = parse_frame(&full).unwrap();

        let mut offset = 0;
        while offset < resp_payload.len() {
            let (value, new_offset) = selva::wire::value::parse_vtype(resp_payload, offset).unwrap();
            out.push(value);
            offset = new_offset;
        }
        if header.is_last() {
            break;
        }
    }
    out
}

#[tokio::test]
async fn ping_replies_pong() {
    let port = start_server(std::env::temp_dir()).await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let out = request(&mut stream, 0, &[]).await;
    assert_eq!(out, vec![WireValue::Str { data: b"PONG".to_vec(), binary: false, deflate: false }]);
}

#[tokio::test]
async fn create_modify_get_round_trips_a_field() {
    let port = start_server(std::env::temp_dir()).await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let out = request(
        &mut stream,
        63,
        &[node_val("ab00000001"), str_val(""), str_val("s"), str_val("name"), str_val("alice")],
    )
    .await;
    assert_eq!(out, vec![WireValue::LongLong { value: 1, hex: false }]);

    let out = request(&mut stream, 45, &[node_val("ab00000001"), str_val("name")]).await;
    assert_eq!(out, vec![WireValue::Str { data: b"alice".to_vec(), binary: true, deflate: false }]);
}

#[tokio::test]
async fn hierarchy_find_over_a_single_node_traversal_returns_the_root() {
    let port = start_server(std::env::temp_dir()).await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let root = WireValue::Array { len: Some(1) };
    let out = request(
        &mut stream,
        17,
        &[str_val(""), str_val(""), str_val("node"), root, node_val("root")],
    )
    .await;
    assert_eq!(out.len(), 2); // array header + the single returned node id
    assert_eq!(out[0], WireValue::Array { len: Some(1) });
    assert_eq!(out[1], node_val("root"));
}

#[tokio::test]
async fn newly_modified_node_appears_as_a_head() {
    let port = start_server(std::env::temp_dir()).await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    request(&mut stream, 63, &[node_val("ab00000002"), str_val("")]).await;
    let out = request(&mut stream, 24, &[]).await;
    assert!(out.contains(&node_val("ab00000002")));
}

#[tokio::test]
async fn rpn_eval_bool_over_an_object_field() {
    let port = start_server(std::env::temp_dir()).await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    request(&mut stream, 63, &[node_val("ab00000003"), str_val(""), str_val("i"), str_val("score"), ll_val(10)]).await;

    let out = request(&mut stream, 41, &[node_val("ab00000003"), str_val("\"score\" g #5 J")]).await;
    assert_eq!(out, vec![WireValue::LongLong { value: 1, hex: false }]);
}

#[tokio::test]
async fn save_then_load_restores_state() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_server(dir.path().to_path_buf()).await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    request(&mut stream, 63, &[node_val("ab00000004"), str_val(""), str_val("s"), str_val("name"), str_val("bob")]).await;

    let snapshot = dir.path().join("snap.sdb");
    let out = request(&mut stream, 15, &[str_val(snapshot.to_str().unwrap())]).await;
    assert_eq!(out, vec![WireValue::Str { data: b"OK".to_vec(), binary: false, deflate: false }]);

    let out = request(&mut stream, 14, &[str_val(snapshot.to_str().unwrap())]).await;
    assert_eq!(out, vec![WireValue::Str { data: b"OK".to_vec(), binary: false, deflate: false }]);

    let out = request(&mut stream, 45, &[node_val("ab00000004"), str_val("name")]).await;
    assert_eq!(out, vec![WireValue::Str { data: b"bob".to_vec(), binary: true, deflate: false }]);
}

#[tokio::test]
async fn replicaof_catches_the_replica_up_with_a_field_set_before_it_connected() {
    let primary_port = start_server(std::env::temp_dir()).await;
    let mut primary = TcpStream::connect(("127.0.0.1", primary_port)).await.unwrap();
    request(
        &mut primary,
        63,
        &[node_val("ab00000006"), str_val(""), str_val("s"), str_val("name"), str_val("carol")],
    )
    .await;

    let replica_port = start_server(std::env::temp_dir()).await;
    let mut replica = TcpStream::connect(("127.0.0.1", replica_port)).await.unwrap();
    request(&mut replica, 67, &[str_val("127.0.0.1"), ll_val(primary_port as i64)]).await;

    for _ in 0..50 {
        let out = request(&mut replica, 45, &[node_val("ab00000006"), str_val("name")]).await;
        if out == vec![WireValue::Str { data: b"carol".to_vec(), binary: true, deflate: false }] {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("replica never caught up with the primary's snapshot");
}

#[tokio::test]
async fn replicaof_applies_a_command_issued_after_the_initial_snapshot() {
    let primary_port = start_server(std::env::temp_dir()).await;
    let mut primary = TcpStream::connect(("127.0.0.1", primary_port)).await.unwrap();

    let replica_port = start_server(std::env::temp_dir()).await;
    let mut replica = TcpStream::connect(("127.0.0.1", replica_port)).await.unwrap();
    request(&mut replica, 67, &[str_val("127.0.0.1"), ll_val(primary_port as i64)]).await;

    // Give the driver time to take its initial (empty) snapshot before the
    // primary gets a mutation the replica must catch up on separately.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    request(
        &mut primary,
        63,
        &[node_val("ab00000007"), str_val(""), str_val("s"), str_val("name"), str_val("dave")],
    )
    .await;

    for _ in 0..50 {
        let out = request(&mut replica, 45, &[node_val("ab00000007"), str_val("name")]).await;
        if out == vec![WireValue::Str { data: b"dave".to_vec(), binary: true, deflate: false }] {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("replica never applied the post-snapshot command");
}

#[tokio::test]
async fn compress_then_restore_round_trips_a_detached_subtree() {
    let port = start_server(std::env::temp_dir()).await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    request(&mut stream, 63, &[node_val("ab00000005"), str_val("")]).await;

    let out = request(&mut stream, 30, &[node_val("ab00000005")]).await;
    assert_eq!(out, vec![WireValue::Str { data: b"OK".to_vec(), binary: false, deflate: false }]);

    let out = request(&mut stream, 31, &[node_val("ab00000005")]).await;
    assert_eq!(out, vec![WireValue::Str { data: b"OK".to_vec(), binary: false, deflate: false }]);
}
