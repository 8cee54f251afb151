//! `selva-cli` (§6): a thin debug client. Connects, sends one command with
//! its arguments as a sequence of string values, and prints whatever comes
//! back until the last frame of the response.
//!
//! Usage: `selva-cli <host:port> <cmd_id> [arg...]`

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use selva::wire::frame::{parse_frame, FrameHeader, FRAME_HEADER_LEN};
use selva::wire::value::{encode_value, parse_vtype, WireValue};

fn usage() -> ! {
    eprintln!("usage: selva-cli <host:port> <cmd_id> [arg...]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();
    if argv.len() < 3 {
        usage();
    }
    let addr = &argv[1];
    let cmd: i8 = match argv[2].parse() {
        Ok(c) => c,
        Err(_) => {
            eprintln!("cmd_id must fit in an i8");
            std::process::exit(2);
        }
    };

    let mut payload = Vec::new();
    for arg in &argv[3..] {
        encode_value(&WireValue::Str { data: arg.clone().into_bytes(), binary: false, deflate: false }, &mut payload);
    }

    let mut stream = match TcpStream::connect(addr).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("connect to {addr} failed: {e}");
            std::process::exit(1);
        }
    };

    let header = FrameHeader { cmd, flags: 0x20 | 0x40, seqno: 1, frame_bsize: 0, msg_bsize: payload.len() as u32, chk: 0 };
    let frame = match header.build_frame(&payload) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("request too large to frame: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = stream.write_all(&frame).await {
        eprintln!("write failed: {e}");
        std::process::exit(1);
    }

    loop {
        let mut hdr_buf = [0u8; FRAME_HEADER_LEN];
        if let Err(e) = stream.read_exact(&mut hdr_buf).await {
            eprintln!("connection closed: {e}");
            std::process::exit(1);
        }
        let header = match FrameHeader::decode(&hdr_buf) {
            Ok(h) => h,
            Err(e) => {
                eprintln!("bad response header: {e}");
                std::process::exit(1);
            }
        };
        let mut rest = vec![0u8; (header.frame_bsize as usize).saturating_sub(FRAME_HEADER_LEN)];
        if let Err(e) = stream.read_exact(&mut rest).await {
            eprintln!("connection closed mid-frame: {e}");
            std::process::exit(1);
        }
        let mut full = Vec::with_capacity(FRAME_HEADER_LEN + rest.len());
        full.extend_from_slice(&hdr_buf);
        full.extend_from_slice(&rest);
        let (header, payload, _) = match parse_frame(&full) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("malformed response frame: {e}");
                std::process::exit(1);
            }
        };
        print_values(payload);
        if header.is_last() {
            break;
        }
    }
}

fn print_values(buf: &[u8]) {
    let mut offset = 0;
    while offset < buf.len() {
        match parse_vtype(buf, offset) {
            Ok((value, new_offset)) => {
                println!("{value:?}");
                offset = new_offset;
            }
            Err(e) => {
                eprintln!("decode error at {offset}: {e}");
                break;
            }
        }
    }
}
