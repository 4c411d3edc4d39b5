// Client HTTP façade: thin adapters over the node contracts, no invariants
// of its own. Reads come from the published snapshot; writes go through the
// command channel into the node loop.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{mpsc, Arc, RwLock};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::node::engine::{NodeCommand, NodeSnapshot};
use crate::types::Transaction;

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Deserialize)]
struct TxRequest {
    from: String,
    to: Option<String>,
    #[serde(default)]
    value: u64,
    #[serde(default)]
    data: String,
    nonce: u64,
    signature: String,
}

#[derive(Deserialize)]
struct DeployRequest {
    from: String,
    bytecode: String,
    #[serde(default)]
    abi: String,
    #[serde(default)]
    value: u64,
    nonce: u64,
    signature: String,
}

#[derive(Deserialize)]
struct CallRequest {
    address: String,
    method: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    caller: String,
}

#[derive(Deserialize)]
struct RegisterRequest {
    address: String,
    stake: u64,
}

pub fn start_http_server(
    listen_addr: String,
    snapshot: Arc<RwLock<NodeSnapshot>>,
    tx_cmd: mpsc::Sender<NodeCommand>,
) {
    thread::spawn(move || {
        let listener = TcpListener::bind(&listen_addr).expect("bind http");
        for stream in listener.incoming().flatten() {
            let snap = Arc::clone(&snapshot);
            let tx_cmd = tx_cmd.clone();
            thread::spawn(move || handle_client(stream, snap, tx_cmd));
        }
    });
}

fn handle_client(
    mut stream: TcpStream,
    snapshot: Arc<RwLock<NodeSnapshot>>,
    tx_cmd: mpsc::Sender<NodeCommand>,
) {
    let req = match read_request(&mut stream) {
        Ok(r) => r,
        Err(_) => return,
    };
    let (path, query) = match req.path.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (req.path.clone(), None),
    };

    match (req.method.as_str(), path.as_str()) {
        ("GET", "/chain/info") => {
            let snap = snapshot.read().unwrap();
            let body = json!({
                "chain_id": snap.chain_id,
                "height": snap.height,
                "tip_hash": snap.tip_hash,
                "mempool_size": snap.mempool_size,
                "validator_count": snap.validators.len(),
            });
            write_json(&mut stream, 200, &body.to_string());
        }
        ("GET", "/blocks") => {
            let limit = query
                .as_deref()
                .and_then(|q| {
                    q.split('&')
                        .find_map(|kv| kv.strip_prefix("limit="))
                        .and_then(|v| v.parse::<usize>().ok())
                })
                .unwrap_or(10);
            let snap = snapshot.read().unwrap();
            let start = snap.blocks.len().saturating_sub(limit);
            match serde_json::to_string(&snap.blocks[start..]) {
                Ok(body) => write_json(&mut stream, 200, &body),
                Err(_) => write_json(&mut stream, 500, r#"{"error":"encode"}"#),
            }
        }
        ("GET", p) if p.starts_with("/blocks/") => {
            let index = p.trim_start_matches("/blocks/");
            match index.parse::<u64>() {
                Ok(i) => {
                    let snap = snapshot.read().unwrap();
                    match snap.blocks.get(i as usize) {
                        Some(block) => match serde_json::to_string(block) {
                            Ok(body) => write_json(&mut stream, 200, &body),
                            Err(_) => write_json(&mut stream, 500, r#"{"error":"encode"}"#),
                        },
                        None => write_json(&mut stream, 404, r#"{"error":"not found"}"#),
                    }
                }
                Err(_) => write_json(&mut stream, 400, r#"{"error":"bad index"}"#),
            }
        }
        ("GET", p) if p.starts_with("/accounts/") => {
            let address = p.trim_start_matches("/accounts/");
            let snap = snapshot.read().unwrap();
            let account = snap.state.account(address);
            let body = json!({
                "address": address,
                "balance": account.balance,
                "nonce": account.nonce,
            });
            write_json(&mut stream, 200, &body.to_string());
        }
        ("GET", "/validators") => {
            let snap = snapshot.read().unwrap();
            match serde_json::to_string(&snap.validators) {
                Ok(body) => write_json(&mut stream, 200, &body),
                Err(_) => write_json(&mut stream, 500, r#"{"error":"encode"}"#),
            }
        }
        ("POST", "/transactions") => {
            let Ok(body) = serde_json::from_slice::<TxRequest>(&req.body) else {
                return write_json(&mut stream, 400, r#"{"error":"bad json"}"#);
            };
            let tx = Transaction::new(
                body.from, body.to, body.value, body.data, body.nonce, body.signature,
            );
            submit_and_reply(&mut stream, &tx_cmd, tx);
        }
        ("POST", "/contracts/deploy") => {
            let Ok(body) = serde_json::from_slice::<DeployRequest>(&req.body) else {
                return write_json(&mut stream, 400, r#"{"error":"bad json"}"#);
            };
            let data = json!({"bytecode": body.bytecode, "abi": body.abi}).to_string();
            let tx = Transaction::new(
                body.from, None, body.value, data, body.nonce, body.signature,
            );
            submit_and_reply(&mut stream, &tx_cmd, tx);
        }
        ("POST", "/contracts/call") => {
            let Ok(body) = serde_json::from_slice::<CallRequest>(&req.body) else {
                return write_json(&mut stream, 400, r#"{"error":"bad json"}"#);
            };
            let (reply, rx) = mpsc::channel();
            let _ = tx_cmd.send(NodeCommand::CallContract {
                address: body.address,
                method: body.method,
                args: body.args,
                caller: body.caller,
                reply,
            });
            match rx.recv_timeout(REPLY_TIMEOUT) {
                Ok(Ok(result)) => {
                    let body = json!({"success": result.success, "output": result.output});
                    write_json(&mut stream, 200, &body.to_string());
                }
                Ok(Err(e)) => write_error(&mut stream, 400, &e),
                Err(_) => write_json(&mut stream, 500, r#"{"error":"node busy"}"#),
            }
        }
        ("POST", "/validators/register") => {
            let Ok(body) = serde_json::from_slice::<RegisterRequest>(&req.body) else {
                return write_json(&mut stream, 400, r#"{"error":"bad json"}"#);
            };
            let (reply, rx) = mpsc::channel();
            let _ = tx_cmd.send(NodeCommand::RegisterValidator {
                address: body.address,
                stake: body.stake,
                reply,
            });
            match rx.recv_timeout(REPLY_TIMEOUT) {
                Ok(Ok(())) => write_json(&mut stream, 200, r#"{"registered":true}"#),
                Ok(Err(e)) => write_error(&mut stream, 400, &e),
                Err(_) => write_json(&mut stream, 500, r#"{"error":"node busy"}"#),
            }
        }
        ("POST", "/sync") => {
            let _ = tx_cmd.send(NodeCommand::SyncWithPeers);
            write_json(&mut stream, 200, r#"{"requested":true}"#);
        }
        _ => {
            write_json(&mut stream, 404, r#"{"error":"not found"}"#);
        }
    }
}

fn submit_and_reply(
    stream: &mut TcpStream,
    tx_cmd: &mpsc::Sender<NodeCommand>,
    tx: Transaction,
) {
    let (reply, rx) = mpsc::channel();
    let _ = tx_cmd.send(NodeCommand::SubmitTransaction(tx, reply));
    match rx.recv_timeout(REPLY_TIMEOUT) {
        Ok(Ok(id)) => {
            let body = json!({"id": id, "status": "pending"});
            write_json(stream, 200, &body.to_string());
        }
        Ok(Err(e)) => write_error(stream, 400, &e),
        Err(_) => write_json(stream, 500, r#"{"error":"node busy"}"#),
    }
}

fn write_error(stream: &mut TcpStream, status: u16, message: &str) {
    let body = json!({ "error": message });
    write_json(stream, status, &body.to_string());
}

struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn read_request(stream: &mut TcpStream) -> Result<Request, String> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf).map_err(|e| format!("{}", e))?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let header_end = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or("bad request")?
        + 4;
    let header_bytes = &data[..header_end];
    let mut body = data[header_end..].to_vec();

    let req_str = String::from_utf8_lossy(header_bytes);
    let mut lines = req_str.split("\r\n");
    let line = lines.next().ok_or("bad request")?;
    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or("bad method")?.to_string();
    let path = parts.next().ok_or("bad path")?.to_string();

    let mut content_len = 0usize;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some(rest) = line.strip_prefix("Content-Length:") {
            content_len = rest.trim().parse::<usize>().unwrap_or(0);
        }
    }

    if content_len > body.len() {
        let mut remaining = content_len.saturating_sub(body.len());
        while remaining > 0 {
            let mut buf = vec![0u8; remaining.min(4096)];
            let n = stream.read(&mut buf).map_err(|e| format!("{}", e))?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
            remaining = remaining.saturating_sub(n);
        }
    }

    Ok(Request { method, path, body })
}

fn write_json(stream: &mut TcpStream, status: u16, body: &str) {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let resp = format!(
        "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        status_line,
        body.len(),
        body
    );
    let _ = stream.write_all(resp.as_bytes());
}
