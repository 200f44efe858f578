//! Black-box smoke test: spawns the real `ledgerd` binary, waits for its
//! RPC cookie to appear, then drives a handful of RPC calls over a raw
//! TCP connection the same way `ledger-cli` does.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn pick_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn start_ledgerd(port: u16, rpc_port: u16, data_dir: &PathBuf) -> Child {
    let bin = env!("CARGO_BIN_EXE_ledgerd");
    std::fs::create_dir_all(data_dir).unwrap();

    Command::new(bin)
        .env("LEDGERD_PORT", port.to_string())
        .env("LEDGERD_RPC_PORT", rpc_port.to_string())
        .env("LEDGERD_DATA_DIR", data_dir.to_string_lossy().to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn ledgerd")
}

fn wait_for_cookie(data_dir: &PathBuf, timeout: Duration) -> String {
    let cookie_path = data_dir.join(".cookie");
    let start = Instant::now();
    while start.elapsed() < timeout {
        if let Ok(token) = std::fs::read_to_string(&cookie_path) {
            let token = token.trim();
            if token.len() >= 32 {
                return token.to_string();
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("ledgerd did not write a cookie within {timeout:?}");
}

async fn rpc_call(rpc_port: u16, token: &str, method: &str, params: Value) -> Value {
    let mut stream = TcpStream::connect(("127.0.0.1", rpc_port)).await.expect("connect to ledgerd RPC");

    let body = serde_json::to_string(&json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    }))
    .unwrap();
    let request = format!(
        "POST / HTTP/1.1\r\nHost: 127.0.0.1\r\nAuthorization: Bearer {token}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body,
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    let body_start = text.find("\r\n\r\n").expect("http response has a body");
    serde_json::from_str(&text[body_start + 4..]).expect("valid json-rpc response")
}

struct Daemon(Child);
impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[tokio::test]
async fn daemon_starts_and_serves_basic_rpc() {
    let port = pick_free_port();
    let rpc_port = pick_free_port();
    let data_dir = std::env::temp_dir().join(format!("ledgerd_smoke_{}_{}", std::process::id(), rpc_port));
    let _ = std::fs::remove_dir_all(&data_dir);

    let daemon = Daemon(start_ledgerd(port, rpc_port, &data_dir));
    let token = wait_for_cookie(&data_dir, Duration::from_secs(10));

    // Rejects a request with no bearer token at all.
    let mut stream = TcpStream::connect(("127.0.0.1", rpc_port)).await.unwrap();
    let body = serde_json::to_string(&json!({"jsonrpc": "2.0", "method": "getblockcount", "params": [], "id": 1})).unwrap();
    let request = format!(
        "POST / HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body,
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 401"));

    let resp = rpc_call(rpc_port, &token, "getblockcount", json!([])).await;
    assert_eq!(resp["result"], json!(0), "a freshly started node has only the genesis block");

    let resp = rpc_call(rpc_port, &token, "getlatestblock", json!([])).await;
    let block = resp.get("result").expect("genesis block present");
    assert_eq!(block["block_number"], json!(0));
    assert_eq!(block["miner"], json!("GENESIS"));

    let resp = rpc_call(rpc_port, &token, "getmempoolinfo", json!([])).await;
    assert_eq!(resp["result"]["size"], json!(0));

    let resp = rpc_call(rpc_port, &token, "getstatus", json!([])).await;
    assert_eq!(resp["result"]["mining"], json!(false));

    let resp = rpc_call(rpc_port, &token, "getpeerinfo", json!([])).await;
    assert!(resp["result"].as_array().unwrap().is_empty());

    let resp = rpc_call(rpc_port, &token, "startmining", json!([])).await;
    assert!(resp.get("result").is_some());
    let resp = rpc_call(rpc_port, &token, "getstatus", json!([])).await;
    assert_eq!(resp["result"]["mining"], json!(true));

    let resp = rpc_call(rpc_port, &token, "stopmining", json!([])).await;
    assert!(resp.get("result").is_some());

    let resp = rpc_call(rpc_port, &token, "getblock", json!([999])).await;
    assert!(resp.get("error").is_some(), "height 999 does not exist yet");

    let resp = rpc_call(rpc_port, &token, "stop", json!([])).await;
    assert_eq!(resp["result"], json!("stopping"));

    drop(daemon);
    let _ = std::fs::remove_dir_all(&data_dir);
}
