//! JSON-RPC 2.0 control surface: a `hyper` server exposing the handful
//! of methods an operator or the thin CLI needs — chain/mempool/peer
//! inspection, transaction submission, and mining start/stop/shutdown
//! control. Bearer-token auth against a generated `.cookie` file,
//! OPTIONS/CORS preflight handling, and a `serde_json::Value`-based
//! dispatcher.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::coordinator::{Coordinator, ControlMessage, RoundOutcome};
use crate::mempool::Mempool;
use crate::net::protocol::{transaction_payload, Envelope, MessageType};
use crate::net::transport::GossipTransport;
use crate::primitives::{Address, Transaction, TxType, MicroAmount};
use crate::store::StateStore;
use crate::wallet::SignatureOracle;

pub const RPC_BIND_ADDRESS: &str = "127.0.0.1";
pub const RPC_COOKIE_FILE: &str = ".cookie";

pub struct RpcState<O: SignatureOracle + Send + Sync + 'static> {
    pub store: Arc<StateStore>,
    pub mempool: Arc<Mempool>,
    pub transport: Arc<GossipTransport>,
    pub coordinator: Arc<Coordinator<O>>,
    pub control: mpsc::Sender<ControlMessage>,
    pub auth_token: String,
    pub shutdown: Arc<AtomicBool>,
}

async fn handle_rpc<O: SignatureOracle + Send + Sync + 'static>(
    state: &RpcState<O>,
    method: &str,
    params: &Value,
) -> Result<Value, (i32, String)> {
    match method {
        "getblockcount" => Ok(json!(store_err(state.store.block_count())?)),

        "getblock" => {
            let number = params.get(0).and_then(|v| v.as_u64()).ok_or((-32602, "expected a block number".to_string()))?;
            match store_err(state.store.get_block(number))? {
                Some(block) => Ok(block_json(&block)),
                None => Err((-32602, "block not found".to_string())),
            }
        }

        "getlatestblock" => match store_err(state.store.latest_block())? {
            Some(block) => Ok(block_json(&block)),
            None => Err((-32000, "chain has no blocks yet".to_string())),
        },

        "getbalance" => {
            let addr_str = params.get(0).and_then(|v| v.as_str()).ok_or((-32602, "expected an address".to_string()))?;
            let address = Address::parse(addr_str).map_err(|e| (-32602, e.to_string()))?;
            match store_err(state.store.get_user(&address))? {
                Some(user) => Ok(json!({
                    "address": user.address.as_str(),
                    "balance": user.balance.to_canonical_string(),
                    "nonce": user.nonce,
                    "life": user.life,
                })),
                None => Err((-32602, "no such account".to_string())),
            }
        }

        "getmempoolinfo" => Ok(json!({ "size": state.mempool.len() })),

        "getpeerinfo" => {
            let peers = state.transport.peers_snapshot().await;
            let list: Vec<Value> = peers
                .iter()
                .map(|p| json!({ "node_id": p.node_id, "ip": p.ip, "port": p.port }))
                .collect();
            Ok(json!(list))
        }

        "getstatus" => {
            let outcome = state.coordinator.last_outcome().await;
            Ok(json!({
                "address": state.coordinator.address().as_str(),
                "mining": state.coordinator.is_mining(),
                "last_round_outcome": outcome.map(outcome_json),
            }))
        }

        "submittransaction" => {
            let tx = parse_submitted_transaction(params)?;
            let tx_id = tx.tx_id.clone();
            state.mempool.insert(tx.clone()).map_err(|e| (-32000, e.to_string()))?;
            let envelope = Envelope::new(
                MessageType::Transaction,
                state.transport.node_id(),
                0,
                transaction_payload(&tx),
                0,
                true,
            );
            state.transport.broadcast(&envelope).await;
            Ok(json!({ "tx_id": tx_id }))
        }

        "startmining" => {
            state.control.send(ControlMessage::StartMining).await.map_err(|_| (-32000, "coordinator is not running".to_string()))?;
            Ok(json!("mining started"))
        }

        "stopmining" => {
            state.control.send(ControlMessage::StopMining).await.map_err(|_| (-32000, "coordinator is not running".to_string()))?;
            Ok(json!("mining stopped"))
        }

        "stop" => {
            state.shutdown.store(true, Ordering::SeqCst);
            Ok(json!("stopping"))
        }

        _ => Err((-32601, format!("method not found: {method}"))),
    }
}

fn store_err<T>(r: Result<T, crate::store::StoreError>) -> Result<T, (i32, String)> {
    r.map_err(|e| (-32603, format!("store error: {e}")))
}

fn block_json(block: &crate::primitives::Block) -> Value {
    json!({
        "block_number": block.block_number,
        "prev_hash": hex::encode(block.prev_hash),
        "state_hash": hex::encode(block.state_hash),
        "combined_hash": hex::encode(block.combined_hash),
        "group_id": block.group_id,
        "miner": block.miner.as_str(),
        "timestamp": block.timestamp,
        "executed_tx_count": block.executed_tx_count,
        "signature_count": block.signatures.len(),
    })
}

fn outcome_json(outcome: RoundOutcome) -> Value {
    match outcome {
        RoundOutcome::Mined { block_number } => json!({ "kind": "mined", "block_number": block_number }),
        RoundOutcome::Expired => json!({ "kind": "expired" }),
        RoundOutcome::Preempted => json!({ "kind": "preempted" }),
        RoundOutcome::NotInGroup => json!({ "kind": "not_in_group" }),
        RoundOutcome::MinerExpired => json!({ "kind": "miner_expired" }),
        RoundOutcome::Storage(msg) => json!({ "kind": "storage_fault", "message": msg }),
    }
}

/// `submittransaction` takes a single object param with the fields a
/// client-side wallet would already know: type, sender, recipient,
/// amount, nonce, timestamp, and a pre-computed signature. The server
/// never signs on a caller's behalf.
fn parse_submitted_transaction(params: &Value) -> Result<Transaction, (i32, String)> {
    let obj = params
        .get(0)
        .ok_or((-32602, "expected a transaction object".to_string()))?;

    let tx_type = match obj.get("type").and_then(|v| v.as_str()) {
        Some("transfer") => TxType::Transfer,
        Some("new_account") => TxType::NewAccount,
        Some("join_pool") => TxType::JoinPool,
        other => return Err((-32602, format!("unsupported transaction type: {other:?}"))),
    };

    let from = obj
        .get("from")
        .and_then(|v| v.as_str())
        .ok_or((-32602, "missing from".to_string()))
        .and_then(|s| Address::parse(s).map_err(|e| (-32602, e.to_string())))?;
    let to = obj
        .get("to")
        .and_then(|v| v.as_str())
        .ok_or((-32602, "missing to".to_string()))
        .and_then(|s| Address::parse(s).map_err(|e| (-32602, e.to_string())))?;
    let amount_str = obj.get("amount").and_then(|v| v.as_str()).unwrap_or("0");
    let amount = MicroAmount::from_decimal_str(amount_str).ok_or((-32602, "malformed amount".to_string()))?;
    let nonce = obj.get("nonce").and_then(|v| v.as_u64()).unwrap_or(0);
    let timestamp = obj.get("timestamp").and_then(|v| v.as_u64()).unwrap_or(0);
    let signature = obj
        .get("signature")
        .and_then(|v| v.as_str())
        .map(|s| hex::decode(s).unwrap_or_default())
        .unwrap_or_default();
    let tx_id = obj
        .get("tx_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("{}_{}_{}", from, nonce, timestamp));

    let fee = match tx_type {
        TxType::Transfer => crate::primitives::transaction::transfer_fee(amount),
        TxType::NewAccount => crate::primitives::transaction::new_account_fee(),
        TxType::JoinPool => crate::primitives::transaction::join_pool_fee(),
        TxType::Reward => unreachable!(),
    };

    Ok(Transaction { tx_id, tx_type, from, to, amount, fee, nonce, timestamp, signature })
}

async fn handle_request<O: SignatureOracle + Send + Sync + 'static>(
    state: Arc<RpcState<O>>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() == hyper::Method::OPTIONS {
        let builder = Response::builder()
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type, Authorization");
        return Ok(builder.body(Full::new(Bytes::new())).unwrap());
    }

    let auth_header = req.headers().get("authorization").and_then(|h| h.to_str().ok()).unwrap_or("");
    if !auth_header.starts_with("Bearer ") || auth_header[7..] != state.auth_token {
        let builder = Response::builder()
            .status(hyper::StatusCode::UNAUTHORIZED)
            .header("Access-Control-Allow-Origin", "*");
        return Ok(builder.body(Full::new(Bytes::from("Unauthorized"))).unwrap());
    }

    let body = match req.collect().await {
        Ok(b) => b.to_bytes(),
        Err(_) => {
            let mut res = Response::new(Full::new(Bytes::from("Bad Request")));
            *res.status_mut() = hyper::StatusCode::BAD_REQUEST;
            return Ok(res);
        }
    };

    let resp = match serde_json::from_slice::<Value>(&body) {
        Ok(v) => {
            let id = v.get("id").cloned().unwrap_or(json!(null));
            if !v.is_object() || v.get("method").is_none() {
                json!({ "jsonrpc": "2.0", "error": {"code": -32600, "message": "Invalid Request"}, "id": id })
            } else {
                let method = v["method"].as_str().unwrap_or("");
                let params = v.get("params").cloned().unwrap_or(json!([]));
                match handle_rpc(&state, method, &params).await {
                    Ok(result) => json!({ "jsonrpc": "2.0", "result": result, "id": id }),
                    Err((code, message)) => json!({
                        "jsonrpc": "2.0",
                        "error": {"code": code, "message": message},
                        "id": id
                    }),
                }
            }
        }
        Err(e) => json!({ "jsonrpc": "2.0", "error": {"code": -32700, "message": format!("parse error: {e}")}, "id": null }),
    };

    let body_bytes = serde_json::to_vec(&resp).unwrap();
    let builder = Response::builder()
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type, Authorization");
    Ok(builder.body(Full::new(Bytes::from(body_bytes))).unwrap())
}

pub async fn start_rpc_server<O: SignatureOracle + Send + Sync + 'static>(
    state: Arc<RpcState<O>>,
    port: u16,
) -> Result<(), std::io::Error> {
    let addr: SocketAddr = format!("{RPC_BIND_ADDRESS}:{port}").parse().expect("bind address is well-formed");
    let listener = TcpListener::bind(addr).await?;

    loop {
        if state.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let (stream, _) = match tokio::time::timeout(std::time::Duration::from_millis(250), listener.accept()).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(e),
            Err(_) => continue,
        };
        let s = Arc::clone(&state);
        tokio::spawn(async move {
            let svc = hyper::service::service_fn(move |req| {
                let s2 = Arc::clone(&s);
                async move { handle_request(s2, req).await }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), svc)
                .await;
        });
    }
    Ok(())
}

/// Loads the persisted bearer token from `<data_dir>/.cookie`, generating
/// and persisting a fresh one (32 random bytes, SHA-256'd, hex-encoded,
/// `0o600` on unix) the first time a node starts.
pub fn generate_rpc_auth_token(data_dir: &std::path::Path) -> Result<String, std::io::Error> {
    let cookie_path = data_dir.join(RPC_COOKIE_FILE);

    if let Ok(token) = std::fs::read_to_string(&cookie_path) {
        let token = token.trim();
        if token.len() >= 32 {
            return Ok(token.to_string());
        }
    }

    let mut random_bytes = [0u8; 32];
    getrandom::getrandom(&mut random_bytes).expect("RNG failure");
    let token = hex::encode(crate::codec::sha256(&random_bytes));

    std::fs::write(&cookie_path, &token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&cookie_path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(&cookie_path, perms)?;
    }
    Ok(token)
}
