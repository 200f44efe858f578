use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use colored::*;
use tokio::sync::mpsc;

use ledgerd::chain;
use ledgerd::config::{self, Config};
use ledgerd::coordinator::Coordinator;
use ledgerd::mempool::Mempool;
use ledgerd::net::protocol::{hello_payload, state_request_payload};
use ledgerd::net::{Envelope, GossipTransport, MessageType};
use ledgerd::rpc::{self, RpcState};
use ledgerd::store::StateStore;
use ledgerd::wallet::{MockOracle, SignatureOracle};

fn banner() {
    println!("{}", "  _          _                     _ ".bright_cyan());
    println!("{}", " | |___ __| |__ _ ___ _ _ __| |".bright_cyan().bold());
    println!("{}", " | / -_) _` / _` / -_) '_/ _` |".bright_cyan().bold());
    println!("{}", " |_\\___\\__,_\\__, \\___|_| \\__,_|".blue());
    println!("{}", "            |___/              ".blue());
    println!();
    println!("{}", "         replicated signature-threshold ledger        ".bright_green().bold());
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    banner();

    let data_dir = config::default_data_dir();
    println!("{} data dir: {}", "[init]".bright_blue().bold(), data_dir.display());

    let cfg = Config::load(&data_dir)?;
    println!("{} node id: {}", "[init]".bright_blue().bold(), cfg.node_id);

    let store = Arc::new(StateStore::open(&data_dir.join("chaindata"))?);
    println!("{} state store opened", "[init]".bright_blue().bold());

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    chain::ensure_genesis(&store, now)?;
    println!(
        "{} chain height: {}",
        "[init]".bright_blue().bold(),
        store.block_count()?
    );

    let mempool = Arc::new(Mempool::new());

    let (transport, inbound) = GossipTransport::new(cfg.node_id.clone(), cfg.port);
    let transport = Arc::new(transport);

    for peer in &cfg.known_peers {
        transport.add_peer(format!("bootstrap:{}:{}", peer.ip, peer.port), peer.ip.clone(), peer.port).await;
    }

    let oracle = Arc::new(MockOracle::new());
    let private_key = cfg.node_id.as_bytes().to_vec();
    let address = oracle.address_of(&private_key);
    println!("{} mining address: {}", "[init]".bright_blue().bold(), address);

    let coordinator = Coordinator::new(
        Arc::clone(&store),
        Arc::clone(&mempool),
        Arc::clone(&transport),
        oracle,
        private_key,
        cfg.port,
        cfg.signature_wait_seconds as u64,
    );

    let (control_tx, control_rx) = mpsc::channel(16);

    {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            if let Err(err) = transport.listen().await {
                eprintln!("{} listener stopped: {err}", "[gossip]".bright_red().bold());
            }
        });
    }
    tokio::spawn(Arc::clone(&transport).run_maintenance());
    tokio::spawn(Arc::clone(&transport).run_presence_broadcast());

    for peer in &cfg.known_peers {
        let hello = Envelope::new(MessageType::Hello, cfg.node_id.clone(), cfg.port, hello_payload(&cfg.node_id, cfg.port), now, false);
        let state_request = Envelope::new(
            MessageType::StateRequest,
            cfg.node_id.clone(),
            cfg.port,
            state_request_payload(),
            now,
            false,
        );
        let transport = Arc::clone(&transport);
        let ip = peer.ip.clone();
        let port = peer.port;
        tokio::spawn(async move {
            let _ = transport.send_to(&ip, port, &hello).await;
            // Ask every known peer to size up our chain on boot — a node
            // started from empty storage or after downtime can't wait for
            // the next FINAL_UPDATE to learn it's behind.
            let _ = transport.send_to(&ip, port, &state_request).await;
        });
    }

    {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator.run(inbound, control_rx).await;
        });
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let auth_token = rpc::generate_rpc_auth_token(&data_dir)?;
    println!(
        "{} RPC auth token: {}...",
        "[security]".bright_yellow().bold(),
        &auth_token[..16]
    );
    println!(
        "{}",
        format!("           Full token saved to: {}/.cookie", data_dir.display()).yellow()
    );

    let rpc_state = Arc::new(RpcState {
        store,
        mempool,
        transport: Arc::clone(&transport),
        coordinator,
        control: control_tx,
        auth_token,
        shutdown,
    });

    println!(
        "{} RPC server listening on {}:{}",
        "[rpc]".bright_magenta().bold(),
        rpc::RPC_BIND_ADDRESS,
        cfg.rpc_port
    );
    println!(
        "{} gossip listening on 0.0.0.0:{}",
        "[gossip]".bright_green().bold(),
        cfg.port
    );
    println!();
    println!("{}", "  Usage: ledger-cli <command> [args...]".bright_yellow().bold());
    println!("  {} ledger-cli getblockcount", "\u{276f}".bright_black());
    println!("  {} ledger-cli getbalance <address>", "\u{276f}".bright_black());
    println!("  {} ledger-cli startmining", "\u{276f}".bright_black());
    println!("  {} ledger-cli stop", "\u{276f}".bright_black());
    println!();

    rpc::start_rpc_server(rpc_state, cfg.rpc_port).await?;
    println!("{} done", "[shutdown]".bright_red().bold());
    Ok(())
}
