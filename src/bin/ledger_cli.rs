// ledger-cli — thin JSON-RPC client for the ledgerd daemon.
//
// Usage: ledger-cli <method> [params...]

use std::env;

use colored::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use ledgerd::config;
use ledgerd::rpc::{RPC_BIND_ADDRESS, RPC_COOKIE_FILE};

fn print_usage() {
    println!("{}", "  ledger-cli — control surface for ledgerd".bright_yellow().bold());
    println!();
    println!("  Usage: ledger-cli <command> [args...]");
    println!();
    println!("  {} {:<28} {}", "\u{276f}".bright_black(), "getblockcount".bright_green(), "current chain height");
    println!("  {} {:<28} {}", "\u{276f}".bright_black(), "getblock <number>".bright_green(), "full block data at height");
    println!("  {} {:<28} {}", "\u{276f}".bright_black(), "getlatestblock".bright_green(), "the chain tip");
    println!("  {} {:<28} {}", "\u{276f}".bright_black(), "getbalance <address>".bright_green(), "account balance and life");
    println!("  {} {:<28} {}", "\u{276f}".bright_black(), "getmempoolinfo".bright_green(), "pending transaction count");
    println!("  {} {:<28} {}", "\u{276f}".bright_black(), "getpeerinfo".bright_green(), "known peer directory");
    println!("  {} {:<28} {}", "\u{276f}".bright_black(), "getstatus".bright_green(), "coordinator state and last round outcome");
    println!("  {} {:<28} {}", "\u{276f}".bright_black(), "startmining".bright_green(), "begin proposing rounds");
    println!("  {} {:<28} {}", "\u{276f}".bright_black(), "stopmining".bright_green(), "stop proposing rounds");
    println!("  {} {:<28} {}", "\u{276f}".bright_black(), "stop".bright_green(), "shut down the daemon");
    println!();
}

fn read_auth_token() -> Option<String> {
    let data_dir = config::default_data_dir();
    std::fs::read_to_string(data_dir.join(RPC_COOKIE_FILE)).ok().map(|s| s.trim().to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let method = &args[1];
    let params: Vec<serde_json::Value> = args[2..]
        .iter()
        .map(|arg| match arg.parse::<u64>() {
            Ok(n) => serde_json::json!(n),
            Err(_) => serde_json::json!(arg),
        })
        .collect();

    let token = match read_auth_token() {
        Some(t) => t,
        None => {
            eprintln!(
                "{} no RPC auth token found; is ledgerd running at least once?",
                "error:".bright_red().bold()
            );
            std::process::exit(1);
        }
    };

    let rpc_port: u16 = std::env::var("LEDGERD_RPC_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(config::DEFAULT_PORT + 1);

    let addr = format!("{RPC_BIND_ADDRESS}:{rpc_port}");
    let mut stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(_) => {
            eprintln!("{} cannot connect to ledgerd at {}", "error:".bright_red().bold(), addr);
            eprintln!("Is the daemon running? Start it with: {}", "ledgerd".bright_yellow().bold());
            std::process::exit(1);
        }
    };

    let request_body = serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });

    let body = serde_json::to_string(&request_body)?;
    let http_request = format!(
        "POST / HTTP/1.1\r\nHost: 127.0.0.1\r\nAuthorization: Bearer {token}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body,
    );

    stream.write_all(http_request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    let response_str = String::from_utf8_lossy(&response);

    if let Some(body_start) = response_str.find("\r\n\r\n") {
        let json_body = &response_str[body_start + 4..];
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(json_body) {
            if let Some(result) = parsed.get("result") {
                println!("{}", serde_json::to_string_pretty(result)?.bright_white());
            } else if let Some(error) = parsed.get("error") {
                eprintln!("{} {}", "Error:".bright_red().bold(), serde_json::to_string_pretty(error)?);
                std::process::exit(1);
            }
        } else {
            println!("{json_body}");
        }
    }

    Ok(())
}
