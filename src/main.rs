use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use punchnet::dht::Dht;
use punchnet::{DhtKey, NodeId, PunchOutcome};

/// Kademlia DHT node with STUN-assisted NAT traversal.
#[derive(Parser)]
#[command(name = "punchnet")]
#[command(author, version, about)]
struct Cli {
    /// Local UDP port
    #[arg(long, default_value_t = 4000)]
    port: u16,

    /// Bootstrap peer as addr:port; absent, this node is a bootstrap itself
    #[arg(long)]
    bootstrap: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let bootstrap_addrs: Vec<SocketAddr> = match &cli.bootstrap {
        Some(addr) => vec![addr
            .parse()
            .with_context(|| format!("invalid bootstrap address {addr:?}"))?],
        None => Vec::new(),
    };

    let dht = Dht::start(&format!("0.0.0.0:{}", cli.port), bootstrap_addrs).await?;

    println!("Node ID: {}", dht.node_info.node_id.to_hex());
    println!("Listening on {}", dht.local_addr());
    if let Some(addr) = &cli.bootstrap {
        println!("Bootstrapping from {addr}");
    } else {
        println!("Running as a bootstrap node");
    }

    let nat_type = dht.detect_nat().await;
    println!("Detected NAT type: {nat_type}");
    match dht.public_endpoint().await {
        Some((ip, port)) => println!("Public endpoint: {ip}:{port}"),
        None => println!("Public endpoint: unknown"),
    }

    println!();
    println!("Commands:");
    println!("  store <key> <value>  - Store a key-value pair");
    println!("  get <key>            - Get a value by key");
    println!("  find <node-id>       - Find the closest nodes to a node ID");
    println!("  ping <node-id>       - Ping a node");
    println!("  connect <node-id>    - Connect to a node using hole punching");
    println!("  info                 - Show node information");
    println!("  quit                 - Quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("\nReceived Ctrl+C, shutting down...");
                break;
            }
            line = lines.next_line() => {
                match line? {
                    None => break,
                    Some(line) => {
                        if !run_command(&dht, line.trim()).await? {
                            break;
                        }
                    }
                }
            }
        }
    }

    dht.shutdown().await?;
    println!("Node stopped");
    Ok(())
}

/// Execute one shell line. Returns false when the shell should exit.
async fn run_command(dht: &Dht, line: &str) -> anyhow::Result<bool> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(true);
    };

    match command {
        "store" => {
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                println!("Usage: store <key> <value>");
                return Ok(true);
            };
            if dht.put(DhtKey::from(key), value.as_bytes().to_vec()).await? {
                println!("Stored successfully: {value}");
            } else {
                println!("Failed to store");
            }
        }
        "get" => {
            let Some(key) = parts.next() else {
                println!("Usage: get <key>");
                return Ok(true);
            };
            match dht.get(DhtKey::from(key)).await? {
                Some(value) => println!("Found value: {}", String::from_utf8_lossy(&value)),
                None => println!("Value not found"),
            }
        }
        "find" => {
            let Some(hex) = parts.next() else {
                println!("Usage: find <node-id>");
                return Ok(true);
            };
            match NodeId::from_hex(hex) {
                Ok(target) => {
                    let nodes = dht.find_node(target).await?;
                    println!("Found {} nodes:", nodes.len());
                    for node in nodes {
                        println!("  {node}");
                    }
                }
                Err(e) => println!("Invalid node ID: {e}"),
            }
        }
        "ping" => {
            let Some(hex) = parts.next() else {
                println!("Usage: ping <node-id>");
                return Ok(true);
            };
            match NodeId::from_hex(hex) {
                Ok(id) => {
                    if dht.ping(id).await? {
                        println!("Ping successful");
                    } else {
                        println!("Ping failed");
                    }
                }
                Err(e) => println!("Invalid node ID: {e}"),
            }
        }
        "connect" => {
            let Some(hex) = parts.next() else {
                println!("Usage: connect <node-id>");
                return Ok(true);
            };
            match NodeId::from_hex(hex) {
                Ok(id) => match dht.connect(id).await? {
                    PunchOutcome::Connected { ip, port } => {
                        println!("Connection established with {ip}:{port}")
                    }
                    PunchOutcome::Failed => println!("Failed to establish connection"),
                },
                Err(e) => println!("Invalid node ID: {e}"),
            }
        }
        "info" => {
            let report = dht.info().await?;
            println!("Node ID: {}", report.my_info.node_id.to_hex());
            println!("Local endpoint: {}", dht.local_addr());
            match report.connection.public_ip {
                Some(ip) => println!("Public endpoint: {}:{}", ip, report.connection.public_port),
                None => println!("Public endpoint: unknown"),
            }
            println!("NAT type: {}", report.connection.nat_type);
            println!("Stored records: {}", report.stored_records);
            println!("Routing table: {} nodes", report.peers.len());
            for peer in report.peers {
                println!("  {peer}");
            }
        }
        "quit" => return Ok(false),
        other => println!("Unknown command: {other}"),
    }
    Ok(true)
}
