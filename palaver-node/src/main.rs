use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use palaver_node::chat::OnOutput;
use palaver_node::{config, node::ChatNode};
use tokio::io::{AsyncBufReadExt, BufReader};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn usage() -> ! {
    eprintln!("usage: palaver [--version] <external-id>");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut external_id = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("palaver {VERSION}");
                return Ok(());
            }
            _ if external_id.is_none() => external_id = Some(arg),
            _ => usage(),
        }
    }
    let Some(external_id) = external_id else {
        usage();
    };

    let config = config::load();
    let output: OnOutput = Arc::new(|line: &str| println!("{line}"));
    let node = ChatNode::start(&external_id, &config, output)
        .await
        .context("could not start node")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(rest) = line.strip_prefix("/add ") {
                    if let Err(e) = add_command(&node, rest).await {
                        eprintln!("{e}");
                    }
                } else if line == "/quit" {
                    break;
                } else {
                    node.send(line);
                    println!("You > {line}");
                }
            }
        }
    }

    node.stop().await;
    Ok(())
}

async fn add_command(node: &Arc<ChatNode>, args: &str) -> anyhow::Result<()> {
    let mut parts = args.split_whitespace();
    let (Some(host), Some(port), Some(peer)) = (parts.next(), parts.next(), parts.next()) else {
        bail!("usage: /add <host> <port> <peer-id>");
    };
    if parts.next().is_some() {
        bail!("usage: /add <host> <port> <peer-id>");
    }
    let host: IpAddr = host.parse().context("bad host address")?;
    let port: u16 = port.parse().context("bad port")?;
    let peer = peer.parse().context("bad peer id")?;
    node.add_peer(host, port, peer).await;
    Ok(())
}
