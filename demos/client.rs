//! Minimal relay participant.
//!
//! `cargo run --example client -- [name] [addr]`
//!
//! Lines typed on stdin are sent as messages; `/me text` sends an action and
//! `/urg text` an urgent message. Urgent messages are printed in red.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use text_relay::{
    config::DEFAULT_PORT,
    server::message::{encode_handshake, parse_command, MessageFlags, MessageFrame, ProtocolError},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{tcp::OwnedReadHalf, TcpStream},
};

const COLOR_RED: &str = "\x1b[31m";
const COLOR_RESET: &str = "\x1b[0m";

/// Relayed frames carry the sender prefix, so allow more than the relay accepts inbound.
const MAX_INCOMING: u32 = 16 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let name = match args.next() {
        Some(name) => name,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(b"Name: ").await?;
            stdout.flush().await?;
            stdin.next_line().await?.context("no name given")?
        }
    };
    let addr: SocketAddr = match args.next() {
        Some(addr) => addr.parse().context("invalid relay address")?,
        None => SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
    };

    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(&encode_handshake(name.as_bytes())?).await?;

    let mut incoming = tokio::spawn(print_incoming(reader));

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                if line.is_empty() {
                    continue;
                }
                let (flags, text) = parse_command(&line);
                let frame = MessageFrame::new(flags, text.as_bytes().to_vec());
                writer.write_all(&frame.encode()?).await?;
            }
            _ = &mut incoming => {
                println!("Disconnected from server");
                std::process::exit(1);
            }
        }
    }

    writer.shutdown().await?;
    Ok(())
}

async fn print_incoming(mut reader: OwnedReadHalf) {
    loop {
        match MessageFrame::read_from(&mut reader, MAX_INCOMING).await {
            Ok(frame) => {
                let text = String::from_utf8_lossy(&frame.payload);
                if frame.flags.contains(MessageFlags::URG) {
                    println!("{COLOR_RED}{text}{COLOR_RESET}");
                } else {
                    println!("{text}");
                }
            }
            Err(ProtocolError::Disconnected) => return,
            Err(e) => {
                eprintln!("read error: {e}");
                return;
            }
        }
    }
}
