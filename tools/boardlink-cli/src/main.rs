//! Command-line client for boardlink-server.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use boardlink_server::protocol::{ClientEvent, DeviceRequest, Envelope, ErrorKind, FlashStart};
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Talk to a boardlink server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server websocket URL
    #[arg(long, env = "BOARDLINK_URL", default_value = "ws://localhost:8080/")]
    url: String,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the attached boards
    List {
        /// Seconds to wait for further notifications
        #[arg(long, default_value_t = 1)]
        wait: u64,
    },
    /// Upload a firmware image and flash it
    Flash {
        device_id: String,
        file: PathBuf,
        /// Module address on multi-port boards
        #[arg(long)]
        address: Option<String>,
        /// Ask the board to verify after writing
        #[arg(long)]
        verify: bool,
        /// Block size; must not exceed the server's maximum message size
        #[arg(long, default_value_t = 1024)]
        block_size: usize,
    },
    /// Check that a board answers
    Ping {
        device_id: String,
        #[arg(long)]
        address: Option<String>,
    },
    /// Reset a board
    Reset {
        device_id: String,
        #[arg(long)]
        address: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("boardlink_cli=debug".parse()?),
            )
            .init();
    }

    let (mut ws, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", args.url))?;
    debug!(url = %args.url, "Connected");

    let result = match args.command {
        Command::List { wait } => list(&mut ws, Duration::from_secs(wait)).await,
        Command::Flash {
            device_id,
            file,
            address,
            verify,
            block_size,
        } => {
            let image = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {:?}", file))?;
            let request = FlashStart {
                device_id,
                file_size: image.len(),
                address,
                verify,
            };
            flash(&mut ws, request, &image, block_size.max(1)).await
        }
        Command::Ping { device_id, address } => {
            let request = DeviceRequest { device_id, address };
            simple(&mut ws, ClientEvent::Ping(request), "pong").await
        }
        Command::Reset { device_id, address } => {
            let request = DeviceRequest { device_id, address };
            simple(&mut ws, ClientEvent::Reset(request), "reset-result").await
        }
    };

    let _ = ws.close(None).await;
    result
}

async fn send(ws: &mut Socket, event: ClientEvent) -> Result<()> {
    let envelope = event
        .to_envelope()
        .context("Event has no text encoding")?;
    ws.send(Message::Text(serde_json::to_string(&envelope)?))
        .await?;
    Ok(())
}

/// Next text envelope, or `None` once the server hangs up.
async fn receive(ws: &mut Socket) -> Result<Option<Envelope>> {
    while let Some(frame) = ws.next().await {
        match frame? {
            Message::Text(text) => {
                let envelope: Envelope = serde_json::from_str(&text)
                    .with_context(|| format!("Unparseable message: {}", text))?;
                debug!(kind = %envelope.kind, "Received");
                return Ok(Some(envelope));
            }
            Message::Close(_) => return Ok(None),
            _ => continue,
        }
    }
    Ok(None)
}

/// Fail on error envelopes.
fn check(envelope: &Envelope) -> Result<()> {
    if let Some(kind) = ErrorKind::parse(&envelope.kind) {
        match envelope.payload.as_str() {
            Some(comment) => bail!("{}: {}", kind, comment),
            None => bail!("{}", kind),
        }
    }
    Ok(())
}

fn print_device(envelope: &Envelope) {
    let p = &envelope.payload;
    let id = p["deviceID"].as_str().unwrap_or("?");
    let name = p["name"].as_str().unwrap_or("?");
    match envelope.kind.as_str() {
        "device" => println!("{}\t{}\t{}", id, name, p["portName"].as_str().unwrap_or("-")),
        "ms-device" => println!("{}\t{}\t{}", id, name, p["portNames"]),
        "device-update-delete" => println!("{}\tremoved", id),
        "device-update-port" => println!("{}\tports {}", id, p["portNames"]),
        _ => {}
    }
}

async fn list(ws: &mut Socket, wait: Duration) -> Result<()> {
    send(ws, ClientEvent::GetList).await?;
    loop {
        match tokio::time::timeout(wait, receive(ws)).await {
            Err(_) | Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(envelope))) => {
                check(&envelope)?;
                print_device(&envelope);
            }
            Ok(Err(e)) => return Err(e),
        }
    }
}

async fn flash(ws: &mut Socket, request: FlashStart, image: &[u8], block_size: usize) -> Result<()> {
    let device_id = request.device_id.clone();
    send(ws, ClientEvent::FlashStart(request)).await?;

    let mut blocks = image.chunks(block_size);
    let mut sent = 0;
    while let Some(envelope) = receive(ws).await? {
        check(&envelope)?;
        match envelope.kind.as_str() {
            "flash-next-block" => {
                let block = blocks.next().context("Server asked for more data than the image holds")?;
                sent += block.len();
                debug!(sent, total = image.len(), "Block");
                ws.send(Message::Binary(block.to_vec())).await?;
            }
            "flash-backtrack-ms" => {
                let p = &envelope.payload;
                println!(
                    "{} {}/{}",
                    p["uploadStage"].as_str().unwrap_or("?"),
                    p["curPack"],
                    p["totalPacks"]
                );
            }
            "flash-done" => {
                println!("{}", envelope.payload["avrdudeMsg"].as_str().unwrap_or(""));
                println!("{} flashed", device_id);
                return Ok(());
            }
            _ => print_device(&envelope),
        }
    }
    bail!("Connection closed before the flash finished")
}

/// Send one request and print the matching reply.
async fn simple(ws: &mut Socket, event: ClientEvent, reply: &str) -> Result<()> {
    send(ws, event).await?;
    while let Some(envelope) = receive(ws).await? {
        check(&envelope)?;
        if envelope.kind == reply {
            let p = &envelope.payload;
            println!("code {}: {}", p["code"], p["comment"].as_str().unwrap_or(""));
            if p["code"].as_i64() != Some(0) {
                bail!("{} failed", reply);
            }
            return Ok(());
        }
        print_device(&envelope);
    }
    bail!("Connection closed before a reply arrived")
}
