//! Client-facing TCP frame server.
//!
//! One task per connection; bytes accumulate in a buffer and are parsed
//! into frames as they arrive. Malformed frames answer `-ERR` and skip
//! only the bad frame — a command error never drops the connection.

use dkvs_cluster::{Coordinator, ReplicaTransport};
use dkvs_proto::{self as proto, Command, Parse};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Accept connections on `listener` and serve frames against
/// `coordinator` until the listener fails.
pub async fn serve<T: ReplicaTransport>(
    listener: TcpListener,
    coordinator: Arc<Coordinator<T>>,
) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, coordinator).await {
                tracing::debug!("connection from {} ended: {}", peer, e);
            }
        });
    }
}

async fn handle_connection<T: ReplicaTransport>(
    mut stream: TcpStream,
    coordinator: Arc<Coordinator<T>>,
) -> io::Result<()> {
    let _ = stream.set_nodelay(true);
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        // Drain every complete frame currently buffered.
        loop {
            match proto::parse_frame(&buf) {
                Parse::Incomplete => break,
                Parse::Frame { command, consumed } => {
                    buf.drain(..consumed);
                    let word = command_word(&command);
                    dkvs_metrics::metrics().commands.with_label_values(&[word]).inc();
                    let timer = dkvs_metrics::start_command_timer(word);
                    let response = coordinator.handle_command(command).await;
                    drop(timer);
                    stream.write_all(&response).await?;
                }
                Parse::Error { message, consumed } => {
                    buf.drain(..consumed);
                    stream.write_all(&proto::format_error(&message)).await?;
                }
            }
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn command_word(cmd: &Command) -> &'static str {
    match cmd {
        Command::Ping => "PING",
        Command::Get { .. } => "GET",
        Command::Set { .. } => "SET",
        Command::Del { .. } => "DEL",
        Command::Fwd { .. } => "FWD",
        Command::RSet { .. } => "RSET",
        Command::RDel { .. } => "RDEL",
        Command::RGet { .. } => "RGET",
    }
}
