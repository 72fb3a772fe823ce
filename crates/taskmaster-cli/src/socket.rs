//! Line-oriented control socket: a greeting line, a `> ` prompt, then
//! one command per line until `exit`/`quit` or disconnect.

use crate::commands::{dispatch, CommandContext};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub async fn serve(addr: SocketAddr, ctx: CommandContext) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "control socket listening");

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, ctx).await {
                        warn!(%peer, error = %e, "control socket connection error");
                    }
                });
            }
        }
    }
}

async fn handle_connection(socket: tokio::net::TcpStream, ctx: CommandContext) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half
        .write_all(b"taskmaster control socket\n> ")
        .await?;

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return Ok(()),
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()); };
                let trimmed = line.trim();
                if trimmed == "exit" || trimmed == "quit" {
                    return Ok(());
                }
                if trimmed.is_empty() {
                    write_half.write_all(b"> ").await?;
                    continue;
                }

                for response in dispatch(trimmed, &ctx).await {
                    write_half.write_all(response.as_bytes()).await?;
                    write_half.write_all(b"\n").await?;
                }
                if ctx.shutdown.is_cancelled() {
                    return Ok(());
                }
                write_half.write_all(b"> ").await?;
            }
        }
    }
}
