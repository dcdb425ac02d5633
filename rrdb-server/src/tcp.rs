//! TCP statement listener.
//!
//! One statement per connection: the server reads until it sees `;`, the
//! peer closes, or `max_message_size` bytes arrive, executes the statement,
//! writes the response and closes the connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rrdb::{Counter, Engine};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Longest statement accepted, in bytes.
    pub max_message_size: usize,
    /// Time allowed to receive a complete statement.
    pub read_timeout: Duration,
}

/// Accepts connections until `shutdown` flips.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<Engine>,
    limits: Limits,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    engine.status().increment(Counter::TcpConnections);
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, engine, limits).await {
                            tracing::debug!("connection from {peer} failed: {e}");
                        }
                    });
                }
                Err(e) => tracing::warn!("accept error: {e}"),
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("TCP listener stopped");
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<Engine>,
    limits: Limits,
) -> io::Result<()> {
    let read = read_statement(&mut stream, limits.max_message_size);
    let statement = match tokio::time::timeout(limits.read_timeout, read).await {
        Ok(result) => result?,
        Err(_) => {
            engine.status().increment(Counter::TcpTimeouts);
            tracing::debug!("read from {peer} timed out");
            return Ok(());
        }
    };

    let Some(statement) = statement else {
        tracing::debug!("{peer} closed the connection before a complete statement");
        return Ok(());
    };
    tracing::debug!("{peer}: {}", statement.trim());

    let response = tokio::task::spawn_blocking(move || engine.handle_tcp(&statement))
        .await
        .map_err(io::Error::other)?;

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Reads one statement.
///
/// Returns `None` if the peer closed the connection before sending `;` and
/// before filling `max_message_size` bytes. A full buffer without `;` is
/// returned as is and fails to parse downstream.
pub async fn read_statement<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_message_size: usize,
) -> io::Result<Option<String>> {
    let mut buf = Vec::with_capacity(max_message_size.min(1024));
    let mut chunk = [0u8; 1024];

    loop {
        let want = chunk.len().min(max_message_size - buf.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Ok(None);
        }

        let terminated = chunk[..n].contains(&b';');
        buf.extend_from_slice(&chunk[..n]);
        if terminated || buf.len() >= max_message_size {
            return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
        }
    }
}
