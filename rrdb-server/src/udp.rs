//! UDP command listener.
//!
//! Fire and forget: each datagram holds one short command and gets no
//! reply. Commands run one at a time in arrival order.

use std::sync::Arc;

use rrdb::Engine;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Receives datagrams until `shutdown` flips.
///
/// Datagrams longer than `max_message_size` are truncated by the receive
/// buffer and then fail to parse.
pub async fn serve(
    socket: UdpSocket,
    engine: Arc<Engine>,
    max_message_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; max_message_size];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, peer)) => {
                    let packet = String::from_utf8_lossy(&buf[..n]).into_owned();
                    tracing::debug!("{peer}: {}", packet.trim());
                    let engine = Arc::clone(&engine);
                    let handled = tokio::task::spawn_blocking(move || {
                        // Failures are logged and counted by the engine.
                        let _ = engine.handle_udp(&packet);
                    })
                    .await;
                    if let Err(e) = handled {
                        tracing::error!("UDP command from {peer} panicked: {e}");
                    }
                }
                Err(e) => tracing::warn!("UDP receive error: {e}"),
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("UDP listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rrdb::{Counter, RegistryOptions};
    use std::time::Duration;

    #[tokio::test]
    async fn test_commands_over_udp() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Engine::open(temp_dir.path(), RegistryOptions::default()).unwrap());

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (_shutdown, rx) = watch::channel(false);
        tokio::spawn(serve(socket, Arc::clone(&engine), 2048, rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for packet in ["c|cpu|1 sec for 1 min", "u|cpu|3|1000", "u|cpu|5|1000", "garbage"] {
            client.send_to(packet.as_bytes(), addr).await.unwrap();
        }

        // Wait for all four datagrams to be processed.
        for _ in 0..100 {
            if engine.status().get(Counter::UdpRequests) == 4
                && engine.status().get(Counter::UdpErrors) == 1
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(engine.status().get(Counter::UdpRequests), 4);
        assert_eq!(engine.status().get(Counter::UdpErrors), 1);
        let result = engine.registry().select("cpu", 1000, 1001, None).unwrap();
        assert_eq!(result.rows()[0].count, 2);
        assert_eq!(result.rows()[0].sum, 8.0);
    }
}
