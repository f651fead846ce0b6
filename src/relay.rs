//! Bidirectional byte relay between a client and a container port
//!
//! This is a pass-through splice, not a protocol-aware proxy: whatever
//! bytes arrive on one side are written to the other until either side
//! closes or errors, or the optional hard deadline fires.

use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Outcome of a completed relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// One side closed or errored
    Eof,
    /// The hard session deadline fired
    Deadline,
}

/// Splice bytes between `client` and the container's service on
/// `127.0.0.1:host_port` until either side finishes or `deadline` elapses.
///
/// Completes exactly once. Copy errors are normal session termination and
/// are folded into [`RelayEnd::Eof`]; only the upfront connect to the
/// container can fail.
pub async fn relay(
    client: &mut TcpStream,
    host_port: u16,
    deadline: Option<Duration>,
) -> io::Result<RelayEnd> {
    let mut backend = TcpStream::connect(("127.0.0.1", host_port)).await?;

    let copy = tokio::io::copy_bidirectional(client, &mut backend);

    let end = match deadline {
        Some(limit) => match tokio::time::timeout(limit, copy).await {
            Ok(result) => finish(result),
            Err(_) => {
                debug!(host_port, "Session deadline reached, ending relay");
                RelayEnd::Deadline
            }
        },
        None => finish(copy.await),
    };

    Ok(end)
}

fn finish(result: io::Result<(u64, u64)>) -> RelayEnd {
    match result {
        Ok((to_backend, to_client)) => {
            debug!(to_backend, to_client, "Relay finished");
        }
        Err(e) => {
            // either side dropping mid-stream is not an error worth reporting
            debug!(error = %e, "Relay ended with I/O error");
        }
    }
    RelayEnd::Eof
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Echo server standing in for a container's service
    async fn spawn_echo_backend() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        port
    }

    /// A connected (client, gate-side) socket pair
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (gate_side, _) = listener.accept().await.unwrap();
        (client, gate_side)
    }

    #[tokio::test]
    async fn test_relay_echoes_bytes() {
        let backend_port = spawn_echo_backend().await;
        let (mut client, mut gate_side) = socket_pair().await;

        let handle =
            tokio::spawn(async move { relay(&mut gate_side, backend_port, None).await });

        client.write_all(b"hello container").await.unwrap();
        let mut buf = [0u8; 15];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello container");

        // client disconnect ends the relay
        drop(client);
        let end = handle.await.unwrap().unwrap();
        assert_eq!(end, RelayEnd::Eof);
    }

    #[tokio::test]
    async fn test_relay_fails_when_backend_unreachable() {
        // allocate a port and leave it unbound
        let port = {
            let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            probe.local_addr().unwrap().port()
        };
        let (_client, mut gate_side) = socket_pair().await;

        let result = relay(&mut gate_side, port, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_relay_deadline_ends_idle_session() {
        let backend_port = spawn_echo_backend().await;
        let (client, mut gate_side) = socket_pair().await;

        let start = Instant::now();
        let end = relay(
            &mut gate_side,
            backend_port,
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap();

        assert_eq!(end, RelayEnd::Deadline);
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(start.elapsed() < Duration::from_secs(5));
        drop(client);
    }

    #[tokio::test]
    async fn test_relay_without_deadline_ends_on_backend_close() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let backend_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // accept and immediately hang up
            let _ = listener.accept().await;
        });

        let (mut client, mut gate_side) = socket_pair().await;
        let handle =
            tokio::spawn(async move { relay(&mut gate_side, backend_port, None).await });

        // the backend hangup is propagated to the client as EOF
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        drop(client);
        let end = handle.await.unwrap().unwrap();
        assert_eq!(end, RelayEnd::Eof);
    }
}
