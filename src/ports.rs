//! Loopback port allocation for container bindings
//!
//! There is no reservation between allocation and use. The caller must hand
//! the port to the container engine immediately to keep the race window
//! small.

use crate::error::GateError;
use tokio::net::TcpListener;

/// Find a TCP port that is currently free on the loopback interface.
///
/// The probe listener is dropped before returning, releasing the port.
pub async fn allocate() -> Result<u16, GateError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(GateError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(GateError::PortAllocation)?
        .port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_returns_free_port() {
        let port = allocate().await.unwrap();
        assert_ne!(port, 0);

        // the port is released and can be bound again
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_allocate_distinct_ports_while_held() {
        let a = allocate().await.unwrap();
        let _hold = TcpListener::bind(("127.0.0.1", a)).await.unwrap();
        let b = allocate().await.unwrap();
        assert_ne!(a, b);
    }
}
