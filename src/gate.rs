//! TCP listener and per-connection lifecycle coordination
//!
//! Each accepted connection runs its own task through the same sequence:
//! rate limit (ephemeral mode only), provision or reuse a container, relay
//! bytes, then tear down or hand the session to the idle reaper. A failure
//! anywhere rejects only that connection; the listener keeps running.

use crate::config::GateConfig;
use crate::docker::{ProvisionSpec, SharedEngine};
use crate::error::Result;
use crate::limiter::RateLimiter;
use crate::ports;
use crate::relay;
use crate::session::{ContainerSession, SessionRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How often stale rate-limit entries are swept
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The connection-triggered container gatekeeper
pub struct Gatekeeper {
    config: GateConfig,
    engine: SharedEngine,
    limiter: Arc<RateLimiter>,
    registry: Arc<SessionRegistry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Gatekeeper {
    pub fn new(config: GateConfig, engine: SharedEngine, shutdown_rx: watch::Receiver<bool>) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit()));
        Self {
            config,
            engine,
            limiter,
            registry: SessionRegistry::new(),
            shutdown_rx,
        }
    }

    /// Registry handle, used to drain warm containers at shutdown
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        info!(
            port = self.config.port,
            image = %self.config.image,
            reuse = self.config.reuse,
            rate_limit_ms = self.config.rate_limit_ms,
            timeout_ms = self.config.timeout_ms,
            "Gatekeeper listening"
        );

        // keep the rate-limit map bounded by address churn
        if self.limiter.enabled() {
            let limiter = Arc::clone(&self.limiter);
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(LIMITER_SWEEP_INTERVAL) => {
                            limiter.prune();
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((client, peer)) => {
                            let config = self.config.clone();
                            let engine = Arc::clone(&self.engine);
                            let limiter = Arc::clone(&self.limiter);
                            let registry = Arc::clone(&self.registry);
                            tokio::spawn(async move {
                                handle_client(client, peer, config, engine, limiter, registry).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gatekeeper shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Rate-limit and reuse bucketing key: the client's source address.
/// Clients behind one NAT share a key; accepted limitation.
fn session_key(peer: &SocketAddr) -> String {
    peer.ip().to_string()
}

/// Resolves `true` if the client hangs up before sending anything.
/// If the client sends data first it resolves `false` (the caller's
/// `select!` arm is disabled and the connection proceeds).
async fn client_gone(client: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match client.peek(&mut buf).await {
        Ok(0) => true,
        Ok(_) => false,
        Err(_) => true,
    }
}

async fn handle_client(
    mut client: TcpStream,
    peer: SocketAddr,
    config: GateConfig,
    engine: SharedEngine,
    limiter: Arc<RateLimiter>,
    registry: Arc<SessionRegistry>,
) {
    let key = session_key(&peer);
    info!(peer = %peer, "New connection");

    // reused sessions are never rate limited after their first connection
    if !config.reuse {
        tokio::select! {
            _ = limiter.admit(&key) => {}
            true = client_gone(&mut client) => {
                warn!(peer = %peer, "Client disconnected before admission");
                return;
            }
        }
    }

    let deadline = config.session_deadline();

    if config.reuse {
        let session = match registry
            .checkout_or_provision(&key, || provision_session(&engine, &config))
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Provisioning failed, rejecting connection");
                return;
            }
        };

        info!(
            peer = %peer,
            container_id = %session.short_id,
            active = session.active_connections(),
            "Session attached"
        );

        if let Err(e) = relay::relay(&mut client, session.host_port, deadline).await {
            debug!(peer = %peer, error = %e, "Could not reach container service");
        }

        registry.release(&key, &session, config.idle_timeout(), Arc::clone(&engine));
        info!(
            peer = %peer,
            container_id = %session.short_id,
            active = session.active_connections(),
            "Session detached"
        );
    } else {
        let session = match provision_session(&engine, &config).await {
            Ok(session) => session,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Provisioning failed, rejecting connection");
                return;
            }
        };
        session.attach();
        info!(peer = %peer, container_id = %session.short_id, "Container created");

        if let Err(e) = relay::relay(&mut client, session.host_port, deadline).await {
            debug!(peer = %peer, error = %e, "Could not reach container service");
        }

        session.detach();
        info!(peer = %peer, container_id = %session.short_id, "Session ending");
        engine.teardown(&session.container_id).await;
    }
}

/// Allocate a loopback port and provision a container bound to it
async fn provision_session(engine: &SharedEngine, config: &GateConfig) -> Result<ContainerSession> {
    let host_port = ports::allocate().await?;
    let spec = ProvisionSpec::bound(
        &config.image,
        config.container_port,
        host_port,
        config.pids_limit,
    );
    let provisioned = engine.provision(&spec).await?;
    Ok(ContainerSession::new(provisioned.container_id, host_port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_session_key_drops_port() {
        let peer: SocketAddr = "203.0.113.9:53211".parse().unwrap();
        assert_eq!(session_key(&peer), "203.0.113.9");

        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(session_key(&v6), "2001:db8::1");
    }

    async fn accepted_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        (client, accepted)
    }

    #[tokio::test]
    async fn test_client_gone_detects_hangup() {
        let (client, mut accepted) = accepted_pair().await;
        drop(client);
        assert!(client_gone(&mut accepted).await);
    }

    #[tokio::test]
    async fn test_client_gone_false_when_data_pending() {
        let (mut client, mut accepted) = accepted_pair().await;
        client.write_all(b"x").await.unwrap();
        assert!(!client_gone(&mut accepted).await);
    }
}
