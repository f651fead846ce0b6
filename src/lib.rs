//! Cellgate - a TCP gatekeeper for disposable container backends
//!
//! Cellgate accepts raw TCP connections and hands each client an isolated
//! container instance:
//! - Provisions one container per connection (ephemeral mode) or one per
//!   source address (reuse mode) via the Docker API
//! - Relays bytes transparently between client and container, with an
//!   optional hard session cap
//! - Queues bursts with per-address admission rate limiting
//! - Reclaims reused containers after an idle timeout
//! - Exposes an out-of-band control-plane HTTP API for spawn/stop

pub mod api;
pub mod config;
pub mod docker;
pub mod error;
pub mod gate;
pub mod limiter;
pub mod ports;
pub mod relay;
pub mod session;
