//! Container sessions, the reuse registry, and idle reclamation
//!
//! A [`ContainerSession`] is one provisioned container bound to either a
//! single connection (ephemeral mode) or a source address (reuse mode). It
//! is always in exactly one of two states: active (connection counter > 0,
//! no reaper armed) or idle-armed (counter == 0, reaper pending). The epoch
//! counter makes reclamation exactly-once: a reaper that fires after the
//! session was re-attached sees a stale epoch and does nothing.

use crate::docker::{short_id, SharedEngine};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One provisioned container and its connection accounting
pub struct ContainerSession {
    /// Opaque identifier from the container engine
    pub container_id: String,
    /// Display-only prefix of the container id
    pub short_id: String,
    /// Loopback port the container's service is bound to
    pub host_port: u16,
    state: Mutex<SessionState>,
}

struct SessionState {
    /// Connections currently relaying through this container
    active: u32,
    /// Bumped on every attach; a reaper only fires if the epoch it was
    /// armed with is still current
    epoch: u64,
    /// Armed idle reaper, present only while `active == 0`
    reaper: Option<JoinHandle<()>>,
}

impl ContainerSession {
    pub fn new(container_id: String, host_port: u16) -> Self {
        let short = short_id(&container_id);
        Self {
            container_id,
            short_id: short,
            host_port,
            state: Mutex::new(SessionState {
                active: 0,
                epoch: 0,
                reaper: None,
            }),
        }
    }

    /// Bind a new connection to this session: cancel any armed reaper and
    /// increment the counter in one atomic section.
    pub fn attach(&self) {
        let mut state = self.state.lock();
        if let Some(reaper) = state.reaper.take() {
            reaper.abort();
        }
        state.epoch += 1;
        state.active += 1;
    }

    /// Unbind a connection without arming a reaper (ephemeral mode).
    /// Returns the number of connections still attached.
    pub fn detach(&self) -> u32 {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        state.active
    }

    /// Unbind a connection and, if the counter reached zero, arm the reaper
    /// produced by `arm` in the same atomic section. `arm` receives the
    /// current epoch.
    fn detach_and_arm<F>(&self, arm: F) -> bool
    where
        F: FnOnce(u64) -> JoinHandle<()>,
    {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if state.active > 0 {
            return false;
        }
        let handle = arm(state.epoch);
        if let Some(old) = state.reaper.replace(handle) {
            old.abort();
        }
        true
    }

    /// True if no connection is attached and no attach happened since `epoch`
    fn is_idle_at(&self, epoch: u64) -> bool {
        let state = self.state.lock();
        state.active == 0 && state.epoch == epoch
    }

    fn cancel_reaper(&self) {
        if let Some(reaper) = self.state.lock().reaper.take() {
            reaper.abort();
        }
    }

    pub fn active_connections(&self) -> u32 {
        self.state.lock().active
    }
}

/// Reuse-mode registry mapping a session key (source address) to its warm
/// container.
///
/// The map is behind an async mutex held across the provisioning await in
/// [`checkout_or_provision`](SessionRegistry::checkout_or_provision), so two
/// racing connections for the same key cannot both provision. The registry
/// holds a non-owning reference for lookup only; teardown authority stays
/// with the coordinator and the reaper.
pub struct SessionRegistry {
    sessions: tokio::sync::Mutex<HashMap<String, Arc<ContainerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Look up a warm session for `key`, or provision a new one and
    /// register it. Either way the returned session has the calling
    /// connection attached.
    pub async fn checkout_or_provision<F, Fut>(
        &self,
        key: &str,
        provision: F,
    ) -> Result<Arc<ContainerSession>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ContainerSession>>,
    {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(key) {
            session.attach();
            debug!(
                key,
                container_id = %session.short_id,
                active = session.active_connections(),
                "Reusing warm container"
            );
            return Ok(Arc::clone(session));
        }

        let session = Arc::new(provision().await?);
        session.attach();
        sessions.insert(key.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Detach a connection; when the session goes idle, arm a reaper that
    /// reclaims the container after `idle_timeout` with no new connections.
    pub fn release(
        self: &Arc<Self>,
        key: &str,
        session: &Arc<ContainerSession>,
        idle_timeout: Duration,
        engine: SharedEngine,
    ) {
        session.detach_and_arm(|epoch| {
            let registry = Arc::clone(self);
            let key = key.to_string();
            let session = Arc::clone(session);
            tokio::spawn(async move {
                tokio::time::sleep(idle_timeout).await;
                if registry.take_if_idle(&key, &session, epoch).await {
                    info!(key, container_id = %session.short_id, "Idle timeout, reclaiming container");
                    engine.teardown(&session.container_id).await;
                }
            })
        });
    }

    /// Remove `session` from the registry if it is still idle at `epoch`
    /// and still the session registered under `key`. The epoch and counter
    /// are checked under the registry lock, which serialises this against
    /// `checkout_or_provision`, so reclamation happens at most once.
    async fn take_if_idle(&self, key: &str, session: &Arc<ContainerSession>, epoch: u64) -> bool {
        let mut sessions = self.sessions.lock().await;
        if !session.is_idle_at(epoch) {
            return false;
        }
        match sessions.get(key) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Tear down every registered session. Used at shutdown so warm
    /// containers do not outlive the gatekeeper.
    pub async fn drain(&self, engine: &SharedEngine) {
        let drained: Vec<(String, Arc<ContainerSession>)> =
            self.sessions.lock().await.drain().collect();
        for (key, session) in drained {
            session.cancel_reaper();
            info!(key, container_id = %session.short_id, "Draining warm container");
            engine.teardown(&session.container_id).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
