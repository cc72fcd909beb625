//! Coordinated teardown of in-flight containers and streams
//!
//! Containers are registered right after creation and deregistered after
//! they terminate normally. On the first interrupt every registered entry is
//! stopped concurrently; later interrupts are ignored.

use fclocal_provider::{ContainerEngine, ContainerId, ProviderError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

enum ActiveEntry {
    Container(ContainerId),
    /// In-flight build or pull, cancelled through its token
    Stream(CancellationToken),
}

/// Process-wide registry of running containers plus the interrupt handler
pub struct ShutdownCoordinator {
    engine: Arc<dyn ContainerEngine>,
    active: Mutex<HashMap<String, ActiveEntry>>,
    stopping: AtomicBool,
    input: CancellationToken,
    done: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            engine,
            active: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            input: CancellationToken::new(),
            done,
        })
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveEntry>> {
        // A panic while holding the lock leaves the map itself intact
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a container for teardown
    ///
    /// Returns false once shutdown has begun; the caller then owns the
    /// cleanup of `id`. The flag is read under the registry lock, so an entry
    /// is either drained by [`shutdown`](Self::shutdown) or refused here.
    pub fn register_container(&self, id: &ContainerId) -> bool {
        let mut entries = self.entries();
        if self.is_stopping() {
            tracing::debug!("Refusing container {} during shutdown", id.short());
            return false;
        }
        tracing::debug!("Registering container {}", id.short());
        entries.insert(id.0.clone(), ActiveEntry::Container(id.clone()));
        true
    }

    pub fn deregister_container(&self, id: &ContainerId) {
        if self.entries().remove(&id.0).is_some() {
            tracing::debug!("Deregistered container {}", id.short());
        }
    }

    /// Register a cancellable stream under `key`
    ///
    /// During shutdown the returned token is already cancelled.
    pub fn register_stream(&self, key: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut entries = self.entries();
        if self.is_stopping() {
            token.cancel();
        } else {
            entries.insert(key.to_string(), ActiveEntry::Stream(token.clone()));
        }
        token
    }

    pub fn deregister_stream(&self, key: &str) {
        self.entries().remove(key);
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.entries().len()
    }

    /// Cancelled once shutdown begins; input pumps stop forwarding
    pub fn input_token(&self) -> CancellationToken {
        self.input.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Stop everything registered
    ///
    /// Returns false when a shutdown already ran or is running.
    pub async fn shutdown(&self) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            tracing::debug!("Shutdown already in progress");
            return false;
        }
        self.input.cancel();

        let entries: Vec<ActiveEntry> = self.entries().drain().map(|(_, e)| e).collect();

        let mut containers = Vec::new();
        for entry in entries {
            match entry {
                ActiveEntry::Stream(token) => token.cancel(),
                ActiveEntry::Container(id) => containers.push(id),
            }
        }

        if !containers.is_empty() {
            tracing::info!("Received cancel request, stopping running containers...");
        }

        let stops = containers.iter().map(|id| async move {
            tracing::info!("Stopping container {}", id.short());
            (id, self.engine.stop(id).await)
        });
        let mut failed = 0;
        for (id, result) in futures::future::join_all(stops).await {
            match result {
                Ok(()) => {}
                Err(ProviderError::NotFound(_)) => {
                    tracing::debug!("Container {} already gone", id.short());
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!("Failed to stop container {}: {}", id.short(), e);
                }
            }
        }

        if !containers.is_empty() && failed == 0 {
            tracing::info!("All containers stopped");
        }

        self.done.send_replace(true);
        true
    }

    /// Resolves once a shutdown has completed
    pub async fn finished(&self) {
        let mut rx = self.done.subscribe();
        // Sender lives in self, so wait_for cannot fail while self is borrowed
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Run [`shutdown`](Self::shutdown) on Ctrl-C; repeated interrupts are no-ops
    pub fn install_signal_handler(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Cannot listen for interrupts: {}", e);
                    return;
                }
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    coordinator.shutdown().await;
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockCall, MockEngine};
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_stops_all_containers_once() {
        let engine = Arc::new(MockEngine::new());
        let coordinator = ShutdownCoordinator::new(engine.clone());

        let a = ContainerId::new("container_a");
        let b = ContainerId::new("container_b");
        coordinator.register_container(&a);
        coordinator.register_container(&b);
        assert_eq!(coordinator.active_count(), 2);

        assert!(coordinator.shutdown().await);
        assert_eq!(coordinator.active_count(), 0);
        assert!(engine.was_called(&MockCall::Stop { id: "container_a".into() }));
        assert!(engine.was_called(&MockCall::Stop { id: "container_b".into() }));

        assert!(!coordinator.shutdown().await);
        let stops = engine
            .get_calls()
            .into_iter()
            .filter(|c| matches!(c, MockCall::Stop { .. }))
            .count();
        assert_eq!(stops, 2);
    }

    #[tokio::test]
    async fn test_concurrent_interrupts_single_cleanup() {
        let engine = Arc::new(MockEngine::new());
        *engine.stop_delay.lock().unwrap() = Duration::from_millis(50);
        let coordinator = ShutdownCoordinator::new(engine.clone());
        coordinator.register_container(&ContainerId::new("c1"));
        coordinator.register_container(&ContainerId::new("c2"));

        let (first, second) = tokio::join!(coordinator.shutdown(), coordinator.shutdown());
        assert!(first ^ second);
        assert_eq!(engine.count_calls(|c| matches!(c, MockCall::Stop { .. })), 2);
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_streams_and_input() {
        let engine = Arc::new(MockEngine::new());
        let coordinator = ShutdownCoordinator::new(engine.clone());
        let token = coordinator.register_stream("build:demo");
        let input = coordinator.input_token();
        assert!(coordinator.is_registered("build:demo"));

        coordinator.shutdown().await;
        assert!(token.is_cancelled());
        assert!(input.is_cancelled());
        assert!(coordinator.is_stopping());
        assert!(engine.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_errors_do_not_abort_cleanup() {
        let engine = Arc::new(MockEngine::new());
        *engine.stop_error.lock().unwrap() = Some("daemon unavailable".into());
        let coordinator = ShutdownCoordinator::new(engine.clone());
        coordinator.register_container(&ContainerId::new("c1"));
        coordinator.register_container(&ContainerId::new("c2"));

        assert!(coordinator.shutdown().await);
        assert_eq!(engine.count_calls(|c| matches!(c, MockCall::Stop { .. })), 2);
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_finished_resolves_after_shutdown() {
        let engine = Arc::new(MockEngine::new());
        let coordinator = ShutdownCoordinator::new(engine);
        let waiter = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.finished().await })
        };
        coordinator.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_registration_refused_after_shutdown() {
        let engine = Arc::new(MockEngine::new());
        let coordinator = ShutdownCoordinator::new(engine.clone());
        assert!(coordinator.register_container(&ContainerId::new("early")));
        coordinator.shutdown().await;

        assert!(!coordinator.register_container(&ContainerId::new("late")));
        assert!(!coordinator.is_registered("late"));
        assert!(coordinator.register_stream("pull:late").is_cancelled());
        assert_eq!(coordinator.active_count(), 0);
    }

    #[test]
    fn test_deregister() {
        let coordinator = ShutdownCoordinator::new(Arc::new(MockEngine::new()));
        let id = ContainerId::new("c");
        coordinator.register_container(&id);
        coordinator.deregister_container(&id);
        assert!(!coordinator.is_registered("c"));
    }
}
