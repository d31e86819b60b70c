//! One SSH session per distinct connection descriptor.
//!
//! Each descriptor owns a slot holding a `OnceCell` with the outcome of one
//! establishment attempt. The map lock is only held to find or create the
//! slot; establishment runs under the slot's own cell, so callers for the same
//! descriptor wait for a single attempt while callers for other descriptors
//! proceed. Everyone waiting on an attempt gets its outcome, failures included.
//! A failed slot is removed from the map, and the next caller starts over.

use crate::descriptor::ConnectionDescriptor;
use crate::error::TunnelError;
use crate::establisher::{TunnelEstablisher, TunnelSession};
use async_channel::{Receiver, Sender};
use async_lock::{Mutex, OnceCell};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Events buffered for subscribers before new ones are dropped
const EVENT_BUFFER: usize = 256;

type Outcome = Result<Arc<TunnelSession>, TunnelError>;
type Slot = Arc<OnceCell<Outcome>>;

/// When a cached session may be handed out again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReusePolicy {
    /// Keep every session for the life of the cache
    #[default]
    Forever,
    /// Check the session before reuse and re-establish it once if it died
    VerifyLiveness,
}

/// Session lifecycle states
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelState {
    Establishing,
    Established { local_addr: String },
    Failed { error: String },
    /// Shut down through eviction, cache shutdown or a failed liveness check
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TunnelEvent {
    /// `user@bastion:port -> host:port`
    pub target: String,
    /// Set once a session exists
    pub session_id: Option<Uuid>,
    pub state: TunnelState,
}

/// Process-wide registry of live tunnels keyed by descriptor.
pub struct TunnelCache {
    sessions: Mutex<HashMap<ConnectionDescriptor, Slot>>,
    policy: ReusePolicy,
    event_tx: Sender<TunnelEvent>,
    event_rx: Receiver<TunnelEvent>,
}

impl TunnelCache {
    pub fn new() -> Self {
        Self::with_policy(ReusePolicy::default())
    }

    pub fn with_policy(policy: ReusePolicy) -> Self {
        let (event_tx, event_rx) = async_channel::bounded(EVENT_BUFFER);
        Self {
            sessions: Mutex::new(HashMap::new()),
            policy,
            event_tx,
            event_rx,
        }
    }

    pub fn policy(&self) -> ReusePolicy {
        self.policy
    }

    /// Receive lifecycle events.
    ///
    /// Receivers share one queue, so each event reaches one of them. Events are
    /// dropped while the queue is full.
    pub fn subscribe(&self) -> Receiver<TunnelEvent> {
        self.event_rx.clone()
    }

    /// Return the session for `descriptor`, establishing it if needed.
    pub async fn get_or_create(
        &self,
        descriptor: &ConnectionDescriptor,
        establisher: &dyn TunnelEstablisher,
    ) -> Result<Arc<TunnelSession>, TunnelError> {
        let slot = self.slot(descriptor).await;
        let session = self.get_or_establish(&slot, descriptor, establisher).await?;

        if self.policy == ReusePolicy::VerifyLiveness && !session.is_alive().await {
            tracing::warn!(
                "Cached tunnel {} for {} is no longer alive, re-establishing",
                session.local_addr(),
                describe(descriptor)
            );
            self.discard_dead(descriptor, &slot, &session).await;

            let slot = self.slot(descriptor).await;
            return self.get_or_establish(&slot, descriptor, establisher).await;
        }

        tracing::debug!(
            "Reusing tunnel {} for {}",
            session.local_addr(),
            describe(descriptor)
        );
        Ok(session)
    }

    /// Remove and shut down the session for `descriptor`.
    ///
    /// Returns false when no established session was cached. An establishment
    /// still in flight completes for its waiters but is not cached.
    pub async fn evict(&self, descriptor: &ConnectionDescriptor) -> bool {
        let slot = self.sessions.lock().await.remove(descriptor);
        match slot.as_ref().and_then(|slot| slot.get()) {
            Some(Ok(session)) => {
                tracing::info!("Evicting tunnel {} for {}", session.local_addr(), describe(descriptor));
                session.shutdown().await;
                self.emit(descriptor, Some(session.id()), TunnelState::Closed);
                true
            }
            _ => false,
        }
    }

    /// Shut down every cached session and empty the cache.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = self.sessions.lock().await.drain().collect();
        tracing::info!("Shutting down {} cached tunnel(s)", slots.len());

        for (descriptor, slot) in slots {
            if let Some(Ok(session)) = slot.get() {
                session.shutdown().await;
                self.emit(&descriptor, Some(session.id()), TunnelState::Closed);
            }
        }
    }

    /// Number of established sessions.
    pub async fn len(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|slot| matches!(slot.get(), Some(Ok(_))))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Find the slot for `descriptor`, replacing one whose attempt failed.
    async fn slot(&self, descriptor: &ConnectionDescriptor) -> Slot {
        let mut sessions = self.sessions.lock().await;
        let slot = sessions
            .entry(descriptor.clone())
            .and_modify(|slot| {
                if matches!(slot.get(), Some(Err(_))) {
                    *slot = Arc::new(OnceCell::new());
                }
            })
            .or_insert_with(|| Arc::new(OnceCell::new()));
        Arc::clone(slot)
    }

    async fn get_or_establish(
        &self,
        slot: &Slot,
        descriptor: &ConnectionDescriptor,
        establisher: &dyn TunnelEstablisher,
    ) -> Result<Arc<TunnelSession>, TunnelError> {
        let outcome = slot
            .get_or_init(|| async {
                tracing::info!("Establishing tunnel for {}", describe(descriptor));
                self.emit(descriptor, None, TunnelState::Establishing);

                match establisher.establish(descriptor).await {
                    Ok(session) => {
                        tracing::info!(
                            "Tunnel {} established for {}",
                            session.local_addr(),
                            describe(descriptor)
                        );
                        self.emit(
                            descriptor,
                            Some(session.id()),
                            TunnelState::Established {
                                local_addr: session.local_addr(),
                            },
                        );
                        Ok(Arc::new(session))
                    }
                    Err(e) => {
                        tracing::error!("Tunnel for {} failed: {}", describe(descriptor), e);
                        self.emit(
                            descriptor,
                            None,
                            TunnelState::Failed {
                                error: e.to_string(),
                            },
                        );
                        Err(e)
                    }
                }
            })
            .await
            .clone();

        if outcome.is_err() {
            self.discard_failed(descriptor, slot).await;
        }
        outcome
    }

    /// Drop a failed slot so the next caller starts a new attempt.
    async fn discard_failed(&self, descriptor: &ConnectionDescriptor, slot: &Slot) {
        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(descriptor)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            sessions.remove(descriptor);
        }
    }

    /// Forget a dead session. Only the caller that removes it shuts it down.
    async fn discard_dead(
        &self,
        descriptor: &ConnectionDescriptor,
        slot: &Slot,
        session: &TunnelSession,
    ) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            let current = sessions
                .get(descriptor)
                .is_some_and(|current| Arc::ptr_eq(current, slot));
            if current {
                sessions.remove(descriptor);
            }
            current
        };

        if removed {
            session.shutdown().await;
            self.emit(descriptor, Some(session.id()), TunnelState::Closed);
        }
    }

    fn emit(&self, descriptor: &ConnectionDescriptor, session_id: Option<Uuid>, state: TunnelState) {
        let event = TunnelEvent {
            target: describe(descriptor),
            session_id,
            state,
        };
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::trace!("Dropping tunnel event: {}", e);
        }
    }
}

impl Default for TunnelCache {
    fn default() -> Self {
        Self::new()
    }
}

fn describe(descriptor: &ConnectionDescriptor) -> String {
    match descriptor.remote_port() {
        Some(port) => format!(
            "{} -> {}:{}",
            descriptor.ssh_target(),
            descriptor.remote_host(),
            port
        ),
        None => format!("{} -> {}", descriptor.ssh_target(), descriptor.remote_host()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::establisher::tests::{FakeHandle, descriptor};
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts establishments; the first `fail_first` calls fail.
    #[derive(Default)]
    pub(crate) struct CountingEstablisher {
        pub(crate) calls: AtomicUsize,
        pub(crate) fail_first: usize,
        pub(crate) delay: Duration,
        pub(crate) handles: std::sync::Mutex<Vec<FakeHandle>>,
    }

    impl CountingEstablisher {
        pub(crate) fn failing_first(fail_first: usize) -> Self {
            Self {
                fail_first,
                ..Self::default()
            }
        }

        pub(crate) fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn handle(&self, index: usize) -> FakeHandle {
            self.handles.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl TunnelEstablisher for CountingEstablisher {
        async fn establish(
            &self,
            descriptor: &ConnectionDescriptor,
        ) -> Result<TunnelSession, TunnelError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                smol::Timer::after(self.delay).await;
            }
            if call <= self.fail_first {
                return Err(TunnelError::ssh(
                    descriptor.ssh_target(),
                    anyhow::anyhow!("Connection refused"),
                ));
            }

            let handle = FakeHandle::default();
            self.handles.lock().unwrap().push(handle.clone());
            Ok(TunnelSession::new("127.0.0.1", 40000 + call as u16, handle))
        }
    }

    /// Blocks establishment for one host until released.
    struct GatedEstablisher {
        gated_host: &'static str,
        gate: Receiver<()>,
    }

    #[async_trait]
    impl TunnelEstablisher for GatedEstablisher {
        async fn establish(
            &self,
            descriptor: &ConnectionDescriptor,
        ) -> Result<TunnelSession, TunnelError> {
            if descriptor.remote_host() == self.gated_host {
                let _ = self.gate.recv().await;
            }
            Ok(TunnelSession::new("127.0.0.1", 40000, FakeHandle::default()))
        }
    }

    fn mysql(host: &str) -> ConnectionDescriptor {
        descriptor(&format!("mysql://{}:3306/app", host), None, None)
    }

    #[test]
    fn test_equal_descriptors_share_session() {
        smol::block_on(async {
            let cache = TunnelCache::new();
            let establisher = CountingEstablisher::default();

            let first = cache.get_or_create(&mysql("db"), &establisher).await.unwrap();
            let second = cache.get_or_create(&mysql("db"), &establisher).await.unwrap();

            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(establisher.calls(), 1);
            assert_eq!(cache.len().await, 1);
        });
    }

    #[test]
    fn test_concurrent_callers_establish_once() {
        smol::block_on(async {
            let cache = TunnelCache::new();
            let establisher = CountingEstablisher::with_delay(Duration::from_millis(50));
            let target = mysql("db");

            let sessions = join_all((0..8).map(|_| cache.get_or_create(&target, &establisher))).await;

            assert_eq!(establisher.calls(), 1);
            let ids: Vec<_> = sessions.into_iter().map(|s| s.unwrap().id()).collect();
            assert!(ids.iter().all(|id| *id == ids[0]));
        });
    }

    #[test]
    fn test_failure_is_not_cached() {
        smol::block_on(async {
            let cache = TunnelCache::new();
            let establisher = CountingEstablisher::failing_first(1);

            let err = cache.get_or_create(&mysql("db"), &establisher).await.unwrap_err();
            assert!(matches!(err, TunnelError::SshEstablish { .. }));
            assert!(cache.is_empty().await);

            let session = cache.get_or_create(&mysql("db"), &establisher).await.unwrap();
            assert_eq!(session.local_port(), 40002);
            assert_eq!(establisher.calls(), 2);
        });
    }

    #[test]
    fn test_concurrent_waiters_share_failure() {
        smol::block_on(async {
            let cache = TunnelCache::new();
            let events = cache.subscribe();
            let establisher = CountingEstablisher {
                fail_first: 1,
                delay: Duration::from_millis(20),
                ..CountingEstablisher::default()
            };
            let target = mysql("db");

            let (first, second) = futures::join!(
                cache.get_or_create(&target, &establisher),
                cache.get_or_create(&target, &establisher)
            );

            assert!(matches!(first, Err(TunnelError::SshEstablish { .. })));
            assert!(matches!(second, Err(TunnelError::SshEstablish { .. })));
            assert_eq!(establisher.calls(), 1);
            let failures = std::iter::from_fn(|| events.try_recv().ok())
                .filter(|event| matches!(event.state, TunnelState::Failed { .. }))
                .count();
            assert_eq!(failures, 1);

            // A new call after the failed attempt settles starts over
            cache.get_or_create(&target, &establisher).await.unwrap();
            assert_eq!(establisher.calls(), 2);
            assert_eq!(cache.len().await, 1);
        });
    }

    #[test]
    fn test_failed_slot_is_removed() {
        smol::block_on(async {
            let cache = TunnelCache::new();
            let establisher = CountingEstablisher::failing_first(1);
            let target = mysql("db");

            let pending = cache.slot(&target).await;
            assert!(cache.get_or_create(&target, &establisher).await.is_err());

            assert!(cache.sessions.lock().await.is_empty());
            drop(pending);
        });
    }

    #[test]
    fn test_stale_failed_slot_is_replaced() {
        smol::block_on(async {
            let cache = TunnelCache::new();
            let establisher = CountingEstablisher::failing_first(1);
            let target = mysql("db");

            // A failed outcome still in the map is never handed out again
            let slot = cache.slot(&target).await;
            assert!(cache.get_or_establish(&slot, &target, &establisher).await.is_err());
            cache.sessions.lock().await.insert(target.clone(), Arc::clone(&slot));

            let fresh = cache.slot(&target).await;
            assert!(!Arc::ptr_eq(&fresh, &slot));
            cache.get_or_create(&target, &establisher).await.unwrap();
            assert_eq!(establisher.calls(), 2);
        });
    }

    #[test]
    fn test_distinct_descriptors_do_not_wait_on_each_other() {
        smol::block_on(async {
            let cache = Arc::new(TunnelCache::new());
            let (release, gate) = async_channel::bounded(1);
            let establisher = Arc::new(GatedEstablisher {
                gated_host: "slow",
                gate,
            });

            let slow = smol::spawn({
                let cache = Arc::clone(&cache);
                let establisher = Arc::clone(&establisher);
                async move {
                    cache
                        .get_or_create(&mysql("slow"), establisher.as_ref())
                        .await
                }
            });
            smol::Timer::after(Duration::from_millis(20)).await;

            // Completes while "slow" is still establishing
            let fast = cache
                .get_or_create(&mysql("fast"), establisher.as_ref())
                .await
                .unwrap();

            release.send(()).await.unwrap();
            let slow = slow.await.unwrap();
            assert_ne!(slow.id(), fast.id());
        });
    }

    #[test]
    fn test_forever_policy_reuses_dead_session() {
        smol::block_on(async {
            let cache = TunnelCache::new();
            let establisher = CountingEstablisher::default();

            let first = cache.get_or_create(&mysql("db"), &establisher).await.unwrap();
            establisher.handle(0).dead.store(true, Ordering::SeqCst);
            let second = cache.get_or_create(&mysql("db"), &establisher).await.unwrap();

            assert_eq!(first.id(), second.id());
            assert_eq!(establisher.calls(), 1);
        });
    }

    #[test]
    fn test_verify_liveness_replaces_dead_session() {
        smol::block_on(async {
            let cache = TunnelCache::with_policy(ReusePolicy::VerifyLiveness);
            let establisher = CountingEstablisher::default();

            let first = cache.get_or_create(&mysql("db"), &establisher).await.unwrap();
            establisher.handle(0).dead.store(true, Ordering::SeqCst);
            let second = cache.get_or_create(&mysql("db"), &establisher).await.unwrap();

            assert_ne!(first.id(), second.id());
            assert_eq!(establisher.calls(), 2);
            assert!(establisher.handle(0).shut_down.load(Ordering::SeqCst));
            assert_eq!(cache.len().await, 1);
        });
    }

    #[test]
    fn test_evict_shuts_down_session() {
        smol::block_on(async {
            let cache = TunnelCache::new();
            let establisher = CountingEstablisher::default();
            let target = mysql("db");

            cache.get_or_create(&target, &establisher).await.unwrap();
            assert!(cache.evict(&target).await);
            assert!(establisher.handle(0).shut_down.load(Ordering::SeqCst));
            assert!(!cache.evict(&target).await);

            cache.get_or_create(&target, &establisher).await.unwrap();
            assert_eq!(establisher.calls(), 2);
        });
    }

    #[test]
    fn test_shutdown_closes_everything() {
        smol::block_on(async {
            let cache = TunnelCache::new();
            let establisher = CountingEstablisher::default();

            cache.get_or_create(&mysql("a"), &establisher).await.unwrap();
            cache.get_or_create(&mysql("b"), &establisher).await.unwrap();
            cache.shutdown().await;

            assert!(cache.is_empty().await);
            assert!(establisher.handle(0).shut_down.load(Ordering::SeqCst));
            assert!(establisher.handle(1).shut_down.load(Ordering::SeqCst));
        });
    }

    #[test]
    fn test_lifecycle_events() {
        smol::block_on(async {
            let cache = TunnelCache::new();
            let events = cache.subscribe();
            let establisher = CountingEstablisher::failing_first(1);
            let target = mysql("db");

            let _ = cache.get_or_create(&target, &establisher).await;
            let session = cache.get_or_create(&target, &establisher).await.unwrap();
            cache.evict(&target).await;

            let states: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
                .map(|event| event.state)
                .collect();
            assert_eq!(states[0], TunnelState::Establishing);
            assert!(matches!(states[1], TunnelState::Failed { .. }));
            assert_eq!(states[2], TunnelState::Establishing);
            assert_eq!(
                states[3],
                TunnelState::Established {
                    local_addr: session.local_addr()
                }
            );
            assert_eq!(states[4], TunnelState::Closed);
        });
    }

    #[test]
    fn test_event_target_names_bastion_and_database() {
        smol::block_on(async {
            let cache = TunnelCache::new();
            let events = cache.subscribe();
            cache
                .get_or_create(&mysql("db"), &CountingEstablisher::default())
                .await
                .unwrap();

            let event = events.try_recv().unwrap();
            assert_eq!(event.target, "deploy@bastion.example.com:22 -> db:3306");
            assert_eq!(event.session_id, None);
        });
    }

    #[test]
    fn test_reuse_policy_serde() {
        assert_eq!(
            serde_json::to_string(&ReusePolicy::VerifyLiveness).unwrap(),
            "\"verify-liveness\""
        );
        let policy: ReusePolicy = serde_json::from_str("\"forever\"").unwrap();
        assert_eq!(policy, ReusePolicy::Forever);
    }
}
