// notifications/mod.rs - New-Message Notifications
//
//! Per-agent "new message arrived" signalling with long-poll support.
//!
//! Two flavours share one implementation, [`NotificationService`], and differ
//! only in their [`FlagCodec`]:
//!
//! - **V1** ([`UnackedFlag`]): a boolean, cleared unconditionally on ack
//! - **V2** ([`UnackedSince`]): the unix-ms time of the last unacked message,
//!   cleared only by an ack at least that recent
//!
//! A long-poll registers a one-shot callback for the agent; the first
//! callback for an agent subscribes its flag key in the [`FlagStore`] and the
//! last deregistration unsubscribes it.

pub mod codec;
pub mod pubsub;

pub use codec::{FlagCodec, UnackedFlag, UnackedSince};
pub use pubsub::{FlagStore, KeyEvent, KeySubscription, MemoryFlagStore, SledFlagStore};

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Notification errors
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Notifications are not available")]
    Unavailable,

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Flag store error: {0}")]
    Store(String),

    #[error("Flag codec error: {0}")]
    Codec(String),
}

/// Current unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Callbacks waiting on one agent, plus the task listening to its flag key
struct PendingCallbacks {
    callbacks: HashMap<Uuid, oneshot::Sender<()>>,
    listener: JoinHandle<()>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingCallbacks>>>;

fn remove_callback(pending: &PendingMap, agent_did: &str, callback_id: Uuid) {
    let mut pending = pending.lock();
    let Some(entry) = pending.get_mut(agent_did) else {
        return;
    };
    entry.callbacks.remove(&callback_id);
    if entry.callbacks.is_empty() {
        if let Some(entry) = pending.remove(agent_did) {
            entry.listener.abort();
            trace!(agent_did, "Unsubscribed notification key");
        }
    }
}

/// Deregisters a long-poll callback however the poll ends
struct CallbackGuard {
    pending: PendingMap,
    agent_did: String,
    callback_id: Uuid,
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        remove_callback(&self.pending, &self.agent_did, self.callback_id);
    }
}

/// Notification service over a flag codec
pub struct NotificationService<C: FlagCodec> {
    store: Option<Arc<dyn FlagStore>>,
    pending: PendingMap,
    _codec: PhantomData<C>,
}

impl<C: FlagCodec> Clone for NotificationService<C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            pending: self.pending.clone(),
            _codec: PhantomData,
        }
    }
}

impl<C: FlagCodec> NotificationService<C> {
    /// Create a service; without a store every operation is `Unavailable`
    pub fn new(store: Option<Arc<dyn FlagStore>>) -> Self {
        Self {
            store,
            pending: Arc::new(Mutex::new(HashMap::new())),
            _codec: PhantomData,
        }
    }

    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    fn store(&self) -> Result<&Arc<dyn FlagStore>, NotificationError> {
        self.store.as_ref().ok_or(NotificationError::Unavailable)
    }

    async fn load(&self, agent_did: &str) -> Result<Option<(String, C::Value)>, NotificationError> {
        match self.store()?.get(&C::key(agent_did)).await? {
            Some(raw) => {
                let value = C::decode(&raw)?;
                Ok(Some((raw, value)))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, agent_did: &str, value: &C::Value) -> Result<(), NotificationError> {
        self.store()?.set(&C::key(agent_did), &C::encode(value)).await
    }

    /// Whether the agent has an unacknowledged message
    pub async fn has_unacked_message(&self, agent_did: &str) -> Result<bool, NotificationError> {
        Ok(self
            .load(agent_did)
            .await?
            .is_some_and(|(_, value)| C::is_pending(&value)))
    }

    /// Register a one-shot callback fired on the next pending flag value
    pub fn register_callback(
        &self,
        agent_did: &str,
        callback_id: Uuid,
    ) -> Result<oneshot::Receiver<()>, NotificationError> {
        let store = self.store()?;
        let (tx, rx) = oneshot::channel();

        let mut pending = self.pending.lock();
        let entry = pending.entry(agent_did.to_string()).or_insert_with(|| {
            trace!(agent_did, "Subscribing notification key");
            let subscription = store.subscribe(&C::key(agent_did));
            PendingCallbacks {
                callbacks: HashMap::new(),
                listener: tokio::spawn(listen::<C>(
                    subscription,
                    self.pending.clone(),
                    agent_did.to_string(),
                )),
            }
        });
        entry.callbacks.insert(callback_id, tx);

        Ok(rx)
    }

    /// Deregister a callback; the key is unsubscribed when none remain
    pub fn cleanup_callback(&self, agent_did: &str, callback_id: Uuid) -> Result<(), NotificationError> {
        self.store()?;
        remove_callback(&self.pending, agent_did, callback_id);
        Ok(())
    }

    /// Wait until the agent has an unacknowledged message or `timeout` passes.
    ///
    /// Returns `true` if a message is pending. The callback is deregistered
    /// even when the returned future is dropped.
    pub async fn wait_for_new_message(
        &self,
        agent_did: &str,
        timeout: Duration,
    ) -> Result<bool, NotificationError> {
        if self.has_unacked_message(agent_did).await? {
            return Ok(true);
        }

        let callback_id = Uuid::new_v4();
        let fired = self.register_callback(agent_did, callback_id)?;
        let _guard = CallbackGuard {
            pending: self.pending.clone(),
            agent_did: agent_did.to_string(),
            callback_id,
        };

        // a flag set before the subscription existed
        if self.has_unacked_message(agent_did).await? {
            return Ok(true);
        }

        tokio::select! {
            result = fired => Ok(result.is_ok()),
            _ = tokio::time::sleep(timeout) => {
                debug!(agent_did, timeout_ms = timeout.as_millis() as u64, "Long-poll timed out");
                Ok(false)
            }
        }
    }

    #[cfg(test)]
    fn waiting_agents(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Fire every callback of the agent whenever its flag becomes pending
async fn listen<C: FlagCodec>(mut subscription: KeySubscription, pending: PendingMap, agent_did: String) {
    while let Some(event) = subscription.next().await {
        let KeyEvent::Set(raw) = event else {
            continue;
        };
        match C::decode(&raw) {
            Ok(value) if C::is_pending(&value) => {}
            Ok(_) => continue,
            Err(e) => {
                warn!(agent_did, error = %e, "Ignoring undecodable notification flag");
                continue;
            }
        }

        let mut waiting = pending.lock();
        if let Some(entry) = waiting.get_mut(&agent_did) {
            for (_, callback) in entry.callbacks.drain() {
                let _ = callback.send(());
            }
        }
    }
}

impl NotificationService<UnackedFlag> {
    pub async fn flag_new_message(&self, agent_did: &str) -> Result<(), NotificationError> {
        self.save(agent_did, &true).await
    }

    /// Clear the flag unconditionally
    pub async fn ack_new_message(&self, agent_did: &str) -> Result<(), NotificationError> {
        self.store()?.delete(&UnackedFlag::key(agent_did)).await
    }
}

impl NotificationService<UnackedSince> {
    /// Record an unacked message received at `utime` (unix ms)
    pub async fn flag_new_message(&self, agent_did: &str, utime: i64) -> Result<(), NotificationError> {
        if utime > now_millis() {
            return Err(NotificationError::InvalidTimestamp(format!(
                "message time {utime} is in the future"
            )));
        }
        self.save(agent_did, &utime).await
    }

    /// Clear the flag if `ack_utime` is not older than the stored time.
    /// A stale ack leaves the flag in place.
    pub async fn ack_new_message(&self, agent_did: &str, ack_utime: i64) -> Result<(), NotificationError> {
        if ack_utime > now_millis() {
            return Err(NotificationError::InvalidTimestamp(format!(
                "ack time {ack_utime} is in the future"
            )));
        }

        let Some((raw, stored)) = self.load(agent_did).await? else {
            return Ok(());
        };
        if ack_utime < stored {
            debug!(agent_did, ack_utime, stored, "Ignoring stale ack");
            return Ok(());
        }

        // a newer flag written meanwhile survives
        self.store()?
            .delete_if_eq(&UnackedSince::key(agent_did), &raw)
            .await?;
        Ok(())
    }
}

/// V1 and V2 notifications over one flag store
#[derive(Clone)]
pub struct Notifier {
    pub v1: NotificationService<UnackedFlag>,
    pub v2: NotificationService<UnackedSince>,
}

impl Notifier {
    pub fn new(store: Option<Arc<dyn FlagStore>>) -> Self {
        Self {
            v1: NotificationService::new(store.clone()),
            v2: NotificationService::new(store),
        }
    }

    /// A notifier whose every operation is `Unavailable`
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_available(&self) -> bool {
        self.v2.is_available()
    }

    /// Raise both flags for the agent. Each flag is attempted even when the
    /// other fails; the first error is returned afterwards.
    pub async fn flag_new_message(&self, agent_did: &str) -> Result<(), NotificationError> {
        let v1 = self.v1.flag_new_message(agent_did).await;
        if let Err(e) = &v1 {
            warn!(agent_did, error = %e, "Failed to raise V1 flag");
        }
        let v2 = self.v2.flag_new_message(agent_did, now_millis()).await;
        if let Err(e) = &v2 {
            warn!(agent_did, error = %e, "Failed to raise V2 flag");
        }
        v1.and(v2)
    }

    /// Clear both flags; V2 only if `ack_utime` (default: now) is recent enough.
    /// A future `ack_utime` is rejected before either flag is touched.
    pub async fn ack_new_message(
        &self,
        agent_did: &str,
        ack_utime: Option<i64>,
    ) -> Result<(), NotificationError> {
        if !self.is_available() {
            return Err(NotificationError::Unavailable);
        }
        let ack_utime = ack_utime.unwrap_or_else(now_millis);
        if ack_utime > now_millis() {
            return Err(NotificationError::InvalidTimestamp(format!(
                "ack time {ack_utime} is in the future"
            )));
        }

        self.v1.ack_new_message(agent_did).await?;
        self.v2.ack_new_message(agent_did, ack_utime).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn memory_store() -> Option<Arc<dyn FlagStore>> {
        Some(Arc::new(MemoryFlagStore::new()))
    }

    /// Memory store whose writes to V1 keys fail
    struct BrokenV1Store {
        inner: MemoryFlagStore,
    }

    impl BrokenV1Store {
        fn check(key: &str) -> Result<(), NotificationError> {
            if key.starts_with(UnackedFlag::KEY_PREFIX) {
                return Err(NotificationError::Store("v1 down".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl FlagStore for BrokenV1Store {
        async fn get(&self, key: &str) -> Result<Option<String>, NotificationError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), NotificationError> {
            Self::check(key)?;
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), NotificationError> {
            Self::check(key)?;
            self.inner.delete(key).await
        }

        async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, NotificationError> {
            Self::check(key)?;
            self.inner.delete_if_eq(key, expected).await
        }

        fn subscribe(&self, key: &str) -> KeySubscription {
            self.inner.subscribe(key)
        }
    }

    #[tokio::test]
    async fn test_v2_flag_survives_v1_failure() {
        let notifier = Notifier::new(Some(Arc::new(BrokenV1Store {
            inner: MemoryFlagStore::new(),
        })));

        assert!(matches!(
            notifier.flag_new_message("a1").await,
            Err(NotificationError::Store(_))
        ));
        assert!(!notifier.v1.has_unacked_message("a1").await.unwrap());
        assert!(notifier.v2.has_unacked_message("a1").await.unwrap());
        assert!(
            notifier
                .v2
                .wait_for_new_message("a1", Duration::from_millis(10))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_future_ack_leaves_both_flags() {
        let notifier = Notifier::new(memory_store());
        notifier.flag_new_message("a1").await.unwrap();

        assert!(matches!(
            notifier.ack_new_message("a1", Some(now_millis() + 60_000)).await,
            Err(NotificationError::InvalidTimestamp(_))
        ));
        assert!(notifier.v1.has_unacked_message("a1").await.unwrap());
        assert!(notifier.v2.has_unacked_message("a1").await.unwrap());

        assert!(matches!(
            Notifier::disabled().ack_new_message("a1", None).await,
            Err(NotificationError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_v1_flag_and_ack() {
        let service = NotificationService::<UnackedFlag>::new(memory_store());
        assert!(!service.has_unacked_message("a1").await.unwrap());

        service.flag_new_message("a1").await.unwrap();
        assert!(service.has_unacked_message("a1").await.unwrap());
        assert!(!service.has_unacked_message("a2").await.unwrap());

        service.ack_new_message("a1").await.unwrap();
        assert!(!service.has_unacked_message("a1").await.unwrap());
    }

    #[tokio::test]
    async fn test_long_poll_returns_immediately_when_flagged() {
        let service = NotificationService::<UnackedSince>::new(memory_store());
        service.flag_new_message("a1", now_millis()).await.unwrap();

        let start = Instant::now();
        let result = service
            .wait_for_new_message("a1", Duration::from_secs(10))
            .await
            .unwrap();

        assert!(result);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(service.waiting_agents(), 0);
    }

    #[tokio::test]
    async fn test_long_poll_times_out() {
        let service = NotificationService::<UnackedSince>::new(memory_store());

        let start = Instant::now();
        let result = service
            .wait_for_new_message("a1", Duration::from_millis(100))
            .await
            .unwrap();

        assert!(!result);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(service.waiting_agents(), 0);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_flag() {
        let service = NotificationService::<UnackedSince>::new(memory_store());

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let result = service
                    .wait_for_new_message("a1", Duration::from_secs(10))
                    .await
                    .unwrap();
                (result, start.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        service.flag_new_message("a1", now_millis()).await.unwrap();

        let (result, elapsed) = waiter.await.unwrap();
        assert!(result);
        assert!(elapsed < Duration::from_secs(5));
        assert_eq!(service.waiting_agents(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_polls_share_subscription() {
        let service = NotificationService::<UnackedSince>::new(memory_store());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .wait_for_new_message("a1", Duration::from_secs(10))
                        .await
                        .unwrap()
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.waiting_agents(), 1);
        service.flag_new_message("a1", now_millis()).await.unwrap();

        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
        assert_eq!(service.waiting_agents(), 0);
    }

    #[tokio::test]
    async fn test_dropped_poll_deregisters() {
        let service = NotificationService::<UnackedSince>::new(memory_store());

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            service.wait_for_new_message("a1", Duration::from_secs(10)),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(service.waiting_agents(), 0);
    }

    #[tokio::test]
    async fn test_v2_stale_ack_is_ignored() {
        let service = NotificationService::<UnackedSince>::new(memory_store());
        let flagged_at = now_millis() - 1_000;
        service.flag_new_message("a1", flagged_at).await.unwrap();

        service.ack_new_message("a1", flagged_at - 1).await.unwrap();
        assert!(service.has_unacked_message("a1").await.unwrap());

        service.ack_new_message("a1", flagged_at).await.unwrap();
        assert!(!service.has_unacked_message("a1").await.unwrap());
    }

    #[tokio::test]
    async fn test_v2_rejects_future_times() {
        let service = NotificationService::<UnackedSince>::new(memory_store());
        let future = now_millis() + 60_000;

        assert!(matches!(
            service.flag_new_message("a1", future).await,
            Err(NotificationError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            service.ack_new_message("a1", future).await,
            Err(NotificationError::InvalidTimestamp(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_without_store() {
        let service = NotificationService::<UnackedFlag>::new(None);

        assert!(matches!(
            service.has_unacked_message("a1").await,
            Err(NotificationError::Unavailable)
        ));
        assert!(matches!(
            service.flag_new_message("a1").await,
            Err(NotificationError::Unavailable)
        ));
        assert!(matches!(
            service.register_callback("a1", Uuid::new_v4()),
            Err(NotificationError::Unavailable)
        ));
        assert!(matches!(
            service
                .wait_for_new_message("a1", Duration::from_millis(10))
                .await,
            Err(NotificationError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_notifier_flags_and_acks_both() {
        let notifier = Notifier::new(memory_store());
        notifier.flag_new_message("a1").await.unwrap();
        assert!(notifier.v1.has_unacked_message("a1").await.unwrap());
        assert!(notifier.v2.has_unacked_message("a1").await.unwrap());

        notifier.ack_new_message("a1", None).await.unwrap();
        assert!(!notifier.v1.has_unacked_message("a1").await.unwrap());
        assert!(!notifier.v2.has_unacked_message("a1").await.unwrap());

        assert!(!Notifier::disabled().is_available());
    }

    #[tokio::test]
    async fn test_long_poll_over_sled_store() {
        let store: Arc<dyn FlagStore> = Arc::new(SledFlagStore::in_memory().unwrap());
        let service = NotificationService::<UnackedSince>::new(Some(store));

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .wait_for_new_message("a1", Duration::from_secs(10))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        service.flag_new_message("a1", now_millis()).await.unwrap();
        assert!(waiter.await.unwrap());
    }
}
