// notifications/pubsub.rs - Flag Stores with Key Subscriptions
//
//! Key-value stores that publish changes per key.
//!
//! - [`MemoryFlagStore`]: in-process, one `tokio::sync::broadcast` channel per
//!   subscribed key
//! - [`SledFlagStore`]: durable, built on sled `watch_prefix`

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use sled::Tree;
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::NotificationError;

const TREE_FLAGS: &str = "notification_flags";

/// Broadcast buffer per subscribed key
const CHANNEL_CAPACITY: usize = 16;

/// Change observed on a subscribed key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEvent {
    Set(String),
    Deleted,
}

/// Stream of changes to one key. Dropping it unsubscribes.
pub struct KeySubscription {
    events: BoxStream<'static, KeyEvent>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl KeySubscription {
    fn new(events: BoxStream<'static, KeyEvent>) -> Self {
        Self {
            events,
            release: None,
        }
    }

    fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }
}

impl Stream for KeySubscription {
    type Item = KeyEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<KeyEvent>> {
        self.get_mut().events.poll_next_unpin(cx)
    }
}

impl Drop for KeySubscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for KeySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySubscription").finish_non_exhaustive()
    }
}

/// Publish/subscribe key-value store holding notification flags
#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, NotificationError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), NotificationError>;

    async fn delete(&self, key: &str) -> Result<(), NotificationError>;

    /// Delete the key only while it still holds `expected`
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, NotificationError>;

    /// Subscribe to changes of one key
    fn subscribe(&self, key: &str) -> KeySubscription;
}

/// In-process flag store
#[derive(Debug, Default)]
pub struct MemoryFlagStore {
    values: DashMap<String, String>,
    channels: Arc<DashMap<String, broadcast::Sender<KeyEvent>>>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, key: &str, event: KeyEvent) {
        if let Some(tx) = self.channels.get(key) {
            // no receivers is fine
            let _ = tx.send(event);
        }
    }

    #[cfg(test)]
    fn subscribed_keys(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn get(&self, key: &str) -> Result<Option<String>, NotificationError> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), NotificationError> {
        self.values.insert(key.to_string(), value.to_string());
        self.publish(key, KeyEvent::Set(value.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), NotificationError> {
        if self.values.remove(key).is_some() {
            self.publish(key, KeyEvent::Deleted);
        }
        Ok(())
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, NotificationError> {
        let removed = self.values.remove_if(key, |_, v| v == expected).is_some();
        if removed {
            self.publish(key, KeyEvent::Deleted);
        }
        Ok(removed)
    }

    fn subscribe(&self, key: &str) -> KeySubscription {
        let rx = self
            .channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        // lagged receivers skip the missed events
        let events = BroadcastStream::new(rx)
            .filter_map(|event| async move { event.ok() })
            .boxed();

        let channels = self.channels.clone();
        let key = key.to_string();
        KeySubscription::new(events).on_release(move || {
            // the releasing receiver is still alive here
            channels.remove_if(&key, |_, tx| tx.receiver_count() <= 1);
        })
    }
}

/// Durable flag store on sled
#[derive(Clone)]
pub struct SledFlagStore {
    flags: Tree,
}

impl fmt::Debug for SledFlagStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledFlagStore")
            .field("len", &self.flags.len())
            .finish()
    }
}

fn store_error(e: sled::Error) -> NotificationError {
    NotificationError::Store(e.to_string())
}

impl SledFlagStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, NotificationError> {
        Self::from_db(&sled::open(path).map_err(store_error)?)
    }

    /// Create a temporary store (for testing)
    pub fn in_memory() -> Result<Self, NotificationError> {
        Self::from_db(
            &sled::Config::new()
                .temporary(true)
                .open()
                .map_err(store_error)?,
        )
    }

    fn from_db(db: &sled::Db) -> Result<Self, NotificationError> {
        Ok(Self {
            flags: db.open_tree(TREE_FLAGS).map_err(store_error)?,
        })
    }
}

#[async_trait]
impl FlagStore for SledFlagStore {
    async fn get(&self, key: &str) -> Result<Option<String>, NotificationError> {
        match self.flags.get(key).map_err(store_error)? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| NotificationError::Codec(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), NotificationError> {
        self.flags.insert(key, value.as_bytes()).map_err(store_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), NotificationError> {
        self.flags.remove(key).map_err(store_error)?;
        Ok(())
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, NotificationError> {
        let swapped = self
            .flags
            .compare_and_swap(key, Some(expected.as_bytes()), None::<&[u8]>)
            .map_err(store_error)?;
        Ok(swapped.is_ok())
    }

    fn subscribe(&self, key: &str) -> KeySubscription {
        let subscriber = self.flags.watch_prefix(key.as_bytes());
        let key = key.as_bytes().to_vec();

        let events = stream::unfold(subscriber, |mut subscriber| async move {
            let event = (&mut subscriber).await?;
            Some((event, subscriber))
        })
        .filter_map(move |event| {
            // watch_prefix also reports longer keys sharing the prefix
            let matched = match event {
                sled::Event::Insert { key: k, value } if k.as_ref() == key.as_slice() => Some(
                    KeyEvent::Set(String::from_utf8_lossy(&value).into_owned()),
                ),
                sled::Event::Remove { key: k } if k.as_ref() == key.as_slice() => {
                    Some(KeyEvent::Deleted)
                }
                _ => None,
            };
            async move { matched }
        })
        .boxed();

        KeySubscription::new(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn store_contract(store: &dyn FlagStore) {
        assert!(store.get("k").await.unwrap().is_none());

        store.set("k", "1").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("1"));

        assert!(!store.delete_if_eq("k", "2").await.unwrap());
        assert!(store.delete_if_eq("k", "1").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());

        store.set("k", "3").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    async fn subscription_contract(store: &dyn FlagStore) {
        let mut events = store.subscribe("agent1");

        store.set("agent10", "ignored").await.unwrap();
        store.set("agent1", "42").await.unwrap();
        store.delete("agent1").await.unwrap();

        let first = timeout(Duration::from_secs(1), events.next()).await.unwrap();
        assert_eq!(first, Some(KeyEvent::Set("42".to_string())));
        let second = timeout(Duration::from_secs(1), events.next()).await.unwrap();
        assert_eq!(second, Some(KeyEvent::Deleted));
    }

    #[tokio::test]
    async fn test_memory_store() {
        store_contract(&MemoryFlagStore::new()).await;
    }

    #[tokio::test]
    async fn test_memory_subscription() {
        subscription_contract(&MemoryFlagStore::new()).await;
    }

    #[tokio::test]
    async fn test_memory_subscription_release() {
        let store = MemoryFlagStore::new();
        let first = store.subscribe("k");
        let second = store.subscribe("k");
        assert_eq!(store.subscribed_keys(), 1);

        drop(first);
        assert_eq!(store.subscribed_keys(), 1);
        drop(second);
        assert_eq!(store.subscribed_keys(), 0);
    }

    #[tokio::test]
    async fn test_sled_store() {
        store_contract(&SledFlagStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_sled_subscription() {
        subscription_contract(&SledFlagStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_sled_store_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledFlagStore::open(dir.path().join("flags")).unwrap();
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
