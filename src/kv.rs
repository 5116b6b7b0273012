//! C1 — KV Adapter: typed operations over the key/value store (§4.1).
//!
//! All operations are given a deadline by the caller via `tokio::time::timeout`
//! at the call site; the adapter itself does not retry — that is a property
//! of callers, per spec.md §4.1 ("Retry is not the adapter's concern").

use async_trait::async_trait;
use fred::prelude::*;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;

use crate::errors::SafeDisplay;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key/value store unavailable: {0}")]
    Unavailable(String),
}

impl SafeDisplay for KvError {
    fn to_safe_string(&self) -> String {
        "the key/value store is temporarily unavailable".to_string()
    }
}

impl From<fred::error::Error> for KvError {
    fn from(err: fred::error::Error) -> Self {
        KvError::Unavailable(err.to_string())
    }
}

pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// A namespaced key/value store: hashes, sets, strings with TTL, queues, pub/sub.
///
/// Every key passed in is assumed to already carry the deployment prefix `P`;
/// namespacing is the caller's job (see [`crate::repo`], [`crate::rate_limit`]).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn hash_set(&self, key: &str, fields: &HashMap<String, String>) -> Result<(), KvError>;
    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>, KvError>;

    /// Atomic set-if-absent; returns `true` if this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Atomic increment with TTL applied only on first creation. Returns the
    /// post-increment value.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), KvError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), KvError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError>;
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, KvError>;

    async fn queue_push(&self, queue: &str, payload: &str) -> Result<(), KvError>;
    async fn queue_pop_blocking(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>, KvError>;
    /// Best-effort removal of a specific queued payload (used by cancel-while-queued).
    async fn queue_remove(&self, queue: &str, payload: &str) -> Result<(), KvError>;

    async fn get_ttl(&self, key: &str) -> Result<Option<Duration>, KvError>;
    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    /// Sets (or refreshes) a key's expiration, independent of its value type.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;
}

/// `fred`-backed implementation against a real Redis-compatible store.
pub struct FredKeyValueStore {
    client: fred::clients::Client,
    subscriber: fred::clients::SubscriberClient,
}

impl FredKeyValueStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let config = Config::from_url(url)?;
        let client = Builder::from_config(config.clone()).build()?;
        client.init().await?;

        let subscriber = Builder::from_config(config).build_subscriber_client()?;
        subscriber.init().await?;

        Ok(Self { client, subscriber })
    }
}

#[async_trait]
impl KeyValueStore for FredKeyValueStore {
    async fn hash_set(&self, key: &str, fields: &HashMap<String, String>) -> Result<(), KvError> {
        let pairs: Vec<(String, String)> = fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let _: () = self.client.hset(key, pairs).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>, KvError> {
        let map: HashMap<String, String> = self.client.hgetall(key).await?;
        if map.is_empty() {
            Ok(None)
        } else {
            Ok(Some(map))
        }
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let result: Option<String> = self
            .client
            .set(
                key,
                value,
                Some(Expiration::EX(ttl.as_secs() as i64)),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        Ok(result.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let value: Option<String> = self.client.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let _: i64 = self.client.del(key).await?;
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        let value: i64 = self.client.incr(key).await?;
        if value == 1 {
            let _: () = self.client.expire(key, ttl.as_secs() as i64, None).await?;
        }
        Ok(value)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), KvError> {
        let _: i64 = self.client.sadd(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), KvError> {
        let _: i64 = self.client.srem(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        let members: Vec<String> = self.client.smembers(key).await?;
        Ok(members)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
        let _: i64 = self.client.publish(channel, message).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, KvError> {
        use tokio_stream::StreamExt;

        self.subscriber.subscribe(channel).await?;
        let channel = channel.to_string();
        let stream = self
            .subscriber
            .message_rx()
            .into_stream()
            // `message_rx` is shared across every channel this client has ever
            // subscribed to; without this filter one job's viewer receives
            // every other job's frames too.
            .filter_map(move |message| {
                if message.channel.to_string() == channel {
                    message.value.as_string()
                } else {
                    None
                }
            });

        Ok(Box::pin(stream))
    }

    async fn queue_push(&self, queue: &str, payload: &str) -> Result<(), KvError> {
        let _: i64 = self.client.rpush(queue, payload).await?;
        Ok(())
    }

    async fn queue_pop_blocking(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>, KvError> {
        let result: Option<(String, String)> = self
            .client
            .blpop(queue, timeout.as_secs_f64())
            .await?;
        Ok(result.map(|(_, payload)| payload))
    }

    async fn queue_remove(&self, queue: &str, payload: &str) -> Result<(), KvError> {
        let _: i64 = self.client.lrem(queue, 0, payload).await?;
        Ok(())
    }

    async fn get_ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let ttl: i64 = self.client.ttl(key).await?;
        if ttl < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_secs(ttl as u64)))
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let count: i64 = self.client.exists(key).await?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let _: () = self.client.expire(key, ttl.as_secs() as i64, None).await?;
        Ok(())
    }
}
