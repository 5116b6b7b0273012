//! Fake [`KeyValueStore`], [`ObjectStore`], and [`BackendClient`] backends.
//!
//! [`InMemoryKv`] is enough on its own to exercise [`crate::repo::KvJobRepository`]
//! and [`crate::rate_limit`] without a real Redis; the job-repository layer is
//! not faked separately since it is pure logic over [`KeyValueStore`].

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::backend::{ArtifactBytes, BackendClient, BackendError, ImageRef, PollOutcome, PromptHandle};
use crate::kv::{KeyValueStore, KvError, MessageStream};
use crate::model::GenerationRequest;
use crate::storage::{ObjectStore, StorageError};

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    strings: HashMap<String, StringEntry>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    queues: HashMap<String, VecDeque<String>>,
}

/// Single-process stand-in for the Redis-compatible store, used by unit and
/// property tests. Not suitable for anything beyond a single test process.
#[derive(Default)]
pub struct InMemoryKv {
    state: Mutex<State>,
    channels: Mutex<HashMap<String, tokio::sync::broadcast::Sender<String>>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, name: &str) -> tokio::sync::broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(name.to_string())
            .or_insert_with(|| tokio::sync::broadcast::channel(64).0)
            .clone()
    }

    fn expire_if_needed(state: &mut State, key: &str) {
        if let Some(entry) = state.strings.get(key) {
            if matches!(entry.expires_at, Some(at) if Instant::now() >= at) {
                state.strings.remove(key);
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKv {
    async fn hash_set(&self, key: &str, fields: &HashMap<String, String>) -> Result<(), KvError> {
        let mut state = self.state.lock().unwrap();
        state.hashes.entry(key.to_string()).or_default().extend(fields.clone());
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>, KvError> {
        let state = self.state.lock().unwrap();
        Ok(state.hashes.get(key).cloned())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut state = self.state.lock().unwrap();
        Self::expire_if_needed(&mut state, key);
        if state.strings.contains_key(key) {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut state = self.state.lock().unwrap();
        Self::expire_if_needed(&mut state, key);
        Ok(state.strings.get(key).map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut state = self.state.lock().unwrap();
        state.strings.remove(key);
        state.hashes.remove(key);
        state.sets.remove(key);
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        let mut state = self.state.lock().unwrap();
        Self::expire_if_needed(&mut state, key);
        let entry = state.strings.entry(key.to_string()).or_insert_with(|| StringEntry {
            value: "0".to_string(),
            expires_at: None,
        });
        let value: i64 = entry.value.parse().unwrap_or(0) + 1;
        entry.value = value.to_string();
        if value == 1 {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(value)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut state = self.state.lock().unwrap();
        state.sets.entry(key.to_string()).or_default().insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut state = self.state.lock().unwrap();
        if let Some(set) = state.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        let state = self.state.lock().unwrap();
        Ok(state.sets.get(key).map(|set| set.iter().cloned().collect()).unwrap_or_default())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
        let _ = self.channel(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, KvError> {
        let receiver = self.channel(channel).subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(|item| async move { item.ok() });
        Ok(Box::pin(stream))
    }

    async fn queue_push(&self, queue: &str, payload: &str) -> Result<(), KvError> {
        let mut state = self.state.lock().unwrap();
        state.queues.entry(queue.to_string()).or_default().push_back(payload.to_string());
        Ok(())
    }

    async fn queue_pop_blocking(&self, queue: &str, timeout: Duration) -> Result<Option<String>, KvError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(payload) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) {
                    return Ok(Some(payload));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn queue_remove(&self, queue: &str, payload: &str) -> Result<(), KvError> {
        let mut state = self.state.lock().unwrap();
        if let Some(q) = state.queues.get_mut(queue) {
            q.retain(|item| item != payload);
        }
        Ok(())
    }

    async fn get_ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .strings
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut state = self.state.lock().unwrap();
        Self::expire_if_needed(&mut state, key);
        Ok(state.strings.contains_key(key) || state.hashes.contains_key(key))
    }

    /// No-op: the fake's hash entries don't model expiry, since nothing in
    /// the test suite depends on a job record actually disappearing.
    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), KvError> {
        Ok(())
    }
}

/// In-process object store; `get` lets tests assert on uploaded bytes (§8
/// property 10, "artifact addressability").
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn put_object(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String, StorageError> {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(format!("memory/{key}"))
    }

    async fn presign_get(&self, key: &str, _ttl: Duration) -> Result<String, StorageError> {
        Ok(format!("memory://{key}"))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Fake ComfyUI: succeeds after `ticks_to_complete` poll ticks, or rejects
/// every submission if constructed via [`FakeBackendClient::always_rejects`].
pub struct FakeBackendClient {
    ticks_to_complete: u32,
    rejects: bool,
    ticks_seen: Mutex<HashMap<String, u32>>,
}

impl FakeBackendClient {
    pub fn new(ticks_to_complete: u32) -> Self {
        Self {
            ticks_to_complete: ticks_to_complete.max(1),
            rejects: false,
            ticks_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn always_rejects() -> Self {
        Self {
            ticks_to_complete: 1,
            rejects: true,
            ticks_seen: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BackendClient for FakeBackendClient {
    async fn submit(&self, request: &GenerationRequest) -> Result<PromptHandle, BackendError> {
        if self.rejects {
            return Err(BackendError::Rejection("fake backend rejects all submissions".to_string()));
        }
        let seed = crate::backend::workflow::resolve_seed(request);
        let prompt_id = format!("fake-{}", uuid::Uuid::new_v4());
        self.ticks_seen.lock().unwrap().insert(prompt_id.clone(), 0);
        Ok(PromptHandle { prompt_id, resolved_seed: seed })
    }

    async fn poll_once(&self, prompt_id: &str) -> Result<PollOutcome, BackendError> {
        let mut seen = self.ticks_seen.lock().unwrap();
        let ticks = seen.entry(prompt_id.to_string()).or_insert(0);
        *ticks += 1;
        if *ticks >= self.ticks_to_complete {
            Ok(PollOutcome::Succeeded {
                images: vec![ImageRef {
                    filename: "fake.png".to_string(),
                    subfolder: String::new(),
                    image_type: "output".to_string(),
                }],
            })
        } else {
            Ok(PollOutcome::Pending {
                progress: Some(f64::from(*ticks) / f64::from(self.ticks_to_complete)),
            })
        }
    }

    async fn fetch_artifact(&self, _image_ref: &ImageRef) -> Result<ArtifactBytes, BackendError> {
        const MINIMAL_PNG: [u8; 67] = [
            0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52, 0x00,
            0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x02, 0x00, 0x00, 0x00, 0x90, 0x77, 0x53, 0xDE, 0x00,
            0x00, 0x00, 0x0C, 0x49, 0x44, 0x41, 0x54, 0x08, 0xD7, 0x63, 0xF8, 0xCF, 0xC0, 0x00, 0x00, 0x03, 0x01,
            0x01, 0x00, 0x18, 0xDD, 0x8D, 0xB0, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60,
            0x82,
        ];
        Ok(ArtifactBytes {
            bytes: MINIMAL_PNG.to_vec(),
            width: Some(1),
            height: Some(1),
        })
    }

    async fn health(&self) -> bool {
        !self.rejects
    }
}
