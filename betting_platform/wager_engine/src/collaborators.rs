//! Narrow seams to the systems the engine does not own: identity, group
//! membership, proof storage and wall-clock time. In-memory implementations
//! back tests and single-process embedding.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::{DashMap, DashSet};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult, ErrorContext, ErrorKind};
use crate::types::{GroupId, UserId};

/// Resolves the caller of the current request
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Fails with `Unauthenticated` when the session maps to no user
    async fn resolve_current_user(&self, session: &str) -> EngineResult<UserId>;
}

#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    async fn is_member(&self, user: UserId, group: GroupId) -> EngineResult<bool>;
}

/// Storage for proof uploads; returns a URL the proof can be fetched from
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store(&self, bytes: Vec<u8>, content_type: &str) -> EngineResult<String>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
    }
}

/// Session token → user map
#[derive(Default)]
pub struct InMemoryIdentity {
    sessions: DashMap<String, UserId>,
}

impl InMemoryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `user` and return its token
    pub fn session_for(&self, user: UserId) -> String {
        let token = format!("session-{}", user);
        self.sessions.insert(token.clone(), user);
        token
    }

    pub fn revoke(&self, session: &str) {
        self.sessions.remove(session);
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentity {
    async fn resolve_current_user(&self, session: &str) -> EngineResult<UserId> {
        self.sessions.get(session).map(|entry| *entry.value()).ok_or_else(|| {
            EngineError::new(
                ErrorKind::Unauthenticated,
                "no user for session",
                ErrorContext::new("identity", "resolve_current_user"),
            )
        })
    }
}

#[derive(Default)]
pub struct InMemoryMembership {
    members: DashSet<(GroupId, UserId)>,
}

impl InMemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, group: GroupId, user: UserId) {
        self.members.insert((group, user));
    }

    pub fn remove_member(&self, group: GroupId, user: UserId) {
        self.members.remove(&(group, user));
    }
}

#[async_trait]
impl MembershipDirectory for InMemoryMembership {
    async fn is_member(&self, user: UserId, group: GroupId) -> EngineResult<bool> {
        Ok(self.members.contains(&(group, user)))
    }
}

/// A stored proof blob
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: DashMap<String, StoredBlob>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<StoredBlob> {
        self.blobs.get(url).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn store(&self, bytes: Vec<u8>, content_type: &str) -> EngineResult<String> {
        if bytes.is_empty() {
            return Err(EngineError::validation(
                "proof",
                "proof upload is empty",
                ErrorContext::new("blob_store", "store"),
            ));
        }
        let url = format!("memory://proofs/{}", Uuid::new_v4());
        self.blobs.insert(
            url.clone(),
            StoredBlob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(url)
    }
}
