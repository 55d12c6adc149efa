//! Collaborator contracts for persistence and quota.
//!
//! The pipeline never talks to a database directly; it hands finalized
//! records to an `ArticleStore` and asks a `QuotaGate` whether a new
//! parse may proceed. In-memory implementations back tests and the
//! CLI; deployments inject their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Completed,
    Failed,
}

/// The finalized record handed to the persistence collaborator for
/// idempotent upsert, keyed by content fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub id: Uuid,
    pub url: String,
    pub title: String,
    pub content: String,
    pub summary: String,
    pub key_points: Vec<String>,
    pub tags: Vec<String>,
    pub language: String,
    pub tokens_in: usize,
    pub tokens_out: usize,
    pub cost_estimate: f64,
    pub status: RecordStatus,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// Persistence contract: idempotent upsert plus fingerprint history
/// lookup for de-duplication.
#[async_trait::async_trait]
pub trait ArticleStore: Send + Sync {
    async fn upsert(&self, record: ArticleRecord) -> Result<()>;
    async fn fingerprint_exists(&self, fingerprint: &str) -> Result<bool>;
}

/// Quota contract: check-and-increment gating whether a new parse may
/// proceed. Returns false when the caller's quota is exhausted.
#[async_trait::async_trait]
pub trait QuotaGate: Send + Sync {
    async fn check_and_increment(&self) -> Result<bool>;
}

/// In-memory store keyed by fingerprint.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ArticleRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, fingerprint: &str) -> Option<ArticleRecord> {
        self.records.read().await.get(fingerprint).cloned()
    }
}

#[async_trait::async_trait]
impl ArticleStore for MemoryStore {
    async fn upsert(&self, record: ArticleRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(record.fingerprint.clone(), record);
        Ok(())
    }

    async fn fingerprint_exists(&self, fingerprint: &str) -> Result<bool> {
        Ok(self.records.read().await.contains_key(fingerprint))
    }
}

/// Quota gate that never rejects.
pub struct UnlimitedQuota;

#[async_trait::async_trait]
impl QuotaGate for UnlimitedQuota {
    async fn check_and_increment(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Quota gate with a fixed budget, for tests and bounded runs.
pub struct FixedQuota {
    remaining: AtomicI64,
}

impl FixedQuota {
    pub fn new(budget: i64) -> Self {
        Self {
            remaining: AtomicI64::new(budget),
        }
    }
}

#[async_trait::async_trait]
impl QuotaGate for FixedQuota {
    async fn check_and_increment(&self) -> Result<bool> {
        Ok(self.remaining.fetch_sub(1, Ordering::SeqCst) > 0)
    }
}
