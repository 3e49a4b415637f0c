//! Read-side usage tracking feeding the least-recently-used policy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::Gav;

/// When a cached version was last read.
#[async_trait]
pub trait QueryMetricsSource: Send + Sync {
    async fn last_queried(&self, gav: &Gav) -> Option<DateTime<Utc>>;
}

/// Process-local record of version reads.
#[derive(Default)]
pub struct InMemoryQueryMetrics {
    reads: RwLock<HashMap<Gav, DateTime<Utc>>>,
}

impl InMemoryQueryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read of `gav` at `at`. Older timestamps never overwrite newer ones.
    pub fn record(&self, gav: &Gav, at: DateTime<Utc>) {
        if let Ok(mut reads) = self.reads.write() {
            let entry = reads.entry(gav.clone()).or_insert(at);
            if at > *entry {
                *entry = at;
            }
        }
    }

    pub fn forget(&self, gav: &Gav) {
        if let Ok(mut reads) = self.reads.write() {
            reads.remove(gav);
        }
    }
}

#[async_trait]
impl QueryMetricsSource for InMemoryQueryMetrics {
    async fn last_queried(&self, gav: &Gav) -> Option<DateTime<Utc>> {
        self.reads.read().ok()?.get(gav).copied()
    }
}
