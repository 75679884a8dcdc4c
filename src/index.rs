use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bb8_redis::{bb8, RedisConnectionManager};
use redis::AsyncCommands;
use serde::Deserialize;

const META_PREFIX: &str = "META:";
const SCORE_KEY: &str = "DOWNLOAD_SCORES";

const POOL_MAX_SIZE: u32 = 10;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

/// Per-blob record kept in the index, keyed by the full address.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub address: String,
    pub size: i64,
    pub created_at: i64,
    pub score: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index pool error: {0}")]
    Pool(#[from] bb8::RunError<redis::RedisError>),
    #[error("index error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("no score entry for {0}")]
    MissingScore(String),
}

/// Metadata and popularity index for stored blobs.
///
/// Blob metadata lives in a hash record per address; live addresses are also
/// members of one ordered set ranking them by download count. Eviction only
/// ever consults the ordered set, which makes the window between a blob
/// landing on disk and its `save` becoming visible safe.
#[async_trait]
pub trait MetaIndex: Send + Sync {
    /// Upserts the metadata record and registers the address in the
    /// popularity set with its initial score.
    async fn save(&self, meta: &FileMeta) -> Result<(), IndexError>;

    /// Adds one download to the address and returns the new score.
    async fn inc_score(&self, address: &str) -> Result<i64, IndexError>;

    /// Bottom `limit` addresses by score, ascending. A `limit` below one
    /// still yields a single element.
    async fn unused(&self, limit: i64) -> Result<Vec<String>, IndexError>;

    /// Stamps `deleted_at` and the final score into the metadata record and
    /// drops the address from the popularity set.
    async fn mark_deleted(&self, address: &str, deleted_at: i64) -> Result<(), IndexError>;
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn meta_key(address: &str) -> String {
    format!("{META_PREFIX}{address}")
}

/// `MetaIndex` backed by Redis through a bb8 connection pool. Connections
/// are checked out per operation and health-checked with a PING on borrow.
pub struct RedisIndex {
    pool: bb8::Pool<RedisConnectionManager>,
}

impl RedisIndex {
    pub async fn connect(cfg: &RedisConfig) -> Result<Self, IndexError> {
        let host = if cfg.host.is_empty() {
            "127.0.0.1"
        } else {
            cfg.host.as_str()
        };
        let port = if cfg.port == 0 { 6379 } else { cfg.port };

        let manager = RedisConnectionManager::new(format!("redis://{host}:{port}"))?;
        let pool = bb8::Pool::builder()
            .max_size(POOL_MAX_SIZE)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .test_on_check_out(true)
            .build(manager)
            .await?;

        Ok(RedisIndex { pool })
    }
}

#[async_trait]
impl MetaIndex for RedisIndex {
    async fn save(&self, meta: &FileMeta) -> Result<(), IndexError> {
        let mut conn = self.pool.get().await?;

        redis::pipe()
            .hset_multiple(
                meta_key(&meta.address),
                &[("size", meta.size), ("created_at", meta.created_at)],
            )
            .ignore()
            .zadd(SCORE_KEY, &meta.address, meta.score)
            .ignore()
            .query_async::<_, ()>(&mut *conn)
            .await?;

        Ok(())
    }

    async fn inc_score(&self, address: &str) -> Result<i64, IndexError> {
        let mut conn = self.pool.get().await?;

        let score: f64 = conn.zincr(SCORE_KEY, address, 1).await?;
        Ok(score as i64)
    }

    async fn unused(&self, limit: i64) -> Result<Vec<String>, IndexError> {
        let stop = if limit < 1 { 0 } else { limit - 1 };
        let mut conn = self.pool.get().await?;

        let members: Vec<String> = conn.zrange(SCORE_KEY, 0, stop as isize).await?;
        Ok(members)
    }

    async fn mark_deleted(&self, address: &str, deleted_at: i64) -> Result<(), IndexError> {
        let mut conn = self.pool.get().await?;

        let score: Option<f64> = conn.zscore(SCORE_KEY, address).await?;
        let score = score.ok_or_else(|| IndexError::MissingScore(address.to_string()))? as i64;

        redis::pipe()
            .hset_multiple(
                meta_key(address),
                &[("deleted_at", deleted_at), ("score", score)],
            )
            .ignore()
            .zrem(SCORE_KEY, address)
            .ignore()
            .query_async::<_, ()>(&mut *conn)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) use memory::MemoryIndex;

#[cfg(test)]
mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, Default)]
    pub(crate) struct StoredMeta {
        pub size: i64,
        pub created_at: i64,
        pub deleted_at: Option<i64>,
        pub score: i64,
    }

    /// In-memory `MetaIndex` double mirroring the Redis command semantics.
    #[derive(Default)]
    pub(crate) struct MemoryIndex {
        state: Mutex<State>,
    }

    #[derive(Default)]
    struct State {
        records: HashMap<String, StoredMeta>,
        scores: HashMap<String, i64>,
    }

    impl MemoryIndex {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn record(&self, address: &str) -> Option<StoredMeta> {
            self.state.lock().unwrap().records.get(address).cloned()
        }

        pub(crate) fn score(&self, address: &str) -> Option<i64> {
            self.state.lock().unwrap().scores.get(address).copied()
        }

        pub(crate) fn live_count(&self) -> usize {
            self.state.lock().unwrap().scores.len()
        }
    }

    #[async_trait]
    impl MetaIndex for MemoryIndex {
        async fn save(&self, meta: &FileMeta) -> Result<(), IndexError> {
            let mut state = self.state.lock().unwrap();

            let record = state.records.entry(meta.address.clone()).or_default();
            record.size = meta.size;
            record.created_at = meta.created_at;

            state.scores.insert(meta.address.clone(), meta.score);
            Ok(())
        }

        async fn inc_score(&self, address: &str) -> Result<i64, IndexError> {
            let mut state = self.state.lock().unwrap();

            let score = state.scores.entry(address.to_string()).or_insert(0);
            *score += 1;
            Ok(*score)
        }

        async fn unused(&self, limit: i64) -> Result<Vec<String>, IndexError> {
            let stop = if limit < 1 { 0 } else { limit - 1 };
            let state = self.state.lock().unwrap();

            let mut ranked: Vec<(&String, &i64)> = state.scores.iter().collect();
            ranked.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));

            Ok(ranked
                .into_iter()
                .take(stop as usize + 1)
                .map(|(address, _)| address.clone())
                .collect())
        }

        async fn mark_deleted(&self, address: &str, deleted_at: i64) -> Result<(), IndexError> {
            let mut state = self.state.lock().unwrap();

            let score = state
                .scores
                .remove(address)
                .ok_or_else(|| IndexError::MissingScore(address.to_string()))?;

            let record = state.records.entry(address.to_string()).or_default();
            record.deleted_at = Some(deleted_at);
            record.score = score;
            Ok(())
        }
    }
}
