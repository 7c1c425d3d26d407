//! Redis-backed signal queue.
//!
//! Layout:
//! - `signals:queue`        sorted set of signal ids, score = priority band + epoch seconds
//! - `signals:processing`   set of in-flight signal ids
//! - `signals:dead_letter`  list of terminal failures (JSON: signal + error + timestamp)
//! - `signal:<id>`          JSON body, written before the index entry
//! - `dedup:<key>`          suppression marker with TTL
//!
//! A signal id lives in exactly one of queued / processing / dead letter;
//! the body key exists iff the signal is queued or processing. `ZPOPMIN` is
//! the single-popper guarantee: one worker owns an id until `complete` or
//! `fail`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Connection, Pool, Runtime};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::domain::ports::{QueueStats, SignalQueue};
use crate::domain::signal::{QueuePriority, QueuedSignal};

const QUEUE_KEY: &str = "signals:queue";
const PROCESSING_KEY: &str = "signals:processing";
const DEAD_LETTER_KEY: &str = "signals:dead_letter";
const SIGNAL_DATA_PREFIX: &str = "signal:";
const DEDUP_PREFIX: &str = "dedup:";

/// Priority bands are spaced far enough apart that no realistic timestamp
/// can promote a signal across classes.
const PRIORITY_BAND: f64 = 1e12;

const MAX_RETRY_DELAY_SECS: u64 = 60;

/// Score of a signal in the sorted set: priority class first, enqueue time
/// (with sub-second resolution) breaking ties within a class.
pub fn queue_score(priority: QueuePriority, at: DateTime<Utc>) -> f64 {
    u8::from(priority) as f64 * PRIORITY_BAND + at.timestamp_millis() as f64 / 1000.0
}

/// Exponential retry backoff: `min(2^k, 60)` seconds for the k-th retry.
pub fn retry_backoff(retry_count: u32) -> Duration {
    let secs = 2u64
        .checked_pow(retry_count)
        .map(|d| d.min(MAX_RETRY_DELAY_SECS))
        .unwrap_or(MAX_RETRY_DELAY_SECS);
    Duration::from_secs(secs)
}

fn signal_key(signal_id: &str) -> String {
    format!("{}{}", SIGNAL_DATA_PREFIX, signal_id)
}

fn dedup_key(key: &str) -> String {
    format!("{}{}", DEDUP_PREFIX, key)
}

pub struct RedisSignalQueue {
    pool: Pool,
}

impl RedisSignalQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from a Redis URL and verify connectivity with a PING.
    pub async fn from_url(url: &str) -> Result<Self> {
        let config = deadpool_redis::Config::from_url(url);
        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .context("failed to create Redis pool")?;

        let mut conn = pool.get().await.context("failed to connect to Redis")?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis ping failed")?;

        info!("Connected to Redis at {}", url);
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .context("failed to get Redis connection")
    }
}

#[async_trait]
impl SignalQueue for RedisSignalQueue {
    async fn enqueue(
        &self,
        signal: &QueuedSignal,
        dedup: Option<&str>,
        dedup_ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;

        // SET NX EX makes the dedup check-and-mark atomic across instances.
        if let Some(key) = dedup {
            let marker: Option<String> = redis::cmd("SET")
                .arg(dedup_key(key))
                .arg(&signal.signal_id)
                .arg("NX")
                .arg("EX")
                .arg(dedup_ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await?;
            if marker.is_none() {
                info!(
                    "Signal {} deduplicated (key {})",
                    signal.signal_id, key
                );
                return Ok(false);
            }
        }

        // Body before index entry: a concurrent dequeue that sees the id in
        // the sorted set must find the body.
        let body = serde_json::to_string(signal).context("failed to serialize signal")?;
        let _: () = conn.set(signal_key(&signal.signal_id), body).await?;

        let score = queue_score(signal.priority, Utc::now());
        let _: () = conn.zadd(QUEUE_KEY, &signal.signal_id, score).await?;

        info!(
            "Signal {} enqueued: {} {} priority {:?}",
            signal.signal_id, signal.action, signal.symbol, signal.priority
        );
        Ok(true)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<QueuedSignal>> {
        let mut conn = self.conn().await?;

        let signal_id = if timeout.is_zero() {
            let popped: Vec<(String, f64)> = conn.zpopmin(QUEUE_KEY, 1).await?;
            popped.into_iter().next().map(|(id, _)| id)
        } else {
            let popped: Option<(String, String, f64)> =
                conn.bzpopmin(QUEUE_KEY, timeout.as_secs_f64()).await?;
            popped.map(|(_, id, _)| id)
        };
        let Some(signal_id) = signal_id else {
            return Ok(None);
        };

        let body: Option<String> = conn.get(signal_key(&signal_id)).await?;
        let Some(body) = body else {
            // Body invariant broken; do not re-queue, this needs an operator.
            warn!("Signal body missing for dequeued id {}", signal_id);
            return Ok(None);
        };
        let signal: QueuedSignal =
            serde_json::from_str(&body).context("failed to deserialize signal body")?;

        let _: () = conn.sadd(PROCESSING_KEY, &signal_id).await?;

        debug!("Signal {} dequeued ({})", signal_id, signal.action);
        Ok(Some(signal))
    }

    async fn complete(&self, signal_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.srem(PROCESSING_KEY, signal_id).await?;
        let _: () = conn.del(signal_key(signal_id)).await?;
        info!("Signal {} completed", signal_id);
        Ok(())
    }

    async fn fail(&self, signal_id: &str, error_msg: &str, retry: bool) -> Result<bool> {
        let mut conn = self.conn().await?;
        let _: () = conn.srem(PROCESSING_KEY, signal_id).await?;

        let body: Option<String> = conn.get(signal_key(signal_id)).await?;
        let Some(body) = body else {
            warn!("Signal {} not found for failure", signal_id);
            return Ok(false);
        };
        let mut signal: QueuedSignal =
            serde_json::from_str(&body).context("failed to deserialize signal body")?;

        if retry && signal.retry_count < signal.max_retries {
            signal.retry_count += 1;
            let delay = retry_backoff(signal.retry_count);

            let body = serde_json::to_string(&signal)?;
            let _: () = conn.set(signal_key(signal_id), body).await?;

            // Retries yield to fresh work: LOW class, delay baked into the
            // score (ordering only, an idle queue pops it immediately).
            let scheduled = Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64);
            let score = queue_score(QueuePriority::Low, scheduled);
            let _: () = conn.zadd(QUEUE_KEY, signal_id, score).await?;

            warn!(
                "Signal {} scheduled for retry {}/{} in {}s: {}",
                signal_id, signal.retry_count, signal.max_retries, delay.as_secs(), error_msg
            );
            Ok(true)
        } else {
            let entry = serde_json::json!({
                "signal": signal,
                "error": error_msg,
                "failed_at": Utc::now(),
            });
            let _: () = conn.lpush(DEAD_LETTER_KEY, entry.to_string()).await?;
            let _: () = conn.del(signal_key(signal_id)).await?;

            error!(
                "Signal {} moved to dead letter queue after {} retries: {}",
                signal_id, signal.retry_count, error_msg
            );
            Ok(false)
        }
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn().await?;
        let queued: u64 = conn.zcard(QUEUE_KEY).await?;
        let processing: u64 = conn.scard(PROCESSING_KEY).await?;
        let dead_letter: u64 = conn.llen(DEAD_LETTER_KEY).await?;
        Ok(QueueStats {
            queued,
            processing,
            dead_letter,
        })
    }

    async fn recover_processing(&self, max_age: Duration) -> Result<u32> {
        let mut conn = self.conn().await?;
        let processing_ids: Vec<String> = conn.smembers(PROCESSING_KEY).await?;
        let mut recovered = 0u32;

        for signal_id in processing_ids {
            let body: Option<String> = conn.get(signal_key(&signal_id)).await?;
            let Some(body) = body else {
                let _: () = conn.srem(PROCESSING_KEY, &signal_id).await?;
                continue;
            };
            let mut signal: QueuedSignal =
                serde_json::from_str(&body).context("failed to deserialize signal body")?;

            // created_at is the best proxy we track for processing start.
            let age = Utc::now() - signal.created_at;
            if age.num_seconds() > max_age.as_secs() as i64 {
                signal.retry_count += 1;
                let body = serde_json::to_string(&signal)?;
                let _: () = conn.set(signal_key(&signal_id), body).await?;

                let score = queue_score(QueuePriority::High, Utc::now());
                let _: () = conn.zadd(QUEUE_KEY, &signal_id, score).await?;
                let _: () = conn.srem(PROCESSING_KEY, &signal_id).await?;

                recovered += 1;
                warn!(
                    "Recovered stuck signal {} after {}s",
                    signal_id,
                    age.num_seconds()
                );
            }
        }

        Ok(recovered)
    }
}
