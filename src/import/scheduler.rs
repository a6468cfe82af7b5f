//! Scheduler adapter: "run a tick now or soon" without binding the engine to
//! a queue implementation.
//!
//! Three backends: an in-process recording queue (tests and drive-to-done
//! loops), a timer fallback that re-invokes over a channel, and a Postgres
//! delayed-job table for an external worker fleet.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Job id the orchestrator enqueues for itself.
pub const TICK_JOB_ID: &str = "catalog-import.tick";

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn enqueue(&self, job_id: &str, payload: Value, delay: Duration) -> Result<()>;
}

/// In-process queue. Nothing runs by itself; the owner pops explicitly, so
/// tests control exactly when the next tick happens.
#[derive(Default)]
pub struct QueueScheduler {
    queue: Mutex<VecDeque<(String, Value)>>,
}

impl QueueScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<(String, Value)> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[async_trait]
impl Scheduler for QueueScheduler {
    async fn enqueue(&self, job_id: &str, payload: Value, _delay: Duration) -> Result<()> {
        self.queue
            .lock()
            .unwrap()
            .push_back((job_id.to_string(), payload));
        Ok(())
    }
}

/// Timer-based re-invocation: each enqueue spawns a task that sleeps the
/// delay and then hands the job to the run loop over a channel.
pub struct TimerScheduler {
    tx: mpsc::UnboundedSender<(String, Value)>,
}

impl TimerScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Scheduler for TimerScheduler {
    async fn enqueue(&self, job_id: &str, payload: Value, delay: Duration) -> Result<()> {
        let tx = self.tx.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            // Receiver gone means the run loop ended; nothing left to do.
            let _ = tx.send((job_id, payload));
        });
        Ok(())
    }
}

/// Delayed-job backend: one row per job keyed by a dedupe key, picked up by
/// an external worker. Re-enqueueing the same job moves its schedule forward
/// instead of piling up duplicates.
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Scheduler for PgJobQueue {
    async fn enqueue(&self, job_id: &str, payload: Value, delay: Duration) -> Result<()> {
        let delay_secs = delay.as_secs_f64();
        sqlx::query(
            "INSERT INTO import_jobs(kind, dedupe_key, payload, status, scheduled_at) \
             VALUES ($1, $2, $3, 'queued', now() + make_interval(secs => $4)) \
             ON CONFLICT (dedupe_key) DO UPDATE \
               SET payload = EXCLUDED.payload, \
                   status = 'queued', \
                   scheduled_at = EXCLUDED.scheduled_at, \
                   updated_at = now()",
        )
        .persistent(false)
        .bind(job_id)
        .bind(job_id)
        .bind(&payload)
        .bind(delay_secs)
        .execute(&self.pool)
        .await
        .context("enqueue into import_jobs failed")?;
        debug!(job_id, delay_secs, "enqueued import job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn queue_scheduler_records_in_order() {
        let sched = QueueScheduler::new();
        sched
            .enqueue(TICK_JOB_ID, json!({"n": 1}), Duration::ZERO)
            .await
            .unwrap();
        sched
            .enqueue(TICK_JOB_ID, json!({"n": 2}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(sched.pending(), 2);
        let (id, payload) = sched.pop().unwrap();
        assert_eq!(id, TICK_JOB_ID);
        assert_eq!(payload["n"], 1);
        assert_eq!(sched.pending(), 1);
    }

    #[tokio::test]
    async fn timer_scheduler_delivers_after_delay() {
        let (sched, mut rx) = TimerScheduler::new();
        sched
            .enqueue(TICK_JOB_ID, json!({}), Duration::from_millis(5))
            .await
            .unwrap();
        let (id, _) = rx.recv().await.unwrap();
        assert_eq!(id, TICK_JOB_ID);
    }
}
