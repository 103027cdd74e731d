use anyhow::Result;
use sqlx::PgPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::types::ActivityLog;

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub worker_count: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self { queue_capacity: 10_000, batch_size: 100, batch_timeout_ms: 1000, worker_count: 2 }
    }
}

/// Async activity logger with a bounded queue; workers batch-insert into
/// Postgres instead of blocking the caller on each log line.
#[derive(Clone)]
pub struct ActivityLogger {
    sender: mpsc::Sender<ActivityLog>,
    queue_len: Arc<AtomicUsize>,
    queue_capacity: usize,
}

impl ActivityLogger {
    pub fn new(pool: PgPool, config: LoggerConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let queue_len = Arc::new(AtomicUsize::new(0));

        info!(
            "initializing activity logger: queue={}, batch={}, timeout={}ms, workers={}",
            config.queue_capacity, config.batch_size, config.batch_timeout_ms, config.worker_count
        );

        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        for worker_id in 0..config.worker_count {
            let pool = pool.clone();
            let receiver = receiver.clone();
            let config = config.clone();
            let queue_len = queue_len.clone();
            tokio::spawn(async move {
                Self::worker_loop(worker_id, pool, receiver, config, queue_len).await;
            });
        }

        Self { sender, queue_len, queue_capacity: config.queue_capacity }
    }

    /// Non-blocking enqueue; drops the log with a warning if the queue is full.
    pub fn log(&self, activity: ActivityLog) {
        match self.sender.try_send(activity) {
            Ok(()) => {
                self.queue_len.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("failed to enqueue log (queue full?): {}", e),
        }
    }

    /// Enqueues without blocking the caller, waiting for room if the queue
    /// is momentarily full rather than dropping.
    pub fn log_async(&self, activity: ActivityLog) {
        let sender = self.sender.clone();
        let queue_len = self.queue_len.clone();
        tokio::spawn(async move {
            if sender.send(activity).await.is_ok() {
                queue_len.fetch_add(1, Ordering::Relaxed);
            } else {
                error!("failed to send log to queue: channel closed");
            }
        });
    }

    async fn worker_loop(
        worker_id: usize,
        pool: PgPool,
        receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<ActivityLog>>>,
        config: LoggerConfig,
        queue_len: Arc<AtomicUsize>,
    ) {
        info!("logger worker {} started", worker_id);

        let mut batch: Vec<ActivityLog> = Vec::with_capacity(config.batch_size);
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);

        loop {
            let deadline = tokio::time::Instant::now() + batch_timeout;

            while batch.len() < config.batch_size {
                let mut guard = receiver.lock().await;
                match tokio::time::timeout_at(deadline, guard.recv()).await {
                    Ok(Some(log)) => {
                        queue_len.fetch_sub(1, Ordering::Relaxed);
                        batch.push(log);
                    }
                    Ok(None) => {
                        drop(guard);
                        if !batch.is_empty() {
                            Self::flush_batch(&pool, &batch, worker_id).await;
                        }
                        info!("logger worker {} shutting down (channel closed)", worker_id);
                        return;
                    }
                    Err(_) => break,
                }
            }

            if !batch.is_empty() {
                Self::flush_batch(&pool, &batch, worker_id).await;
                batch.clear();
            } else {
                sleep(Duration::from_millis(100)).await;
            }
        }
    }

    async fn flush_batch(pool: &PgPool, batch: &[ActivityLog], worker_id: usize) {
        let start = std::time::Instant::now();
        let batch_size = batch.len();

        debug!("worker {} flushing {} logs to database", worker_id, batch_size);

        match Self::insert_batch(pool, batch).await {
            Ok(inserted) => {
                let duration = start.elapsed();
                debug!(
                    "worker {} inserted {} logs in {:?} ({:.2} logs/sec)",
                    worker_id,
                    inserted,
                    duration,
                    inserted as f64 / duration.as_secs_f64().max(1e-6)
                );
            }
            Err(e) => error!("worker {} failed to insert batch: {}", worker_id, e),
        }
    }

    async fn insert_batch(pool: &PgPool, logs: &[ActivityLog]) -> Result<usize> {
        let mut query_builder = sqlx::QueryBuilder::new(
            r#"
            INSERT INTO tbl_activity_logs (
                session_id, owner_id, activity_type, activity_status,
                document_id, message_content, response_content,
                token_count, retrieval_skipped, similarity_score,
                processing_time_ms, llm_call_duration_ms, retrieval_duration_ms,
                error_message, error_type, user_agent, ip_address, created_at
            )
            "#,
        );

        query_builder.push_values(logs, |mut b, log| {
            b.push_bind(log.session_id)
                .push_bind(log.owner_id)
                .push_bind(log.activity_type.as_str())
                .push_bind(log.activity_status.as_str())
                .push_bind(log.document_id)
                .push_bind(&log.message_content)
                .push_bind(&log.response_content)
                .push_bind(log.token_count)
                .push_bind(log.retrieval_skipped)
                .push_bind(log.similarity_score)
                .push_bind(log.processing_time_ms)
                .push_bind(log.llm_call_duration_ms)
                .push_bind(log.retrieval_duration_ms)
                .push_bind(&log.error_message)
                .push_bind(&log.error_type)
                .push_bind(&log.user_agent)
                .push_bind(log.ip_address)
                .push_bind(log.created_at);
        });

        let query = query_builder.build();
        let result = query.execute(pool).await?;

        Ok(result.rows_affected() as usize)
    }

    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    pub fn is_queue_full(&self) -> bool {
        self.queue_len() >= self.queue_capacity
    }
}
