use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{Job, JobCounts, JobOptions, JobPayload, JobResult, JobStatus};
use super::store::{
    apply_claim, apply_completion, apply_failure, apply_stall, lock_lost, FailOutcome, JobStore,
    Retention, StalledSweep,
};
use crate::error::{PilotError, Result};

fn store_err(err: redis::RedisError) -> PilotError {
    PilotError::Store(err.to_string())
}

/// Redis 队列
///
/// 任务以 JSON 存于 `{prefix}:{queue}:job:{id}`；待执行集合按 `run_at` 排序，
/// 活动集合按锁过期时间排序，完成与失败列表按保留数量裁剪。
pub struct RedisJobStore {
    client: redis::Client,
    prefix: String,
    queue: String,
    retention: Retention,
}

impl RedisJobStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            queue: queue.into(),
            retention: Retention::default(),
        }
    }

    pub fn open(url: &str, prefix: impl Into<String>, queue: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        Ok(Self::new(client, prefix, queue))
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.queue, suffix)
    }

    fn job_key(&self, job_id: &str) -> String {
        self.key(&format!("job:{job_id}"))
    }

    /// 每次操作使用独立连接，WATCH 状态不会与其他调用共享
    async fn conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_err)
    }

    async fn load(&self, conn: &mut MultiplexedConnection, job_id: &str) -> Result<Option<Job>> {
        let raw: Option<String> = conn.get(self.job_key(job_id)).await.map_err(store_err)?;
        raw.map(|text| serde_json::from_str(&text).map_err(PilotError::from))
            .transpose()
    }

    /// WATCH 任务键，读取后由 `stage` 写入事务；键被并发修改时 EXEC 放弃并重读
    ///
    /// 所有状态迁移都会改写任务键，因此同一任务的迁移彼此串行。
    async fn transact<T>(
        &self,
        conn: &mut MultiplexedConnection,
        job_id: &str,
        mut stage: impl FnMut(Option<Job>, &mut redis::Pipeline) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        let job_key = self.job_key(job_id);
        for _ in 0..TRANSACTION_RETRIES {
            let _: () = redis::cmd("WATCH")
                .arg(&job_key)
                .query_async(&mut *conn)
                .await
                .map_err(store_err)?;
            let job = self.load(conn, job_id).await?;
            let mut pipe = redis::pipe();
            pipe.atomic();
            let value = match stage(job, &mut pipe) {
                Ok(Some(value)) => value,
                other => {
                    let _: () = redis::cmd("UNWATCH")
                        .query_async(&mut *conn)
                        .await
                        .map_err(store_err)?;
                    return other;
                }
            };
            let committed: Option<()> = pipe.query_async(&mut *conn).await.map_err(store_err)?;
            if committed.is_some() {
                return Ok(Some(value));
            }
            debug!(job_id, "job changed during transaction, retrying");
        }
        Err(PilotError::Store(format!(
            "job `{job_id}` kept changing, transaction abandoned"
        )))
    }

    fn retire_list(&self, status: JobStatus) -> (String, usize) {
        match status {
            JobStatus::Completed => (self.key("completed"), self.retention.keep_completed),
            _ => (self.key("failed"), self.retention.keep_failed),
        }
    }

    /// 按保留数量裁剪完成/失败列表并删除被淘汰的任务
    async fn evict(&self, conn: &mut MultiplexedConnection, status: JobStatus) -> Result<()> {
        let (list, keep) = self.retire_list(status);
        let evicted: Vec<String> = conn
            .lrange(&list, keep as isize, -1)
            .await
            .map_err(store_err)?;
        if !evicted.is_empty() {
            let keys: Vec<String> = evicted.iter().map(|id| self.job_key(id)).collect();
            let _: () = conn.del(keys).await.map_err(store_err)?;
            let _: () = conn
                .ltrim(&list, 0, keep as isize - 1)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }
}

const TRANSACTION_RETRIES: usize = 5;

fn encode(job: &Job) -> Result<String> {
    Ok(serde_json::to_string(job)?)
}

fn millis_after(lock: Duration) -> i64 {
    (Utc::now() + chrono::Duration::milliseconds(lock.as_millis() as i64)).timestamp_millis()
}

/// 停滞扫描对单个任务的处理
#[derive(Debug, PartialEq)]
enum Recovery {
    /// 锁已被续期或任务已离开活动状态
    Skip,
    /// 活动集合里的残留项
    Drop,
    Requeue(Job),
    Fail(Job),
}

fn stage_recovery(job: Option<Job>, now_ms: i64) -> Recovery {
    let Some(mut job) = job else {
        return Recovery::Drop;
    };
    if job.status != JobStatus::Active {
        return Recovery::Drop;
    }
    if job
        .lock_expires_at
        .is_some_and(|at| at.timestamp_millis() > now_ms)
    {
        return Recovery::Skip;
    }
    if apply_stall(&mut job) {
        Recovery::Requeue(job)
    } else {
        Recovery::Fail(job)
    }
}

/// 只有等待或延迟中的任务可以被领取
fn stage_claim(job: Option<Job>, worker_id: &str, lock: Duration) -> Option<Job> {
    let mut job = job?;
    if !matches!(job.status, JobStatus::Waiting | JobStatus::Delayed) {
        return None;
    }
    apply_claim(&mut job, worker_id, lock);
    Some(job)
}

#[async_trait]
impl JobStore for RedisJobStore {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<String> {
        if options.attempts == 0 {
            return Err(PilotError::Job("job attempts must be at least 1".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        let job = Job::new(id.clone(), self.queue.clone(), payload, options);
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .set(self.job_key(&id), encode(&job)?)
            .ignore()
            .zadd(self.key("pending"), &id, job.run_at.timestamp_millis())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        debug!(job_id = %id, queue = %self.queue, "job enqueued");
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, lock: Duration) -> Result<Option<Job>> {
        let mut conn = self.conn().await?;
        let pending = self.key("pending");
        let active = self.key("active");
        let due: Vec<String> = conn
            .zrangebyscore_limit(&pending, "-inf", Utc::now().timestamp_millis(), 0, 1)
            .await
            .map_err(store_err)?;
        let Some(id) = due.into_iter().next() else {
            return Ok(None);
        };
        // 出队与入活动集合在同一事务内，崩溃不会丢任务
        let claimed = self
            .transact(&mut conn, &id, |job, pipe| {
                if job.is_none() {
                    warn!(job_id = %id, "scheduled job has no payload");
                    pipe.zrem(&pending, &id).ignore();
                    return Ok(Some(None));
                }
                let Some(job) = stage_claim(job, worker_id, lock) else {
                    return Ok(None);
                };
                let expires = millis_after(lock);
                pipe.set(self.job_key(&id), encode(&job)?)
                    .ignore()
                    .zrem(&pending, &id)
                    .ignore()
                    .zadd(&active, &id, expires)
                    .ignore();
                Ok(Some(Some(job)))
            })
            .await?;
        Ok(claimed.flatten())
    }

    async fn renew_lock(&self, job_id: &str, token: &str, lock: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let active = self.key("active");
        let renewed = self
            .transact(&mut conn, job_id, |job, pipe| {
                let Some(mut job) = job.filter(|job| job.holds_lock(token)) else {
                    return Ok(None);
                };
                let expires = Utc::now() + chrono::Duration::milliseconds(lock.as_millis() as i64);
                job.lock_expires_at = Some(expires);
                pipe.set(self.job_key(job_id), encode(&job)?)
                    .ignore()
                    .zadd(&active, job_id, expires.timestamp_millis())
                    .ignore();
                Ok(Some(()))
            })
            .await?;
        Ok(renewed.is_some())
    }

    async fn complete(&self, job_id: &str, token: &str, result: JobResult) -> Result<()> {
        let mut conn = self.conn().await?;
        let active = self.key("active");
        let (completed, _) = self.retire_list(JobStatus::Completed);
        self.transact(&mut conn, job_id, |job, pipe| {
            let Some(mut job) = job.filter(|job| job.holds_lock(token)) else {
                return Err(lock_lost(job_id));
            };
            apply_completion(&mut job, result.clone());
            pipe.set(self.job_key(job_id), encode(&job)?)
                .ignore()
                .zrem(&active, job_id)
                .ignore()
                .lpush(&completed, job_id)
                .ignore();
            Ok(Some(()))
        })
        .await?;
        self.evict(&mut conn, JobStatus::Completed).await
    }

    async fn fail(&self, job_id: &str, token: &str, error: &str, retryable: bool) -> Result<FailOutcome> {
        let mut conn = self.conn().await?;
        let active = self.key("active");
        let pending = self.key("pending");
        let (failed, _) = self.retire_list(JobStatus::Failed);
        let outcome = self
            .transact(&mut conn, job_id, |job, pipe| {
                let Some(mut job) = job.filter(|job| job.holds_lock(token)) else {
                    return Err(lock_lost(job_id));
                };
                let outcome = apply_failure(&mut job, error, retryable);
                pipe.set(self.job_key(job_id), encode(&job)?)
                    .ignore()
                    .zrem(&active, job_id)
                    .ignore();
                match outcome {
                    FailOutcome::Retrying { .. } => {
                        pipe.zadd(&pending, job_id, job.run_at.timestamp_millis())
                            .ignore();
                    }
                    FailOutcome::Failed { .. } => {
                        pipe.lpush(&failed, job_id).ignore();
                    }
                }
                Ok(Some(outcome))
            })
            .await?
            .ok_or_else(|| lock_lost(job_id))?;
        if matches!(outcome, FailOutcome::Failed { .. }) {
            self.evict(&mut conn, JobStatus::Failed).await?;
        }
        Ok(outcome)
    }

    async fn recover_stalled(&self) -> Result<StalledSweep> {
        let mut conn = self.conn().await?;
        let active = self.key("active");
        let pending = self.key("pending");
        let (failed, _) = self.retire_list(JobStatus::Failed);
        let expired: Vec<String> = conn
            .zrangebyscore(&active, "-inf", Utc::now().timestamp_millis())
            .await
            .map_err(store_err)?;

        let mut sweep = StalledSweep::default();
        for id in expired {
            // 事务内重新判断锁是否过期，续期与扫描并发时以先提交者为准
            let recovered = self
                .transact(&mut conn, &id, |job, pipe| {
                    match stage_recovery(job, Utc::now().timestamp_millis()) {
                        Recovery::Skip => Ok(None),
                        Recovery::Drop => {
                            pipe.zrem(&active, &id).ignore();
                            Ok(Some(None))
                        }
                        Recovery::Requeue(job) => {
                            pipe.set(self.job_key(&id), encode(&job)?)
                                .ignore()
                                .zrem(&active, &id)
                                .ignore()
                                .zadd(&pending, &id, job.run_at.timestamp_millis())
                                .ignore();
                            Ok(Some(Some((true, job.attempts_made))))
                        }
                        Recovery::Fail(job) => {
                            pipe.set(self.job_key(&id), encode(&job)?)
                                .ignore()
                                .zrem(&active, &id)
                                .ignore()
                                .lpush(&failed, &id)
                                .ignore();
                            Ok(Some(Some((false, job.attempts_made))))
                        }
                    }
                })
                .await?;
            match recovered.flatten() {
                Some((true, attempts)) => {
                    info!(job_id = %id, attempts, "stalled job requeued");
                    sweep.requeued.push(id);
                }
                Some((false, attempts)) => {
                    warn!(job_id = %id, attempts, "stalled job exhausted attempts");
                    sweep.failed.push(id);
                }
                None => {}
            }
        }
        if !sweep.failed.is_empty() {
            self.evict(&mut conn, JobStatus::Failed).await?;
        }
        Ok(sweep)
    }

    async fn counts(&self) -> Result<JobCounts> {
        let mut conn = self.conn().await?;
        let pending = self.key("pending");
        let now_ms = Utc::now().timestamp_millis();
        let waiting: usize = conn
            .zcount(&pending, "-inf", now_ms)
            .await
            .map_err(store_err)?;
        let delayed: usize = conn
            .zcount(&pending, format!("({now_ms}"), "+inf")
            .await
            .map_err(store_err)?;
        let active: usize = conn.zcard(self.key("active")).await.map_err(store_err)?;
        let completed: usize = conn.llen(self.key("completed")).await.map_err(store_err)?;
        let failed: usize = conn.llen(self.key("failed")).await.map_err(store_err)?;
        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn().await?;
        self.load(&mut conn, job_id).await
    }
}
