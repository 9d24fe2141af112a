use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{Job, JobCounts, JobOptions, JobPayload, JobResult, JobStatus};
use crate::error::{PilotError, Result};

pub const STALLED_ERROR: &str = "job stalled: lock expired before completion";

/// 失败后的去向
#[derive(Clone, Debug, PartialEq)]
pub enum FailOutcome {
    Retrying { attempt: u32, delay: Duration },
    Failed { attempts: u32 },
}

/// 一次停滞扫描的结果
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StalledSweep {
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
}

impl StalledSweep {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// 已完成与已失败任务的保留数量
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

/// 持久化任务队列
#[async_trait]
pub trait JobStore: Send + Sync {
    fn queue_name(&self) -> &str;

    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<String>;

    /// 领取一个到期任务并加锁
    async fn claim(&self, worker_id: &str, lock: Duration) -> Result<Option<Job>>;

    /// 续期；锁已丢失时返回 false
    async fn renew_lock(&self, job_id: &str, token: &str, lock: Duration) -> Result<bool>;

    async fn complete(&self, job_id: &str, token: &str, result: JobResult) -> Result<()>;

    async fn fail(&self, job_id: &str, token: &str, error: &str, retryable: bool) -> Result<FailOutcome>;

    /// 锁过期的活动任务重新入队，次数用尽则置为失败
    async fn recover_stalled(&self) -> Result<StalledSweep>;

    async fn counts(&self) -> Result<JobCounts>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>>;
}

pub(crate) fn lock_lost(job_id: &str) -> PilotError {
    PilotError::Job(format!("job `{job_id}` is no longer locked by this worker"))
}

/// 对锁定任务应用失败；返回结果与是否进入失败集合
pub(crate) fn apply_failure(job: &mut Job, error: &str, retryable: bool) -> FailOutcome {
    let now = Utc::now();
    job.attempts_made += 1;
    job.last_error = Some(error.to_string());
    job.lock_token = None;
    job.locked_by = None;
    job.lock_expires_at = None;

    if retryable && job.attempts_made < job.options.attempts {
        let delay = job.options.backoff.delay_for(job.attempts_made);
        job.status = JobStatus::Delayed;
        job.run_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
        FailOutcome::Retrying {
            attempt: job.attempts_made,
            delay,
        }
    } else {
        job.status = JobStatus::Failed;
        job.finished_at = Some(now);
        FailOutcome::Failed {
            attempts: job.attempts_made,
        }
    }
}

pub(crate) fn apply_claim(job: &mut Job, worker_id: &str, lock: Duration) {
    job.status = JobStatus::Active;
    job.lock_token = Some(Uuid::new_v4().to_string());
    job.locked_by = Some(worker_id.to_string());
    job.lock_expires_at = Some(Utc::now() + chrono::Duration::milliseconds(lock.as_millis() as i64));
}

pub(crate) fn apply_completion(job: &mut Job, result: JobResult) {
    job.status = JobStatus::Completed;
    job.result = Some(result);
    job.finished_at = Some(Utc::now());
    job.lock_token = None;
    job.locked_by = None;
    job.lock_expires_at = None;
}

/// 停滞任务：算作一次尝试；返回 true 表示重新入队
pub(crate) fn apply_stall(job: &mut Job) -> bool {
    let now = Utc::now();
    job.attempts_made += 1;
    job.last_error = Some(STALLED_ERROR.to_string());
    job.lock_token = None;
    job.locked_by = None;
    job.lock_expires_at = None;
    if job.attempts_made < job.options.attempts {
        job.status = JobStatus::Waiting;
        job.run_at = now;
        true
    } else {
        job.status = JobStatus::Failed;
        job.finished_at = Some(now);
        false
    }
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, Job>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
}

impl MemoryState {
    fn retire(&mut self, job_id: &str, status: JobStatus, retention: Retention) {
        let (list, keep) = match status {
            JobStatus::Completed => (&mut self.completed, retention.keep_completed),
            _ => (&mut self.failed, retention.keep_failed),
        };
        list.push_back(job_id.to_string());
        let mut evicted = Vec::new();
        while list.len() > keep {
            if let Some(old) = list.pop_front() {
                evicted.push(old);
            }
        }
        for old in evicted {
            self.jobs.remove(&old);
        }
    }
}

/// 进程内队列
pub struct MemoryJobStore {
    queue: String,
    retention: Retention,
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            retention: Retention::default(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<String> {
        if options.attempts == 0 {
            return Err(PilotError::Job("job attempts must be at least 1".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        let job = Job::new(id.clone(), self.queue.clone(), payload, options);
        debug!(job_id = %id, target = job.payload.target(), "job enqueued");
        self.state.lock().jobs.insert(id.clone(), job);
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, lock: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let next = state
            .jobs
            .values()
            .filter(|job| {
                matches!(job.status, JobStatus::Waiting | JobStatus::Delayed) && job.run_at <= now
            })
            .min_by(|a, b| {
                a.run_at
                    .cmp(&b.run_at)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|job| job.id.clone());
        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        apply_claim(job, worker_id, lock);
        Ok(Some(job.clone()))
    }

    async fn renew_lock(&self, job_id: &str, token: &str, lock: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        match state.jobs.get_mut(job_id) {
            Some(job) if job.holds_lock(token) => {
                job.lock_expires_at =
                    Some(Utc::now() + chrono::Duration::milliseconds(lock.as_millis() as i64));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, job_id: &str, token: &str, result: JobResult) -> Result<()> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .filter(|job| job.holds_lock(token))
            .ok_or_else(|| lock_lost(job_id))?;
        apply_completion(job, result);
        state.retire(job_id, JobStatus::Completed, self.retention);
        Ok(())
    }

    async fn fail(&self, job_id: &str, token: &str, error: &str, retryable: bool) -> Result<FailOutcome> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .filter(|job| job.holds_lock(token))
            .ok_or_else(|| lock_lost(job_id))?;
        let outcome = apply_failure(job, error, retryable);
        if let FailOutcome::Failed { .. } = outcome {
            state.retire(job_id, JobStatus::Failed, self.retention);
        }
        Ok(outcome)
    }

    async fn recover_stalled(&self) -> Result<StalledSweep> {
        let now = Utc::now();
        let mut sweep = StalledSweep::default();
        let mut state = self.state.lock();
        let stalled: Vec<String> = state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Active
                    && job.lock_expires_at.map(|at| at < now).unwrap_or(true)
            })
            .map(|job| job.id.clone())
            .collect();
        for id in stalled {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if apply_stall(job) {
                info!(job_id = %id, attempts = job.attempts_made, "stalled job requeued");
                sweep.requeued.push(id);
            } else {
                warn!(job_id = %id, attempts = job.attempts_made, "stalled job exhausted attempts");
                state.retire(&id, JobStatus::Failed, self.retention);
                sweep.failed.push(id);
            }
        }
        Ok(sweep)
    }

    async fn counts(&self) -> Result<JobCounts> {
        let now = Utc::now();
        let state = self.state.lock();
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Waiting | JobStatus::Delayed if job.run_at <= now => counts.waiting += 1,
                JobStatus::Waiting | JobStatus::Delayed => counts.delayed += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.state.lock().jobs.get(job_id).cloned())
    }
}
