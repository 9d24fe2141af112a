use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::JobHandler;
use super::job::Job;
use super::store::{FailOutcome, JobStore};
use crate::config::PilotSettings;
use crate::error::{PilotError, Result};

/// 关闭信号，可在多个任务间共享
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// 等待信号触发
    pub async fn triggered(&self) {
        let mut rx = self.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// 收到 SIGINT/SIGTERM 后触发关闭
pub async fn listen_for_os_signals(shutdown: ShutdownSignal) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot install SIGTERM handler, listening for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    shutdown.trigger();
}

#[derive(Clone, Debug)]
pub struct WorkerOptions {
    pub id: String,
    pub concurrency: usize,
    pub lock_duration: Duration,
    pub stalled_interval: Duration,
    pub poll_interval: Duration,
    /// 关闭时等待在途任务的时长
    pub grace_period: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_settings(&PilotSettings::default())
    }
}

impl WorkerOptions {
    pub fn from_settings(settings: &PilotSettings) -> Self {
        Self {
            id: format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]),
            concurrency: settings.worker_concurrency.max(1),
            lock_duration: settings.lock_duration(),
            stalled_interval: settings.stalled_interval(),
            poll_interval: settings.poll_interval(),
            grace_period: settings.shutdown_grace(),
        }
    }
}

/// 单个任务的处理结果
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    Completed,
    Retrying { attempt: u32, delay: Duration },
    Failed,
    /// 锁已被停滞扫描回收，结果被丢弃
    LockLost,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerReport {
    pub processed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub lock_lost: usize,
    /// 宽限期结束时被中止的任务
    pub aborted: usize,
}

impl WorkerReport {
    fn absorb(&mut self, joined: std::result::Result<JobOutcome, JoinError>) {
        match joined {
            Ok(outcome) => {
                self.processed += 1;
                match outcome {
                    JobOutcome::Completed => self.completed += 1,
                    JobOutcome::Retrying { .. } => self.retried += 1,
                    JobOutcome::Failed => self.failed += 1,
                    JobOutcome::LockLost => self.lock_lost += 1,
                }
            }
            Err(err) if err.is_cancelled() => self.aborted += 1,
            Err(err) => {
                // 锁会过期，由停滞扫描接手
                error!(error = %err, "job task panicked");
                self.failed += 1;
            }
        }
    }
}

/// 任务被中止时停止续期
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// 队列 worker：有界并发、锁续期、停滞扫描、优雅关闭
pub struct Worker {
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
    shutdown: ShutdownSignal,
}

impl Worker {
    pub fn new(store: Arc<dyn JobStore>, handler: Arc<dyn JobHandler>, options: WorkerOptions) -> Self {
        Self {
            store,
            handler,
            options,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// 运行直到关闭信号触发，然后在宽限期内等待在途任务
    pub async fn run(self) -> Result<WorkerReport> {
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks: JoinSet<JobOutcome> = JoinSet::new();
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut report = WorkerReport::default();
        let mut next_sweep = Instant::now();

        info!(
            worker = %self.options.id,
            queue = self.store.queue_name(),
            concurrency = self.options.concurrency,
            "worker started"
        );

        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            if Instant::now() >= next_sweep {
                self.sweep_stalled().await;
                next_sweep = Instant::now() + self.options.stalled_interval;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|e| PilotError::Job(format!("worker semaphore closed: {e}")))?,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    report.absorb(joined);
                    continue;
                }
                _ = shutdown_rx.changed() => continue,
                _ = sleep_until(next_sweep) => continue,
            };

            // 等待许可期间可能已收到关闭信号
            if self.shutdown.is_triggered() {
                drop(permit);
                break;
            }
            match self.store.claim(&self.options.id, self.options.lock_duration).await {
                Ok(Some(job)) => {
                    debug!(worker = %self.options.id, job_id = %job.id, attempt = job.attempts_made + 1, "job claimed");
                    tasks.spawn(process_job(
                        self.store.clone(),
                        self.handler.clone(),
                        job,
                        self.options.lock_duration,
                        permit,
                    ));
                }
                Ok(None) => {
                    drop(permit);
                    self.idle(&mut shutdown_rx).await;
                }
                Err(err) => {
                    drop(permit);
                    warn!(worker = %self.options.id, error = %err, "failed to claim job");
                    self.idle(&mut shutdown_rx).await;
                }
            }
        }

        info!(
            worker = %self.options.id,
            in_flight = tasks.len(),
            grace_secs = self.options.grace_period.as_secs(),
            "worker draining"
        );
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                report.absorb(joined);
            }
        };
        let drained = tokio::time::timeout(self.options.grace_period, drain).await.is_ok();
        if !drained {
            warn!(worker = %self.options.id, remaining = tasks.len(), "grace period elapsed, aborting jobs");
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                report.absorb(joined);
            }
        }

        info!(
            worker = %self.options.id,
            processed = report.processed,
            failed = report.failed,
            aborted = report.aborted,
            "worker stopped"
        );
        Ok(report)
    }

    async fn idle(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = sleep(self.options.poll_interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    async fn sweep_stalled(&self) {
        match self.store.recover_stalled().await {
            Ok(sweep) if !sweep.is_empty() => {
                info!(
                    worker = %self.options.id,
                    requeued = sweep.requeued.len(),
                    failed = sweep.failed.len(),
                    "recovered stalled jobs"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(worker = %self.options.id, error = %err, "stalled job sweep failed"),
        }
    }
}

async fn process_job(
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    job: Job,
    lock: Duration,
    _permit: OwnedSemaphorePermit,
) -> JobOutcome {
    let Some(token) = job.lock_token.clone() else {
        warn!(job_id = %job.id, "claimed job carries no lock token");
        return JobOutcome::LockLost;
    };
    let _heartbeat = AbortOnDrop(tokio::spawn(heartbeat(
        store.clone(),
        job.id.clone(),
        token.clone(),
        lock,
    )));

    match handler.handle(&job).await {
        Ok(result) => match store.complete(&job.id, &token, result).await {
            Ok(()) => {
                info!(job_id = %job.id, target = job.payload.target(), "job completed");
                JobOutcome::Completed
            }
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "job finished after losing its lock");
                JobOutcome::LockLost
            }
        },
        Err(err) => {
            let retryable = err.is_retryable();
            match store.fail(&job.id, &token, &err.to_string(), retryable).await {
                Ok(FailOutcome::Retrying { attempt, delay }) => {
                    warn!(job_id = %job.id, attempt, delay_ms = delay.as_millis() as u64, error = %err, "job failed, retrying");
                    JobOutcome::Retrying { attempt, delay }
                }
                Ok(FailOutcome::Failed { attempts }) => {
                    error!(job_id = %job.id, attempts, retryable, error = %err, "job failed permanently");
                    JobOutcome::Failed
                }
                Err(store_err) => {
                    warn!(job_id = %job.id, error = %store_err, "job failed after losing its lock");
                    JobOutcome::LockLost
                }
            }
        }
    }
}

/// 每半个锁周期续期一次，锁丢失后停止
async fn heartbeat(store: Arc<dyn JobStore>, job_id: String, token: String, lock: Duration) {
    let period = (lock / 2).max(Duration::from_millis(10));
    loop {
        sleep(period).await;
        match store.renew_lock(&job_id, &token, lock).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%job_id, "job lock lost");
                return;
            }
            Err(err) => warn!(%job_id, error = %err, "failed to renew job lock"),
        }
    }
}
