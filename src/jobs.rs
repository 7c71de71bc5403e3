//! Background job plumbing: a worker pool over an mpsc queue, periodic
//! tickers that feed it, retry with exponential backoff for transient
//! failures, and a cooperative panic stop checked before every job.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::enforcement::Enforcer;
use crate::error;
use crate::model::{ScanOutcome, SessionType};
use crate::reporting::ReportPipeline;
use crate::scanner::Scanner;
use crate::store::Store;

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_SECS: u64 = 2;
const BACKOFF_CAP_SECS: u64 = 60;

#[derive(Debug)]
pub enum Job {
    PollRemote,
    PollLocal,
    PollFederated,
    Analyze(Box<ScanOutcome>),
    ProcessExpired,
    SweepCache,
    RecordStats,
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::PollRemote => "poll_remote",
            Job::PollLocal => "poll_local",
            Job::PollFederated => "poll_federated",
            Job::Analyze(_) => "analyze",
            Job::ProcessExpired => "process_expired",
            Job::SweepCache => "sweep_cache",
            Job::RecordStats => "record_stats",
        }
    }
}

/// Everything a worker needs to execute any job.
pub struct JobContext {
    pub store: Store,
    pub scanner: Arc<Scanner>,
    pub pipeline: Arc<ReportPipeline>,
    pub enforcer: Arc<Enforcer>,
    /// Static half of the kill switch; the dynamic half lives in the config
    /// table and is re-read before every job.
    pub panic_stop: bool,
}

impl JobContext {
    pub fn panic_stopped(&self) -> bool {
        self.panic_stop || self.store.config_flag("panic_stop")
    }

    /// Run one job. Poll jobs return follow-up analyze jobs.
    pub async fn execute(&self, job: &Job) -> Result<Vec<Job>> {
        match job {
            Job::PollRemote => self.poll(SessionType::Remote).await,
            Job::PollLocal => self.poll(SessionType::Local).await,
            Job::PollFederated => {
                let mut outcomes = Vec::new();
                self.scanner.poll_federated(&mut outcomes).await?;
                Ok(outcomes
                    .into_iter()
                    .map(|o| Job::Analyze(Box::new(o)))
                    .collect())
            }
            Job::Analyze(outcome) => {
                self.pipeline.analyze_and_maybe_report(outcome).await?;
                Ok(Vec::new())
            }
            Job::ProcessExpired => {
                let reversed = self.enforcer.process_expired_actions().await?;
                if reversed > 0 {
                    log::info!("reversed {reversed} expired actions");
                }
                Ok(Vec::new())
            }
            Job::SweepCache => {
                self.scanner.expire_stale_scans()?;
                Ok(Vec::new())
            }
            Job::RecordStats => {
                for stat in self.store.rule_trigger_stats()? {
                    if stat.trigger_count > 0 {
                        log::info!(
                            "rule {} ({}): {} triggers, last {:?}",
                            stat.name,
                            stat.detector_type,
                            stat.trigger_count,
                            stat.last_triggered_at
                        );
                    }
                }
                Ok(Vec::new())
            }
        }
    }

    async fn poll(&self, session_type: SessionType) -> Result<Vec<Job>> {
        let mut outcomes = Vec::new();
        self.scanner.poll(session_type, &mut outcomes).await?;
        Ok(outcomes
            .into_iter()
            .map(|o| Job::Analyze(Box::new(o)))
            .collect())
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_SECS
        .saturating_mul(1u64 << attempt.min(10))
        .min(BACKOFF_CAP_SECS);
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    Duration::from_secs(base) + Duration::from_millis(jitter_ms)
}

/// Execute with retry. Only transient failures are retried; permanent and
/// invariant failures surface immediately.
pub async fn run_with_retry(ctx: &JobContext, job: &Job) -> Result<Vec<Job>> {
    let mut attempt = 0;
    loop {
        match ctx.execute(job).await {
            Ok(follow_ups) => return Ok(follow_ups),
            Err(e) if error::is_retryable(&e) && attempt + 1 < MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                log::warn!(
                    "job {} attempt {} failed, retrying in {delay:?}: {e:#}",
                    job.name(),
                    attempt + 1
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct JobRunner {
    ctx: Arc<JobContext>,
    workers: usize,
    poll_interval: Duration,
    expiry_interval: Duration,
}

impl JobRunner {
    pub fn new(
        ctx: Arc<JobContext>,
        workers: usize,
        poll_interval: Duration,
        expiry_interval: Duration,
    ) -> Self {
        JobRunner {
            ctx,
            workers,
            poll_interval,
            expiry_interval,
        }
    }

    /// Run the worker pool and tickers until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Job>(256);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::new();
        for worker_id in 0..self.workers {
            let ctx = Arc::clone(&self.ctx);
            let rx = Arc::clone(&rx);
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let job = match job {
                        Some(job) => job,
                        None => break,
                    };
                    if ctx.panic_stopped() {
                        log::warn!("panic stop set, skipping job {}", job.name());
                        continue;
                    }
                    match run_with_retry(&ctx, &job).await {
                        Ok(follow_ups) => {
                            for follow_up in follow_ups {
                                if tx.send(follow_up).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            log::error!("worker {worker_id}: job {} failed: {e:#}", job.name())
                        }
                    }
                }
            }));
        }

        let mut poll_tick = tokio::time::interval(self.poll_interval);
        let mut expiry_tick = tokio::time::interval(self.expiry_interval);
        let mut hourly_tick = tokio::time::interval(Duration::from_secs(3600));

        loop {
            tokio::select! {
                _ = poll_tick.tick() => {
                    let _ = tx.send(Job::PollRemote).await;
                    let _ = tx.send(Job::PollLocal).await;
                    let _ = tx.send(Job::SweepCache).await;
                }
                _ = expiry_tick.tick() => {
                    let _ = tx.send(Job::ProcessExpired).await;
                }
                _ = hourly_tick.tick() => {
                    let _ = tx.send(Job::PollFederated).await;
                    let _ = tx.send(Job::RecordStats).await;
                }
                result = tokio::signal::ctrl_c() => {
                    result?;
                    log::info!("shutdown requested, draining job queue");
                    break;
                }
            }
        }

        drop(tx);
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}
