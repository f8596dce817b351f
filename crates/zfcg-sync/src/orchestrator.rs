//! Live schedule owner.
//!
//! Every reload builds a complete replacement schedule from freshly read
//! configuration, then swaps it in under one lock. Jobs carry the generation
//! they were registered under and do nothing once a newer schedule exists,
//! so a job fired during the swap never runs against discarded configuration.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zfcg_core::{CrawlFrequency, MonitorConfig, Subscriber};

use crate::notify::Notifier;
use crate::pipeline::CrawlPipeline;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    Sweep,
    MonitorCrawl { config_id: i64, web_page: String },
    Notify { hour: u32, recipients: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub cron: String,
    #[serde(flatten)]
    pub kind: JobKind,
}

struct LiveSchedule {
    generation: u64,
    scheduler: JobScheduler,
    jobs: Vec<ScheduledJob>,
}

/// Configuration snapshot a schedule is built from.
#[derive(Default)]
struct SchedulePlan {
    monitors: Vec<(MonitorConfig, u32)>,
    notify_hours: BTreeMap<u32, Vec<Subscriber>>,
}

pub struct Orchestrator {
    pipeline: Arc<CrawlPipeline>,
    notifier: Arc<dyn Notifier>,
    live: Mutex<Option<LiveSchedule>>,
    generation: Arc<AtomicU64>,
}

impl Orchestrator {
    pub fn new(pipeline: Arc<CrawlPipeline>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            pipeline,
            notifier,
            live: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn pipeline(&self) -> &Arc<CrawlPipeline> {
        &self.pipeline
    }

    /// Generation of the current schedule; 0 before the first reload.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Starts an empty schedule. Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut live = self.live.lock().await;
        if live.is_some() {
            return Ok(());
        }
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        scheduler.start().await.context("starting scheduler")?;
        *live = Some(LiveSchedule {
            generation: self.generation(),
            scheduler,
            jobs: Vec::new(),
        });
        info!("orchestrator started with an empty schedule");
        Ok(())
    }

    /// Rebuilds the schedule from the stored configuration.
    ///
    /// Configuration is read before anything is stopped: when it cannot be
    /// read the error is returned and the previous schedule keeps running.
    /// If that schedule has no sweep job yet (the first reload after
    /// [`start`](Self::start)), a sweep-only schedule is installed first so
    /// the keyword sweep never depends on the monitor and subscriber tables.
    pub async fn reload_tasks(&self) -> Result<Vec<ScheduledJob>> {
        let mut live = self.live.lock().await;
        let plan = match self.load_plan().await {
            Ok(plan) => plan,
            Err(err) => {
                let has_sweep = live
                    .as_ref()
                    .is_some_and(|l| l.jobs.iter().any(|j| j.kind == JobKind::Sweep));
                if !has_sweep {
                    warn!(
                        error = ?err,
                        "schedule configuration unreadable, installing sweep only"
                    );
                    self.install(&mut live, &SchedulePlan::default()).await?;
                }
                return Err(err).context("reading schedule configuration");
            }
        };
        self.install(&mut live, &plan).await
    }

    /// Builds a schedule for `plan` under the next generation, starts it,
    /// and stops the one it replaces.
    async fn install(
        &self,
        live: &mut Option<LiveSchedule>,
        plan: &SchedulePlan,
    ) -> Result<Vec<ScheduledJob>> {
        let next = self.generation() + 1;
        let (mut scheduler, jobs) = self.build_schedule(next, plan).await?;
        let previous = self.generation.swap(next, Ordering::SeqCst);
        if let Err(err) = scheduler.start().await {
            self.generation.store(previous, Ordering::SeqCst);
            if let Err(shutdown_err) = scheduler.shutdown().await {
                debug!(error = %shutdown_err, "discarding unstarted scheduler failed");
            }
            return Err(err).context("starting rebuilt scheduler");
        }

        let replaced = live.replace(LiveSchedule {
            generation: next,
            scheduler,
            jobs: jobs.clone(),
        });
        if let Some(mut old) = replaced {
            if let Err(err) = old.scheduler.shutdown().await {
                warn!(
                    generation = old.generation,
                    error = %err,
                    "stopping replaced schedule failed"
                );
            }
        }
        info!(generation = next, jobs = jobs.len(), "schedule reloaded");
        Ok(jobs)
    }

    /// Jobs registered on the live schedule.
    pub async fn active_jobs(&self) -> Vec<ScheduledJob> {
        self.live
            .lock()
            .await
            .as_ref()
            .map(|live| live.jobs.clone())
            .unwrap_or_default()
    }

    /// Stops the live schedule. In-flight job executions are not cancelled.
    pub async fn shutdown(&self) -> Result<()> {
        let mut live = self.live.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(mut schedule) = live.take() {
            schedule
                .scheduler
                .shutdown()
                .await
                .context("stopping scheduler")?;
        }
        Ok(())
    }

    async fn load_plan(&self) -> Result<SchedulePlan> {
        let store = self.pipeline.store();
        let mut monitors = Vec::new();
        if self.pipeline.config().schedule_monitor_jobs {
            for config in store.monitor_configs().await? {
                let Some(hour) = config.crawl_hour() else {
                    warn!(
                        config_id = config.id,
                        crawl_time = %config.crawl_time,
                        "skipping monitor config with invalid crawl hour"
                    );
                    continue;
                };
                if let CrawlFrequency::Unrecognized(tag) = config.frequency() {
                    warn!(config_id = config.id, %tag, "unknown crawl frequency, scheduling daily");
                }
                monitors.push((config, hour));
            }
        }

        let mut notify_hours: BTreeMap<u32, Vec<Subscriber>> = BTreeMap::new();
        for subscriber in store.subscribers().await? {
            notify_hours
                .entry(subscriber.push_hour)
                .or_default()
                .push(subscriber);
        }
        Ok(SchedulePlan {
            monitors,
            notify_hours,
        })
    }

    async fn build_schedule(
        &self,
        generation: u64,
        plan: &SchedulePlan,
    ) -> Result<(JobScheduler, Vec<ScheduledJob>)> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let mut jobs = Vec::new();

        let cron = self.pipeline.config().sweep_cron.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let job = self.guarded_job(&cron, generation, "sweep".to_string(), move || {
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.execute_sweep().await.map(|_| ()) }
        })?;
        let id = scheduler.add(job).await.context("adding sweep job")?;
        jobs.push(ScheduledJob {
            id,
            cron,
            kind: JobKind::Sweep,
        });

        for (config, hour) in &plan.monitors {
            let cron = format!("0 0 {hour} * * *");
            let pipeline = Arc::clone(&self.pipeline);
            let snapshot = config.clone();
            let label = format!("monitor:{}", config.id);
            let job = self.guarded_job(&cron, generation, label, move || {
                let pipeline = Arc::clone(&pipeline);
                let snapshot = snapshot.clone();
                async move { pipeline.run_monitor_task(&snapshot).await.map(|_| ()) }
            })?;
            let id = scheduler
                .add(job)
                .await
                .with_context(|| format!("adding monitor job for config {}", config.id))?;
            jobs.push(ScheduledJob {
                id,
                cron,
                kind: JobKind::MonitorCrawl {
                    config_id: config.id,
                    web_page: config.web_page.name.clone(),
                },
            });
        }

        for (hour, recipients) in &plan.notify_hours {
            let cron = format!("0 0 {hour} * * *");
            let pipeline = Arc::clone(&self.pipeline);
            let notifier = Arc::clone(&self.notifier);
            let snapshot = recipients.clone();
            let job = self.guarded_job(&cron, generation, format!("notify:{hour}"), move || {
                let pipeline = Arc::clone(&pipeline);
                let notifier = Arc::clone(&notifier);
                let snapshot = snapshot.clone();
                async move {
                    pipeline
                        .notify_recipients(Utc::now().date_naive(), &snapshot, notifier.as_ref())
                        .await
                        .map(|_| ())
                }
            })?;
            let id = scheduler
                .add(job)
                .await
                .with_context(|| format!("adding notify job for hour {hour}"))?;
            jobs.push(ScheduledJob {
                id,
                cron,
                kind: JobKind::Notify {
                    hour: *hour,
                    recipients: recipients.iter().map(|s| s.email.clone()).collect(),
                },
            });
        }

        Ok((scheduler, jobs))
    }

    /// Wraps `task` in a local-time cron job that only runs while
    /// `generation` is current. Failures are logged, never propagated.
    fn guarded_job<F, Fut>(
        &self,
        cron: &str,
        generation: u64,
        label: String,
        task: F,
    ) -> Result<Job>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let current = Arc::clone(&self.generation);
        let task = Arc::new(task);
        Job::new_async_tz(cron, Local, move |_uuid, _l| {
            let current = Arc::clone(&current);
            let task = Arc::clone(&task);
            let label = label.clone();
            Box::pin(async move {
                run_if_current(&current, generation, &label, || task()).await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))
    }
}

/// Runs `task` when `generation` is still the current one. Returns whether
/// it ran.
async fn run_if_current<F, Fut>(
    current: &AtomicU64,
    generation: u64,
    label: &str,
    task: F,
) -> bool
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if current.load(Ordering::SeqCst) != generation {
        debug!(%label, generation, "skipping job from a replaced schedule");
        return false;
    }
    info!(%label, "scheduled job started");
    if let Err(err) = task().await {
        warn!(%label, error = ?err, "scheduled job failed");
    }
    true
}
