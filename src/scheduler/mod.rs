//! Background scheduler: materializes one job per enabled monitor, fires
//! them at their cadence through a bounded worker pool, persists job state
//! across restarts, and reacts to monitor CRUD.

pub mod trigger;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::models::{CheckResultRecord, SchedulerJobRecord};
use crate::db::{monitor_service, result_service, scheduler_job_service, DbPool};
use crate::pipeline;
use crate::stages::Status;
use trigger::Trigger;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
/// Consecutive skipped fires before a synthetic `overlapped` result is
/// recorded.
const OVERLAP_STRIKES: u32 = 2;

#[derive(Debug)]
pub enum SchedulerCommand {
    Reschedule(String),
    Unschedule(String),
}

/// Cheap handle for the API layer: CRUD reactions and shutdown.
#[derive(Clone)]
pub struct SchedulerHandle {
    cmd_tx: mpsc::Sender<SchedulerCommand>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl SchedulerHandle {
    pub async fn reschedule(&self, monitor_id: &str) {
        if self
            .cmd_tx
            .send(SchedulerCommand::Reschedule(monitor_id.to_string()))
            .await
            .is_err()
        {
            warn!(monitor_id, "Scheduler is gone; reschedule dropped.");
        }
    }

    pub async fn unschedule(&self, monitor_id: &str) {
        if self
            .cmd_tx
            .send(SchedulerCommand::Unschedule(monitor_id.to_string()))
            .await
            .is_err()
        {
            warn!(monitor_id, "Scheduler is gone; unschedule dropped.");
        }
    }

    /// Ask the scheduler to stop. It stops submitting new runs and waits up
    /// to 30 s for in-flight ones; await the control task handle to block on
    /// that.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct Job {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    trigger: Trigger,
}

pub struct Scheduler {
    pool: DbPool,
    retention: usize,
    permits: Arc<Semaphore>,
    jobs: HashMap<String, Job>,
}

/// Start the scheduler: reconcile persisted jobs against the monitor
/// collection, then run the control loop until shutdown.
pub fn start(
    pool: DbPool,
    retention: usize,
    concurrency: usize,
) -> (SchedulerHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = SchedulerHandle {
        cmd_tx,
        shutdown_tx: Arc::new(shutdown_tx),
    };

    let mut scheduler = Scheduler {
        pool,
        retention,
        permits: Arc::new(Semaphore::new(concurrency.max(1))),
        jobs: HashMap::new(),
    };

    let control = tokio::spawn(async move {
        scheduler.run(cmd_rx, shutdown_rx).await;
    });

    (handle, control)
}

impl Scheduler {
    async fn run(
        &mut self,
        mut cmd_rx: mpsc::Receiver<SchedulerCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        if let Err(e) = self.reconcile().await {
            error!(error = %e, "Initial scheduler reconciliation failed.");
        }
        info!(job_count = self.jobs.len(), "Scheduler started.");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    self.shutdown().await;
                    break;
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SchedulerCommand::Reschedule(id)) => self.reschedule(&id).await,
                        Some(SchedulerCommand::Unschedule(id)) => self.unschedule(&id).await,
                        None => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }
            }
        }
        info!("Scheduler stopped.");
    }

    /// Bring persisted jobs and running tasks in line with the monitor
    /// collection: enabled monitors get jobs, jobs for unknown or disabled
    /// monitors are removed, changed triggers are rewritten.
    async fn reconcile(&mut self) -> Result<(), crate::web::error::AppError> {
        let monitors = monitor_service::list_monitors(self.pool.clone(), None).await?;
        let persisted = scheduler_job_service::list_jobs(self.pool.clone()).await?;

        let enabled: HashMap<&str, _> = monitors
            .iter()
            .filter(|m| m.enabled)
            .map(|m| (m.id.as_str(), m))
            .collect();

        let mut persisted_by_id = HashMap::new();
        for job in persisted {
            if !enabled.contains_key(job.monitor_id.as_str()) {
                info!(monitor_id = %job.monitor_id, "Dropping stale scheduler job.");
                scheduler_job_service::delete_job(self.pool.clone(), &job.monitor_id).await?;
            } else {
                persisted_by_id.insert(job.monitor_id.clone(), job);
            }
        }

        for monitor in enabled.values() {
            match Trigger::from_monitor(monitor) {
                Ok(trigger) => {
                    // A persisted job whose trigger still matches keeps its
                    // next-run time, so fires missed while the engine was
                    // down are caught up promptly; a changed trigger is
                    // recomputed in place.
                    let carry_over = persisted_by_id
                        .get(monitor.id.as_str())
                        .filter(|job| {
                            job.trigger_kind == trigger.kind()
                                && job.trigger_spec == trigger.spec_string()
                        })
                        .and_then(|job| job.next_run_at);
                    self.spawn_job(&monitor.id, trigger, carry_over);
                }
                Err(e) => {
                    // Misconfigured monitors are skipped, not fatal.
                    error!(monitor_id = %monitor.id, error = %e, "Cannot schedule monitor.");
                }
            }
        }
        Ok(())
    }

    async fn reschedule(&mut self, monitor_id: &str) {
        let monitor = match monitor_service::get_monitor(self.pool.clone(), monitor_id).await {
            Ok(Some(monitor)) => monitor,
            Ok(None) => {
                self.unschedule(monitor_id).await;
                return;
            }
            Err(e) => {
                error!(monitor_id, error = %e, "Failed to load monitor for reschedule.");
                return;
            }
        };

        if !monitor.enabled {
            self.unschedule(monitor_id).await;
            return;
        }

        match Trigger::from_monitor(&monitor) {
            Ok(trigger) => {
                if self.jobs.get(monitor_id).is_some_and(|j| j.trigger == trigger) {
                    debug!(monitor_id, "Trigger unchanged; keeping existing job.");
                    return;
                }
                self.spawn_job(monitor_id, trigger, None);
            }
            Err(e) => {
                error!(monitor_id, error = %e, "Cannot schedule monitor.");
                self.unschedule(monitor_id).await;
            }
        }
    }

    async fn unschedule(&mut self, monitor_id: &str) {
        if let Some(job) = self.jobs.remove(monitor_id) {
            info!(monitor_id, "Unscheduling monitor.");
            let _ = job.shutdown_tx.send(true);
        }
        if let Err(e) = scheduler_job_service::delete_job(self.pool.clone(), monitor_id).await {
            error!(monitor_id, error = %e, "Failed to delete scheduler job record.");
        }
    }

    /// (Re)create the job for a monitor. Job identity is the monitor id;
    /// an existing job with the same id is replaced.
    fn spawn_job(
        &mut self,
        monitor_id: &str,
        trigger: Trigger,
        initial_next_run: Option<chrono::DateTime<Utc>>,
    ) {
        if let Some(old) = self.jobs.remove(monitor_id) {
            let _ = old.shutdown_tx.send(true);
        }

        info!(
            monitor_id,
            kind = trigger.kind(),
            spec = %trigger.spec_string(),
            "Scheduling monitor."
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_job(
            self.pool.clone(),
            monitor_id.to_string(),
            trigger.clone(),
            initial_next_run,
            self.permits.clone(),
            self.retention,
            shutdown_rx,
        ));
        self.jobs.insert(
            monitor_id.to_string(),
            Job {
                handle,
                shutdown_tx,
                trigger,
            },
        );
    }

    /// Cooperative shutdown: signal every job, wait up to 30 s, abort the
    /// stragglers.
    async fn shutdown(&mut self) {
        info!(job_count = self.jobs.len(), "Scheduler shutting down.");
        let jobs: Vec<Job> = self.jobs.drain().map(|(_, job)| job).collect();
        for job in &jobs {
            let _ = job.shutdown_tx.send(true);
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for job in jobs {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let abort = job.handle.abort_handle();
            if tokio::time::timeout(remaining, job.handle).await.is_err() {
                warn!("Job did not stop within the grace period; aborting.");
                abort.abort();
            }
        }
    }
}

/// One monitor's job loop: compute the next fire, persist it, sleep, then
/// submit a run through the worker pool. A job never runs concurrently with
/// itself; overlapping fires are skipped, and two consecutive skips record a
/// single synthetic `degraded` result.
async fn run_job(
    pool: DbPool,
    monitor_id: String,
    trigger: Trigger,
    initial_next_run: Option<chrono::DateTime<Utc>>,
    permits: Arc<Semaphore>,
    retention: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut overlap_strikes: u32 = 0;
    let mut in_flight: Option<JoinHandle<()>> = None;
    // First fire carried over from a previous process, when the trigger is
    // unchanged; a time already in the past fires immediately.
    let mut pending_next = initial_next_run;

    loop {
        let now = Utc::now();
        let next_run = match pending_next.take() {
            Some(next_run) => next_run,
            None => match trigger.next_fire(now) {
                Some(next_run) => next_run,
                None => {
                    warn!(monitor_id = %monitor_id, "Trigger has no future fire times; job ends.");
                    break;
                }
            },
        };

        let record = SchedulerJobRecord {
            monitor_id: monitor_id.clone(),
            trigger_kind: trigger.kind().to_string(),
            trigger_spec: trigger.spec_string(),
            next_run_at: Some(next_run),
            last_updated: now,
        };
        if let Err(e) = scheduler_job_service::upsert_job(pool.clone(), &record).await {
            error!(monitor_id = %monitor_id, error = %e, "Failed to persist job state.");
        }

        let sleep_for = (next_run - now)
            .to_std()
            .unwrap_or(Duration::from_secs(0));
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(sleep_for) => {}
        }

        // Coalescing: skip this fire if the previous run is still going.
        if let Some(handle) = &in_flight {
            if !handle.is_finished() {
                overlap_strikes += 1;
                warn!(
                    monitor_id = %monitor_id,
                    strikes = overlap_strikes,
                    "Previous run still in flight; skipping fire."
                );
                if overlap_strikes >= OVERLAP_STRIKES {
                    record_overlap(&pool, &monitor_id, overlap_strikes, retention).await;
                    overlap_strikes = 0;
                }
                continue;
            }
        }
        overlap_strikes = 0;

        let permit = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let pool = pool.clone();
        let monitor_id_for_run = monitor_id.clone();
        in_flight = Some(tokio::spawn(async move {
            let _permit = permit;
            run_scheduled_check(pool, &monitor_id_for_run, retention).await;
        }));
    }

    // Let an in-flight run finish before the job task exits, so shutdown can
    // wait for it.
    if let Some(handle) = in_flight {
        let _ = handle.await;
    }
    debug!(monitor_id = %monitor_id, "Job loop finished.");
}

async fn run_scheduled_check(pool: DbPool, monitor_id: &str, retention: usize) {
    let monitor = match monitor_service::get_monitor(pool.clone(), monitor_id).await {
        Ok(Some(monitor)) => monitor,
        Ok(None) => {
            warn!(monitor_id, "Monitor vanished before its scheduled check.");
            return;
        }
        Err(e) => {
            error!(monitor_id, error = %e, "Failed to load monitor for scheduled check.");
            return;
        }
    };
    if !monitor.enabled {
        debug!(monitor_id, "Monitor disabled; skipping scheduled check.");
        return;
    }

    match pipeline::run_check(pool, &monitor, retention, false).await {
        Ok(result) => {
            info!(
                monitor_id,
                name = %monitor.name,
                status = %result.status,
                elapsed_ms = format!("{:.1}", result.elapsed_ms),
                "Scheduled check completed."
            );
        }
        // Storage failures drop this one result; the worker stays alive.
        Err(e) => {
            error!(monitor_id, name = %monitor.name, error = %e, "Scheduled check failed.");
        }
    }
}

async fn record_overlap(pool: &DbPool, monitor_id: &str, skips: u32, retention: usize) {
    let now = crate::db::models::now_millis();
    let record = CheckResultRecord {
        id: Uuid::new_v4().to_string(),
        monitor_id: monitor_id.to_string(),
        status: Status::Degraded,
        message: "overlapped".to_string(),
        elapsed_ms: 0.0,
        details: serde_json::json!({"scheduler": {"consecutive_skips": skips}}),
        checked_at: now,
    };
    if let Err(e) = result_service::append_result(pool.clone(), &record, retention).await {
        error!(monitor_id, error = %e, "Failed to record overlap result.");
        return;
    }
    if let Err(e) =
        monitor_service::update_monitor_mirror(pool.clone(), monitor_id, now, Status::Degraded)
            .await
    {
        error!(monitor_id, error = %e, "Failed to update mirror after overlap.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{CreateMonitor, UpdateMonitor};
    use crate::db::test_support::temp_pool;
    use crate::stages::StageSpec;

    fn payload(name: &str, enabled: bool) -> CreateMonitor {
        CreateMonitor {
            name: name.to_string(),
            url: "https://example.com".to_string(),
            pipeline: vec![StageSpec::new("http")],
            interval: 60,
            schedule: None,
            enabled,
            tags: Vec::new(),
        }
    }

    async fn wait_for_jobs<F>(pool: &DbPool, pred: F)
    where
        F: Fn(&[SchedulerJobRecord]) -> bool,
    {
        for _ in 0..100 {
            let jobs = scheduler_job_service::list_jobs(pool.clone()).await.unwrap();
            if pred(&jobs) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("scheduler job state not reached in time");
    }

    #[tokio::test]
    async fn reconciliation_creates_and_prunes_jobs() {
        let (_dir, pool) = temp_pool();
        let enabled = monitor_service::create_monitor(pool.clone(), payload("on", true))
            .await
            .unwrap();
        let disabled = monitor_service::create_monitor(pool.clone(), payload("off", false))
            .await
            .unwrap();

        // Stale rows: one for the disabled monitor, one for a ghost.
        for id in [disabled.id.as_str(), "ghost"] {
            scheduler_job_service::upsert_job(
                pool.clone(),
                &SchedulerJobRecord {
                    monitor_id: id.to_string(),
                    trigger_kind: "interval".to_string(),
                    trigger_spec: "60".to_string(),
                    next_run_at: None,
                    last_updated: Utc::now(),
                },
            )
            .await
            .unwrap();
        }

        let (handle, control) = start(pool.clone(), 100, 4);
        let enabled_id = enabled.id.clone();
        wait_for_jobs(&pool, |jobs| {
            jobs.len() == 1 && jobs[0].monitor_id == enabled_id
        })
        .await;

        let jobs = scheduler_job_service::list_jobs(pool.clone()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].monitor_id, enabled.id);
        assert_eq!(jobs[0].trigger_kind, "interval");
        assert_eq!(jobs[0].trigger_spec, "60");
        assert!(jobs[0].next_run_at.is_some());

        handle.shutdown();
        let _ = control.await;
    }

    #[tokio::test]
    async fn missed_fire_is_caught_up_after_restart() {
        let (_dir, pool) = temp_pool();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let monitor = monitor_service::create_monitor(
            pool.clone(),
            CreateMonitor {
                name: "m".to_string(),
                url: "http://127.0.0.1".to_string(),
                pipeline: vec![StageSpec::new("tcp").with_option("port", port)],
                interval: 60,
                schedule: None,
                enabled: true,
                tags: Vec::new(),
            },
        )
        .await
        .unwrap();

        // Simulate a fire that was missed while the previous process was
        // down: same trigger, next_run_at already in the past.
        scheduler_job_service::upsert_job(
            pool.clone(),
            &SchedulerJobRecord {
                monitor_id: monitor.id.clone(),
                trigger_kind: "interval".to_string(),
                trigger_spec: "60".to_string(),
                next_run_at: Some(Utc::now() - chrono::Duration::seconds(5)),
                last_updated: Utc::now(),
            },
        )
        .await
        .unwrap();

        let (handle, control) = start(pool.clone(), 100, 4);

        let mut caught_up = false;
        for _ in 0..200 {
            let results = result_service::list_results(pool.clone(), &monitor.id, 10)
                .await
                .unwrap();
            if !results.is_empty() {
                assert_eq!(results[0].status, Status::Up);
                caught_up = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(caught_up, "missed fire was not caught up after restart");

        handle.shutdown();
        let _ = control.await;
    }

    #[tokio::test]
    async fn disabling_a_monitor_unschedules_it() {
        let (_dir, pool) = temp_pool();
        let monitor = monitor_service::create_monitor(pool.clone(), payload("m", true))
            .await
            .unwrap();

        let (handle, control) = start(pool.clone(), 100, 4);
        wait_for_jobs(&pool, |jobs| !jobs.is_empty()).await;

        monitor_service::update_monitor(
            pool.clone(),
            &monitor.id,
            UpdateMonitor {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        handle.reschedule(&monitor.id).await;

        wait_for_jobs(&pool, |jobs| jobs.is_empty()).await;

        handle.shutdown();
        let _ = control.await;
    }

    #[tokio::test]
    async fn deleting_a_monitor_unschedules_it() {
        let (_dir, pool) = temp_pool();
        let monitor = monitor_service::create_monitor(pool.clone(), payload("m", true))
            .await
            .unwrap();

        let (handle, control) = start(pool.clone(), 100, 4);
        wait_for_jobs(&pool, |jobs| !jobs.is_empty()).await;

        monitor_service::delete_monitor(pool.clone(), &monitor.id).await.unwrap();
        handle.unschedule(&monitor.id).await;

        wait_for_jobs(&pool, |jobs| jobs.is_empty()).await;

        handle.shutdown();
        let _ = control.await;
    }
}
