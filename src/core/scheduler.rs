//! Job scheduler: runs engine operations as tracked background jobs
//!
//! Every rebuild, incremental apply, sync and teardown goes through
//! [`Scheduler::enqueue`], which returns a job id immediately. A semaphore
//! bounds how many jobs run at once; the engine's own locks decide which of
//! the running jobs may touch the same namespace concurrently.
//!
//! The periodic sync timer skips a tick while the previous timed sync is still
//! queued or running, so a slow facility never piles up sync jobs.

use crate::config::UnknownMappingPolicy;
use crate::core::engine::{ApplyReport, CommandRunner, Engine, RebuildTarget};
use crate::core::error::Result;
use crate::core::model::{EntityRef, PolicyStore};
use crate::core::sync::{self, StateObserver};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Finished job records kept for status queries
const RETAINED_JOBS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Job {
    Rebuild { target: RebuildTarget },
    Apply { entity: EntityRef },
    Remove { entity: EntityRef, delete: bool },
    Sync,
    Teardown,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Rebuild { target } => match target {
                RebuildTarget::All => write!(f, "rebuild"),
                RebuildTarget::Firewall => write!(f, "rebuild(firewall)"),
                RebuildTarget::Shaper(id) => write!(f, "rebuild(qos:{id})"),
            },
            Job::Apply { entity } => write!(f, "apply({entity})"),
            Job::Remove {
                entity,
                delete: true,
            } => write!(f, "delete({entity})"),
            Job::Remove { entity, .. } => write!(f, "disable({entity})"),
            Job::Sync => write!(f, "sync"),
            Job::Teardown => write!(f, "teardown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub const fn is_finished(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub job: Job,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Report of the finished operation
    pub summary: Option<serde_json::Value>,
}

struct Inner<R: CommandRunner, O, S: ?Sized> {
    engine: Arc<Engine<R>>,
    observer: Arc<O>,
    store: Arc<S>,
    unknown_mappings: UnknownMappingPolicy,
    permits: Semaphore,
    jobs: Mutex<HashMap<Uuid, Arc<watch::Sender<JobRecord>>>>,
    timed_sync_pending: AtomicBool,
}

/// Runs engine operations as background jobs
pub struct Scheduler<R: CommandRunner, O, S: ?Sized> {
    inner: Arc<Inner<R, O, S>>,
}

impl<R: CommandRunner, O, S: ?Sized> Clone for Scheduler<R, O, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn report_outcome(report: &ApplyReport) -> (Option<String>, serde_json::Value) {
    let summary = report.summary();
    let error = (report.failed() > 0).then(|| format!("{} directives failed", report.failed()));
    (
        error,
        serde_json::to_value(&summary).unwrap_or(serde_json::Value::Null),
    )
}

impl<R, O, S> Scheduler<R, O, S>
where
    R: CommandRunner,
    O: StateObserver,
    S: PolicyStore + 'static + ?Sized,
{
    pub fn new(
        engine: Arc<Engine<R>>,
        observer: Arc<O>,
        store: Arc<S>,
        unknown_mappings: UnknownMappingPolicy,
        max_concurrent_jobs: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                observer,
                store,
                unknown_mappings,
                permits: Semaphore::new(max_concurrent_jobs.max(1)),
                jobs: Mutex::new(HashMap::new()),
                timed_sync_pending: AtomicBool::new(false),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<Engine<R>> {
        &self.inner.engine
    }

    /// Queues `job` and returns its id without waiting for it
    pub fn enqueue(&self, job: Job) -> Uuid {
        let id = Uuid::new_v4();
        let record = JobRecord {
            id,
            job,
            state: JobState::Queued,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            summary: None,
        };
        let tx = Arc::new(watch::channel(record).0);
        {
            let mut jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            prune(&mut jobs);
            jobs.insert(id, Arc::clone(&tx));
        }
        debug!("Queued job {id}: {job}");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let Ok(_permit) = inner.permits.acquire().await else {
                return;
            };
            tx.send_modify(|r| {
                r.state = JobState::Running;
                r.started_at = Some(Utc::now());
            });

            let outcome = inner.run(job).await;
            if job == Job::Sync {
                inner.timed_sync_pending.store(false, Ordering::Release);
            }

            tx.send_modify(|r| {
                r.finished_at = Some(Utc::now());
                match outcome {
                    Ok((None, summary)) => {
                        r.state = JobState::Succeeded;
                        r.summary = Some(summary);
                    }
                    Ok((Some(err), summary)) => {
                        r.state = JobState::Failed;
                        r.error = Some(err);
                        r.summary = Some(summary);
                    }
                    Err(e) => {
                        error!("Job {id} ({job}) failed: {e}");
                        r.state = JobState::Failed;
                        r.error = Some(e.to_string());
                    }
                }
            });
        });
        id
    }

    pub fn job(&self, id: Uuid) -> Option<JobRecord> {
        let jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.get(&id).map(|tx| tx.borrow().clone())
    }

    /// All known jobs, oldest first
    pub fn jobs(&self) -> Vec<JobRecord> {
        let jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<JobRecord> = jobs.values().map(|tx| tx.borrow().clone()).collect();
        records.sort_by_key(|r| r.enqueued_at);
        records
    }

    /// Waits until the job has finished and returns its final record
    pub async fn wait(&self, id: Uuid) -> Option<JobRecord> {
        let mut rx = {
            let jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            jobs.get(&id)?.subscribe()
        };
        let record = rx.wait_for(|r| r.state.is_finished()).await.ok()?.clone();
        Some(record)
    }

    /// Enqueues a sync every `interval`, skipping ticks while the previous
    /// timed sync is unfinished
    pub fn spawn_periodic_sync(&self, interval: Duration) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if scheduler
                    .inner
                    .timed_sync_pending
                    .swap(true, Ordering::AcqRel)
                {
                    debug!("Previous sync still in flight; skipping tick");
                    continue;
                }
                scheduler.enqueue(Job::Sync);
            }
        })
    }
}

impl<R, O, S> Inner<R, O, S>
where
    R: CommandRunner,
    O: StateObserver,
    S: PolicyStore + 'static + ?Sized,
{
    async fn run(&self, job: Job) -> Result<(Option<String>, serde_json::Value)> {
        let store = &*self.store;
        match job {
            Job::Rebuild { target } => {
                Ok(report_outcome(&self.engine.rebuild(store, target).await?))
            }
            Job::Apply { entity } => Ok(report_outcome(&self.engine.apply_entity(store, entity).await?)),
            Job::Remove { entity, delete } => Ok(report_outcome(
                &self.engine.remove_entity(store, entity, delete).await?,
            )),
            Job::Teardown => Ok(report_outcome(&self.engine.teardown().await?)),
            Job::Sync => {
                let report =
                    sync::reconcile(&*self.engine, &*self.observer, store, self.unknown_mappings)
                        .await?;
                info!("Sync job finished with {} drift", report.drift_count);
                let error = (!report.errors.is_empty()).then(|| report.errors.join("; "));
                Ok((
                    error,
                    serde_json::to_value(&report).unwrap_or(serde_json::Value::Null),
                ))
            }
        }
    }
}

/// Drops the oldest finished records beyond the retention limit
fn prune(jobs: &mut HashMap<Uuid, Arc<watch::Sender<JobRecord>>>) {
    if jobs.len() < RETAINED_JOBS {
        return;
    }
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .iter()
        .filter_map(|(id, tx)| {
            let r = tx.borrow();
            r.state.is_finished().then_some((r.enqueued_at, *id))
        })
        .collect();
    finished.sort();
    let excess = jobs.len() + 1 - RETAINED_JOBS;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::Engine;
    use crate::core::model::PolicySnapshot;
    use crate::core::store::MemoryPolicyStore;
    use crate::core::test_helpers::{FakeObserver, FakeRunner, engine_config, rule, zone};

    fn scheduler(runner: FakeRunner) -> Scheduler<FakeRunner, FakeObserver, MemoryPolicyStore> {
        let mut snapshot = PolicySnapshot::default();
        snapshot.zones.push(zone(1, "wan", 0, &["eth0"]));
        snapshot.rules.push(rule(2, "wan", 0, "tcp", "22"));
        let engine = Arc::new(Engine::new(runner, &engine_config(), None));
        Scheduler::new(
            engine,
            Arc::new(FakeObserver::default()),
            Arc::new(MemoryPolicyStore::new(snapshot)),
            UnknownMappingPolicy::Orphan,
            2,
        )
    }

    #[tokio::test]
    async fn test_enqueue_returns_before_completion_and_wait_finishes() {
        let scheduler = scheduler(FakeRunner::new());
        let id = scheduler.enqueue(Job::Rebuild {
            target: RebuildTarget::All,
        });
        let record = scheduler.wait(id).await.unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert!(record.started_at.is_some());
        assert!(record.summary.is_some());
        assert_eq!(scheduler.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_directive_fails_job() {
        let runner = FakeRunner::new();
        runner.fail_when("dport 22", "Error: syntax error");
        let scheduler = scheduler(runner);
        let id = scheduler.enqueue(Job::Rebuild {
            target: RebuildTarget::Firewall,
        });
        let record = scheduler.wait(id).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.error.as_deref(), Some("1 directives failed"));
    }

    #[tokio::test]
    async fn test_lifecycle_error_fails_job() {
        let scheduler = scheduler(FakeRunner::new());
        let entity = EntityRef::Rule(2);
        let first = scheduler.enqueue(Job::Remove {
            entity,
            delete: true,
        });
        scheduler.wait(first).await.unwrap();
        let second = scheduler.enqueue(Job::Remove {
            entity,
            delete: true,
        });
        let record = scheduler.wait(second).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert!(record.error.unwrap().contains("deleted"));
    }

    #[tokio::test]
    async fn test_unknown_job_id() {
        let scheduler = scheduler(FakeRunner::new());
        assert!(scheduler.job(Uuid::new_v4()).is_none());
        assert!(scheduler.wait(Uuid::new_v4()).await.is_none());
    }

    #[test]
    fn test_job_display() {
        assert_eq!(
            Job::Remove {
                entity: EntityRef::Zone(3),
                delete: false
            }
            .to_string(),
            "disable(zone:3)"
        );
        assert_eq!(
            Job::Rebuild {
                target: RebuildTarget::Shaper(2)
            }
            .to_string(),
            "rebuild(qos:2)"
        );
    }
}
