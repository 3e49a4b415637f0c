//! Background job scheduler.
//!
//! Each registered schedule gets its own tokio task that sleeps until the
//! next fire time and runs the job. Singleton schedules take a
//! `ScheduleInstance` lease first, so at most one node runs them at a time;
//! a node that dies mid-run simply lets the lease lapse.

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::error::{AppError, Result};
use crate::models::{ScheduleFrequency, ScheduleInfo};
use crate::services::metrics_service::MetricsSink;
use crate::storage::{LeaseOutcome, ScheduleInstanceStore};

/// Fallback delay when a cron expression cannot be parsed.
const INVALID_CRON_FALLBACK: Duration = Duration::from_secs(24 * 3600);

/// A unit of recurring work. Returns a short summary for `last_message`.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    async fn run(&self) -> Result<String>;
}

/// Outcome of asking the scheduler to run a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRun {
    Completed(String),
    Failed(String),
    /// The job is already running on this node
    AlreadyRunning,
    /// Another node holds the singleton lease
    LeaseHeld { owner: String },
}

struct Registration {
    info: Mutex<ScheduleInfo>,
    job: Arc<dyn ScheduledJob>,
}

impl Registration {
    fn info(&self) -> Result<std::sync::MutexGuard<'_, ScheduleInfo>> {
        self.info
            .lock()
            .map_err(|_| AppError::Internal("schedule state lock poisoned".into()))
    }
}

pub struct SchedulerService {
    schedules: Mutex<BTreeMap<String, Arc<Registration>>>,
    instances: Arc<dyn ScheduleInstanceStore>,
    node_id: String,
    lease: chrono::Duration,
    metrics: Arc<dyn MetricsSink>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerService {
    pub fn new(
        instances: Arc<dyn ScheduleInstanceStore>,
        node_id: impl Into<String>,
        lease: chrono::Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            schedules: Mutex::new(BTreeMap::new()),
            instances,
            node_id: node_id.into(),
            lease,
            metrics,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn schedules(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Arc<Registration>>>> {
        self.schedules
            .lock()
            .map_err(|_| AppError::Internal("schedule registry lock poisoned".into()))
    }

    fn registration(&self, name: &str) -> Result<Arc<Registration>> {
        self.schedules()?
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("schedule '{name}'")))
    }

    /// Register a job. Names are unique.
    pub fn register(
        &self,
        name: &str,
        frequency: ScheduleFrequency,
        singleton: bool,
        job: Arc<dyn ScheduledJob>,
    ) -> Result<()> {
        if name.trim().is_empty() {
            return Err(AppError::Validation("schedule name is required".into()));
        }
        if let ScheduleFrequency::Every(every) = &frequency {
            if every.is_zero() {
                return Err(AppError::Validation(format!(
                    "schedule '{name}' needs a non-zero interval"
                )));
            }
        }

        let mut schedules = self.schedules()?;
        if schedules.contains_key(name) {
            return Err(AppError::Conflict(format!("schedule '{name}' is already registered")));
        }
        tracing::info!("Registered schedule '{}' ({})", name, frequency);
        schedules.insert(
            name.to_string(),
            Arc::new(Registration {
                info: Mutex::new(ScheduleInfo::new(name, frequency, singleton)),
                job,
            }),
        );
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ScheduleInfo>> {
        let registrations: Vec<Arc<Registration>> = self.schedules()?.values().cloned().collect();
        registrations
            .iter()
            .map(|r| r.info().map(|info| info.clone()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Result<ScheduleInfo> {
        let registration = self.registration(name)?;
        let info = registration.info()?;
        Ok(info.clone())
    }

    /// Enable or disable a schedule. A disabled schedule keeps its task but
    /// skips its runs.
    pub fn toggle(&self, name: &str, disabled: bool) -> Result<ScheduleInfo> {
        let registration = self.registration(name)?;
        let mut info = registration.info()?;
        info.disabled = disabled;
        tracing::info!(
            "Schedule '{}' {}",
            name,
            if disabled { "disabled" } else { "enabled" }
        );
        Ok(info.clone())
    }

    /// Run a job now, even if it is disabled. The singleton lease still applies.
    pub async fn trigger(&self, name: &str) -> Result<JobRun> {
        let registration = self.registration(name)?;
        self.execute(name, &registration).await
    }

    /// Start one task per registered schedule.
    pub fn spawn_all(self: &Arc<Self>) -> Result<usize> {
        let names: Vec<String> = self.schedules()?.keys().cloned().collect();
        let mut handles = self
            .handles
            .lock()
            .map_err(|_| AppError::Internal("scheduler handle lock poisoned".into()))?;

        for name in &names {
            let scheduler = Arc::clone(self);
            let name = name.clone();
            handles.push(tokio::spawn(async move {
                scheduler.run_loop(&name).await;
            }));
        }
        Ok(names.len())
    }

    /// Abort every spawned schedule task.
    pub fn shutdown(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }

    async fn run_loop(&self, name: &str) {
        loop {
            let registration = match self.registration(name) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("Schedule '{}' stopped: {}", name, e);
                    return;
                }
            };
            let frequency = match registration.info() {
                Ok(info) => info.frequency.clone(),
                Err(e) => {
                    tracing::error!("Schedule '{}' stopped: {}", name, e);
                    return;
                }
            };

            tokio::time::sleep(next_delay(&frequency)).await;

            let disabled = registration.info().map(|i| i.disabled).unwrap_or(true);
            if disabled {
                tracing::debug!("Schedule '{}' is disabled, skipping", name);
                continue;
            }
            match self.execute(name, &registration).await {
                Ok(JobRun::Failed(e)) => tracing::warn!("Scheduled job '{}' failed: {}", name, e),
                Ok(JobRun::LeaseHeld { owner }) => {
                    tracing::debug!("Schedule '{}' is running on {}, skipping", name, owner)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Scheduled job '{}' could not start: {}", name, e),
            }
        }
    }

    async fn execute(&self, name: &str, registration: &Registration) -> Result<JobRun> {
        let singleton = {
            let mut info = registration.info()?;
            if info.running {
                return Ok(JobRun::AlreadyRunning);
            }
            info.running = true;
            info.singleton
        };

        if singleton {
            let acquired = self
                .instances
                .try_acquire(name, &self.node_id, Utc::now(), self.lease)
                .await;
            match acquired {
                Ok(LeaseOutcome::Acquired(_)) => {}
                Ok(LeaseOutcome::Held(instance)) => {
                    registration.info()?.running = false;
                    return Ok(JobRun::LeaseHeld {
                        owner: instance.owner,
                    });
                }
                Err(e) => {
                    registration.info()?.running = false;
                    return Err(e);
                }
            }
        }

        tracing::debug!("Running scheduled job '{}'", name);
        // A panicking job must not leave the schedule marked as running
        let job = registration.job.clone();
        let result = match tokio::spawn(async move { job.run().await }).await {
            Ok(result) => result,
            Err(e) => Err(AppError::Internal(format!("job panicked: {e}"))),
        };

        if singleton {
            if let Err(e) = self.instances.release(name, &self.node_id).await {
                tracing::warn!("Failed to release schedule lease '{}': {}", name, e);
            }
        }

        let mut info = registration.info()?;
        info.running = false;
        info.last_run = Some(Utc::now());
        info.run_count += 1;
        self.metrics.record_schedule_run(name, result.is_ok());
        Ok(match result {
            Ok(message) => {
                info.last_message = Some(message.clone());
                info.last_error = None;
                JobRun::Completed(message)
            }
            Err(e) => {
                let error = e.to_string();
                info.last_error = Some(error.clone());
                JobRun::Failed(error)
            }
        })
    }
}

/// Time until a schedule should next fire.
pub fn next_delay(frequency: &ScheduleFrequency) -> Duration {
    match frequency {
        ScheduleFrequency::Every(every) => *every,
        ScheduleFrequency::Cron(expr) => compute_next_run(expr)
            .and_then(|next| (next - Utc::now()).to_std().ok())
            .unwrap_or(INVALID_CRON_FALLBACK),
    }
}

/// Next fire time of a cron expression.
pub fn compute_next_run(cron_expr: &str) -> Option<chrono::DateTime<Utc>> {
    // The cron crate expects 6 or 7 fields (sec min hour dom month dow [year])
    // but users typically write 5-field (min hour dom month dow).
    // Prepend "0 " for seconds if we detect a 5-field expression.
    let normalized = if cron_expr.split_whitespace().count() == 5 {
        format!("0 {}", cron_expr)
    } else {
        cron_expr.to_string()
    };

    match Schedule::from_str(&normalized) {
        Ok(schedule) => schedule.upcoming(Utc).next(),
        Err(e) => {
            tracing::warn!(
                "Invalid cron expression '{}': {}. Falling back to 24h from now.",
                cron_expr,
                e
            );
            Some(Utc::now() + chrono::Duration::hours(24))
        }
    }
}
