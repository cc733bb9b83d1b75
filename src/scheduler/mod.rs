//! Job scheduler: a worker pool over the durable job table.
//!
//! Workers repeatedly claim the highest-priority pending job whose slot is
//! free and whose scope's circuit is closed, run its handler, and classify
//! the outcome. Parallelism is bounded by slot capacity, not worker count;
//! workers idle when their slots are full.

pub mod breaker;
pub mod slots;

pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
pub use slots::{SlotGuard, SlotTable};

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::store::types::*;
use crate::store::EvidenceStore;

/// Cooperative cancellation flag shared between the scheduler and job
/// handlers. Handlers check it at suspension points: between network
/// requests and between batch items.
#[derive(Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A job handler: consumes the job input, may suspend at I/O, and returns
/// the output payload or a classified error.
pub type JobHandler =
    Arc<dyn Fn(Job, CancellationToken) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Single-process, multi-worker scheduler over the durable job table.
pub struct Scheduler {
    store: Arc<EvidenceStore>,
    slots: Arc<SlotTable>,
    breakers: Arc<BreakerRegistry>,
    config: SchedulerConfig,
    handlers: Mutex<HashMap<JobKind, JobHandler>>,
    task_tokens: Mutex<HashMap<TaskId, CancellationToken>>,
    work_available: Notify,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(store: Arc<EvidenceStore>, config: SchedulerConfig) -> Self {
        Self {
            slots: Arc::new(SlotTable::new(config.network_slots)),
            breakers: Arc::new(BreakerRegistry::new(
                config.breaker_failure_threshold,
                config.breaker_cooldown_secs,
            )),
            store,
            config,
            handlers: Mutex::new(HashMap::new()),
            task_tokens: Mutex::new(HashMap::new()),
            work_available: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register the handler for a job kind.
    pub fn register_handler(&self, kind: JobKind, handler: JobHandler) {
        self.handlers
            .lock()
            .expect("handler map mutex")
            .insert(kind, handler);
    }

    /// The breaker registry, shared with the provider layer.
    pub fn breakers(&self) -> Arc<BreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    /// Slot usage snapshot for status reporting.
    pub fn slot_usage(&self) -> Vec<(Slot, usize)> {
        [Slot::Gpu, Slot::BrowserHeadful, Slot::NetworkClient]
            .into_iter()
            .map(|s| (s, self.slots.in_use(s)))
            .collect()
    }

    /// Enqueue a job, enforcing the task budget for fetch/extract work.
    ///
    /// At 100% of the page budget new fetch and extract jobs are refused
    /// and the task transitions to paused; at 80% a soft warning lands in
    /// the event log.
    pub fn enqueue(&self, job: Job) -> Result<JobId> {
        if matches!(job.kind, JobKind::Fetch | JobKind::Extract) {
            if let Some(task_id) = &job.task_id {
                self.check_budget(task_id)?;
            }
        }
        let id = job.id.clone();
        self.store.insert_job(&job)?;
        self.work_available.notify_waiters();
        Ok(id)
    }

    fn check_budget(&self, task_id: &TaskId) -> Result<()> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| Error::invalid_input(format!("unknown task {}", task_id)))?;

        let fetched = self.store.pages_fetched(task_id)?;
        let cap = task.budget.max_pages;
        let wall_spent = (chrono::Utc::now() - task.created_at).num_seconds().max(0) as u64;

        let page_exhausted = cap > 0 && fetched >= cap;
        let wall_exhausted = task.budget.max_wall_secs > 0 && wall_spent >= task.budget.max_wall_secs;
        if page_exhausted || wall_exhausted {
            let resource = if page_exhausted { "pages" } else { "wall_clock" };
            if !task.status.is_terminal() && task.status != TaskStatus::Paused {
                self.store.update_task_status(task_id, TaskStatus::Paused)?;
            }
            self.store
                .log_event("budget_exhausted", Some(task_id), None, resource)?;
            return Err(Error::budget_exhausted(resource));
        }

        if cap > 0 && f64::from(fetched) >= f64::from(cap) * 0.8 {
            self.store.log_event(
                "budget_warning",
                Some(task_id),
                None,
                &format!("{}/{} pages used", fetched, cap),
            )?;
        }
        Ok(())
    }

    /// The cancellation token scoped to a task, creating it on first use.
    pub fn task_token(&self, task_id: &TaskId) -> CancellationToken {
        self.task_tokens
            .lock()
            .expect("task token mutex")
            .entry(task_id.clone())
            .or_default()
            .clone()
    }

    /// Request cancellation of all of a task's jobs. Running handlers
    /// observe the token at their next suspension point; queued and pending
    /// jobs are cancelled in place.
    pub fn cancel_task(&self, task_id: &TaskId) -> Result<Vec<JobId>> {
        self.task_token(task_id).cancel();
        let cancelled = self.store.cancel_task_jobs(task_id)?;
        info!(task = %task_id, jobs = cancelled.len(), "task jobs cancelled");
        Ok(cancelled)
    }

    /// Move a job that hit an auth wall back to pending after a human
    /// resolved the queue entry.
    pub fn resolve_auth(&self, entry_id: i64) -> Result<JobId> {
        let job_id = self.store.resolve_auth_entry(entry_id)?;
        self.store.transition_job(&job_id, JobState::Pending)?;
        self.work_available.notify_waiters();
        Ok(job_id)
    }

    /// Stop all workers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.work_available.notify_waiters();
    }

    /// Whether the scheduler has been halted.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Spawn the worker pool.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|i| {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move {
                    scheduler.worker_loop(i).await;
                })
            })
            .collect()
    }

    async fn worker_loop(self: &Arc<Self>, worker_id: usize) {
        info!(worker_id, "worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.claim_next() {
                Ok(Some((job, guard))) => {
                    self.execute(job, guard, worker_id).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.work_available.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!(worker_id, error = %e, "claim failed");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
        info!(worker_id, "worker stopped");
    }

    /// Claim the highest-priority runnable job: slot free, circuit closed,
    /// task alive. The pending -> queued flip is a guarded update, so two
    /// workers can never claim the same job.
    fn claim_next(&self) -> Result<Option<(Job, SlotGuard)>> {
        let candidates = self.store.pending_jobs(64)?;
        for job in candidates {
            if let Some(task_id) = &job.task_id {
                if self.task_token(task_id).is_cancelled() {
                    // Swept here in case the job was enqueued after stop_task.
                    let _ = self.store.cancel_task_jobs(task_id);
                    continue;
                }
            }
            if let Some(domain) = &job.domain {
                if !self.breakers.allow_request(domain) {
                    continue;
                }
            }
            let Some(guard) = self.slots.try_acquire(job.slot, job.domain.as_deref()) else {
                continue;
            };
            if self.store.try_claim_job(&job.id)? {
                return Ok(Some((job, guard)));
            }
            // Another worker won the claim; the guard drops and frees the
            // slot.
        }
        Ok(None)
    }

    async fn execute(self: &Arc<Self>, job: Job, guard: SlotGuard, worker_id: usize) {
        let handler = {
            let handlers = self.handlers.lock().expect("handler map mutex");
            handlers.get(&job.kind).cloned()
        };
        let Some(handler) = handler else {
            warn!(worker_id, kind = %job.kind, "no handler registered");
            let _ = self.store.transition_job(&job.id, JobState::Running);
            let _ = self.store.fail_job(&job.id, "no handler registered");
            return;
        };

        if let Err(e) = self.store.transition_job(&job.id, JobState::Running) {
            // Cancelled between claim and start.
            warn!(worker_id, job = %job.id, error = %e, "job no longer runnable");
            return;
        }

        let token = job
            .task_id
            .as_ref()
            .map(|t| self.task_token(t))
            .unwrap_or_default();

        let job_id = job.id.clone();
        let task_id = job.task_id.clone();
        let kind = job.kind;
        let domain = job.domain.clone();
        let attempt = job.attempt;
        let input = job.input.clone();

        let outcome = handler(job, token.clone()).await;
        drop(guard);

        if token.is_cancelled() {
            // stop_task already cancelled the row; nothing to record.
            self.work_available.notify_waiters();
            return;
        }

        match outcome {
            Ok(output) => {
                if let Some(domain) = &domain {
                    self.breakers.record_success(domain);
                }
                if let Err(e) = self.store.complete_job(&job_id, &output) {
                    error!(job = %job_id, error = %e, "failed to record completion");
                }
            }
            Err(e) if e.suspends() => {
                let url = match &e {
                    Error::AuthRequired { url } => url.clone(),
                    _ => input
                        .get("url")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                };
                if let Some(domain) = &domain {
                    self.breakers.record_failure(domain, true);
                }
                let _ = self.store.transition_job(&job_id, JobState::AwaitingAuth);
                match self.store.push_auth_queue(&job_id, &url) {
                    Ok(entry) => {
                        info!(job = %job_id, entry, url = %url, "job suspended for auth");
                        let _ = self.store.log_event(
                            "auth_suspended",
                            task_id.as_ref(),
                            Some(&job_id),
                            &url,
                        );
                    }
                    Err(e) => error!(job = %job_id, error = %e, "auth queue push failed"),
                }
            }
            Err(e) if e.retryable() && attempt + 1 < self.config.max_attempts => {
                if let Some(domain) = &domain {
                    self.breakers.record_failure(domain, false);
                }
                let delay = self.backoff_delay(attempt + 1);
                warn!(job = %job_id, attempt, delay_ms = delay.as_millis() as u64,
                      error = %e, "retrying job");
                let _ = self.store.requeue_job(&job_id, &e.to_string(), delay);
            }
            Err(e) => {
                if let Some(domain) = &domain {
                    self.breakers.record_failure(domain, false);
                }
                warn!(job = %job_id, kind = %kind, error = %e, "job failed");
                let _ = self.store.fail_job(&job_id, &e.to_string());
                let _ = self
                    .store
                    .log_event("job_failed", task_id.as_ref(), Some(&job_id), &e.to_string());
                if e.is_fatal() {
                    error!("fatal error; halting scheduler");
                    self.shutdown();
                }
            }
        }
        self.work_available.notify_waiters();
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.config.backoff_factor.max(1.0).powi(attempt as i32 - 1);
        let millis = (self.config.backoff_base_ms as f64 * factor).round() as u64;
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn scheduler() -> (Arc<EvidenceStore>, Arc<Scheduler>) {
        let store = Arc::new(EvidenceStore::in_memory().unwrap());
        let config = SchedulerConfig {
            workers: 2,
            network_slots: 2,
            max_attempts: 3,
            backoff_base_ms: 10,
            backoff_factor: 2.0,
            breaker_cooldown_secs: 1800,
            breaker_failure_threshold: 2,
        };
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), config));
        (store, scheduler)
    }

    fn task(store: &EvidenceStore, max_pages: u32) -> Task {
        let task = Task::new("hypothesis", TaskBudget::new(max_pages, 3600));
        store.insert_task(&task).unwrap();
        task
    }

    fn ok_handler(counter: Arc<AtomicUsize>) -> JobHandler {
        Arc::new(move |_job, _token| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"ok": true}))
            })
        })
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_jobs_complete_through_worker_pool() {
        let (store, scheduler) = scheduler();
        let t = task(&store, 100);
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register_handler(JobKind::Extract, ok_handler(Arc::clone(&counter)));

        let mut ids = Vec::new();
        for _ in 0..4 {
            let job = Job::new(JobKind::Extract, json!({})).for_task(t.id.clone());
            ids.push(scheduler.enqueue(job).unwrap());
        }
        let handles = scheduler.spawn_workers();

        wait_for(|| counter.load(Ordering::SeqCst) == 4).await;
        for id in &ids {
            wait_for(|| {
                store.get_job(id).unwrap().unwrap().state == JobState::Completed
            })
            .await;
        }
        scheduler.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_priority_order_within_single_worker() {
        let store = Arc::new(EvidenceStore::in_memory().unwrap());
        let t = task(&store, 100);
        // One worker drains sequentially, so claim order is observable.
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            SchedulerConfig {
                workers: 1,
                ..SchedulerConfig::default()
            },
        ));
        let order: Arc<Mutex<Vec<JobKind>>> = Arc::new(Mutex::new(Vec::new()));

        // Enqueued lowest-priority first; claimed highest-priority first.
        for kind in [JobKind::Llm, JobKind::Extract, JobKind::Serp] {
            let order = Arc::clone(&order);
            scheduler.register_handler(
                kind,
                Arc::new(move |job, _token| {
                    let order = Arc::clone(&order);
                    Box::pin(async move {
                        order.lock().unwrap().push(job.kind);
                        Ok(json!({}))
                    })
                }),
            );
            let job = Job::new(kind, json!({})).for_task(t.id.clone());
            scheduler.enqueue(job).unwrap();
        }

        let handles = scheduler.spawn_workers();
        wait_for(|| order.lock().unwrap().len() == 3).await;
        assert_eq!(
            *order.lock().unwrap(),
            vec![JobKind::Serp, JobKind::Extract, JobKind::Llm]
        );
        scheduler.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let (store, scheduler) = scheduler();
        let t = task(&store, 100);
        let attempts = Arc::new(AtomicUsize::new(0));
        {
            let attempts = Arc::clone(&attempts);
            scheduler.register_handler(
                JobKind::Fetch,
                Arc::new(move |_job, _token| {
                    let attempts = Arc::clone(&attempts);
                    Box::pin(async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(Error::transient("first try flakes"))
                        } else {
                            Ok(json!({"fetched": true}))
                        }
                    })
                }),
            );
        }

        let job = Job::new(JobKind::Fetch, json!({"url": "https://x.org/a"}))
            .for_task(t.id.clone())
            .with_domain("x.org");
        let id = scheduler.enqueue(job).unwrap();
        let handles = scheduler.spawn_workers();

        wait_for(|| store.get_job(&id).unwrap().unwrap().state == JobState::Completed).await;
        let job = store.get_job(&id).unwrap().unwrap();
        assert_eq!(job.attempt, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        scheduler.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_retry_budget_exhausts_to_failed() {
        let (store, scheduler) = scheduler();
        let t = task(&store, 100);
        scheduler.register_handler(
            JobKind::Fetch,
            Arc::new(|_job, _token| Box::pin(async { Err(Error::transient("always down")) })),
        );

        let job = Job::new(JobKind::Fetch, json!({})).for_task(t.id.clone());
        let id = scheduler.enqueue(job).unwrap();
        let handles = scheduler.spawn_workers();

        wait_for(|| store.get_job(&id).unwrap().unwrap().state == JobState::Failed).await;
        let job = store.get_job(&id).unwrap().unwrap();
        // max_attempts = 3: initial run plus two retries.
        assert_eq!(job.attempt, 2);

        scheduler.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_auth_suspension_and_resolution() {
        let (store, scheduler) = scheduler();
        let t = task(&store, 100);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            scheduler.register_handler(
                JobKind::Fetch,
                Arc::new(move |_job, _token| {
                    let calls = Arc::clone(&calls);
                    Box::pin(async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(Error::auth_required("https://wall.org/paper"))
                        } else {
                            Ok(json!({"fetched": true}))
                        }
                    })
                }),
            );
        }

        let job = Job::new(JobKind::Fetch, json!({"url": "https://wall.org/paper"}))
            .for_task(t.id.clone())
            .with_domain("wall.org");
        let id = scheduler.enqueue(job).unwrap();
        let handles = scheduler.spawn_workers();

        wait_for(|| store.get_job(&id).unwrap().unwrap().state == JobState::AwaitingAuth).await;
        let entries = store.pending_auth_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "https://wall.org/paper");

        scheduler.resolve_auth(entries[0].id).unwrap();
        wait_for(|| store.get_job(&id).unwrap().unwrap().state == JobState::Completed).await;
        assert!(store.pending_auth_entries().unwrap().is_empty());

        scheduler.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_budget_exhaustion_refuses_and_pauses() {
        let (store, scheduler) = scheduler();
        let t = task(&store, 2);
        store.record_page_fetched(&t.id).unwrap();
        store.record_page_fetched(&t.id).unwrap();

        let job = Job::new(JobKind::Fetch, json!({})).for_task(t.id.clone());
        let err = scheduler.enqueue(job).unwrap_err();
        assert!(matches!(err, Error::BudgetExhausted { .. }));

        let task = store.get_task(&t.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Paused);

        // Non-fetch work is still admitted.
        let job = Job::new(JobKind::Nli, json!({})).for_task(t.id.clone());
        assert!(scheduler.enqueue(job).is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_reaches_running_jobs() {
        let store = Arc::new(EvidenceStore::in_memory().unwrap());
        let t = task(&store, 100);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            SchedulerConfig {
                workers: 4,
                ..SchedulerConfig::default()
            },
        ));
        let started = Arc::new(AtomicUsize::new(0));
        {
            let started = Arc::clone(&started);
            scheduler.register_handler(
                JobKind::Nli,
                Arc::new(move |_job, token| {
                    let started = Arc::clone(&started);
                    Box::pin(async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        // Cooperative handler: wait at a suspension point.
                        token.cancelled().await;
                        Err(Error::transient("interrupted"))
                    })
                }),
            );
        }

        let mut ids = Vec::new();
        for _ in 0..4 {
            let job = Job::new(JobKind::Nli, json!({})).for_task(t.id.clone());
            ids.push(scheduler.enqueue(job).unwrap());
        }
        let handles = scheduler.spawn_workers();

        wait_for(|| started.load(Ordering::SeqCst) == 4).await;
        scheduler.cancel_task(&t.id).unwrap();

        for id in &ids {
            wait_for(|| store.get_job(id).unwrap().unwrap().state == JobState::Cancelled).await;
        }

        scheduler.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_open_breaker_skips_jobs_for_scope() {
        let (store, scheduler) = scheduler();
        let t = task(&store, 100);
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = Arc::clone(&runs);
            scheduler.register_handler(
                JobKind::Fetch,
                Arc::new(move |_job, _token| {
                    let runs = Arc::clone(&runs);
                    Box::pin(async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({}))
                    })
                }),
            );
        }

        // Trip the breaker for the domain.
        scheduler.breakers().record_failure("down.org", false);
        scheduler.breakers().record_failure("down.org", false);
        assert_eq!(scheduler.breakers().state("down.org"), BreakerState::Open);

        let blocked = Job::new(JobKind::Fetch, json!({}))
            .for_task(t.id.clone())
            .with_domain("down.org");
        let blocked_id = scheduler.enqueue(blocked).unwrap();

        let fine = Job::new(JobKind::Fetch, json!({}))
            .for_task(t.id.clone())
            .with_domain("up.org");
        let fine_id = scheduler.enqueue(fine).unwrap();

        let handles = scheduler.spawn_workers();
        wait_for(|| store.get_job(&fine_id).unwrap().unwrap().state == JobState::Completed).await;

        // The blocked job is still pending; the circuit kept it out.
        let blocked = store.get_job(&blocked_id).unwrap().unwrap();
        assert_eq!(blocked.state, JobState::Pending);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scheduler.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
