//! Plan executor.
//!
//! Applies a change plan level by level. Every operation of a level must
//! finish before the next level starts; within a level, operations run
//! concurrently on a bounded pool. A failed resource causes all of its
//! descendants to be skipped while independent branches carry on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::{Resource, ResourceId, resolve_value};
use crate::provider::{ApplyRequest, Operation, Provider};
use crate::retry::{RetryPolicy, with_retry};
use crate::state::{ResourceState, RunHistoryEntry, StateStore};

use super::graph::DependencyGraph;
use super::plan::{Action, ActionKind, ChangePlan};

/// Final status of one resource in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    /// The action completed and state was recorded.
    Success,
    /// The action failed.
    Failed {
        /// Failure description.
        reason: String,
    },
    /// The action was never attempted.
    Skipped {
        /// Why it was skipped.
        reason: String,
    },
}

/// Execution record for one resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceOutcome {
    /// Resource identifier.
    pub id: ResourceId,
    /// Planned action.
    pub action: ActionKind,
    /// What happened.
    pub outcome: Outcome,
    /// Provider attempts made.
    pub attempts: u32,
    /// Dependency level the resource belonged to.
    pub level: usize,
    /// When work on the resource started.
    pub started_at: Option<DateTime<Utc>>,
    /// When work on the resource finished.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Summary of a complete run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: String,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// Per-resource outcomes, sorted by identifier.
    pub outcomes: Vec<ResourceOutcome>,
    /// Whether the run was cancelled before completing.
    pub cancelled: bool,
}

/// Counts of outcomes in a report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    /// Resources created.
    pub created: usize,
    /// Resources updated.
    pub updated: usize,
    /// Resources deleted.
    pub deleted: usize,
    /// Resources already up to date.
    pub unchanged: usize,
    /// Resources that failed.
    pub failed: usize,
    /// Resources skipped.
    pub skipped: usize,
}

impl RunReport {
    /// Tallies outcomes. Successes are counted by action kind.
    #[must_use]
    pub fn counts(&self) -> RunCounts {
        let mut counts = RunCounts::default();
        for outcome in &self.outcomes {
            match (&outcome.outcome, outcome.action) {
                (Outcome::Success, ActionKind::Create) => counts.created += 1,
                (Outcome::Success, ActionKind::Update) => counts.updated += 1,
                (Outcome::Success, ActionKind::Delete) => counts.deleted += 1,
                (Outcome::Success, ActionKind::NoOp) => counts.unchanged += 1,
                (Outcome::Failed { .. }, _) => counts.failed += 1,
                (Outcome::Skipped { .. }, _) => counts.skipped += 1,
            }
        }
        counts
    }

    /// Returns true if every resource converged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self
                .outcomes
                .iter()
                .all(|o| matches!(o.outcome, Outcome::Success))
    }

    /// Returns the number of resources created, updated or deleted.
    #[must_use]
    pub fn changed(&self) -> usize {
        let counts = self.counts();
        counts.created + counts.updated + counts.deleted
    }

    /// Finds the outcome of a resource.
    #[must_use]
    pub fn outcome(&self, id: &ResourceId) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| &o.id == id)
    }

    /// Returns the first failure reason, if any.
    #[must_use]
    pub fn first_failure(&self) -> Option<String> {
        self.outcomes.iter().find_map(|o| match &o.outcome {
            Outcome::Failed { reason } => Some(format!("{}: {reason}", o.id)),
            _ => None,
        })
    }

    /// Converts the report into a history record.
    #[must_use]
    pub fn history_entry(&self) -> RunHistoryEntry {
        let counts = self.counts();
        RunHistoryEntry {
            run_id: self.run_id.clone(),
            timestamp: self.finished_at,
            success: self.is_success(),
            changed: self.changed(),
            failed: counts.failed,
            skipped: counts.skipped,
            cancelled: self.cancelled,
            error: self.first_failure(),
        }
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts = self.counts();
        write!(
            f,
            "Run {}: {} created, {} updated, {} deleted, {} unchanged, {} failed, {} skipped",
            self.run_id,
            counts.created,
            counts.updated,
            counts.deleted,
            counts.unchanged,
            counts.failed,
            counts.skipped
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

/// State change produced by a successful operation.
enum StateChange {
    Written(Box<ResourceState>),
    Removed,
    Unchanged,
}

/// Everything a spawned operation needs, owned.
struct Task {
    action: Action,
    level: usize,
    desired: Option<Resource>,
    previous: Option<ResourceState>,
    upstream: Arc<BTreeMap<ResourceId, ResourceState>>,
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    timeout: Duration,
}

/// Interval between lock refreshes while a run is executing.
const LOCK_HEARTBEAT: Duration = Duration::from_secs(60);

/// Background task keeping the state lock alive; stopped on drop.
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(store: Arc<dyn StateStore>, run_id: String, period: Duration) -> Self {
        Self(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = store.refresh_lock(&run_id).await {
                    warn!("Lock heartbeat for run {run_id} stopped: {e}");
                    break;
                }
                debug!("Refreshed state lock for run {run_id}");
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Executor for change plans.
pub struct Executor {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    workers: usize,
    retry: RetryPolicy,
    operation_timeout: Duration,
    lock_heartbeat: Duration,
    cancel: CancellationToken,
}

impl Executor {
    /// Creates an executor with default settings.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            workers: 4,
            retry: RetryPolicy::default(),
            operation_timeout: Duration::from_secs(60),
            lock_heartbeat: LOCK_HEARTBEAT,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the maximum number of concurrent operations within a level.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the retry policy for transient failures.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the timeout for a single provider call.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets how often the state lock is refreshed during execution.
    ///
    /// Must be shorter than the store's lock expiry.
    #[must_use]
    pub fn with_lock_heartbeat(mut self, period: Duration) -> Self {
        self.lock_heartbeat = period.max(Duration::from_millis(1));
        self
    }

    /// Sets the cancellation token observed between levels.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executes a plan in dependency order.
    ///
    /// `run_id` must hold the state lock. The lock is refreshed on a fixed
    /// heartbeat for as long as execution runs, and again before each level.
    pub async fn execute(
        &self,
        run_id: &str,
        plan: &ChangePlan,
        graph: &DependencyGraph,
        desired: &[Resource],
        current: &BTreeMap<ResourceId, ResourceState>,
    ) -> RunReport {
        let started_at = Utc::now();
        info!(
            "Executing plan for run {run_id}: {} across {} levels",
            plan.summary(),
            graph.levels().len()
        );

        let _heartbeat = Heartbeat::start(Arc::clone(&self.store), run_id.to_string(), self.lock_heartbeat);

        let declared: BTreeMap<&ResourceId, &Resource> = desired.iter().map(|r| (&r.id, r)).collect();
        let mut upstream = current.clone();
        let mut blocked: BTreeMap<ResourceId, ResourceId> = BTreeMap::new();
        let mut outcomes: Vec<ResourceOutcome> = Vec::with_capacity(graph.len());
        let mut halted: Option<String> = None;
        let mut cancelled = false;

        for (level, ids) in graph.levels().iter().enumerate() {
            if halted.is_none() && self.cancel.is_cancelled() {
                warn!("Run {run_id} cancelled before level {level}");
                cancelled = true;
                halted = Some(String::from("run cancelled"));
            }

            if halted.is_none()
                && level > 0
                && let Err(e) = self.store.refresh_lock(run_id).await
            {
                error!("Lost state lock during run {run_id}: {e}");
                halted = Some(format!("state lock lost: {e}"));
            }

            if let Some(reason) = &halted {
                outcomes.extend(ids.iter().map(|id| skipped(plan, id, level, reason.clone())));
                continue;
            }

            debug!("Level {level}: {} resources", ids.len());
            let snapshot = Arc::new(upstream.clone());
            let level_outcomes = self
                .run_level(plan, level, ids, &declared, &blocked, &snapshot)
                .await;

            for (outcome, change) in level_outcomes {
                match change {
                    StateChange::Written(state) => {
                        upstream.insert(outcome.id.clone(), *state);
                    }
                    StateChange::Removed => {
                        upstream.remove(&outcome.id);
                    }
                    StateChange::Unchanged => {}
                }

                if matches!(outcome.outcome, Outcome::Failed { .. }) {
                    for descendant in graph.descendants(&outcome.id) {
                        blocked.entry(descendant).or_insert_with(|| outcome.id.clone());
                    }
                }
                outcomes.push(outcome);
            }
        }

        outcomes.sort_by(|a, b| a.id.cmp(&b.id));
        let report = RunReport {
            run_id: run_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            outcomes,
            cancelled,
        };

        info!("{report}");
        report
    }

    /// Runs one level and waits for all of its operations.
    async fn run_level(
        &self,
        plan: &ChangePlan,
        level: usize,
        ids: &[ResourceId],
        desired: &BTreeMap<&ResourceId, &Resource>,
        blocked: &BTreeMap<ResourceId, ResourceId>,
        upstream: &Arc<BTreeMap<ResourceId, ResourceState>>,
    ) -> Vec<(ResourceOutcome, StateChange)> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut join_set = JoinSet::new();
        let mut in_flight = BTreeMap::new();
        let mut results = Vec::with_capacity(ids.len());

        for id in ids {
            if let Some(ancestor) = blocked.get(id) {
                warn!("Skipping {id}: dependency {ancestor} failed");
                results.push((
                    skipped(plan, id, level, format!("dependency {ancestor} failed")),
                    StateChange::Unchanged,
                ));
                continue;
            }

            let Some(action) = plan.get(id) else {
                error!("No planned action for {id}");
                results.push((
                    failed(id, ActionKind::NoOp, level, "no planned action".to_string()),
                    StateChange::Unchanged,
                ));
                continue;
            };

            if action.kind == ActionKind::NoOp {
                let now = Utc::now();
                results.push((
                    ResourceOutcome {
                        id: id.clone(),
                        action: ActionKind::NoOp,
                        outcome: Outcome::Success,
                        attempts: 0,
                        level,
                        started_at: Some(now),
                        finished_at: Some(now),
                    },
                    StateChange::Unchanged,
                ));
                continue;
            }

            let task = Task {
                action: action.clone(),
                level,
                desired: desired.get(id).map(|r| (*r).clone()),
                previous: upstream.get(id).cloned(),
                upstream: Arc::clone(upstream),
                provider: Arc::clone(&self.provider),
                store: Arc::clone(&self.store),
                retry: self.retry.clone(),
                timeout: self.operation_timeout,
            };
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                task.run().await
            });
            in_flight.insert(id.clone(), action.kind);
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => {
                    in_flight.remove(&result.0.id);
                    results.push(result);
                }
                Err(e) => error!("Operation task aborted: {e}"),
            }
        }

        // Anything still in flight belongs to a task that panicked
        for (id, kind) in in_flight {
            results.push((
                failed(&id, kind, level, String::from("operation aborted")),
                StateChange::Unchanged,
            ));
        }

        results
    }
}

impl Task {
    async fn run(self) -> (ResourceOutcome, StateChange) {
        let started_at = Utc::now();
        let id = self.action.id.clone();
        let kind = self.action.kind;

        let (outcome, attempts, change) = match self.perform().await {
            Ok((attempts, change)) => {
                info!("{kind} {id} succeeded after {attempts} attempt(s)");
                (Outcome::Success, attempts, change)
            }
            Err((attempts, reason)) => {
                error!("{kind} {id} failed after {attempts} attempt(s): {reason}");
                (Outcome::Failed { reason }, attempts, StateChange::Unchanged)
            }
        };

        (
            ResourceOutcome {
                id,
                action: kind,
                outcome,
                attempts,
                level: self.level,
                started_at: Some(started_at),
                finished_at: Some(Utc::now()),
            },
            change,
        )
    }

    async fn perform(&self) -> Result<(u32, StateChange), (u32, String)> {
        let Some(operation) = self.action.operation() else {
            return Ok((0, StateChange::Unchanged));
        };

        let request = self.build_request(operation).map_err(|reason| (0, reason))?;
        let label = format!("{operation} {}", request.id);

        let attempted = with_retry(&self.retry, self.timeout, &label, |_| self.provider.apply(&request)).await;
        let attempts = attempted.attempts;
        let observed = attempted.result.map_err(|e| (attempts, e.to_string()))?;

        match operation {
            Operation::Delete => {
                self.store
                    .delete(&request.id)
                    .await
                    .map_err(|e| (attempts, format!("state delete failed: {e}")))?;
                Ok((attempts, StateChange::Removed))
            }
            Operation::Create | Operation::Update => {
                let declared = self
                    .desired
                    .as_ref()
                    .map(|r| r.attributes.clone())
                    .unwrap_or_default();
                let dependencies = self
                    .desired
                    .as_ref()
                    .map(|r| r.all_dependencies().into_iter().collect())
                    .unwrap_or_default();

                let state = ResourceState::new(request.id.clone(), declared)
                    .with_applied(request.attributes)
                    .with_outputs(observed.outputs)
                    .with_dependencies(dependencies)
                    .succeeding(self.previous.as_ref());

                self.store
                    .write(&state)
                    .await
                    .map_err(|e| (attempts, format!("state write failed: {e}")))?;
                Ok((attempts, StateChange::Written(Box::new(state))))
            }
        }
    }

    /// Builds the provider request, resolving interpolation references.
    fn build_request(&self, operation: Operation) -> Result<ApplyRequest, String> {
        let previous_outputs = self
            .previous
            .as_ref()
            .map(|s| s.outputs.clone())
            .unwrap_or_default();

        let attributes = match (operation, &self.desired) {
            (Operation::Delete, _) => BTreeMap::new(),
            (_, None) => return Err(String::from("resource is not declared")),
            (_, Some(resource)) => {
                let lookup = |reference: &crate::model::Reference| {
                    self.upstream
                        .get(&reference.target)
                        .and_then(|state| state.lookup(&reference.attribute))
                        .cloned()
                };

                let mut resolved = BTreeMap::new();
                for (name, value) in &resource.attributes {
                    let value = resolve_value(value, &lookup)
                        .map_err(|token| format!("unresolved reference {token} in attribute '{name}'"))?;
                    resolved.insert(name.clone(), value);
                }
                resolved
            }
        };

        Ok(ApplyRequest {
            id: self.action.id.clone(),
            operation,
            attributes,
            previous_outputs,
        })
    }
}

fn skipped(plan: &ChangePlan, id: &ResourceId, level: usize, reason: String) -> ResourceOutcome {
    ResourceOutcome {
        id: id.clone(),
        action: plan.get(id).map_or(ActionKind::NoOp, |a| a.kind),
        outcome: Outcome::Skipped { reason },
        attempts: 0,
        level,
        started_at: None,
        finished_at: None,
    }
}

fn failed(id: &ResourceId, action: ActionKind, level: usize, reason: String) -> ResourceOutcome {
    let now = Utc::now();
    ResourceOutcome {
        id: id.clone(),
        action,
        outcome: Outcome::Failed { reason },
        attempts: 0,
        level,
        started_at: Some(now),
        finished_at: Some(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::model::Value;
    use crate::planner::{DiffEngine, GraphBuilder};
    use crate::provider::{CallKind, MemoryProvider, MockProvider};
    use crate::state::MemoryStateStore;

    const RUN: &str = "run-test";

    fn id(name: &str) -> ResourceId {
        ResourceId::new("svc", name)
    }

    fn res(name: &str) -> Resource {
        Resource::new(id(name)).with_attribute("name", name)
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(2),
        }
    }

    struct Harness {
        provider: Arc<MemoryProvider>,
        store: Arc<MemoryStateStore>,
    }

    impl Harness {
        async fn new(provider: MemoryProvider) -> Self {
            let store = Arc::new(MemoryStateStore::new());
            store.acquire_lock(RUN).await.expect("lock");
            Self {
                provider: Arc::new(provider),
                store,
            }
        }

        fn executor(&self) -> Executor {
            Executor::new(self.provider.clone(), self.store.clone()).with_retry(fast_retry(3))
        }

        async fn run_with(&self, executor: &Executor, desired: &[Resource]) -> RunReport {
            let current = self.store.read_all().await.expect("read_all");
            let plan = DiffEngine::new().compute(desired, &current, None);
            let graph = GraphBuilder::new().build(desired, &current).expect("graph");
            executor.execute(RUN, &plan, &graph, desired, &current).await
        }

        async fn run(&self, desired: &[Resource]) -> RunReport {
            self.run_with(&self.executor(), desired).await
        }
    }

    #[tokio::test]
    async fn test_creates_in_dependency_order() {
        let h = Harness::new(MemoryProvider::new().with_latency(Duration::from_millis(20))).await;
        let desired = [
            res("a"),
            res("b").with_dependency(id("a")),
            res("c").with_dependency(id("b")),
        ];

        let report = h.run(&desired).await;
        assert!(report.is_success());
        assert_eq!(report.counts().created, 3);

        let calls = h.provider.apply_calls().await;
        let finish = |name: &str| calls.iter().find(|c| c.id == id(name)).map(|c| c.finished_at);
        let start = |name: &str| calls.iter().find(|c| c.id == id(name)).map(|c| c.started_at);
        assert!(start("b") >= finish("a"));
        assert!(start("c") >= finish("b"));

        let a = report.outcome(&id("a")).expect("a");
        let b = report.outcome(&id("b")).expect("b");
        assert!(b.started_at >= a.finished_at);
        assert_eq!((a.level, b.level), (0, 1));
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let h = Harness::new(MemoryProvider::new()).await;
        let desired = [res("a"), res("b").with_attribute("peer", "${svc.a.uid}")];

        assert!(h.run(&desired).await.is_success());
        h.provider.clear_calls().await;

        let report = h.run(&desired).await;
        assert!(report.is_success());
        assert_eq!(report.counts().unchanged, 2);
        assert_eq!(report.changed(), 0);
        assert!(h.provider.apply_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let h = Harness::new(MemoryProvider::new().with_latency(Duration::from_millis(30))).await;
        let desired: Vec<Resource> = (0..6).map(|i| res(&format!("r{i}"))).collect();
        let executor = h.executor().with_workers(2);

        let report = h.run_with(&executor, &desired).await;
        assert!(report.is_success());

        let calls = h.provider.apply_calls().await;
        let max_overlap = calls
            .iter()
            .map(|c| {
                calls
                    .iter()
                    .filter(|o| o.started_at <= c.started_at && o.finished_at > c.started_at)
                    .count()
            })
            .max()
            .unwrap_or(0);
        assert!(max_overlap <= 2, "saw {max_overlap} concurrent operations");
    }

    #[tokio::test]
    async fn test_failure_skips_descendants_only() {
        let provider = MemoryProvider::new();
        provider.fail_permanently(id("a")).await;
        let h = Harness::new(provider).await;
        let desired = [
            res("a"),
            res("b").with_dependency(id("a")),
            res("c"),
            res("d").with_dependency(id("b")),
        ];

        let report = h.run(&desired).await;
        assert!(!report.is_success());

        let counts = report.counts();
        assert_eq!((counts.created, counts.failed, counts.skipped), (1, 1, 2));
        assert_eq!(
            report.outcome(&id("d")).map(|o| o.outcome.clone()),
            Some(Outcome::Skipped {
                reason: String::from("dependency svc.a failed")
            })
        );
        assert_eq!(report.outcome(&id("a")).map(|o| o.attempts), Some(1));

        let stored = h.store.read_all().await.expect("read_all");
        assert_eq!(stored.keys().cloned().collect::<Vec<_>>(), vec![id("c")]);
    }

    #[tokio::test]
    async fn test_failure_skips_every_branch_of_a_fan_out() {
        let provider = MemoryProvider::new();
        provider.fail_permanently(id("a")).await;
        let h = Harness::new(provider).await;
        let desired = [
            res("a"),
            res("b").with_dependency(id("a")),
            res("c").with_dependency(id("a")),
            res("d"),
        ];

        let report = h.run(&desired).await;
        let skipped = Some(Outcome::Skipped {
            reason: String::from("dependency svc.a failed"),
        });

        assert!(matches!(report.outcome(&id("a")).map(|o| &o.outcome), Some(Outcome::Failed { .. })));
        assert_eq!(report.outcome(&id("b")).map(|o| o.outcome.clone()), skipped);
        assert_eq!(report.outcome(&id("c")).map(|o| o.outcome.clone()), skipped);
        assert_eq!(report.outcome(&id("d")).map(|o| o.outcome.clone()), Some(Outcome::Success));

        let applied: Vec<ResourceId> = h.provider.apply_calls().await.into_iter().map(|c| c.id).collect();
        assert!(!applied.contains(&id("b")) && !applied.contains(&id("c")));
        assert!(h.provider.object(&id("d")).await.is_some());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = MemoryProvider::new();
        provider.fail_transiently(id("a"), 2).await;
        let h = Harness::new(provider).await;

        let report = h.run(&[res("a")]).await;
        assert!(report.is_success());
        assert_eq!(report.outcome(&id("a")).map(|o| o.attempts), Some(3));
    }

    #[tokio::test]
    async fn test_timeout_exhausts_attempts() {
        let provider = MemoryProvider::new();
        provider.set_latency(id("slow"), Duration::from_millis(500)).await;
        let h = Harness::new(provider).await;
        let executor = h
            .executor()
            .with_retry(fast_retry(2))
            .with_operation_timeout(Duration::from_millis(20));

        let report = h.run_with(&executor, &[res("slow"), res("fast")]).await;
        let slow = report.outcome(&id("slow")).expect("slow");

        assert!(matches!(slow.outcome, Outcome::Failed { ref reason } if reason.contains("timed out")));
        assert_eq!(slow.attempts, 2);
        assert_eq!(report.counts().created, 1);
    }

    #[tokio::test]
    async fn test_interpolation_uses_upstream_outputs() {
        let h = Harness::new(MemoryProvider::new()).await;
        let desired = [
            res("db"),
            res("web").with_attribute("upstream", "${svc.db.uid}:5432"),
        ];

        let report = h.run(&desired).await;
        assert!(report.is_success());

        let web = h.store.read(&id("web")).await.expect("read").expect("stored");
        assert_eq!(web.attributes.get("upstream"), Some(&Value::from("${svc.db.uid}:5432")));
        assert_eq!(web.applied.get("upstream"), Some(&Value::from("mem-1:5432")));
        assert_eq!(web.dependencies, vec![id("db")]);
    }

    #[tokio::test]
    async fn test_dependent_follows_changed_upstream_value() {
        let h = Harness::new(MemoryProvider::new()).await;
        let dependent = res("b").with_attribute("p", "${svc.a.port}");
        let first = [res("a").with_attribute("port", 80_i64), dependent.clone()];
        assert!(h.run(&first).await.is_success());

        let second = [res("a").with_attribute("port", 81_i64), dependent];
        let current = h.store.read_all().await.expect("read_all");
        let plan = DiffEngine::new().compute(&second, &current, None);
        assert_eq!(plan.get(&id("b")).map(|a| a.kind), Some(ActionKind::Update));

        let report = h.run(&second).await;
        assert!(report.is_success());
        assert_eq!(report.counts().updated, 2);

        let b = h.provider.object(&id("b")).await.expect("b on target");
        assert_eq!(b.attributes.get("p"), Some(&Value::Int(81)));

        h.provider.clear_calls().await;
        let report = h.run(&second).await;
        assert_eq!(report.changed(), 0);
        assert!(h.provider.apply_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_reference_fails_without_provider_call() {
        let h = Harness::new(MemoryProvider::new()).await;
        let desired = [res("db"), res("web").with_attribute("port", "${svc.db.port}")];

        let report = h.run(&desired).await;
        let web = report.outcome(&id("web")).expect("web");

        assert!(matches!(web.outcome, Outcome::Failed { ref reason } if reason.contains("${svc.db.port}")));
        assert_eq!(web.attempts, 0);
        assert!(h.provider.object(&id("web")).await.is_none());
    }

    #[tokio::test]
    async fn test_deletes_after_dependents() {
        let h = Harness::new(MemoryProvider::new()).await;
        let first = [res("db"), res("web").with_dependency(id("db"))];
        assert!(h.run(&first).await.is_success());
        h.provider.clear_calls().await;

        // Both removed: web must be deleted before db
        let report = h.run(&[]).await;
        assert!(report.is_success());
        assert_eq!(report.counts().deleted, 2);

        let calls = h.provider.apply_calls().await;
        let order: Vec<&str> = calls.iter().map(|c| c.id.name.as_str()).collect();
        assert_eq!(order, vec!["web", "db"]);
        assert!(calls.iter().all(|c| c.kind == CallKind::Apply(Operation::Delete)));
        assert!(h.store.read_all().await.expect("read_all").is_empty());
    }

    #[tokio::test]
    async fn test_precancelled_run_skips_everything() {
        let h = Harness::new(MemoryProvider::new()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = h.executor().with_cancel_token(cancel);

        let report = h.run_with(&executor, &[res("a"), res("b")]).await;
        assert!(report.cancelled);
        assert_eq!(report.counts().skipped, 2);
        assert!(h.provider.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_lets_current_level_finish() {
        let h = Harness::new(MemoryProvider::new().with_latency(Duration::from_millis(100))).await;
        let cancel = CancellationToken::new();
        let executor = h.executor().with_cancel_token(cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let report = h
            .run_with(&executor, &[res("a"), res("b").with_dependency(id("a"))])
            .await;
        trigger.await.expect("trigger task");

        assert!(report.cancelled);
        assert_eq!(report.outcome(&id("a")).map(|o| o.outcome.clone()), Some(Outcome::Success));
        assert_eq!(
            report.outcome(&id("b")).map(|o| o.outcome.clone()),
            Some(Outcome::Skipped {
                reason: String::from("run cancelled")
            })
        );
    }

    #[tokio::test]
    async fn test_permanent_provider_error_not_retried() {
        let mut mock = MockProvider::new();
        mock.expect_name().return_const("mock");
        mock.expect_apply()
            .times(1)
            .returning(|_| Err(ProviderError::permanent("quota exceeded")));

        let store = Arc::new(MemoryStateStore::new());
        store.acquire_lock(RUN).await.expect("lock");
        let executor = Executor::new(Arc::new(mock), store.clone()).with_retry(fast_retry(5));

        let desired = [res("a")];
        let current = BTreeMap::new();
        let plan = DiffEngine::new().compute(&desired, &current, None);
        let graph = GraphBuilder::new().build(&desired, &current).expect("graph");

        let report = executor.execute(RUN, &plan, &graph, &desired, &current).await;
        let a = report.outcome(&id("a")).expect("a");
        assert_eq!(a.attempts, 1);
        assert!(matches!(a.outcome, Outcome::Failed { ref reason } if reason.contains("quota exceeded")));
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lock_through_long_level() {
        let provider = MemoryProvider::new();
        provider.set_latency(id("slow"), Duration::from_millis(200)).await;
        let store = Arc::new(MemoryStateStore::new().with_lock_ttl(chrono::Duration::milliseconds(50)));
        store.acquire_lock(RUN).await.expect("lock");
        let h = Harness {
            provider: Arc::new(provider),
            store,
        };
        let executor = h.executor().with_lock_heartbeat(Duration::from_millis(10));

        let resources = [res("slow")];
        let (report, intruder) = tokio::join!(h.run_with(&executor, &resources), async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            h.store.acquire_lock("run-other").await
        });

        assert!(report.is_success());
        assert!(matches!(
            intruder,
            Err(crate::error::ConvergeError::State(crate::error::StateError::LockHeld { ref run_id, .. })) if run_id == RUN
        ));
    }

    #[tokio::test]
    async fn test_lost_lock_halts_remaining_levels() {
        let h = Harness::new(MemoryProvider::new()).await;
        h.store.force_unlock().await.expect("unlock");

        let report = h.run(&[res("a"), res("b").with_dependency(id("a"))]).await;
        assert_eq!(report.outcome(&id("a")).map(|o| o.outcome.clone()), Some(Outcome::Success));
        assert!(matches!(
            report.outcome(&id("b")).map(|o| o.outcome.clone()),
            Some(Outcome::Skipped { reason }) if reason.starts_with("state lock lost")
        ));
    }

    #[test]
    fn test_history_entry_reports_first_failure() {
        let report = RunReport {
            run_id: String::from("r"),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcomes: vec![ResourceOutcome {
                id: id("a"),
                action: ActionKind::Create,
                outcome: Outcome::Failed {
                    reason: String::from("boom"),
                },
                attempts: 1,
                level: 0,
                started_at: None,
                finished_at: None,
            }],
            cancelled: false,
        };

        let entry = report.history_entry();
        assert!(!entry.success);
        assert_eq!(entry.failed, 1);
        assert_eq!(entry.error.as_deref(), Some("svc.a: boom"));
    }
}
