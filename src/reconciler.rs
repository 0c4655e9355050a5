//! Reconciler for maintaining desired state.
//!
//! This module implements the run orchestration: it validates the declared
//! resources, takes the state lock, loads the recorded baseline, optionally
//! probes for drift, plans, and hands the plan to the executor. The lock is
//! released on every path once acquired.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ConfigValidator, DeployConfig, ProviderKind, StateBackend};
use crate::error::{ConvergeError, ReconcileError, Result};
use crate::model::{Resource, ResourceId};
use crate::planner::{ChangePlan, DependencyGraph, DiffEngine, Executor, GraphBuilder, RunReport};
use crate::provider::{DriftReport, LocalProvider, MemoryProvider, Prober, Provider};
use crate::state::{LocalStateStore, MemoryStateStore, ResourceState, StateStore, generate_run_id};

/// A plan computed without applying it.
#[derive(Debug)]
pub struct PlannedRun {
    /// Per-resource actions.
    pub plan: ChangePlan,
    /// Dependency graph including pending deletions.
    pub graph: DependencyGraph,
    /// Drift observed while planning, if refresh was enabled.
    pub drift: Option<DriftReport>,
}

/// Reconciler for maintaining desired state.
pub struct Reconciler<'a> {
    /// Configuration.
    config: &'a DeployConfig,
    /// State store.
    store: Arc<dyn StateStore>,
    /// Target provider.
    provider: Arc<dyn Provider>,
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Cancellation observed by the executor.
    cancel: CancellationToken,
}

impl<'a> Reconciler<'a> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(config: &'a DeployConfig, store: Arc<dyn StateStore>, provider: Arc<dyn Provider>) -> Self {
        Self {
            config,
            store,
            provider,
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a reconciler with the store and provider named in the configuration.
    #[must_use]
    pub fn from_config(config: &'a DeployConfig) -> Self {
        Self::new(config, open_store(config), open_provider(config))
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    /// Validates the configuration and builds the desired resources.
    ///
    /// Cycles and unknown references are reported here, before any state is touched.
    ///
    /// # Errors
    ///
    /// Returns a configuration or graph error.
    pub fn desired(&self) -> Result<Vec<Resource>> {
        ConfigValidator::new().validate(self.config)?;
        let desired = self.config.resources()?;
        GraphBuilder::new().build(&desired, &BTreeMap::new())?;
        Ok(desired)
    }

    /// Computes the change plan without taking the lock or applying anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, state cannot be
    /// read, or the drift probe fails.
    pub async fn plan(&self) -> Result<PlannedRun> {
        let desired = self.desired()?;
        let current = self.store.read_all().await?;
        self.plan_against(&desired, &current).await
    }

    /// Performs a full reconciliation run.
    ///
    /// Resource failures do not make this return an error; inspect
    /// [`RunReport::is_success`] or call [`ensure_success`].
    ///
    /// # Errors
    ///
    /// Returns an error if the run aborts before execution: invalid
    /// configuration, a dependency cycle, a held lock, unreadable state or a
    /// failed drift probe.
    pub async fn apply(&self) -> Result<RunReport> {
        let config_hash = self.hasher.hash_config(self.config);
        info!(
            "Starting reconciliation for {} (config {})",
            self.config.qualified_name(),
            self.hasher.short_hash(&config_hash)
        );

        let desired = self.desired()?;
        let run_id = generate_run_id();

        self.store.acquire_lock(&run_id).await?;
        debug!("Acquired {} state lock for run {run_id}", self.store.backend_type());

        let outcome = self.apply_locked(&run_id, &desired).await;

        if let Err(e) = self.store.release_lock(&run_id).await {
            error!("Failed to release state lock for run {run_id}: {e}");
        }

        outcome
    }

    /// Probes recorded resources for drift without planning.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or a probe fails.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!("Checking for drift in {}", self.config.qualified_name());

        let current = self.store.read_all().await?;
        self.prober().detect(&current).await
    }

    async fn apply_locked(&self, run_id: &str, desired: &[Resource]) -> Result<RunReport> {
        let current = self.store.read_all().await?;
        let planned = self.plan_against(desired, &current).await?;
        info!("Plan: {}", planned.plan.summary());

        let engine = &self.config.engine;
        let executor = Executor::new(Arc::clone(&self.provider), Arc::clone(&self.store))
            .with_workers(engine.workers)
            .with_retry(engine.retry.to_policy())
            .with_operation_timeout(engine.operation_timeout())
            .with_cancel_token(self.cancel.clone());

        let report = executor
            .execute(run_id, &planned.plan, &planned.graph, desired, &current)
            .await;

        if let Err(e) = self.store.append_history(report.history_entry()).await {
            warn!("Failed to record run history: {e}");
        }

        Ok(report)
    }

    async fn plan_against(
        &self,
        desired: &[Resource],
        current: &BTreeMap<ResourceId, ResourceState>,
    ) -> Result<PlannedRun> {
        let drift = if self.config.engine.refresh && !current.is_empty() {
            Some(self.prober().detect(current).await?)
        } else {
            None
        };

        let plan = self.diff_engine.compute(desired, current, drift.as_ref());
        let graph = GraphBuilder::new().build(desired, current)?;

        Ok(PlannedRun { plan, graph, drift })
    }

    fn prober(&self) -> Prober {
        Prober::new(Arc::clone(&self.provider), self.config.engine.workers)
    }
}

/// Opens the state store named in the configuration.
#[must_use]
pub fn open_store(config: &DeployConfig) -> Arc<dyn StateStore> {
    match config.state.backend {
        StateBackend::Local => Arc::new(LocalStateStore::with_base_dir(config.state_dir())),
        StateBackend::Memory => Arc::new(MemoryStateStore::new()),
    }
}

/// Opens the provider named in the configuration.
#[must_use]
pub fn open_provider(config: &DeployConfig) -> Arc<dyn Provider> {
    match config.provider.kind {
        ProviderKind::Local => Arc::new(LocalProvider::new(config.target_root())),
        ProviderKind::Memory => Arc::new(MemoryProvider::new()),
    }
}

/// Converts an unsuccessful run into an error.
///
/// # Errors
///
/// Returns [`ReconcileError::Aborted`] for a cancelled run and
/// [`ReconcileError::RunFailed`] if any resource failed or was skipped.
pub fn ensure_success(report: &RunReport) -> Result<()> {
    if report.is_success() {
        return Ok(());
    }

    if report.cancelled {
        return Err(ConvergeError::Reconcile(ReconcileError::Aborted {
            reason: format!("run {} cancelled", report.run_id),
        }));
    }

    let counts = report.counts();
    Err(ConvergeError::Reconcile(ReconcileError::RunFailed {
        run_id: report.run_id.clone(),
        failed: counts.failed,
        skipped: counts.skipped,
    }))
}
